use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::FaceIdError;

/// Current on-disk document version.
const LEDGER_VERSION: u32 = 2;

/// Durable bookkeeping for the vector index: which student owns which
/// vector identifier, per-student embedding counts, and the monotonic
/// identifier counter.
///
/// The ledger is a single JSON document, always written whole via a
/// temporary file and an atomic rename. Identifiers issued by
/// [`Ledger::next_id`] are never reused, including across restarts,
/// because `last_id` is persisted after every mutating store operation.
#[derive(Debug, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default = "default_version")]
    version: u32,

    /// Number of embeddings currently enrolled per student.
    counts: BTreeMap<i64, u32>,

    /// Vector identifiers belonging to each student, in enrollment order.
    by_student: BTreeMap<i64, Vec<u64>>,

    /// Highest identifier ever issued.
    #[serde(default)]
    last_id: u64,
}

fn default_version() -> u32 {
    LEDGER_VERSION
}

impl Ledger {
    /// Creates an empty ledger. `last_id` is seeded from the wall clock
    /// in milliseconds so identifiers can never collide with anything a
    /// legacy deployment put in the index (raw student ids, or ids issued
    /// before the file was lost).
    pub fn fresh() -> Self {
        Self {
            version: LEDGER_VERSION,
            counts: BTreeMap::new(),
            by_student: BTreeMap::new(),
            last_id: now_millis(),
        }
    }

    /// Reads a persisted ledger from `path`.
    ///
    /// Returns the ledger and whether it must be persisted immediately:
    /// true after a legacy-format migration, and after falling back to an
    /// empty ledger because the file was unreadable. The fallback is a
    /// data-loss event and is logged as an error, never swallowed.
    pub fn load(path: &Path) -> (Self, bool) {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) => {
                error!("ledger unreadable at {}: {}; falling back to empty ledger (enrolled metadata lost)", path.display(), e);
                return (Self::fresh(), true);
            }
        };

        let value: serde_json::Value = match serde_json::from_slice(&data) {
            Ok(v) => v,
            Err(e) => {
                error!("ledger corrupt at {}: {}; falling back to empty ledger (enrolled metadata lost)", path.display(), e);
                return (Self::fresh(), true);
            }
        };

        if is_current(&value) {
            match serde_json::from_value::<Ledger>(value) {
                Ok(mut ledger) => {
                    ledger.version = LEDGER_VERSION;
                    return (ledger, false);
                }
                Err(e) => {
                    error!("ledger corrupt at {}: {}; falling back to empty ledger (enrolled metadata lost)", path.display(), e);
                    return (Self::fresh(), true);
                }
            }
        }

        let ledger = Self::migrate_legacy(&value);
        info!(
            "migrated legacy ledger at {}: {} students, last_id seeded to {}",
            path.display(),
            ledger.counts.len(),
            ledger.last_id
        );
        (ledger, true)
    }

    /// Upgrades a legacy flat document (`{"<sid>": <count>, ...}`) to the
    /// current structure. Counts are rebuilt from integer-looking keys,
    /// ownership lists start empty (the legacy format never recorded
    /// them), and `last_id` is seeded from the wall clock so identifiers
    /// issued from now on cannot collide with legacy index entries.
    fn migrate_legacy(value: &serde_json::Value) -> Self {
        let mut counts = BTreeMap::new();
        if let Some(obj) = value.as_object() {
            for (k, v) in obj {
                let Ok(sid) = k.parse::<i64>() else { continue };
                let Some(count) = v.as_u64() else { continue };
                counts.insert(sid, count as u32);
            }
        }
        Self {
            version: LEDGER_VERSION,
            counts,
            by_student: BTreeMap::new(),
            last_id: now_millis(),
        }
    }

    /// Writes the ledger to `path` as JSON. The document goes to a
    /// sibling temporary file first and is atomically renamed over the
    /// target, so a concurrent reader never observes a partial write.
    pub fn save(&self, path: &Path) -> Result<(), FaceIdError> {
        let persist_err = |e: std::io::Error| FaceIdError::Persistence(e.to_string());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(persist_err)?;
            }
        }

        let data = serde_json::to_vec(self).map_err(|e| FaceIdError::Persistence(e.to_string()))?;
        let tmp = tmp_path(path);
        fs::write(&tmp, data).map_err(persist_err)?;
        fs::rename(&tmp, path).map_err(persist_err)?;
        Ok(())
    }

    /// Issues a fresh vector identifier. Never returns the same value
    /// twice for the lifetime of the store, including across restarts.
    pub fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Records that `vid` now belongs to `sid`.
    pub fn record_add(&mut self, sid: i64, vid: u64) {
        self.by_student.entry(sid).or_default().push(vid);
        *self.counts.entry(sid).or_insert(0) += 1;
    }

    /// Records that `vid` no longer belongs to `sid`. A no-op if the
    /// identifier was not associated with that student.
    pub fn record_remove(&mut self, sid: i64, vid: u64) {
        let Some(list) = self.by_student.get_mut(&sid) else {
            return;
        };
        let Some(pos) = list.iter().position(|&v| v == vid) else {
            return;
        };
        list.remove(pos);
        let count = self.counts.entry(sid).or_insert(0);
        *count = count.saturating_sub(1);
    }

    /// Empties the student's ownership list and zeroes their count,
    /// returning the previous identifiers so the caller can remove them
    /// from the index. The entries stay present, cleared.
    pub fn clear_student(&mut self, sid: i64) -> Vec<u64> {
        self.counts.insert(sid, 0);
        self.by_student
            .get_mut(&sid)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Finds the student owning `vid` by scanning the ownership lists.
    /// Linear in enrolled-vector count; identification is dominated by
    /// the similarity search, not this scan.
    pub fn reverse_lookup(&self, vid: u64) -> Option<i64> {
        for (&sid, list) in &self.by_student {
            if list.contains(&vid) {
                return Some(sid);
            }
        }
        None
    }

    /// Number of embeddings currently enrolled for the student.
    pub fn count_for(&self, sid: i64) -> u32 {
        self.counts.get(&sid).copied().unwrap_or(0)
    }

    /// Vector identifiers currently belonging to the student.
    pub fn vids_for(&self, sid: i64) -> &[u64] {
        self.by_student.get(&sid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All students with a ledger entry, including cleared ones.
    pub fn students(&self) -> Vec<i64> {
        self.counts.keys().copied().collect()
    }

    /// Every identifier currently owned by any student.
    pub fn all_vids(&self) -> impl Iterator<Item = u64> + '_ {
        self.by_student.values().flatten().copied()
    }

    /// Total enrolled vectors across all students.
    pub fn total(&self) -> usize {
        self.by_student.values().map(Vec::len).sum()
    }

    /// Highest identifier ever issued.
    pub fn last_id(&self) -> u64 {
        self.last_id
    }
}

/// A document is current (v2) when it carries the structured keys.
/// Anything else is the legacy flat count map.
fn is_current(value: &serde_json::Value) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.contains_key("counts") && o.contains_key("by_student"))
}

pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Wall-clock milliseconds since the Unix epoch.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}
