use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{info, warn};

use classwatch_vecindex::{l2_normalize, FlatIndex};

use crate::error::FaceIdError;
use crate::extract::{best_face, FaceExtractor};
use crate::ledger::{tmp_path, Ledger};

/// Controls store behavior.
#[derive(Debug, Clone)]
pub struct Config {
    /// Embedding dimension (e.g. 512).
    pub dim: usize,

    /// Minimum cosine similarity for an identification to count as a
    /// match. Candidates strictly below this are rejected regardless of
    /// how they compare to other candidates. Default: 0.6.
    pub threshold: f32,

    /// Path of the binary index snapshot.
    pub index_path: PathBuf,

    /// Path of the JSON metadata ledger.
    pub ledger_path: PathBuf,
}

impl Config {
    fn with_defaults(mut self) -> Self {
        if self.threshold == 0.0 {
            self.threshold = 0.6;
        }
        self
    }
}

/// A successful identification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceMatch {
    /// The enrolled student the query embedding matched.
    pub sid: i64,

    /// Cosine similarity to the matched vector, in [-1, 1].
    pub similarity: f32,
}

/// Per-face result of [`FaceStore::identify_image`].
#[derive(Debug, Clone)]
pub struct FaceHit {
    /// Bounding box of the detected face, as reported by the extractor.
    pub bbox: [f32; 4],

    /// Best similarity found for this face (0.0 when the index is empty).
    pub similarity: f32,

    /// The matched student, if the best similarity cleared the threshold
    /// and the vector could be resolved to an owner.
    pub matched: Option<FaceMatch>,
}

/// Outcome of [`FaceStore::rebuild_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildReport {
    /// Embeddings successfully re-enrolled.
    pub enrolled: usize,

    /// Images skipped: no usable face, bad embedding, or extractor error.
    pub failed: usize,
}

struct StoreInner {
    index: FlatIndex,
    ledger: Ledger,
    threshold: f32,
}

/// The identity store: an exact nearest-neighbor index over enrolled
/// face embeddings plus the durable ledger mapping vectors to students.
///
/// All methods take `&self`; a single `RwLock` over the index/ledger pair
/// makes mutating operations (and their snapshot writes) mutually
/// exclusive while identifications proceed concurrently.
pub struct FaceStore {
    dim: usize,
    index_path: PathBuf,
    ledger_path: PathBuf,
    inner: RwLock<StoreInner>,
    extractor: Option<Box<dyn FaceExtractor>>,
}

impl std::fmt::Debug for FaceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceStore")
            .field("dim", &self.dim)
            .field("index_path", &self.index_path)
            .field("ledger_path", &self.ledger_path)
            .field("has_extractor", &self.extractor.is_some())
            .finish()
    }
}

impl FaceStore {
    /// Opens the store at the configured paths, or initializes a fresh
    /// one if either snapshot is absent. Panics if `cfg.dim` is 0.
    ///
    /// On load, the two artifacts are reconciled: index vectors the
    /// ledger doesn't know about (leftovers of an enroll interrupted
    /// between the two snapshot writes) are dropped, and ledger entries
    /// pointing at missing vectors are erased. A migrated or recovered
    /// ledger is persisted immediately.
    pub fn open(
        cfg: Config,
        extractor: Option<Box<dyn FaceExtractor>>,
    ) -> Result<Self, FaceIdError> {
        assert!(cfg.dim > 0, "faceid: Config.dim must be positive");
        let cfg = cfg.with_defaults();

        if let Some(ex) = &extractor {
            if ex.dimension() != cfg.dim {
                return Err(FaceIdError::DimensionMismatch {
                    got: ex.dimension(),
                    want: cfg.dim,
                });
            }
        }

        let have_both = cfg.index_path.exists() && cfg.ledger_path.exists();
        let (index, ledger) = if have_both {
            Self::load_and_reconcile(&cfg)?
        } else {
            info!("creating new identity store (dim {})", cfg.dim);
            let index = FlatIndex::new(cfg.dim);
            let ledger = Ledger::fresh();
            persist_index(&cfg.index_path, &index)?;
            ledger.save(&cfg.ledger_path)?;
            (index, ledger)
        };

        Ok(Self {
            dim: cfg.dim,
            index_path: cfg.index_path,
            ledger_path: cfg.ledger_path,
            inner: RwLock::new(StoreInner {
                index,
                ledger,
                threshold: cfg.threshold,
            }),
            extractor,
        })
    }

    fn load_and_reconcile(cfg: &Config) -> Result<(FlatIndex, Ledger), FaceIdError> {
        let mut f = fs::File::open(&cfg.index_path)
            .map_err(|e| FaceIdError::Persistence(e.to_string()))?;
        let mut index = classwatch_vecindex::load(&mut f)?;
        if index.dim() != cfg.dim {
            return Err(FaceIdError::DimensionMismatch {
                got: index.dim(),
                want: cfg.dim,
            });
        }

        let (mut ledger, mut ledger_dirty) = Ledger::load(&cfg.ledger_path);

        // Index vectors the ledger doesn't own: crash leftovers from an
        // enroll that persisted the index but not the ledger.
        let known: HashSet<u64> = ledger.all_vids().collect();
        let orphans: HashSet<u64> = index
            .vids()
            .into_iter()
            .filter(|vid| !known.contains(vid))
            .collect();
        let mut index_dirty = false;
        if !orphans.is_empty() {
            warn!(
                "dropping {} index vector(s) unknown to the ledger",
                orphans.len()
            );
            index.remove(&orphans);
            index_dirty = true;
        }

        // Ledger entries pointing at vectors the index no longer holds.
        let mut dangling: Vec<(i64, u64)> = Vec::new();
        for sid in ledger.students() {
            for &vid in ledger.vids_for(sid) {
                if !index.contains(vid) {
                    dangling.push((sid, vid));
                }
            }
        }
        if !dangling.is_empty() {
            warn!("erasing {} dangling ledger entries", dangling.len());
            for (sid, vid) in dangling {
                ledger.record_remove(sid, vid);
            }
            ledger_dirty = true;
        }

        if index_dirty {
            persist_index(&cfg.index_path, &index)?;
        }
        if ledger_dirty {
            ledger.save(&cfg.ledger_path)?;
        }
        Ok((index, ledger))
    }

    /// Enrolls an embedding for the student and returns its new vector
    /// identifier. The embedding is L2-normalized before storage.
    ///
    /// The index snapshot is persisted before the ledger: a crash between
    /// the two leaves a detectable orphan vector that the next `open`
    /// drops, never a ledger entry pointing at nothing.
    pub fn enroll(&self, sid: i64, embedding: &[f32]) -> Result<u64, FaceIdError> {
        let vector = self.normalized(embedding)?;

        let mut inner = self.inner.write().unwrap();
        let vid = inner.ledger.next_id();
        inner.index.insert(vid, &vector)?;
        inner.ledger.record_add(sid, vid);

        persist_index(&self.index_path, &inner.index)?;
        inner.ledger.save(&self.ledger_path)?;

        info!(
            "enrolled embedding for student {} (vid {}), {} vectors total",
            sid,
            vid,
            inner.index.len()
        );
        Ok(vid)
    }

    /// Identifies the student whose enrolled embedding is most similar
    /// to the query, or `None` if the store is empty, the best candidate
    /// falls below the threshold, or the matched vector cannot be
    /// resolved to an owner (drift, indistinguishable from no-match
    /// here; the drift itself is logged).
    pub fn identify(&self, embedding: &[f32]) -> Result<Option<FaceMatch>, FaceIdError> {
        let query = self.normalized(embedding)?;
        let inner = self.inner.read().unwrap();
        let (_, matched) = best_match(&inner, &query)?;
        Ok(matched)
    }

    /// Runs the extractor over an image and identifies every detected
    /// face. Faces without a usable embedding are skipped.
    pub fn identify_image(&self, image: &[u8]) -> Result<Vec<FaceHit>, FaceIdError> {
        let extractor = self.extractor.as_deref().ok_or(FaceIdError::NoExtractor)?;
        let faces = extractor.extract(image)?;

        let inner = self.inner.read().unwrap();
        let mut hits = Vec::new();
        for face in &faces {
            let Some(embedding) = &face.embedding else {
                continue;
            };
            if embedding.len() != self.dim {
                continue;
            }
            let mut query = embedding.clone();
            l2_normalize(&mut query);
            let (similarity, matched) = best_match(&inner, &query)?;
            hits.push(FaceHit {
                bbox: face.bbox,
                similarity,
                matched,
            });
        }
        Ok(hits)
    }

    /// Removes a single vector. Returns `false` (with the ledger
    /// untouched and nothing persisted) when the index holds no such
    /// vector (a stale identifier); whether to repair with
    /// [`FaceStore::rebuild_all`] is the caller's call.
    pub fn remove_one(&self, sid: i64, vid: u64) -> Result<bool, FaceIdError> {
        let mut inner = self.inner.write().unwrap();

        let removed = inner.index.remove(&HashSet::from([vid]));
        if removed == 0 {
            warn!("remove of vid {} for student {} found nothing in the index", vid, sid);
            return Ok(false);
        }

        inner.ledger.record_remove(sid, vid);
        persist_index(&self.index_path, &inner.index)?;
        inner.ledger.save(&self.ledger_path)?;

        info!("removed vid {} for student {}", vid, sid);
        Ok(true)
    }

    /// Removes every embedding enrolled for the student and returns the
    /// count actually removed from the index.
    pub fn remove_all(&self, sid: i64) -> Result<usize, FaceIdError> {
        let mut inner = self.inner.write().unwrap();
        let removed = clear_student(&mut inner, sid);

        persist_index(&self.index_path, &inner.index)?;
        inner.ledger.save(&self.ledger_path)?;

        info!("removed all {} embedding(s) for student {}", removed, sid);
        Ok(removed)
    }

    /// Clears the student's embeddings and re-enrolls from the supplied
    /// images. Images that fail extraction (no face, no embedding, wrong
    /// dimension, extractor error) are skipped and counted, never fatal.
    ///
    /// This is the designed repair path for drift between the index and
    /// the ledger (or the photo records that produced the images).
    pub fn rebuild_all(
        &self,
        sid: i64,
        images: &[Vec<u8>],
    ) -> Result<RebuildReport, FaceIdError> {
        let extractor = self.extractor.as_deref().ok_or(FaceIdError::NoExtractor)?;

        let mut inner = self.inner.write().unwrap();
        clear_student(&mut inner, sid);
        persist_index(&self.index_path, &inner.index)?;
        inner.ledger.save(&self.ledger_path)?;

        let mut enrolled = 0;
        let mut failed = 0;
        for image in images {
            let faces = match extractor.extract(image) {
                Ok(f) => f,
                Err(e) => {
                    warn!("extraction failed during rebuild for student {}: {}", sid, e);
                    failed += 1;
                    continue;
                }
            };
            let Some(face) = best_face(&faces) else {
                failed += 1;
                continue;
            };
            let Some(embedding) = &face.embedding else {
                failed += 1;
                continue;
            };
            if embedding.len() != self.dim {
                failed += 1;
                continue;
            }

            let mut vector = embedding.clone();
            l2_normalize(&mut vector);
            let vid = inner.ledger.next_id();
            inner.index.insert(vid, &vector)?;
            inner.ledger.record_add(sid, vid);
            enrolled += 1;
        }

        persist_index(&self.index_path, &inner.index)?;
        inner.ledger.save(&self.ledger_path)?;

        info!(
            "rebuilt embeddings for student {}: {} enrolled, {} skipped",
            sid, enrolled, failed
        );
        Ok(RebuildReport { enrolled, failed })
    }

    /// Number of embeddings currently enrolled for the student.
    pub fn embedding_count(&self, sid: i64) -> u32 {
        self.inner.read().unwrap().ledger.count_for(sid)
    }

    /// Total vectors in the index.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().index.len()
    }

    /// Returns true if no vectors are enrolled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adjusts matching strictness at runtime.
    pub fn set_threshold(&self, t: f32) {
        self.inner.write().unwrap().threshold = t;
    }

    /// The current similarity threshold.
    pub fn threshold(&self) -> f32 {
        self.inner.read().unwrap().threshold
    }

    fn normalized(&self, embedding: &[f32]) -> Result<Vec<f32>, FaceIdError> {
        if embedding.len() != self.dim {
            return Err(FaceIdError::DimensionMismatch {
                got: embedding.len(),
                want: self.dim,
            });
        }
        let mut vector = embedding.to_vec();
        l2_normalize(&mut vector);
        Ok(vector)
    }
}

/// Top-1 search plus owner resolution. Returns the best raw similarity
/// (0.0 on an empty index) and the match, if any.
fn best_match(
    inner: &StoreInner,
    query: &[f32],
) -> Result<(f32, Option<FaceMatch>), FaceIdError> {
    let matches = inner.index.search(query, 1)?;
    let Some(best) = matches.first().copied() else {
        return Ok((0.0, None));
    };
    if best.similarity < inner.threshold {
        return Ok((best.similarity, None));
    }
    match inner.ledger.reverse_lookup(best.vid) {
        Some(sid) => Ok((
            best.similarity,
            Some(FaceMatch {
                sid,
                similarity: best.similarity,
            }),
        )),
        None => {
            warn!(
                "vid {} matched at similarity {:.3} but has no ledger owner, treating as no-match",
                best.vid, best.similarity
            );
            Ok((best.similarity, None))
        }
    }
}

fn clear_student(inner: &mut StoreInner, sid: i64) -> usize {
    let vids: HashSet<u64> = inner.ledger.clear_student(sid).into_iter().collect();
    inner.index.remove(&vids)
}

fn persist_index(path: &Path, index: &FlatIndex) -> Result<(), FaceIdError> {
    let persist_err = |e: std::io::Error| FaceIdError::Persistence(e.to_string());

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(persist_err)?;
        }
    }

    let tmp = tmp_path(path);
    let mut f = fs::File::create(&tmp).map_err(persist_err)?;
    classwatch_vecindex::save(index, &mut f)?;
    fs::rename(&tmp, path).map_err(persist_err)?;
    Ok(())
}
