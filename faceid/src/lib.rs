//! Face-based student identity store.
//!
//! Pairs an exact nearest-neighbor index over face embeddings with a
//! durable metadata ledger that maps vector identifiers to student
//! identifiers. Together they answer "whose face is this?" and stay
//! consistent under enroll/remove/rebuild cycles and process restarts.
//!
//! # Usage
//!
//! ```no_run
//! use classwatch_faceid::{Config, FaceStore};
//!
//! let store = FaceStore::open(
//!     Config {
//!         dim: 512,
//!         threshold: 0.6,
//!         index_path: "assets/index.bin".into(),
//!         ledger_path: "assets/ledger.json".into(),
//!     },
//!     None,
//! ).unwrap();
//!
//! # let embedding = vec![0.0f32; 512];
//! let vid = store.enroll(7, &embedding).unwrap();
//! if let Some(m) = store.identify(&embedding).unwrap() {
//!     println!("student {} (similarity {:.3})", m.sid, m.similarity);
//! }
//! ```
//!
//! # Design
//!
//! Every mutating operation holds a single writer lock across both the
//! index and the ledger, including the snapshot writes, so a reader never
//! observes a half-applied operation. The index snapshot is persisted
//! before the ledger: a crash between the two leaves an orphan index
//! vector that [`FaceStore::open`] detects and drops, never a ledger
//! entry pointing at a missing vector.

pub mod error;
pub mod extract;
pub mod faceid;
pub mod ledger;

pub use error::FaceIdError;
pub use extract::{best_face, DetectedFace, FaceExtractor};
pub use faceid::{Config, FaceHit, FaceMatch, FaceStore, RebuildReport};
pub use ledger::Ledger;
