//! attend-core: Attendance marking from noisy per-frame face matches.
//!
//! Classifies face embeddings against a gallery, stabilizes the labels
//! over a short voting window per tracked face, and writes at most one
//! attendance record per person per day. Face detection/embedding and
//! camera capture are plugged in through [`FaceExtractor`] and
//! [`FrameSource`].

pub mod classifier;
pub mod gallery;
pub mod ledger;
pub mod sampler;
pub mod session;
pub mod stabilizer;
pub mod tracking;
pub mod types;

pub use classifier::{classify, EuclideanMatcher, MatchResult, Matcher};
pub use gallery::{load_gallery, FaceExtractor, Gallery, GalleryError, NamingConvention};
pub use ledger::{CsvDayStore, Ledger, LedgerError, LedgerStore, MemoryStore, RecordOutcome};
pub use sampler::{Capture, FrameSampler, FrameSource, SamplerConfig};
pub use session::{Control, ExitReason, LoopConfig, LoopSnapshot, RecognitionLoop};
pub use stabilizer::{Stabilizer, StabilizerConfig, StabilizerError};
pub use tracking::{IouAssigner, PositionalAssigner, TrackAssigner, TrackerKind};
pub use types::{
    AttendanceRecord, BoundingBox, ClassificationResult, Decision, Detection, Embedding, Frame,
    GalleryEntry, Label, Method, StableDecision, TrackId,
};

/// Base directory for gallery, ledger and models:
/// `$XDG_DATA_HOME/attend`, falling back to `~/.local/share/attend`.
pub fn default_data_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("attend")
}
