//! The per-source recognition loop: sample → extract → classify → track →
//! stabilize → record.

use crate::classifier::classify;
use crate::gallery::{FaceExtractor, Gallery};
use crate::ledger::{Ledger, LedgerStore, RecordOutcome};
use crate::sampler::{Capture, FrameSampler, FrameSource, Sampled, SamplerConfig};
use crate::stabilizer::{Stabilizer, StabilizerConfig, StabilizerError};
use crate::tracking::TrackAssigner;
use crate::types::{BoundingBox, Decision, Frame, Label, Method, TrackId};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const NOT_READY_BACKOFF: Duration = Duration::from_millis(10);

/// Tunables for one recognition loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Distance tolerance τ: a match needs `distance < tolerance`.
    pub tolerance: f32,
    pub stabilizer: StabilizerConfig,
    pub sampler: SamplerConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceReport {
    pub track: TrackId,
    /// Location in full-resolution frame coordinates.
    pub location: BoundingBox,
    /// Raw single-frame label.
    pub label: Label,
    pub distance: f32,
    pub decision: Decision,
}

/// Outcome of one classified frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub sequence: u32,
    pub faces: Vec<FaceReport>,
    /// Identities written to the ledger because of this frame.
    pub newly_recorded: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LoopStats {
    pub frames_seen: u64,
    pub frames_processed: u64,
    pub extract_errors: u64,
    pub records_written: u64,
    pub ledger_errors: u64,
}

/// Point-in-time view of a loop, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct LoopSnapshot {
    pub source: String,
    pub stats: LoopStats,
    pub active_tracks: Vec<TrackId>,
    pub last_report: Option<FrameReport>,
}

#[derive(Debug)]
pub enum Step {
    Processed(FrameReport),
    Skipped,
    NotReady,
    Finished(ExitReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ExitReason {
    Stopped,
    Exhausted,
    SourceFailed(String),
}

/// What the controller wants after each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// One capture/classify/stabilize loop over a single frame source.
///
/// The gallery is shared read-only; the ledger is shared and internally
/// locked. The source is released when the loop is dropped.
pub struct RecognitionLoop<S, E, L> {
    source: S,
    extractor: E,
    gallery: Arc<Gallery>,
    ledger: Arc<Ledger<L>>,
    sampler: FrameSampler,
    tracker: Box<dyn TrackAssigner>,
    stabilizer: Stabilizer,
    tolerance: f32,
    clock: fn() -> NaiveDateTime,
    stats: LoopStats,
    last_report: Option<FrameReport>,
}

impl<S, E, L> RecognitionLoop<S, E, L>
where
    S: FrameSource,
    E: FaceExtractor,
    L: LedgerStore,
{
    pub fn new(
        source: S,
        extractor: E,
        gallery: Arc<Gallery>,
        ledger: Arc<Ledger<L>>,
        tracker: Box<dyn TrackAssigner>,
        config: LoopConfig,
    ) -> Result<Self, StabilizerError> {
        Ok(Self {
            source,
            extractor,
            gallery,
            ledger,
            sampler: FrameSampler::new(config.sampler),
            tracker,
            stabilizer: Stabilizer::new(config.stabilizer)?,
            tolerance: config.tolerance,
            clock: local_now,
            stats: LoopStats::default(),
            last_report: None,
        })
    }

    /// Replace the wall clock used to timestamp ledger records.
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        LoopSnapshot {
            source: self.source.describe(),
            stats: self.stats,
            active_tracks: self.stabilizer.active_tracks(),
            last_report: self.last_report.clone(),
        }
    }

    /// Pull one frame from the source and process it if the sampler says so.
    pub fn step(&mut self) -> Step {
        let frame = match self.source.grab() {
            Ok(Capture::Frame(frame)) => frame,
            Ok(Capture::NotReady) => return Step::NotReady,
            Ok(Capture::Exhausted) => return Step::Finished(ExitReason::Exhausted),
            Err(e) => return Step::Finished(ExitReason::SourceFailed(e.to_string())),
        };
        self.stats.frames_seen += 1;

        match self.sampler.sample(frame) {
            Sampled::Skip(_) => Step::Skipped,
            Sampled::Process { small, .. } => match self.process(&small) {
                Some(report) => {
                    self.last_report = Some(report.clone());
                    Step::Processed(report)
                }
                None => Step::Skipped,
            },
        }
    }

    fn process(&mut self, frame: &Frame) -> Option<FrameReport> {
        let detections = match self.extractor.extract(frame) {
            Ok(d) => d,
            Err(e) => {
                self.stats.extract_errors += 1;
                tracing::warn!(seq = frame.sequence, error = %e, "face extraction failed; frame dropped");
                return None;
            }
        };
        self.stats.frames_processed += 1;

        let boxes: Vec<BoundingBox> = detections.iter().map(|d| d.location.clone()).collect();
        let assignment = self.tracker.assign(&boxes);
        for track in &assignment.retired {
            self.stabilizer.forget(*track);
        }

        let scale = self.sampler.scale();
        let mut faces = Vec::with_capacity(detections.len());
        let mut newly_recorded = Vec::new();

        for (slot, (detection, track)) in detections.iter().zip(assignment.ids).enumerate() {
            let result = classify(slot, &detection.embedding, self.gallery.entries(), self.tolerance);
            let decision = self.stabilizer.observe(track, result.label.clone());

            if let Some(identity) = decision.confirmed_identity() {
                match self.ledger.record(identity, (self.clock)(), Method::Camera) {
                    Ok(RecordOutcome::Recorded(record)) => {
                        self.stats.records_written += 1;
                        newly_recorded.push(record.identity);
                    }
                    Ok(RecordOutcome::AlreadyPresent) => {}
                    Err(e) => {
                        // Identity stays unmarked; the next confirmation retries.
                        self.stats.ledger_errors += 1;
                        tracing::error!(identity, error = %e, "attendance write failed");
                    }
                }
            }

            faces.push(FaceReport {
                track,
                location: detection.location.scaled(scale),
                label: result.label,
                distance: result.distance,
                decision,
            });
        }

        tracing::trace!(seq = frame.sequence, faces = faces.len(), "frame classified");
        Some(FrameReport {
            sequence: frame.sequence,
            faces,
            newly_recorded,
        })
    }

    /// Run until the controller asks to stop or the source ends.
    ///
    /// `control` is consulted before every frame.
    pub fn run(&mut self, mut control: impl FnMut(&Self) -> Control) -> ExitReason {
        let source = self.source.describe();
        tracing::info!(source = %source, "recognition loop started");

        let reason = loop {
            if control(self) == Control::Stop {
                break ExitReason::Stopped;
            }
            match self.step() {
                Step::Finished(reason) => break reason,
                Step::NotReady => std::thread::sleep(NOT_READY_BACKOFF),
                Step::Processed(_) | Step::Skipped => {}
            }
        };

        match &reason {
            ExitReason::SourceFailed(e) => {
                tracing::error!(source = %source, error = %e, "capture failed; loop exiting")
            }
            other => tracing::info!(source = %source, reason = ?other, "recognition loop finished"),
        }
        tracing::info!(
            frames_seen = self.stats.frames_seen,
            frames_processed = self.stats.frames_processed,
            records_written = self.stats.records_written,
            "loop stats"
        );
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryStore;
    use crate::tracking::PositionalAssigner;
    use crate::types::{Detection, Embedding, GalleryEntry};
    use chrono::NaiveDate;
    use std::collections::VecDeque;

    #[derive(Debug, thiserror::Error)]
    #[error("camera unplugged")]
    struct Unplugged;

    /// Scripted source: each frame's first pixel selects the embedding script row.
    struct ScriptSource {
        frames: VecDeque<Result<Capture, Unplugged>>,
    }

    impl ScriptSource {
        fn frames(n: usize) -> Self {
            let frames = (0..n)
                .map(|i| {
                    Ok(Capture::Frame(Frame {
                        data: vec![i as u8; 16],
                        width: 4,
                        height: 4,
                        sequence: i as u32,
                    }))
                })
                .collect();
            Self { frames }
        }
    }

    impl FrameSource for ScriptSource {
        type Error = Unplugged;

        fn grab(&mut self) -> Result<Capture, Unplugged> {
            self.frames.pop_front().unwrap_or(Ok(Capture::Exhausted))
        }

        fn describe(&self) -> String {
            "script".into()
        }
    }

    /// Returns scripted per-frame face embeddings, keyed by frame sequence.
    struct ScriptExtractor {
        per_frame: Vec<Vec<Vec<f32>>>,
    }

    impl FaceExtractor for ScriptExtractor {
        type Error = Unplugged;

        fn extract(&mut self, frame: &Frame) -> Result<Vec<Detection>, Unplugged> {
            let faces = self.per_frame.get(frame.sequence as usize).cloned().unwrap_or_default();
            Ok(faces
                .into_iter()
                .enumerate()
                .map(|(i, values)| Detection {
                    location: BoundingBox {
                        x: 10.0 * i as f32, y: 0.0, width: 2.0, height: 2.0,
                        confidence: 0.9, landmarks: None,
                    },
                    embedding: Embedding::new(values),
                })
                .collect())
        }
    }

    const ALICE: [f32; 2] = [1.0, 0.0];
    const BOB: [f32; 2] = [0.0, 1.0];
    const STRANGER: [f32; 2] = [-1.0, -1.0];

    fn fixed_clock() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 9, 2)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap()
    }

    fn gallery() -> Arc<Gallery> {
        Arc::new(Gallery::from_entries(vec![
            GalleryEntry { identity: "Alice".into(), embedding: Embedding::new(ALICE.to_vec()) },
            GalleryEntry { identity: "Bob".into(), embedding: Embedding::new(BOB.to_vec()) },
        ]))
    }

    fn config() -> LoopConfig {
        LoopConfig {
            tolerance: 0.5,
            stabilizer: StabilizerConfig::default(),
            sampler: SamplerConfig { process_every: 1, downsample: 1 },
        }
    }

    fn build(
        frames: Vec<Vec<[f32; 2]>>,
        ledger: Arc<Ledger<MemoryStore>>,
        cfg: LoopConfig,
    ) -> RecognitionLoop<ScriptSource, ScriptExtractor, MemoryStore> {
        let n = frames.len();
        let per_frame = frames
            .into_iter()
            .map(|faces| faces.into_iter().map(|f| f.to_vec()).collect())
            .collect();
        RecognitionLoop::new(
            ScriptSource::frames(n),
            ScriptExtractor { per_frame },
            gallery(),
            ledger,
            Box::new(PositionalAssigner),
            cfg,
        )
        .unwrap()
        .with_clock(fixed_clock)
    }

    fn rows(ledger: &Ledger<MemoryStore>) -> Vec<String> {
        ledger
            .with_store(|s| s.records().iter().map(|r| r.identity.clone()).collect())
            .unwrap()
    }

    #[test]
    fn test_flicker_confirms_once() {
        let ledger = Arc::new(Ledger::new(MemoryStore::new()));
        let script = vec![
            vec![ALICE],
            vec![ALICE],
            vec![STRANGER],
            vec![ALICE],
            vec![ALICE],
            vec![ALICE],
        ];
        let mut lp = build(script, Arc::clone(&ledger), config());

        let mut reports = Vec::new();
        while let Step::Processed(r) = lp.step() {
            reports.push(r);
        }

        assert_eq!(reports.len(), 6);
        assert!(reports[..4].iter().all(|r| r.faces[0].decision == Decision::Processing));
        assert_eq!(reports[4].faces[0].decision, Decision::Confirmed(Label::Known("Alice".into())));
        assert_eq!(reports[4].newly_recorded, vec!["Alice".to_string()]);
        assert_eq!(reports[5].faces[0].decision, Decision::Confirmed(Label::Known("Alice".into())));
        assert!(reports[5].newly_recorded.is_empty());
        assert_eq!(rows(&ledger), vec!["Alice"]);
    }

    #[test]
    fn test_split_window_never_confirms() {
        let ledger = Arc::new(Ledger::new(MemoryStore::new()));
        let script = vec![vec![ALICE], vec![STRANGER], vec![ALICE], vec![STRANGER], vec![ALICE]];
        let mut lp = build(script, Arc::clone(&ledger), config());

        let reason = lp.run(|_| Control::Continue);
        assert_eq!(reason, ExitReason::Exhausted);
        assert!(rows(&ledger).is_empty());
        assert_eq!(lp.stats().frames_processed, 5);
    }

    #[test]
    fn test_two_people_recorded_in_order() {
        let ledger = Arc::new(Ledger::new(MemoryStore::new()));
        let script = vec![vec![BOB, ALICE]; 7];
        let mut lp = build(script, Arc::clone(&ledger), config());
        lp.run(|_| Control::Continue);

        assert_eq!(rows(&ledger), vec!["Bob", "Alice"]);
        assert_eq!(lp.stats().records_written, 2);
    }

    #[test]
    fn test_confirmed_unknown_is_not_recorded() {
        let ledger = Arc::new(Ledger::new(MemoryStore::new()));
        let mut lp = build(vec![vec![STRANGER]; 6], Arc::clone(&ledger), config());
        lp.run(|_| Control::Continue);
        assert!(rows(&ledger).is_empty());
        let last = lp.snapshot().last_report.unwrap();
        assert_eq!(last.faces[0].decision, Decision::Confirmed(Label::Unknown));
    }

    #[test]
    fn test_ledger_failure_is_retried_on_next_confirmation() {
        let ledger = Arc::new(Ledger::new(MemoryStore::new()));
        ledger.with_store(|s| s.fail_next_append()).unwrap();
        let mut lp = build(vec![vec![ALICE]; 6], Arc::clone(&ledger), config());
        lp.run(|_| Control::Continue);

        assert_eq!(lp.stats().ledger_errors, 1);
        assert_eq!(lp.stats().records_written, 1);
        assert_eq!(rows(&ledger), vec!["Alice"]);
    }

    #[test]
    fn test_sampler_skips_alternate_frames() {
        let ledger = Arc::new(Ledger::new(MemoryStore::new()));
        let cfg = LoopConfig {
            sampler: SamplerConfig { process_every: 2, downsample: 1 },
            ..config()
        };
        let mut lp = build(vec![vec![ALICE]; 10], Arc::clone(&ledger), cfg);
        lp.run(|_| Control::Continue);

        assert_eq!(lp.stats().frames_seen, 10);
        assert_eq!(lp.stats().frames_processed, 5);
        assert_eq!(rows(&ledger), vec!["Alice"]);
    }

    #[test]
    fn test_stop_request_ends_loop() {
        let ledger = Arc::new(Ledger::new(MemoryStore::new()));
        let mut lp = build(vec![vec![ALICE]; 10], ledger, config());
        let reason = lp.run(|lp| {
            if lp.stats().frames_seen >= 3 {
                Control::Stop
            } else {
                Control::Continue
            }
        });
        assert_eq!(reason, ExitReason::Stopped);
        assert_eq!(lp.stats().frames_seen, 3);
    }

    #[test]
    fn test_stalled_source_still_sees_stop() {
        let ledger = Arc::new(Ledger::new(MemoryStore::new()));
        let mut lp = build(vec![], ledger, config());
        lp.source.frames = std::iter::repeat_with(|| Ok(Capture::NotReady)).take(100).collect();

        let mut polls = 0;
        let reason = lp.run(|_| {
            polls += 1;
            if polls > 3 {
                Control::Stop
            } else {
                Control::Continue
            }
        });
        assert_eq!(reason, ExitReason::Stopped);
        assert_eq!(lp.stats().frames_seen, 0);
        assert_eq!(lp.source.frames.len(), 97);
    }

    #[test]
    fn test_source_failure_ends_loop() {
        let ledger = Arc::new(Ledger::new(MemoryStore::new()));
        let mut lp = build(vec![vec![ALICE]; 2], ledger, config());
        lp.source.frames.push_back(Err(Unplugged));

        let reason = lp.run(|_| Control::Continue);
        assert_eq!(reason, ExitReason::SourceFailed("camera unplugged".into()));
        assert_eq!(lp.stats().frames_seen, 2);
    }

    #[test]
    fn test_locations_are_rescaled() {
        let ledger = Arc::new(Ledger::new(MemoryStore::new()));
        let cfg = LoopConfig {
            sampler: SamplerConfig { process_every: 1, downsample: 2 },
            ..config()
        };
        let mut lp = build(vec![vec![BOB, ALICE]], ledger, cfg);
        let Step::Processed(report) = lp.step() else {
            panic!("expected a processed frame");
        };
        assert_eq!(report.faces[1].location.x, 20.0);
        assert_eq!(report.faces[1].location.width, 4.0);
    }
}
