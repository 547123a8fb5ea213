use attend_core::{
    Control, CsvDayStore, ExitReason, FrameSource, Gallery, Ledger, LoopConfig, LoopSnapshot,
    RecognitionLoop, StabilizerError, TrackerKind,
};
use attend_hw::{Camera, CameraError};
use attend_vision::{ExtractorError, OnnxExtractor};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("extractor error: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("stabilizer config: {0}")]
    Stabilizer(#[from] StabilizerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to an engine thread.
enum EngineRequest {
    Status {
        reply: oneshot::Sender<LoopSnapshot>,
    },
    Stop,
}

/// Clone-safe handle to one engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    device: String,
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Snapshot of the loop's counters and current tracks.
    pub async fn status(&self) -> Result<LoopSnapshot, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Ask the loop to stop after the current frame. A no-op if it already exited.
    pub async fn stop(&self) {
        if self.tx.send(EngineRequest::Stop).await.is_err() {
            tracing::debug!(device = %self.device, "engine already stopped");
        }
    }
}

/// Everything an engine thread needs besides its device.
pub struct EngineParams {
    pub model_dir: std::path::PathBuf,
    pub gallery: Arc<Gallery>,
    pub ledger: Arc<Ledger<CsvDayStore>>,
    pub tracker: TrackerKind,
    pub loop_config: LoopConfig,
    pub warmup_frames: usize,
    pub detect_threshold: f32,
    pub nms_threshold: f32,
}

/// Spawn a recognition loop for `device` on a dedicated OS thread.
///
/// The camera is opened and both ONNX models loaded before the thread
/// starts, so a missing device or model fails startup. The thread owns the
/// camera until the loop exits; joining yields the exit reason.
pub fn spawn_engine(
    index: usize,
    device: &str,
    params: &EngineParams,
) -> Result<(EngineHandle, JoinHandle<ExitReason>), EngineError> {
    params.loop_config.stabilizer.validate()?;

    let camera = Camera::open(device)?;
    tracing::info!(
        device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let extractor = OnnxExtractor::load(&params.model_dir)?
        .with_detection_thresholds(params.detect_threshold, params.nms_threshold);
    tracing::info!(
        model_dir = %params.model_dir.display(),
        detect_threshold = params.detect_threshold,
        nms_threshold = params.nms_threshold,
        "face models loaded"
    );

    let (tx, rx) = mpsc::channel::<EngineRequest>(4);
    let gallery = Arc::clone(&params.gallery);
    let ledger = Arc::clone(&params.ledger);
    let tracker = params.tracker;
    let loop_config = params.loop_config;
    let warmup_frames = params.warmup_frames;

    let thread = std::thread::Builder::new()
        .name(format!("attend-engine-{index}"))
        .spawn(move || {
            tracing::info!(device = %camera.device_path, "engine thread started");
            let reason = run_camera(
                &camera,
                extractor,
                gallery,
                ledger,
                tracker,
                loop_config,
                warmup_frames,
                rx,
            );
            tracing::info!(device = %camera.device_path, reason = ?reason, "engine thread exiting");
            reason
        })
        .map_err(EngineError::Spawn)?;

    Ok((
        EngineHandle {
            device: device.to_string(),
            tx,
        },
        thread,
    ))
}

#[allow(clippy::too_many_arguments)]
fn run_camera(
    camera: &Camera,
    extractor: OnnxExtractor,
    gallery: Arc<Gallery>,
    ledger: Arc<Ledger<CsvDayStore>>,
    tracker: TrackerKind,
    loop_config: LoopConfig,
    warmup_frames: usize,
    mut rx: mpsc::Receiver<EngineRequest>,
) -> ExitReason {
    let mut stream = match camera.stream() {
        Ok(stream) => stream,
        Err(e) => return ExitReason::SourceFailed(e.to_string()),
    };

    // Let auto-exposure settle before anything is classified.
    if warmup_frames > 0 {
        tracing::info!(count = warmup_frames, "discarding warmup frames");
        for _ in 0..warmup_frames {
            if let Err(e) = stream.grab() {
                return ExitReason::SourceFailed(e.to_string());
            }
        }
    }

    let mut recognition = match RecognitionLoop::new(
        stream,
        extractor,
        gallery,
        ledger,
        tracker.build(),
        loop_config,
    ) {
        Ok(recognition) => recognition,
        Err(e) => return ExitReason::SourceFailed(e.to_string()),
    };

    recognition.run(|current| poll_requests(&mut rx, || current.snapshot()))
}

/// Answer pending requests without blocking; `Stop` or a dropped sender stops the loop.
fn poll_requests(
    rx: &mut mpsc::Receiver<EngineRequest>,
    snapshot: impl Fn() -> LoopSnapshot,
) -> Control {
    loop {
        match rx.try_recv() {
            Ok(EngineRequest::Status { reply }) => {
                let _ = reply.send(snapshot());
            }
            Ok(EngineRequest::Stop) => return Control::Stop,
            Err(TryRecvError::Empty) => return Control::Continue,
            Err(TryRecvError::Disconnected) => return Control::Stop,
        }
    }
}

/// Spawn one engine per configured device; any failure aborts startup.
pub fn spawn_all(
    devices: &[String],
    params: &EngineParams,
) -> Result<Vec<(EngineHandle, JoinHandle<ExitReason>)>, EngineError> {
    devices
        .iter()
        .enumerate()
        .map(|(index, device)| spawn_engine(index, device, params))
        .collect()
}

/// Model directory sanity check used before any camera is touched.
pub fn check_models(model_dir: &Path) -> Result<(), EngineError> {
    for name in [attend_vision::DETECTOR_MODEL, attend_vision::RECOGNIZER_MODEL] {
        let path = model_dir.join(name);
        if !path.exists() {
            return Err(ExtractorError::ModelNotFound(path).into());
        }
    }
    Ok(())
}
