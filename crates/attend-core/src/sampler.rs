//! Capture source contract and the frame-skipping sampler.

use crate::types::Frame;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROCESS_EVERY: u32 = 2;
pub const DEFAULT_DOWNSAMPLE: u32 = 2;

/// What a capture source produced on one poll.
#[derive(Debug)]
pub enum Capture {
    Frame(Frame),
    /// No new frame yet; poll again.
    NotReady,
    /// The source has ended. Not an error.
    Exhausted,
}

/// A sequence of decoded frames. Errors are terminal for the consuming loop.
pub trait FrameSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn grab(&mut self) -> Result<Capture, Self::Error>;

    /// Human-readable name for logs (device path, file name, ...).
    fn describe(&self) -> String {
        "frame source".to_string()
    }
}

/// Cadence and cost control for the recognition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Classify one frame out of every `process_every` (1 = every frame).
    pub process_every: u32,
    /// Integer downsample factor applied to classified frames.
    pub downsample: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            process_every: DEFAULT_PROCESS_EVERY,
            downsample: DEFAULT_DOWNSAMPLE,
        }
    }
}

#[derive(Debug)]
pub enum Sampled {
    /// Downsampled copy to classify; `original` keeps full resolution.
    Process { small: Frame, original: Frame },
    Skip(Frame),
}

/// Decides which captured frames are classified. The first frame always is.
#[derive(Debug)]
pub struct FrameSampler {
    config: SamplerConfig,
    counter: u64,
}

impl FrameSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config: SamplerConfig {
                process_every: config.process_every.max(1),
                downsample: config.downsample.max(1),
            },
            counter: 0,
        }
    }

    pub fn config(&self) -> SamplerConfig {
        self.config
    }

    /// Scale that maps coordinates on the sampled frame back to the original.
    pub fn scale(&self) -> f32 {
        self.config.downsample as f32
    }

    pub fn sample(&mut self, frame: Frame) -> Sampled {
        let process = self.counter % self.config.process_every as u64 == 0;
        self.counter += 1;
        if process {
            Sampled::Process {
                small: frame.downsample(self.config.downsample),
                original: frame,
            }
        } else {
            Sampled::Skip(frame)
        }
    }
}
