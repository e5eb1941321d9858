pub mod classes;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod display;
pub mod error;
pub mod network;
pub mod optimizer;
pub mod preprocessing;
pub mod reporter;
pub mod session;
pub mod store;
pub mod stream;

// Feature window geometry - matches the browser FFT feature extractor
pub const NUM_FRAMES: usize = 9; // time steps per window, ~23ms each
pub const FREQUENCY_BINS: usize = 232;

// Calibration for the feature extractor's dB output range (not learned)
pub const NORMALIZE_MEAN: f32 = -100.0;
pub const NORMALIZE_STD: f32 = 10.0;

// Network
pub const DEPTH_MULTIPLIER: usize = 8;
pub const KERNEL_BINS: usize = 3;
pub const POOL_SIZE: [usize; 2] = [1, 2];
pub const POOL_STRIDES: [usize; 2] = [2, 2];

// Training schedule
pub const EPOCHS: usize = 10;
pub const BATCH_SIZE: usize = 16;
pub const LEARNING_RATE: f32 = 0.01;

// Stream defaults
pub const OVERLAP_FACTOR: f32 = 0.999;
pub const PROBABILITY_THRESHOLD: f32 = 0.75;

pub use classes::ClassList;
pub use classifier::{Classifier, EpochMetrics, FitHistory, FitOptions, ProbabilityVector};
pub use config::Config;
pub use dataset::{Dataset, Example, TrainingTensors};
pub use display::{Controls, DisplaySink};
pub use error::{Result, SessionError};
pub use network::{Topology, WindowShape};
pub use reporter::{Report, ResultReporter};
pub use session::{SessionController, SessionState};
pub use store::{FileModelStore, MemoryModelStore, ModelLocation, ModelStore};
pub use stream::{ChannelStream, FeatureStream, FrameFeeder, SpectrogramFrame, StreamMode};
