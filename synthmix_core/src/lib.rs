pub mod error;
pub mod params;
pub mod pcm;
pub mod sample;
pub mod stream;

pub use error::{Result, SynthError};
pub use params::{AudioParams, EngineConfig, MixerLimits};
pub use sample::{Channel, FrameChunks, Sample, StopCondition};
pub use stream::PcmStreamChunks;
