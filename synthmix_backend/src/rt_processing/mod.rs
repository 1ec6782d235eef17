pub mod callback;
pub mod mixer;
pub mod performance;
pub mod waveform;

pub use callback::CallbackSlot;
pub use mixer::{ChunkStream, Mixer, SourceId};
pub use performance::{MixerStats, PerformanceMonitor};
