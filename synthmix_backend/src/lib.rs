pub mod output;
pub mod rt_processing;

pub use output::{ChunkSink, Output, RawSink, StreamingHandle, WavFileSink};
pub use rt_processing::{CallbackSlot, Mixer, SourceId};
