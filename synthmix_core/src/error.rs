use thiserror::Error;

/// Errors raised by sample buffers, oscillators and mixer admission.
///
/// Chunk production itself never returns one of these: a misbehaving source
/// is dropped from the mixer and mixing carries on.
#[derive(Debug, Error)]
pub enum SynthError {
    #[error("cannot modify a locked sample")]
    Locked,

    #[error("parameter mismatch: {0}")]
    ParameterMismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("streaming thread failed: {0}")]
    Streaming(String),
}

pub type Result<T> = std::result::Result<T, SynthError>;

impl SynthError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        SynthError::InvalidConfig(msg.into())
    }

    pub fn mismatch(msg: impl Into<String>) -> Self {
        SynthError::ParameterMismatch(msg.into())
    }
}
