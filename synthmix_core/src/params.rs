//! Engine configuration.
//!
//! Everything here deserializes from JSON with defaults for missing fields,
//! so a config file only has to name what it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthError};

pub const DEFAULT_SAMPLERATE: u32 = 44100;
pub const DEFAULT_SAMPLEWIDTH: u16 = 2;
pub const DEFAULT_NCHANNELS: u16 = 2;

/// PCM format shared by a mixer and everything it plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioParams {
    pub samplerate: u32,
    /// Bytes per sample value (2, 3 or 4).
    pub samplewidth: u16,
    pub nchannels: u16,
    pub frames_per_chunk: usize,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            samplerate: DEFAULT_SAMPLERATE,
            samplewidth: DEFAULT_SAMPLEWIDTH,
            nchannels: DEFAULT_NCHANNELS,
            frames_per_chunk: (DEFAULT_SAMPLERATE / 30) as usize,
        }
    }
}

impl AudioParams {
    pub fn new(samplerate: u32, samplewidth: u16, nchannels: u16, frames_per_chunk: usize) -> Result<Self> {
        let params = Self { samplerate, samplewidth, nchannels, frames_per_chunk };
        params.validate()?;
        Ok(params)
    }

    /// Bytes in one interleaved frame.
    pub fn frame_size(&self) -> usize {
        self.samplewidth as usize * self.nchannels as usize
    }

    /// Chunk byte size, fixed for the lifetime of a mixer.
    pub fn chunksize(&self) -> usize {
        self.frames_per_chunk * self.frame_size()
    }

    /// Duration of one chunk in seconds.
    pub fn chunk_duration(&self) -> f64 {
        self.frames_per_chunk as f64 / self.samplerate as f64
    }

    pub fn validate(&self) -> Result<()> {
        validate_format(self.samplerate, self.samplewidth, self.nchannels)?;
        if self.frames_per_chunk == 0 {
            return Err(SynthError::invalid("frames_per_chunk must be positive"));
        }
        Ok(())
    }
}

/// Shared check for sample formats the engine can handle.
pub fn validate_format(samplerate: u32, samplewidth: u16, nchannels: u16) -> Result<()> {
    if !(2..=4).contains(&samplewidth) {
        return Err(SynthError::invalid(format!("samplewidth must be 2, 3 or 4, got {samplewidth}")));
    }
    if !(1..=2).contains(&nchannels) {
        return Err(SynthError::invalid(format!("nchannels must be 1 or 2, got {nchannels}")));
    }
    if samplerate <= 1 {
        return Err(SynthError::invalid(format!("samplerate must be > 1, got {samplerate}")));
    }
    Ok(())
}

/// Concurrency caps enforced when sources are admitted into the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerLimits {
    /// Default maximum of simultaneous instances sharing a sample name.
    pub max_per_name: usize,
    /// Hard cap on simultaneous sources.
    pub max_total: usize,
}

impl Default for MixerLimits {
    fn default() -> Self {
        Self { max_per_name: 4, max_total: 8 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioParams,
    pub limits: MixerLimits,
    /// Fade sources in on their first chunk and out when stopped.
    pub pop_prevention: bool,
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.audio.validate()?;
        if self.limits.max_total == 0 {
            return Err(SynthError::invalid("max_total must be at least 1"));
        }
        Ok(())
    }
}
