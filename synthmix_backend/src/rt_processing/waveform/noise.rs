use std::sync::atomic::{AtomicU32, Ordering};

use synthmix_core::{Result, SynthError};

use super::{OscParams, WaveformSource};

/// Linear congruential generator; fast, deterministic, good enough for noise.
struct FastRng {
    state: u32,
}

impl FastRng {
    fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    #[inline]
    fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(1664525).wrapping_add(1013904223);
        self.state
    }

    /// Uniform in [0.0, 1.0).
    #[inline]
    fn next_unit(&mut self) -> f64 {
        self.next_u32() as f64 / 4294967296.0
    }

    /// Uniform in [-1.0, 1.0).
    #[inline]
    fn next_bipolar(&mut self) -> f64 {
        self.next_unit() * 2.0 - 1.0
    }
}

static SEED_COUNTER: AtomicU32 = AtomicU32::new(0x9E37_79B9);

fn fresh_seed() -> u32 {
    SEED_COUNTER.fetch_add(0x9E37_79B9, Ordering::Relaxed)
}

/// Band-limited "plateau" white noise: each random value is held for
/// `samplerate / frequency` samples.
pub struct WhiteNoise {
    rng: FastRng,
    amplitude: f64,
    bias: f64,
    samplerate: u32,
    cycles: usize,
    held: f64,
    remaining: usize,
}

impl WhiteNoise {
    /// Only frequency, amplitude, bias and samplerate of `params` are used.
    pub fn new(params: OscParams) -> Result<Self> {
        params.validate()?;
        let cycles = (params.samplerate as f64 / params.frequency) as usize;
        if params.frequency == 0.0 || cycles < 1 {
            return Err(SynthError::invalid(format!(
                "noise frequency {} must be positive and not above the samplerate {}",
                params.frequency, params.samplerate
            )));
        }
        Ok(Self {
            rng: FastRng::new(fresh_seed()),
            amplitude: params.amplitude,
            bias: params.bias,
            samplerate: params.samplerate,
            cycles,
            held: 0.0,
            remaining: 0,
        })
    }

    /// Reseeds for reproducible output.
    pub fn with_seed(mut self, seed: u32) -> Self {
        self.rng = FastRng::new(seed);
        self.remaining = 0;
        self
    }

    /// Samples each random value is held for.
    pub fn hold_length(&self) -> usize {
        self.cycles
    }
}

impl WaveformSource for WhiteNoise {
    fn next_value(&mut self) -> Option<f64> {
        if self.remaining == 0 {
            self.held = self.rng.next_bipolar() * self.amplitude + self.bias;
            self.remaining = self.cycles;
        }
        self.remaining -= 1;
        Some(self.held)
    }

    fn samplerate(&self) -> u32 {
        self.samplerate
    }
}
