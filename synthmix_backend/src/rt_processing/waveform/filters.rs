//! Filters that wrap one or more sources.

use std::collections::VecDeque;

use synthmix_core::{Result, SynthError};

use super::{BoxedSource, WaveformSource};

/// Element-wise sum of several sources. Exhausted sources count as zero; the
/// mix ends when all of them are exhausted.
pub struct MixingFilter {
    sources: Vec<Option<BoxedSource>>,
    samplerate: u32,
}

impl MixingFilter {
    pub fn new(sources: Vec<BoxedSource>) -> Result<Self> {
        let samplerate = match sources.first() {
            Some(first) => first.samplerate(),
            None => return Err(SynthError::invalid("mixing filter needs at least one source")),
        };
        Ok(Self {
            sources: sources.into_iter().map(Some).collect(),
            samplerate,
        })
    }
}

impl WaveformSource for MixingFilter {
    fn next_value(&mut self) -> Option<f64> {
        let mut sum = 0.0;
        let mut any = false;
        for slot in self.sources.iter_mut() {
            if let Some(source) = slot {
                match source.next_value() {
                    Some(v) => {
                        sum += v;
                        any = true;
                    }
                    None => *slot = None,
                }
            }
        }
        any.then_some(sum)
    }

    fn samplerate(&self) -> u32 {
        self.samplerate
    }
}

/// Multiplies the source by a modulator (tremolo, ring modulation).
pub struct AmpModulationFilter {
    source: BoxedSource,
    modulator: BoxedSource,
}

impl AmpModulationFilter {
    pub fn new(source: impl WaveformSource + 'static, modulator: impl WaveformSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            modulator: Box::new(modulator),
        }
    }
}

impl WaveformSource for AmpModulationFilter {
    fn next_value(&mut self) -> Option<f64> {
        let v = self.source.next_value()?;
        let m = self.modulator.next_value()?;
        Some(v * m)
    }

    fn samplerate(&self) -> u32 {
        self.source.samplerate()
    }
}

/// Time shift. Positive delays prepend silence, negative ones skip the head
/// of the source. The source itself is untouched apart from being pulled.
pub struct DelayFilter {
    source: BoxedSource,
    pending_silence: usize,
    pending_skip: usize,
}

impl DelayFilter {
    pub fn new(source: impl WaveformSource + 'static, seconds: f64) -> Self {
        let amount = (source.samplerate() as f64 * seconds.abs()) as usize;
        let (pending_silence, pending_skip) = if seconds >= 0.0 { (amount, 0) } else { (0, amount) };
        Self {
            source: Box::new(source),
            pending_silence,
            pending_skip,
        }
    }
}

impl WaveformSource for DelayFilter {
    fn next_value(&mut self) -> Option<f64> {
        if self.pending_silence > 0 {
            self.pending_silence -= 1;
            return Some(0.0);
        }
        while self.pending_skip > 0 {
            self.source.next_value()?;
            self.pending_skip -= 1;
        }
        self.source.next_value()
    }

    fn samplerate(&self) -> u32 {
        self.source.samplerate()
    }
}

/// Smallest echo gain still worth computing.
const ECHO_FLOOR: f64 = 1e-6;

/// Plays the source as is for `after` seconds, then mixes `amount` echoes
/// of the rest into it, each `delay` seconds later and `decay` times softer
/// than the previous one. The echo tail keeps playing after the source ends.
pub struct EchoFilter {
    source: BoxedSource,
    samplerate: u32,
    passthrough: usize,
    delay_samples: usize,
    gains: Vec<f64>,
    history: VecDeque<f64>,
    source_done: bool,
    tail_remaining: usize,
    echo_duration: f64,
}

impl EchoFilter {
    /// `decay` must lie in (0, 1). The echo count is capped where the gain
    /// would drop below 1e-6.
    pub fn new(source: impl WaveformSource + 'static, after: f64, amount: usize, delay: f64, decay: f64) -> Result<Self> {
        if !(decay > 0.0 && decay < 1.0) {
            return Err(SynthError::invalid(format!("echo decay must be within (0, 1), got {decay}")));
        }
        if !(after >= 0.0 && delay >= 0.0) {
            return Err(SynthError::invalid("echo times must not be negative"));
        }
        let audible = (ECHO_FLOOR.ln() / decay.ln()).floor() as usize;
        let amount = amount.min(audible);
        let samplerate = source.samplerate();
        let delay_samples = (samplerate as f64 * delay) as usize;
        let gains: Vec<f64> = (1..=amount as i32).map(|k| decay.powi(k)).collect();
        let history_len = amount * delay_samples;
        Ok(Self {
            source: Box::new(source),
            samplerate,
            passthrough: (samplerate as f64 * after) as usize,
            delay_samples,
            gains,
            history: VecDeque::from(vec![0.0; history_len]),
            source_done: false,
            tail_remaining: 0,
            echo_duration: after + amount as f64 * delay,
        })
    }

    /// Length of the audible result: `after + amount * delay`.
    pub fn echo_duration(&self) -> f64 {
        self.echo_duration
    }

    pub fn echo_count(&self) -> usize {
        self.gains.len()
    }

    fn echoed(&mut self, x: f64) -> f64 {
        if self.delay_samples == 0 {
            return x * (1.0 + self.gains.iter().sum::<f64>());
        }
        let n = self.history.len();
        let echoes: f64 = self
            .gains
            .iter()
            .enumerate()
            .map(|(i, g)| g * self.history[n - (i + 1) * self.delay_samples])
            .sum();
        self.history.pop_front();
        self.history.push_back(x);
        x + echoes
    }
}

impl WaveformSource for EchoFilter {
    fn next_value(&mut self) -> Option<f64> {
        if self.passthrough > 0 {
            self.passthrough -= 1;
            return match self.source.next_value() {
                Some(v) => Some(v),
                None => {
                    // nothing left to echo
                    self.passthrough = 0;
                    self.source_done = true;
                    None
                }
            };
        }
        if !self.source_done {
            if let Some(v) = self.source.next_value() {
                return Some(self.echoed(v));
            }
            self.source_done = true;
            self.tail_remaining = self.history.len();
        }
        if self.tail_remaining == 0 {
            return None;
        }
        self.tail_remaining -= 1;
        Some(self.echoed(0.0))
    }

    fn samplerate(&self) -> u32 {
        self.samplerate
    }
}

/// Clamps source values to `[min, max]`.
pub struct ClipFilter {
    source: BoxedSource,
    min: f64,
    max: f64,
}

impl ClipFilter {
    pub fn new(source: impl WaveformSource + 'static, min: f64, max: f64) -> Result<Self> {
        if min > max {
            return Err(SynthError::invalid(format!("clip range is empty: [{min}, {max}]")));
        }
        Ok(Self { source: Box::new(source), min, max })
    }
}

impl WaveformSource for ClipFilter {
    fn next_value(&mut self) -> Option<f64> {
        self.source.next_value().map(|v| v.clamp(self.min, self.max))
    }

    fn samplerate(&self) -> u32 {
        self.source.samplerate()
    }
}

/// Rectifies a source: every value becomes its absolute value.
pub struct AbsFilter {
    source: BoxedSource,
}

impl AbsFilter {
    pub fn new(source: impl WaveformSource + 'static) -> Self {
        Self { source: Box::new(source) }
    }
}

impl WaveformSource for AbsFilter {
    fn next_value(&mut self) -> Option<f64> {
        self.source.next_value().map(f64::abs)
    }

    fn samplerate(&self) -> u32 {
        self.source.samplerate()
    }
}

/// Passes values through unchanged.
pub struct NullFilter {
    source: BoxedSource,
}

impl NullFilter {
    pub fn new(source: impl WaveformSource + 'static) -> Self {
        Self { source: Box::new(source) }
    }
}

impl WaveformSource for NullFilter {
    fn next_value(&mut self) -> Option<f64> {
        self.source.next_value()
    }

    fn samplerate(&self) -> u32 {
        self.source.samplerate()
    }
}
