//! Lazily evaluated waveform generators and the filters that wrap them.
//!
//! Every generator implements [`WaveformSource`]. Filters and modulated
//! oscillators own their inputs as boxed sources, so a modulation chain is
//! always a tree.

pub mod envelopes;
pub mod filters;
pub mod noise;
pub mod oscillators;

use synthmix_core::params::DEFAULT_SAMPLERATE;
use synthmix_core::{AudioParams, Result, Sample, SynthError, pcm, sample::full_scale};

pub use envelopes::EnvelopeFilter;
pub use filters::{AbsFilter, AmpModulationFilter, ClipFilter, DelayFilter, EchoFilter, MixingFilter, NullFilter};
pub use noise::WhiteNoise;
pub use oscillators::{Harmonics, Linear, Oscillator, Waveform};

/// A single-pass generator of waveform values, one per sample tick.
///
/// `None` means the source is exhausted; plain oscillators never return it.
/// Once exhausted a source keeps returning `None`.
pub trait WaveformSource: Send {
    fn next_value(&mut self) -> Option<f64>;

    fn samplerate(&self) -> u32;

    /// Pulls up to `count` values, fewer if the source runs out.
    fn take_values(&mut self, count: usize) -> Vec<f64> {
        let mut values = Vec::with_capacity(count);
        while values.len() < count {
            match self.next_value() {
                Some(v) => values.push(v),
                None => break,
            }
        }
        values
    }
}

impl WaveformSource for Box<dyn WaveformSource> {
    fn next_value(&mut self) -> Option<f64> {
        (**self).next_value()
    }

    fn samplerate(&self) -> u32 {
        (**self).samplerate()
    }
}

pub type BoxedSource = Box<dyn WaveformSource>;

/// Shared construction parameters for the periodic oscillators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OscParams {
    pub frequency: f64,
    pub amplitude: f64,
    /// Starting phase as a fraction of one cycle.
    pub phase: f64,
    pub bias: f64,
    pub samplerate: u32,
}

impl OscParams {
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            amplitude: 1.0,
            phase: 0.0,
            bias: 0.0,
            samplerate: DEFAULT_SAMPLERATE,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude;
        self
    }

    pub fn with_phase(mut self, phase: f64) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_bias(mut self, bias: f64) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_samplerate(mut self, samplerate: u32) -> Self {
        self.samplerate = samplerate;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.samplerate <= 1 {
            return Err(SynthError::invalid(format!("samplerate must be > 1, got {}", self.samplerate)));
        }
        if !self.frequency.is_finite() || self.frequency < 0.0 {
            return Err(SynthError::invalid(format!("invalid frequency {}", self.frequency)));
        }
        if !self.amplitude.is_finite() || !self.phase.is_finite() || !self.bias.is_finite() {
            return Err(SynthError::invalid("amplitude, phase and bias must be finite"));
        }
        Ok(())
    }
}

/// Time keeping for periodic oscillators, including the FM phase correction.
///
/// With FM attached the effective frequency is recomputed every tick and the
/// accumulated phase correction absorbs the frequency change at the current
/// time, so the waveform argument never jumps.
pub(crate) struct PhaseClock {
    t: f64,
    increment: f64,
    frequency: f64,
    freq_previous: f64,
    phase_correction: f64,
    fm: Option<BoxedSource>,
}

impl PhaseClock {
    /// `cycle` is the length of one waveform period in the waveform's own
    /// argument units (2π for trigonometric shapes, 1 for the linear ones).
    pub(crate) fn new(params: &OscParams, cycle: f64, t_start: f64) -> Self {
        Self {
            t: t_start,
            increment: cycle / params.samplerate as f64,
            frequency: params.frequency,
            freq_previous: params.frequency,
            phase_correction: params.phase * cycle,
            fm: None,
        }
    }

    pub(crate) fn set_fm(&mut self, fm: BoxedSource) {
        self.fm = Some(fm);
    }

    /// Waveform argument for the current tick; advances time afterwards.
    #[inline]
    pub(crate) fn advance(&mut self) -> f64 {
        let tt = match self.fm.as_mut() {
            Some(fm) => {
                // an exhausted modulator counts as zero modulation
                let freq = self.frequency * (1.0 + fm.next_value().unwrap_or(0.0));
                self.phase_correction += (self.freq_previous - freq) * self.t;
                self.freq_previous = freq;
                self.t * freq + self.phase_correction
            }
            None => self.t * self.frequency + self.phase_correction,
        };
        self.t += self.increment;
        tt
    }
}

/// Materializes `duration` seconds of a source into a mono sample.
///
/// Stops early if the source runs out. `amplitude_scale` defaults to full
/// scale for the sample width.
pub fn render_sample(
    source: &mut dyn WaveformSource,
    duration: f64,
    samplewidth: u16,
    amplitude_scale: Option<f64>,
    name: &str,
) -> Result<Sample> {
    let required = (duration * source.samplerate() as f64).max(0.0) as usize;
    let values = source.take_values(required);
    Sample::from_float_values(values, source.samplerate(), samplewidth, amplitude_scale, name)
}

fn ensure_same_rate(sample: &Sample, source: &dyn WaveformSource) -> Result<()> {
    if source.samplerate() != sample.samplerate() {
        return Err(SynthError::mismatch(format!(
            "source samplerate {} differs from sample '{}' at {}",
            source.samplerate(),
            sample.name(),
            sample.samplerate()
        )));
    }
    Ok(())
}

/// Amplitude-modulates a sample by a source, one value per frame.
///
/// Frames after the source runs out keep their level.
pub fn modulate_amp(sample: &mut Sample, modulator: &mut dyn WaveformSource) -> Result<()> {
    ensure_same_rate(sample, modulator)?;
    sample.modulate_amp(std::iter::from_fn(|| modulator.next_value()))?;
    Ok(())
}

/// Pans a sample with an LFO, one panning value in [-1, 1] per frame.
/// A mono sample becomes stereo.
pub fn pan_lfo(sample: &mut Sample, lfo: &mut dyn WaveformSource) -> Result<()> {
    ensure_same_rate(sample, lfo)?;
    sample.pan_lfo(std::iter::from_fn(|| lfo.next_value()))?;
    Ok(())
}

/// Live PCM chunks straight from a waveform source, for feeding the mixer
/// without materializing a sample first.
///
/// Each value is written to every channel. The last chunk may be short; the
/// mixer pads it.
pub struct WaveformChunks {
    source: BoxedSource,
    frames_per_chunk: usize,
    samplewidth: usize,
    nchannels: usize,
    scale: f64,
}

impl WaveformChunks {
    pub fn new(source: BoxedSource, params: &AudioParams, amplitude_scale: Option<f64>) -> Result<Self> {
        if source.samplerate() != params.samplerate {
            return Err(SynthError::mismatch(format!(
                "source samplerate {} differs from output samplerate {}",
                source.samplerate(),
                params.samplerate
            )));
        }
        Ok(Self {
            source,
            frames_per_chunk: params.frames_per_chunk,
            samplewidth: params.samplewidth as usize,
            nchannels: params.nchannels as usize,
            scale: amplitude_scale.unwrap_or_else(|| full_scale(params.samplewidth)),
        })
    }
}

impl Iterator for WaveformChunks {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let values = self.source.take_values(self.frames_per_chunk);
        if values.is_empty() {
            return None;
        }
        let mut chunk = vec![0u8; values.len() * self.samplewidth * self.nchannels];
        for (frame, v) in chunk.chunks_exact_mut(self.samplewidth * self.nchannels).zip(values) {
            let value = (v * self.scale) as i64;
            for s in frame.chunks_exact_mut(self.samplewidth) {
                pcm::write_sample(s, self.samplewidth, value);
            }
        }
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        left: usize,
    }

    impl WaveformSource for Counter {
        fn next_value(&mut self) -> Option<f64> {
            if self.left == 0 {
                return None;
            }
            self.left -= 1;
            Some(0.5)
        }

        fn samplerate(&self) -> u32 {
            100
        }
    }

    #[test]
    fn params_validation() {
        assert!(OscParams::new(440.0).validate().is_ok());
        assert!(OscParams::new(-1.0).validate().is_err());
        assert!(OscParams::new(440.0).with_samplerate(1).validate().is_err());
        assert!(OscParams::new(440.0).with_bias(f64::NAN).validate().is_err());
    }

    #[test]
    fn render_stops_when_source_ends() {
        let mut src = Counter { left: 30 };
        let sample = render_sample(&mut src, 1.0, 2, None, "counter").unwrap();
        assert_eq!(sample.len(), 30);
        assert_eq!(sample.samplerate(), 100);
        assert_eq!(sample.maximum(), 16384);
    }

    #[test]
    fn chunks_duplicate_channels() {
        let params = AudioParams::new(100, 2, 2, 8).unwrap();
        let chunks: Vec<_> = WaveformChunks::new(Box::new(Counter { left: 10 }), &params, Some(100.0))
            .unwrap()
            .collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 8 * 4);
        assert_eq!(chunks[1].len(), 2 * 4);
        assert_eq!(pcm::samples(&chunks[1], 2).collect::<Vec<_>>(), vec![50, 50, 50, 50]);
    }

    #[test]
    fn modulation_helpers_pull_one_value_per_frame() {
        let mut sample = Sample::from_int_values(&[1000; 40], 100, 2, 1, "tone").unwrap();
        modulate_amp(&mut sample, &mut Counter { left: 30 }).unwrap();
        let values: Vec<i64> = pcm::samples(sample.frames(), 2).collect();
        assert_eq!((values[0], values[29], values[30]), (500, 500, 1000));

        pan_lfo(&mut sample, &mut Counter { left: 40 }).unwrap();
        assert_eq!(sample.nchannels(), 2);
        assert_eq!(pcm::samples(sample.frames(), 2).take(2).collect::<Vec<_>>(), vec![125, 375]);

        let mut other_rate = Sample::from_int_values(&[1; 4], 200, 2, 1, "x").unwrap();
        assert!(modulate_amp(&mut other_rate, &mut Counter { left: 4 }).is_err());
    }

    #[test]
    fn chunks_reject_other_samplerate() {
        let params = AudioParams::default();
        assert!(WaveformChunks::new(Box::new(Counter { left: 1 }), &params, None).is_err());
    }
}
