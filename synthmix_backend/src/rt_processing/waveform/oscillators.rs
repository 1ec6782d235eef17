//! Oscillators: closed-form periodic shapes, additive harmonics and a
//! linear ramp for use as a modulator.

use std::f64::consts::PI;

use synthmix_core::{Result, SynthError};

use super::{BoxedSource, OscParams, PhaseClock, WaveformSource};

const TWO_PI: f64 = 2.0 * PI;

/// Periodic waveform shapes computed in closed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Triangle,
    Square,
    Sawtooth,
    Pulse,
    /// Half circles, always on the positive side of the bias.
    Semicircle,
    /// Inverted cosine with sharp peaks.
    Pointy,
}

impl Waveform {
    /// Length of one period in the shape's argument units.
    fn cycle(self) -> f64 {
        match self {
            Waveform::Sine | Waveform::Pointy => TWO_PI,
            Waveform::Semicircle => 2.0,
            Waveform::Triangle | Waveform::Square | Waveform::Sawtooth | Waveform::Pulse => 1.0,
        }
    }

    fn start_time(self) -> f64 {
        if self == Waveform::Semicircle { -1.0 } else { 0.0 }
    }

    /// Unit-amplitude value at waveform argument `tt`.
    #[inline]
    fn evaluate(self, tt: f64, pulsewidth: f64) -> f64 {
        match self {
            Waveform::Sine => tt.sin(),
            Waveform::Triangle => 4.0 * (((tt + 0.75).rem_euclid(1.0) - 0.5).abs() - 0.25),
            Waveform::Square => {
                if (2.0 * tt).floor().rem_euclid(2.0) == 0.0 { 1.0 } else { -1.0 }
            }
            Waveform::Sawtooth => 2.0 * (tt - (0.5 + tt).floor()),
            Waveform::Pulse => {
                if tt.rem_euclid(1.0) < pulsewidth { 1.0 } else { -1.0 }
            }
            Waveform::Semicircle => {
                let ft = tt.rem_euclid(2.0) - 1.0;
                (1.0 - ft * ft).max(0.0).sqrt()
            }
            Waveform::Pointy => {
                let vv = 1.0 - tt.cos().abs();
                if tt.rem_euclid(TWO_PI) > PI { -vv * vv } else { vv * vv }
            }
        }
    }
}

/// Keeps modulated pulse widths strictly inside (0, 1).
#[inline]
fn clamp_pulsewidth(pw: f64) -> f64 {
    pw.clamp(f64::EPSILON, 1.0 - f64::EPSILON)
}

/// A periodic oscillator with optional frequency and pulse-width modulation.
pub struct Oscillator {
    waveform: Waveform,
    params: OscParams,
    clock: PhaseClock,
    pulsewidth: f64,
    pwm: Option<BoxedSource>,
}

impl Oscillator {
    pub fn new(waveform: Waveform, params: OscParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            waveform,
            clock: PhaseClock::new(&params, waveform.cycle(), waveform.start_time()),
            params,
            pulsewidth: clamp_pulsewidth(0.1),
            pwm: None,
        })
    }

    /// Create a sine wave oscillator.
    pub fn sine(params: OscParams) -> Result<Self> {
        Self::new(Waveform::Sine, params)
    }

    /// Create a triangle wave oscillator, rising from zero.
    pub fn triangle(params: OscParams) -> Result<Self> {
        Self::new(Waveform::Triangle, params)
    }

    /// Create a square wave oscillator: high for the first half period.
    pub fn square(params: OscParams) -> Result<Self> {
        Self::new(Waveform::Square, params)
    }

    /// Create a rising sawtooth oscillator, starting at zero.
    pub fn sawtooth(params: OscParams) -> Result<Self> {
        Self::new(Waveform::Sawtooth, params)
    }

    /// Pulse wave with a duty cycle of `pulsewidth` (0 to 1).
    pub fn pulse(params: OscParams, pulsewidth: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&pulsewidth) {
            return Err(SynthError::invalid(format!("pulse width must be within [0, 1], got {pulsewidth}")));
        }
        let mut osc = Self::new(Waveform::Pulse, params)?;
        osc.pulsewidth = clamp_pulsewidth(pulsewidth);
        Ok(osc)
    }

    /// Create an oscillator of half circles above the bias.
    pub fn semicircle(params: OscParams) -> Result<Self> {
        Self::new(Waveform::Semicircle, params)
    }

    /// Create an oscillator of sharp peaks built from an inverted cosine.
    pub fn pointy(params: OscParams) -> Result<Self> {
        Self::new(Waveform::Pointy, params)
    }

    /// Attaches a frequency modulator. Its values scale the frequency as
    /// `frequency * (1 + fm)`.
    pub fn with_fm(mut self, fm: impl WaveformSource + 'static) -> Self {
        self.clock.set_fm(Box::new(fm));
        self
    }

    /// Attaches a pulse-width modulator; only pulse waves consult it. Once it
    /// runs out the static pulse width applies again.
    pub fn with_pwm(mut self, pwm: impl WaveformSource + 'static) -> Self {
        self.pwm = Some(Box::new(pwm));
        self
    }

    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    pub fn frequency(&self) -> f64 {
        self.params.frequency
    }

    pub fn amplitude(&self) -> f64 {
        self.params.amplitude
    }

    pub fn bias(&self) -> f64 {
        self.params.bias
    }

    fn current_pulsewidth(&mut self) -> f64 {
        match self.pwm.as_mut().and_then(|pwm| pwm.next_value()) {
            Some(pw) => clamp_pulsewidth(pw),
            None => self.pulsewidth,
        }
    }
}

impl WaveformSource for Oscillator {
    #[inline]
    fn next_value(&mut self) -> Option<f64> {
        let pulsewidth = if self.waveform == Waveform::Pulse { self.current_pulsewidth() } else { 0.0 };
        let tt = self.clock.advance();
        Some(self.waveform.evaluate(tt, pulsewidth) * self.params.amplitude + self.params.bias)
    }

    fn samplerate(&self) -> u32 {
        self.params.samplerate
    }
}

/// Sum of weighted sine partials. Partials above the Nyquist frequency are
/// dropped. When the peak of the summed partials over one period exceeds one,
/// the weights are scaled down so the output stays within `bias ± amplitude`.
pub struct Harmonics {
    params: OscParams,
    clock: PhaseClock,
    partials: Vec<(f64, f64)>,
    invert: bool,
}

impl Harmonics {
    /// `harmonics` lists `(multiple, weight)` pairs of the base frequency.
    pub fn new(params: OscParams, harmonics: &[(u32, f64)]) -> Result<Self> {
        params.validate()?;
        let nyquist = params.samplerate as f64 / 2.0;
        let mut partials: Vec<(f64, f64)> = harmonics
            .iter()
            .filter(|(k, _)| *k as f64 * params.frequency <= nyquist)
            .map(|&(k, amp)| (k as f64, amp))
            .collect();
        let peak = period_peak(&partials);
        if peak > 1.0 {
            for (_, amp) in partials.iter_mut() {
                *amp /= peak;
            }
        }
        Ok(Self {
            clock: PhaseClock::new(&params, TWO_PI, 0.0),
            params,
            partials,
            invert: false,
        })
    }

    /// Square wave built from the first `num_harmonics` odd partials.
    pub fn square_h(params: OscParams, num_harmonics: u32) -> Result<Self> {
        let harmonics: Vec<(u32, f64)> = (0..num_harmonics).map(|i| 2 * i + 1).map(|n| (n, 1.0 / n as f64)).collect();
        Self::new(params, &harmonics)
    }

    /// Rising sawtooth built from the first `num_harmonics` partials.
    pub fn sawtooth_h(params: OscParams, num_harmonics: u32) -> Result<Self> {
        let harmonics: Vec<(u32, f64)> = (1..=num_harmonics).map(|n| (n, 1.0 / n as f64)).collect();
        let mut osc = Self::new(params.with_phase(params.phase + 0.5), &harmonics)?;
        osc.invert = true;
        Ok(osc)
    }

    pub fn with_fm(mut self, fm: impl WaveformSource + 'static) -> Self {
        self.clock.set_fm(Box::new(fm));
        self
    }

    pub fn partial_count(&self) -> usize {
        self.partials.len()
    }
}

/// Upper bound on the absolute value of the partial sum over one period.
///
/// Measured on a grid of at least 32 points per period of the highest
/// partial; between grid points a sum of degree `K` sampled at `N` points can
/// exceed the grid maximum by at most a factor `1 / cos(pi K / N)`.
fn period_peak(partials: &[(f64, f64)]) -> f64 {
    let highest = partials.iter().map(|(k, _)| *k).fold(1.0, f64::max);
    let points = ((highest * 32.0) as usize).max(1024);
    let grid_peak = (0..points)
        .map(|i| {
            let q = TWO_PI * i as f64 / points as f64;
            partials.iter().map(|&(k, amp)| (q * k).sin() * amp).sum::<f64>().abs()
        })
        .fold(0.0, f64::max);
    grid_peak / (PI * highest / points as f64).cos()
}

impl WaveformSource for Harmonics {
    fn next_value(&mut self) -> Option<f64> {
        let q = self.clock.advance();
        let h: f64 = self.partials.iter().map(|&(k, amp)| (q * k).sin() * amp).sum();
        let value = h * self.params.amplitude + self.params.bias;
        Some(if self.invert { 2.0 * self.params.bias - value } else { value })
    }

    fn samplerate(&self) -> u32 {
        self.params.samplerate
    }
}

/// Linear ramp: yields the current value, then steps by `increment`,
/// clamped to `[min, max]`.
#[derive(Debug, Clone)]
pub struct Linear {
    value: f64,
    increment: f64,
    min: f64,
    max: f64,
    samplerate: u32,
}

impl Linear {
    pub fn new(start: f64) -> Self {
        Self {
            value: start,
            increment: 0.0,
            min: -1.0,
            max: 1.0,
            samplerate: synthmix_core::params::DEFAULT_SAMPLERATE,
        }
    }

    pub fn with_increment(mut self, increment: f64) -> Self {
        self.increment = increment;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Result<Self> {
        if min > max {
            return Err(SynthError::invalid(format!("linear range is empty: [{min}, {max}]")));
        }
        self.min = min;
        self.max = max;
        Ok(self)
    }

    pub fn with_samplerate(mut self, samplerate: u32) -> Self {
        self.samplerate = samplerate;
        self
    }
}

impl WaveformSource for Linear {
    fn next_value(&mut self) -> Option<f64> {
        let value = self.value;
        if self.increment != 0.0 {
            self.value = (self.value + self.increment).clamp(self.min, self.max);
        }
        Some(value)
    }

    fn samplerate(&self) -> u32 {
        self.samplerate
    }
}
