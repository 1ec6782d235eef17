//! ADSR gain envelope applied on top of any waveform source.

use synthmix_core::{Result, SynthError};

use super::{BoxedSource, WaveformSource};

/// Segments of the envelope, in playing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    Attack,
    Decay,
    Sustain,
    Release,
    /// One extra sample when the release ramp stopped above zero.
    ReleaseTail,
    /// Past the envelope: emits silence forever.
    Silent,
    Finished,
}

/// Applies an attack/decay/sustain/release gain to a source.
///
/// Times are in seconds. After the release the filter either emits silence
/// forever (the default, so it can feed consumers that expect an endless
/// stream), stops (`stop_at_end`), or starts over (`cycle`). It also stops
/// when its source runs out.
pub struct EnvelopeFilter {
    source: BoxedSource,
    attack: f64,
    decay: f64,
    end_decay: f64,
    end_sustain: f64,
    end_release: f64,
    sustain_level: f64,
    release: f64,
    stop_at_end: bool,
    cycle: bool,

    state: EnvelopeState,
    time: f64,
    increment: f64,
    amp: f64,
    amp_change: f64,
}

impl EnvelopeFilter {
    pub fn new(
        source: impl WaveformSource + 'static,
        attack: f64,
        decay: f64,
        sustain: f64,
        sustain_level: f64,
        release: f64,
    ) -> Result<Self> {
        if [attack, decay, sustain, release].iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(SynthError::invalid("envelope times must be finite and not negative"));
        }
        if !(0.0..=1.0).contains(&sustain_level) {
            return Err(SynthError::invalid(format!("sustain level must be within [0, 1], got {sustain_level}")));
        }
        let increment = 1.0 / source.samplerate() as f64;
        let end_decay = attack + decay;
        let end_sustain = end_decay + sustain;
        let mut filter = Self {
            source: Box::new(source),
            attack,
            decay,
            end_decay,
            end_sustain,
            end_release: end_sustain + release,
            sustain_level,
            release,
            stop_at_end: false,
            cycle: false,
            state: EnvelopeState::Attack,
            time: 0.0,
            increment,
            amp: 0.0,
            amp_change: 0.0,
        };
        filter.restart();
        Ok(filter)
    }

    /// End the stream after the release instead of emitting silence.
    pub fn with_stop_at_end(mut self, stop_at_end: bool) -> Self {
        self.stop_at_end = stop_at_end;
        self
    }

    /// Start the envelope over after every release.
    pub fn with_cycle(mut self, cycle: bool) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn state(&self) -> EnvelopeState {
        self.state
    }

    fn restart(&mut self) {
        self.time = 0.0;
        self.state = EnvelopeState::Attack;
        self.amp = 0.0;
        self.amp_change = if self.attack > 0.0 { self.increment / self.attack } else { 0.0 };
    }

    fn enter(&mut self, state: EnvelopeState) {
        self.state = state;
        match state {
            EnvelopeState::Decay => {
                self.amp = 1.0;
                self.amp_change = (self.sustain_level - 1.0) / self.decay * self.increment;
            }
            EnvelopeState::Release => {
                self.amp = self.sustain_level;
                self.amp_change = -self.sustain_level / self.release * self.increment;
            }
            _ => {}
        }
    }

    /// Source value at the current ramp amplitude; advances the ramp.
    fn ramp_step(&mut self) -> Option<f64> {
        let v = self.pull(self.amp)?;
        self.amp += self.amp_change;
        self.time += self.increment;
        Some(v)
    }

    fn pull(&mut self, gain: f64) -> Option<f64> {
        match self.source.next_value() {
            Some(v) => Some(v * gain),
            None => {
                self.state = EnvelopeState::Finished;
                None
            }
        }
    }
}

impl WaveformSource for EnvelopeFilter {
    fn next_value(&mut self) -> Option<f64> {
        loop {
            match self.state {
                EnvelopeState::Attack => {
                    if self.attack > 0.0 && self.time < self.attack {
                        return self.ramp_step();
                    }
                    if self.decay > 0.0 {
                        self.enter(EnvelopeState::Decay);
                    } else {
                        self.enter(EnvelopeState::Sustain);
                    }
                }
                EnvelopeState::Decay => {
                    if self.time < self.end_decay {
                        return self.ramp_step();
                    }
                    self.enter(EnvelopeState::Sustain);
                }
                EnvelopeState::Sustain => {
                    if self.time < self.end_sustain {
                        let v = self.pull(self.sustain_level)?;
                        self.time += self.increment;
                        return Some(v);
                    }
                    if self.release > 0.0 {
                        self.enter(EnvelopeState::Release);
                    } else {
                        self.state = EnvelopeState::Silent;
                        return self.after_end();
                    }
                }
                EnvelopeState::Release => {
                    if self.time < self.end_release {
                        return self.ramp_step();
                    }
                    self.state = EnvelopeState::ReleaseTail;
                    if self.amp > 0.0 {
                        return self.pull(self.amp);
                    }
                }
                EnvelopeState::ReleaseTail => {
                    self.state = EnvelopeState::Silent;
                    return self.after_end();
                }
                EnvelopeState::Silent => return self.after_end(),
                EnvelopeState::Finished => return None,
            }
        }
    }

    fn samplerate(&self) -> u32 {
        self.source.samplerate()
    }
}

impl EnvelopeFilter {
    fn after_end(&mut self) -> Option<f64> {
        if self.cycle && self.end_release > 0.0 {
            self.restart();
            return self.next_value();
        }
        if self.stop_at_end {
            self.state = EnvelopeState::Finished;
            return None;
        }
        Some(0.0)
    }
}
