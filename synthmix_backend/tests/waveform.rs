use std::f64::consts::PI;

use synthmix_backend::rt_processing::waveform::{
    EchoFilter, EnvelopeFilter, Harmonics, MixingFilter, OscParams, Oscillator, Waveform, WaveformSource, WhiteNoise,
    render_sample,
};
use synthmix_core::{Sample, pcm};

/// Emits `before` until `switch_at` ticks have passed, then `after`.
struct Step {
    before: f64,
    after: f64,
    switch_at: usize,
    tick: usize,
    samplerate: u32,
}

impl WaveformSource for Step {
    fn next_value(&mut self) -> Option<f64> {
        let v = if self.tick < self.switch_at { self.before } else { self.after };
        self.tick += 1;
        Some(v)
    }

    fn samplerate(&self) -> u32 {
        self.samplerate
    }
}

/// Yields the given values, then ends.
struct Values {
    values: std::vec::IntoIter<f64>,
}

impl WaveformSource for Values {
    fn next_value(&mut self) -> Option<f64> {
        self.values.next()
    }

    fn samplerate(&self) -> u32 {
        1000
    }
}

fn values(v: &[f64]) -> Values {
    Values {
        values: v.to_vec().into_iter(),
    }
}

#[test]
fn oscillators_stay_within_bias_and_amplitude() {
    let shapes = [
        Waveform::Sine,
        Waveform::Triangle,
        Waveform::Square,
        Waveform::Sawtooth,
        Waveform::Pulse,
        Waveform::Semicircle,
        Waveform::Pointy,
    ];
    for shape in shapes {
        for (freq, amp, bias, phase) in [(440.0, 1.0, 0.0, 0.0), (3.3, 0.4, -0.2, 0.37), (11025.0, 0.8, 0.1, 0.9)] {
            let params = OscParams::new(freq)
                .with_amplitude(amp)
                .with_bias(bias)
                .with_phase(phase)
                .with_samplerate(22050);
            let mut osc = Oscillator::new(shape, params).unwrap();
            for v in osc.take_values(5000) {
                assert!(v.is_finite(), "{shape:?} produced {v}");
                assert!(v >= bias - amp - 1e-9 && v <= bias + amp + 1e-9, "{shape:?} {freq} Hz produced {v}");
            }
        }
    }

    let harmonics = [
        Harmonics::square_h(OscParams::new(220.0).with_amplitude(0.5).with_samplerate(22050), 15).unwrap(),
        Harmonics::sawtooth_h(OscParams::new(220.0).with_amplitude(0.5).with_samplerate(22050), 15).unwrap(),
        Harmonics::new(OscParams::new(100.0).with_samplerate(22050), &[(1, 0.9), (2, -0.6), (3, 0.5)]).unwrap(),
    ];
    for mut h in harmonics {
        assert!(h.take_values(5000).iter().all(|v| v.is_finite() && v.abs() <= 1.0 + 1e-9));
    }
}

#[test]
fn fm_keeps_the_waveform_continuous_across_an_abrupt_change() {
    let sr = 8000;
    let base = 100.0;
    let fm = Step {
        before: 0.0,
        after: 0.5,
        switch_at: 333,
        tick: 0,
        samplerate: sr,
    };
    let mut osc = Oscillator::sine(OscParams::new(base).with_samplerate(sr)).unwrap().with_fm(fm);
    let v = osc.take_values(2000);

    let fastest = base * 1.5;
    let bound = 2.0 * PI * fastest / sr as f64 + 1e-9;
    for (i, pair) in v.windows(2).enumerate() {
        assert!((pair[1] - pair[0]).abs() <= bound, "jump of {} at {i}", pair[1] - pair[0]);
    }
    // the first tick at the new frequency still moves at the old rate
    let unmodulated_bound = 2.0 * PI * base / sr as f64 + 1e-9;
    assert!((v[333] - v[332]).abs() <= unmodulated_bound);
}

#[test]
fn fm_changes_pitch() {
    let sr = 8000;
    let count_rises = |v: &[f64]| v.windows(2).filter(|w| w[0] < 0.0 && w[1] >= 0.0).count();
    let plain = Oscillator::sine(OscParams::new(100.0).with_samplerate(sr)).unwrap().take_values(8000);
    let fm = Step {
        before: 1.0,
        after: 1.0,
        switch_at: 0,
        tick: 0,
        samplerate: sr,
    };
    let doubled = Oscillator::sine(OscParams::new(100.0).with_samplerate(sr))
        .unwrap()
        .with_fm(fm)
        .take_values(8000);
    let (a, b) = (count_rises(&plain), count_rises(&doubled));
    assert!((99..=101).contains(&a), "{a}");
    assert!((199..=201).contains(&b), "{b}");
}

#[test]
fn echo_duration_matches_its_parameters() {
    let echo = EchoFilter::new(values(&[0.0; 10]), 1.0, 4, 0.3, 0.5).unwrap();
    assert!((echo.echo_duration() - 2.2).abs() < 1e-12);
    assert!(EchoFilter::new(values(&[0.0]), 1.0, 4, 0.3, 1.0).is_err());
}

#[test]
fn mixing_filter_runs_as_long_as_its_longest_source() {
    let short = values(&[1.0; 10]);
    let long_values: Vec<f64> = (0..100).map(|i| i as f64 / 100.0).collect();
    let long = values(&long_values);
    let sources: Vec<Box<dyn WaveformSource>> = vec![Box::new(short), Box::new(long)];
    let mut mix = MixingFilter::new(sources).unwrap();
    let out = mix.take_values(1000);
    assert_eq!(out.len(), 100);
    assert_eq!(&out[10..], &long_values[10..]);
    assert!((out[3] - 1.03).abs() < 1e-12);
}

#[test]
fn rendered_envelope_sample_has_expected_length_and_peak() {
    let osc = Oscillator::square(OscParams::new(50.0).with_samplerate(1000)).unwrap();
    let mut env = EnvelopeFilter::new(osc, 0.1, 0.1, 0.2, 0.5, 0.1).unwrap().with_stop_at_end(true);
    let sample = render_sample(&mut env, 2.0, 2, None, "square").unwrap();
    assert!((498..=502).contains(&sample.len()), "{}", sample.len());
    assert!(sample.maximum() <= 32768);
    assert!(sample.maximum() > 32000);
    assert_eq!(sample.name(), "square");
}

#[test]
fn rendered_noise_is_full_length() {
    let mut noise = WhiteNoise::new(OscParams::new(4000.0).with_samplerate(8000)).unwrap();
    let sample = render_sample(&mut noise, 0.5, 3, Some(1000.0), "noise").unwrap();
    assert_eq!(sample.len(), 4000);
    assert!(pcm::samples(sample.frames(), 3).all(|v| v.abs() <= 1000));
}

#[test]
fn mix_at_extends_the_buffer() {
    let mut base = Sample::from_int_values(&vec![10; 1000], 1000, 2, 1, "base").unwrap();
    let other = Sample::from_int_values(&vec![20; 500], 1000, 2, 1, "other").unwrap();
    base.mix_at(2.0, &other, None).unwrap();
    assert!((base.duration() - 2.5).abs() < 1e-12);
    let v: Vec<i64> = pcm::samples(base.frames(), 2).collect();
    assert!(v[..1000].iter().all(|&x| x == 10));
    assert!(v[1000..2000].iter().all(|&x| x == 0));
    assert!(v[2000..].iter().all(|&x| x == 20));
}

#[test]
fn chunked_frames_pad_the_last_chunk() {
    let n = 40;
    let k = 6;
    let bytes: Vec<u8> = (0..3 * n + k).map(|i| (i % 250) as u8 + 1).collect();
    let sample = Sample::from_raw_frames(bytes, 2, 1000, 1, "bytes").unwrap();
    let chunks: Vec<Vec<u8>> = sample.chunked_frame_data(n, false, None).collect();
    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|c| c.len() == n));
    assert!(chunks[3][..k].iter().all(|&b| b != 0));
    assert!(chunks[3][k..].iter().all(|&b| b == 0));
}
