//! Owned PCM sample buffer with in-place DSP operations and chunked iteration.
//!
//! Frame data lives behind an `Arc`, so `copy()` and chunk iterators share the
//! bytes until a mutation forces a private copy.

use std::fmt;
use std::io::{Read, Seek, Write};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use log::debug;

use crate::error::{Result, SynthError};
use crate::params::{AudioParams, validate_format};
use crate::pcm;

/// Polled before each chunk; returning `true` ends the iteration.
pub type StopCondition = Box<dyn Fn() -> bool + Send>;

#[derive(Clone)]
pub struct Sample {
    frames: Arc<Vec<u8>>,
    samplewidth: u16,
    samplerate: u32,
    nchannels: u16,
    name: String,
    locked: bool,
}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("name", &self.name)
            .field("duration", &self.duration())
            .field("nchannels", &self.nchannels)
            .field("bits", &(self.samplewidth * 8))
            .field("samplerate", &self.samplerate)
            .field("locked", &self.locked)
            .finish()
    }
}

impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        self.samplewidth == other.samplewidth
            && self.samplerate == other.samplerate
            && self.nchannels == other.nchannels
            && self.frames == other.frames
    }
}

impl Sample {
    /// An empty sample with the given format.
    pub fn new(name: impl Into<String>, samplerate: u32, samplewidth: u16, nchannels: u16) -> Result<Self> {
        Self::from_raw_frames(Vec::new(), samplewidth, samplerate, nchannels, name)
    }

    /// An empty sample in the format of `params`.
    pub fn empty(params: &AudioParams) -> Self {
        Self {
            frames: Arc::new(Vec::new()),
            samplewidth: params.samplewidth,
            samplerate: params.samplerate,
            nchannels: params.nchannels,
            name: String::new(),
            locked: false,
        }
    }

    pub fn from_raw_frames(
        frames: Vec<u8>,
        samplewidth: u16,
        samplerate: u32,
        nchannels: u16,
        name: impl Into<String>,
    ) -> Result<Self> {
        validate_format(samplerate, samplewidth, nchannels)?;
        let frame_size = samplewidth as usize * nchannels as usize;
        if frames.len() % frame_size != 0 {
            return Err(SynthError::invalid(format!(
                "frame data length {} is not a multiple of the frame size {frame_size}",
                frames.len()
            )));
        }
        Ok(Self {
            frames: Arc::new(frames),
            samplewidth,
            samplerate,
            nchannels,
            name: name.into(),
            locked: false,
        })
    }

    /// Interleaved integer sample values, saturated to the sample width.
    pub fn from_int_values(
        values: &[i64],
        samplerate: u32,
        samplewidth: u16,
        nchannels: u16,
        name: impl Into<String>,
    ) -> Result<Self> {
        let frames = pcm::from_values(values.iter().copied(), samplewidth as usize);
        Self::from_raw_frames(frames, samplewidth, samplerate, nchannels, name)
    }

    /// Mono sample from float waveform values.
    ///
    /// Values are multiplied by `amplitude_scale` (full scale `2^(8*width-1)`
    /// when `None`), truncated and saturated to the integer range.
    pub fn from_float_values(
        values: impl IntoIterator<Item = f64>,
        samplerate: u32,
        samplewidth: u16,
        amplitude_scale: Option<f64>,
        name: impl Into<String>,
    ) -> Result<Self> {
        validate_format(samplerate, samplewidth, 1)?;
        let scale = amplitude_scale.unwrap_or_else(|| full_scale(samplewidth));
        let frames = pcm::from_values(values.into_iter().map(|v| (v * scale) as i64), samplewidth as usize);
        Self::from_raw_frames(frames, samplewidth, samplerate, 1, name)
    }

    pub fn load_wav(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path)?;
        let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        Self::from_wav_reader(reader, name)
    }

    pub fn read_wav<R: Read>(reader: R, name: impl Into<String>) -> Result<Self> {
        Self::from_wav_reader(hound::WavReader::new(reader)?, name)
    }

    fn from_wav_reader<R: Read>(mut reader: hound::WavReader<R>, name: impl Into<String>) -> Result<Self> {
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int {
            return Err(SynthError::invalid("only integer PCM wav files are supported"));
        }
        let samplewidth = match spec.bits_per_sample {
            16 => 2,
            24 => 3,
            32 => 4,
            bits => return Err(SynthError::invalid(format!("unsupported wav sample size: {bits} bits"))),
        };
        let values = reader
            .samples::<i32>()
            .map(|s| s.map(i64::from))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Self::from_int_values(&values, spec.sample_rate, samplewidth, spec.channels, name)
    }

    pub fn write_wav(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = hound::WavWriter::create(path, self.wav_spec())?;
        self.finish_wav(writer)
    }

    pub fn write_wav_to<W: Write + Seek>(&self, out: W) -> Result<()> {
        let writer = hound::WavWriter::new(out, self.wav_spec())?;
        self.finish_wav(writer)
    }

    pub fn wav_spec(&self) -> hound::WavSpec {
        hound::WavSpec {
            channels: self.nchannels,
            sample_rate: self.samplerate,
            bits_per_sample: self.samplewidth * 8,
            sample_format: hound::SampleFormat::Int,
        }
    }

    fn finish_wav<W: Write + Seek>(&self, mut writer: hound::WavWriter<W>) -> Result<()> {
        for v in pcm::samples(&self.frames, self.width()) {
            writer.write_sample(v as i32)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Writes the raw frame bytes.
    pub fn write_frames<W: Write>(&self, mut out: W) -> Result<()> {
        out.write_all(&self.frames)?;
        Ok(())
    }

    pub fn samplewidth(&self) -> u16 {
        self.samplewidth
    }

    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    pub fn nchannels(&self) -> u16 {
        self.nchannels
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn frames(&self) -> &[u8] {
        &self.frames
    }

    /// Number of frames (not bytes).
    pub fn len(&self) -> usize {
        self.frames.len() / self.frame_size()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn duration(&self) -> f64 {
        self.len() as f64 / self.samplerate as f64
    }

    pub fn maximum(&self) -> i64 {
        pcm::max_abs(&self.frames, self.width())
    }

    pub fn rms(&self) -> f64 {
        pcm::rms(&self.frames, self.width())
    }

    /// Peak level per channel in dB, from -60 to 0. Mono reports the same
    /// level twice.
    pub fn level_db_peak(&self) -> (f64, f64) {
        self.db_level(|bytes, width| pcm::max_abs(bytes, width) as f64)
    }

    /// RMS level per channel in dB, from -60 to 0. Mono reports the same
    /// level twice.
    pub fn level_db_rms(&self) -> (f64, f64) {
        self.db_level(pcm::rms)
    }

    fn db_level(&self, measure: impl Fn(&[u8], usize) -> f64) -> (f64, f64) {
        let width = self.width();
        let full = full_scale(self.samplewidth);
        let db = |level: f64| (20.0 * ((level + 1.0) / full).log10()).max(-60.0);
        if self.nchannels == 1 {
            let level = db(measure(&self.frames, width));
            return (level, level);
        }
        let channel = |ch: usize| -> Vec<u8> {
            self.frames
                .chunks_exact(self.frame_size())
                .flat_map(|frame| &frame[ch * width..(ch + 1) * width])
                .copied()
                .collect()
        };
        (db(measure(&channel(0), width)), db(measure(&channel(1), width)))
    }

    /// Byte offset of the frame at `seconds`.
    pub fn frame_idx(&self, seconds: f64) -> usize {
        self.frame_size() * (self.samplerate as f64 * seconds) as usize
    }

    pub fn frame_size(&self) -> usize {
        self.samplewidth as usize * self.nchannels as usize
    }

    /// True when `other` can be mixed into or joined onto this sample.
    pub fn same_format(&self, other: &Sample) -> bool {
        self.samplewidth == other.samplewidth
            && self.samplerate == other.samplerate
            && self.nchannels == other.nchannels
    }

    pub fn matches_params(&self, params: &AudioParams) -> bool {
        self.samplewidth == params.samplewidth
            && self.samplerate == params.samplerate
            && self.nchannels == params.nchannels
    }

    /// Unlocked copy sharing the frame data until either side mutates.
    pub fn copy(&self) -> Sample {
        let mut cpy = self.clone();
        cpy.locked = false;
        cpy
    }

    pub fn copy_from(&mut self, other: &Sample) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        self.frames = Arc::clone(&other.frames);
        self.samplewidth = other.samplewidth;
        self.samplerate = other.samplerate;
        self.nchannels = other.nchannels;
        self.name = other.name.clone();
        Ok(self)
    }

    pub fn lock(&mut self) -> &mut Self {
        self.locked = true;
        self
    }

    /// Lazy sequence of `chunksize` byte chunks.
    ///
    /// Without `repeat` the last chunk is zero-padded to `chunksize` and the
    /// sequence ends. With `repeat` the frames are tiled endlessly. Either
    /// way the sequence also ends as soon as `stop` returns true.
    pub fn chunked_frame_data(&self, chunksize: usize, repeat: bool, stop: Option<StopCondition>) -> FrameChunks {
        FrameChunks {
            frames: Arc::clone(&self.frames),
            chunksize,
            position: 0,
            repeat,
            stop,
        }
    }

    /// Converts to the given format: samplerate, width and stereo.
    pub fn normalize(&mut self, params: &AudioParams) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        self.resample(params.samplerate)?;
        if self.samplewidth != params.samplewidth {
            let converted = pcm::convert_width(&self.frames, self.width(), params.samplewidth as usize);
            self.frames = Arc::new(converted);
            self.samplewidth = params.samplewidth;
        }
        if self.nchannels == 1 && params.nchannels == 2 {
            self.stereo(1.0, 1.0)?;
        } else if self.nchannels == 2 && params.nchannels == 1 {
            self.mono(0.5, 0.5)?;
        }
        Ok(self)
    }

    /// Changes the samplerate keeping pitch and duration, by linear interpolation.
    pub fn resample(&mut self, samplerate: u32) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        validate_format(samplerate, self.samplewidth, self.nchannels)?;
        if samplerate == self.samplerate {
            return Ok(self);
        }
        self.frames = Arc::new(self.interpolated(self.samplerate, samplerate));
        self.samplerate = samplerate;
        Ok(self)
    }

    /// Changes playback speed (and with it the pitch and duration).
    pub fn speed(&mut self, speed: f64) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        if speed <= 0.0 {
            return Err(SynthError::invalid("speed must be positive"));
        }
        if speed == 1.0 {
            return Ok(self);
        }
        let source_rate = (self.samplerate as f64 * speed) as u32;
        self.frames = Arc::new(self.interpolated(source_rate.max(1), self.samplerate));
        Ok(self)
    }

    fn interpolated(&self, from_rate: u32, to_rate: u32) -> Vec<u8> {
        let width = self.width();
        let nch = self.nchannels as usize;
        let values: Vec<i64> = pcm::samples(&self.frames, width).collect();
        let in_frames = values.len() / nch;
        if in_frames == 0 {
            return Vec::new();
        }
        let out_frames = (in_frames as u64 * to_rate as u64 / from_rate as u64) as usize;
        let step = from_rate as f64 / to_rate as f64;
        let mut out = Vec::with_capacity(out_frames * nch);
        for i in 0..out_frames {
            let pos = i as f64 * step;
            let i0 = (pos as usize).min(in_frames - 1);
            let i1 = (i0 + 1).min(in_frames - 1);
            let frac = pos - i0 as f64;
            for ch in 0..nch {
                let a = values[i0 * nch + ch] as f64;
                let b = values[i1 * nch + ch] as f64;
                out.push((a + (b - a) * frac).round() as i64);
            }
        }
        pcm::from_values(out, width)
    }

    /// Converts to 32 bit samples. Without `scale_amplitude` the values keep
    /// their original range, leaving headroom for mixing.
    pub fn make_32bit(&mut self, scale_amplitude: bool) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        if self.samplewidth == 4 {
            return Ok(self);
        }
        let frames = if scale_amplitude {
            pcm::convert_width(&self.frames, self.width(), 4)
        } else {
            pcm::from_values(pcm::samples(&self.frames, self.width()), 4)
        };
        self.frames = Arc::new(frames);
        self.samplewidth = 4;
        Ok(self)
    }

    /// Converts to 16 bit samples, optionally maximizing the amplitude first.
    pub fn make_16bit(&mut self, maximize_amplitude: bool) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        if maximize_amplitude {
            self.amplify_max()?;
        }
        if self.samplewidth > 2 {
            let converted = pcm::convert_width(&self.frames, self.width(), 2);
            self.frames = Arc::new(converted);
            self.samplewidth = 2;
        }
        Ok(self)
    }

    /// Scales to the loudest level that does not clip.
    pub fn amplify_max(&mut self) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        let max_amp = self.maximum();
        if max_amp > 0 {
            let target = pcm::max_value(self.width()) - 1;
            self.amplify(target as f64 / max_amp as f64)?;
        }
        Ok(self)
    }

    /// Multiplies every sample value by `factor`, saturating on overflow.
    pub fn amplify(&mut self, factor: f64) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        let width = self.width();
        pcm::scale(self.frames_mut(), width, factor);
        Ok(self)
    }

    /// Amplified copy. Works on locked samples.
    pub fn at_volume(&self, volume: f64) -> Sample {
        let mut cpy = self.copy();
        let width = cpy.width();
        pcm::scale(cpy.frames_mut(), width, volume);
        cpy
    }

    /// Keeps only the part between the two timestamps.
    pub fn clip(&mut self, start_seconds: f64, end_seconds: f64) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        if end_seconds < start_seconds {
            return Err(SynthError::invalid("clip end lies before its start"));
        }
        let len = self.frames.len();
        let start = self.frame_idx(start_seconds).min(len);
        let end = self.frame_idx(end_seconds).min(len);
        self.frames = Arc::new(self.frames[start..end].to_vec());
        Ok(self)
    }

    /// Keeps the part before `seconds` and returns the rest as a new sample.
    pub fn split(&mut self, seconds: f64) -> Result<Sample> {
        self.ensure_unlocked()?;
        let end = self.frame_idx(seconds);
        Ok(self.split_at_byte(end))
    }

    fn split_at_byte(&mut self, end: usize) -> Sample {
        let end = end.min(self.frames.len());
        let mut chopped = self.copy();
        chopped.frames = Arc::new(self.frames[end..].to_vec());
        self.frames_mut().truncate(end);
        chopped
    }

    pub fn add_silence(&mut self, seconds: f64, at_start: bool) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        let extra = self.frame_idx(seconds);
        let frames = self.frames_mut();
        if at_start {
            frames.splice(0..0, std::iter::repeat_n(0u8, extra));
        } else {
            frames.resize(frames.len() + extra, 0);
        }
        Ok(self)
    }

    /// Appends another sample of the same format.
    pub fn join(&mut self, other: &Sample) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        self.ensure_same_format(other)?;
        self.frames_mut().extend_from_slice(&other.frames);
        Ok(self)
    }

    /// Fades the last `seconds` linearly down to `target_volume`.
    pub fn fadeout(&mut self, seconds: f64, target_volume: f64) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        if self.is_empty() {
            return Ok(self);
        }
        let seconds = seconds.min(self.duration());
        let start = self.frame_idx(self.duration() - seconds);
        let decrease = 1.0 - target_volume;
        let len = self.frames.len();
        self.scale_frames(start..len, |i, n| 1.0 - i as f64 * decrease / n as f64);
        Ok(self)
    }

    /// Fades the first `seconds` linearly up from `start_volume`.
    pub fn fadein(&mut self, seconds: f64, start_volume: f64) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        if self.is_empty() {
            return Ok(self);
        }
        let seconds = seconds.min(self.duration());
        let end = self.frame_idx(seconds);
        let increase = 1.0 - start_volume;
        self.scale_frames(0..end, |i, n| i as f64 * increase / n as f64 + start_volume);
        Ok(self)
    }

    /// `factor(i, n)` gets the frame index within the byte range and the
    /// range's frame count.
    fn scale_frames(&mut self, range: Range<usize>, factor: impl Fn(usize, usize) -> f64) {
        let width = self.width();
        let frame_size = self.frame_size();
        let region = &mut self.frames_mut()[range];
        let n = region.len() / frame_size;
        for (i, frame) in region.chunks_exact_mut(frame_size).enumerate() {
            pcm::scale(frame, width, factor(i, n));
        }
    }

    /// Reverses the order of the frames.
    pub fn reverse(&mut self) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        let frame_size = self.frame_size();
        let reversed: Vec<u8> = self.frames.chunks_exact(frame_size).rev().flatten().copied().collect();
        self.frames = Arc::new(reversed);
        Ok(self)
    }

    pub fn invert(&mut self) -> Result<&mut Self> {
        self.amplify(-1.0)
    }

    /// Adds a constant to every sample value, saturating at the width's range.
    pub fn bias(&mut self, bias: i64) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        let width = self.width();
        for s in self.frames_mut().chunks_exact_mut(width) {
            let v = pcm::read_sample(s, width).saturating_add(bias);
            pcm::write_sample(s, width, v);
        }
        Ok(self)
    }

    /// Multiplies each frame by the next modulator value.
    ///
    /// Frames past the end of a finite modulator keep their level.
    pub fn modulate_amp(&mut self, modulator: impl IntoIterator<Item = f64>) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        let width = self.width();
        let frame_size = self.frame_size();
        for (frame, factor) in self.frames_mut().chunks_exact_mut(frame_size).zip(modulator) {
            pcm::scale(frame, width, factor);
        }
        Ok(self)
    }

    /// Amplitude modulation by another sample's waveform, cycled as needed and
    /// scaled so its loudest value is 1.
    pub fn modulate_amp_by(&mut self, modulator: &Sample) -> Result<&mut Self> {
        let biggest = modulator.maximum();
        if biggest == 0 {
            return Err(SynthError::invalid(format!("modulator '{}' is silent", modulator.name)));
        }
        let values: Vec<f64> = pcm::samples(&modulator.frames, modulator.width())
            .map(|v| v as f64 / biggest as f64)
            .collect();
        self.modulate_amp(values.into_iter().cycle())
    }

    /// Inserts silence at the start, or skips audio when `seconds` is negative.
    /// With `keep_length` the total length stays the same.
    pub fn delay(&mut self, seconds: f64, keep_length: bool) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        let original_len = self.frames.len();
        if seconds > 0.0 {
            self.add_silence(seconds, true)?;
            if keep_length {
                self.frames_mut().truncate(original_len);
            }
        } else if seconds < 0.0 {
            if keep_length {
                self.add_silence(-seconds, false)?;
                let excess = self.frames.len() - original_len;
                self.frames_mut().drain(..excess);
            } else {
                let skip = self.frame_idx(-seconds).min(original_len);
                self.frames_mut().drain(..skip);
            }
        }
        Ok(self)
    }

    /// Downmixes stereo to mono as `left*left_factor + right*right_factor`.
    pub fn mono(&mut self, left_factor: f64, right_factor: f64) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        if self.nchannels == 1 {
            return Ok(self);
        }
        let width = self.width();
        let values: Vec<i64> = pcm::samples(&self.frames, width).collect();
        let mixed = values
            .chunks_exact(2)
            .map(|lr| (lr[0] as f64 * left_factor + lr[1] as f64 * right_factor) as i64);
        self.frames = Arc::new(pcm::from_values(mixed, width));
        self.nchannels = 1;
        Ok(self)
    }

    pub fn left(&mut self) -> Result<&mut Self> {
        self.ensure_stereo()?;
        self.mono(1.0, 0.0)
    }

    pub fn right(&mut self) -> Result<&mut Self> {
        self.ensure_stereo()?;
        self.mono(0.0, 1.0)
    }

    /// Mono becomes stereo with per-channel factors; stereo gets its
    /// channels rescaled by the same factors.
    pub fn stereo(&mut self, left_factor: f64, right_factor: f64) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        let width = self.width();
        let values: Vec<i64> = pcm::samples(&self.frames, width).collect();
        let out: Vec<i64> = if self.nchannels == 1 {
            values
                .iter()
                .flat_map(|&v| [(v as f64 * left_factor) as i64, (v as f64 * right_factor) as i64])
                .collect()
        } else {
            values
                .chunks_exact(2)
                .flat_map(|lr| [(lr[0] as f64 * left_factor) as i64, (lr[1] as f64 * right_factor) as i64])
                .collect()
        };
        self.frames = Arc::new(pcm::from_values(out, width));
        self.nchannels = 2;
        Ok(self)
    }

    /// Linear stereo panning, -1 is full left and 1 full right.
    pub fn pan(&mut self, panning: f64) -> Result<&mut Self> {
        let panning = panning.clamp(-1.0, 1.0);
        self.stereo((1.0 - panning) / 2.0, (1.0 + panning) / 2.0)
    }

    /// Panning that moves with an LFO: each frame takes the next value as its
    /// panning. Once a finite LFO ends its last value holds.
    pub fn pan_lfo(&mut self, lfo: impl IntoIterator<Item = f64>) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        let width = self.width();
        let nch = self.nchannels as usize;
        let values: Vec<i64> = pcm::samples(&self.frames, width).collect();
        let mut lfo = lfo.into_iter();
        let mut panning = 0.0;
        let mut out = Vec::with_capacity(values.len() / nch * 2);
        for frame in values.chunks_exact(nch) {
            if let Some(p) = lfo.next() {
                panning = p.clamp(-1.0, 1.0);
            }
            let (left, right) = if nch == 1 { (frame[0], frame[0]) } else { (frame[0], frame[1]) };
            out.push((left as f64 * (1.0 - panning) / 2.0) as i64);
            out.push((right as f64 * (1.0 + panning) / 2.0) as i64);
        }
        self.frames = Arc::new(pcm::from_values(out, width));
        self.nchannels = 2;
        Ok(self)
    }

    /// Mixes a mono sample into one stereo channel, scaled by `other_mix_factor`.
    ///
    /// A mono sample becomes the opposite channel of a new stereo sample
    /// first. `mix_at` and `other_seconds` work as in [`Sample::mix_at`].
    pub fn stereo_mix(
        &mut self,
        other: &Sample,
        other_channel: Channel,
        other_mix_factor: f64,
        mix_at: f64,
        other_seconds: Option<f64>,
    ) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        if other.nchannels != 1 {
            return Err(SynthError::mismatch("stereo_mix needs a mono sample to mix in"));
        }
        if other.samplerate != self.samplerate || other.samplewidth != self.samplewidth {
            return Err(SynthError::mismatch(format!(
                "cannot combine {}Hz/{}bit with {}Hz/{}bit",
                self.samplerate,
                self.samplewidth * 8,
                other.samplerate,
                other.samplewidth * 8
            )));
        }
        let (own, theirs) = match other_channel {
            Channel::Left => ((0.0, 1.0), (other_mix_factor, 0.0)),
            Channel::Right => ((1.0, 0.0), (0.0, other_mix_factor)),
        };
        if self.nchannels == 1 {
            self.stereo(own.0, own.1)?;
        }
        let mut other = other.copy();
        other.stereo(theirs.0, theirs.1)?;
        self.mix_at(mix_at, &other, other_seconds)
    }

    /// Mixes `amount` echoes of the last `length` seconds into the end of the
    /// sample, each `delay` seconds apart and scaled by `decay` per step.
    pub fn echo(&mut self, length: f64, amount: usize, delay: f64, decay: f64) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        if amount == 0 {
            return Ok(self);
        }
        let mut at = (self.duration() - length).max(0.0);
        let mut echo = self.copy();
        echo.frames = Arc::new(self.frames[self.frame_idx(at).min(self.frames.len())..].to_vec());
        let inaudible = 1.0 / full_scale(self.samplewidth);
        let mut echo_amp = decay;
        for _ in 0..amount {
            if echo_amp.abs() < inaudible {
                break;
            }
            at += delay;
            self.mix_at(at, &echo.at_volume(echo_amp), None)?;
            echo_amp *= decay;
        }
        Ok(self)
    }

    /// Materialized ADSR shape.
    ///
    /// With `sustain` set to `None` the sustain segment spans whatever is left
    /// between the decay and the final `release` seconds. With a fixed sustain
    /// time the audio after the release is dropped.
    pub fn envelope(
        &mut self,
        attack: f64,
        decay: f64,
        sustain: Option<f64>,
        sustain_level: f64,
        release: f64,
    ) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        if attack < 0.0 || decay < 0.0 || release < 0.0 || sustain.is_some_and(|s| s < 0.0) {
            return Err(SynthError::invalid("envelope times must not be negative"));
        }
        if !(0.0..=1.0).contains(&sustain_level) {
            return Err(SynthError::invalid("sustain level must be within [0, 1]"));
        }
        let mut d = self.split(attack)?;
        let mut s = d.split(decay)?;
        if let Some(sustain) = sustain {
            let mut r = s.split(sustain)?;
            r.split(release)?;
            s.join(&r)?;
        }
        if sustain_level < 1.0 {
            s.amplify(sustain_level)?;
        }
        let release_bytes = s.frame_idx(release).min(s.frames.len());
        let mut r = s.split_at_byte(s.frames.len() - release_bytes);
        if attack > 0.0 {
            self.fadein(attack, 0.0)?;
        }
        if decay > 0.0 {
            d.fadeout(decay, sustain_level)?;
        }
        if release > 0.0 {
            r.fadeout(release, 0.0)?;
        }
        self.join(&d)?.join(&s)?.join(&r)
    }

    /// Sample-wise saturating addition of `other`, limited to its first
    /// `other_seconds` when given.
    ///
    /// With `pad_shortest` the shorter buffer is extended with silence first;
    /// otherwise only the overlap is mixed and the length stays unchanged.
    pub fn mix(&mut self, other: &Sample, other_seconds: Option<f64>, pad_shortest: bool) -> Result<&mut Self> {
        self.ensure_unlocked()?;
        self.ensure_same_format(other)?;
        let width = self.width();
        let mixed_in = other.leading_frames(other_seconds);
        let frames = self.frames_mut();
        if pad_shortest && frames.len() < mixed_in.len() {
            frames.resize(mixed_in.len(), 0);
        }
        pcm::add_into(frames, mixed_in, width);
        Ok(self)
    }

    /// Mixes `other` in starting at `seconds`, growing the buffer if needed.
    /// Only the first `other_seconds` of `other` are used when given.
    pub fn mix_at(&mut self, seconds: f64, other: &Sample, other_seconds: Option<f64>) -> Result<&mut Self> {
        if seconds == 0.0 {
            return self.mix(other, other_seconds, true);
        }
        self.ensure_unlocked()?;
        self.ensure_same_format(other)?;
        let start = self.frame_idx(seconds);
        let width = self.width();
        let mixed_in = other.leading_frames(other_seconds);
        let frames = self.frames_mut();
        let required = start + mixed_in.len();
        if required > frames.len() {
            frames.resize(required, 0);
        }
        pcm::add_into(&mut frames[start..], mixed_in, width);
        Ok(self)
    }

    fn leading_frames(&self, seconds: Option<f64>) -> &[u8] {
        match seconds {
            Some(seconds) => &self.frames[..self.frame_idx(seconds.max(0.0)).min(self.frames.len())],
            None => &self.frames,
        }
    }

    fn width(&self) -> usize {
        self.samplewidth as usize
    }

    fn frames_mut(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.frames)
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.locked {
            debug!("rejected mutation of locked sample '{}'", self.name);
            return Err(SynthError::Locked);
        }
        Ok(())
    }

    fn ensure_stereo(&self) -> Result<()> {
        if self.nchannels != 2 {
            return Err(SynthError::mismatch("operation requires a stereo sample"));
        }
        Ok(())
    }

    fn ensure_same_format(&self, other: &Sample) -> Result<()> {
        if !self.same_format(other) {
            return Err(SynthError::mismatch(format!(
                "cannot combine {}Hz/{}bit/{}ch with {}Hz/{}bit/{}ch",
                self.samplerate,
                self.samplewidth * 8,
                self.nchannels,
                other.samplerate,
                other.samplewidth * 8,
                other.nchannels
            )));
        }
        Ok(())
    }
}

/// Stereo channel selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Left,
    Right,
}

/// Full-scale amplitude for a sample width in bytes.
pub fn full_scale(samplewidth: u16) -> f64 {
    (1u64 << (8 * samplewidth as u32 - 1)) as f64
}

/// Iterator returned by [`Sample::chunked_frame_data`].
pub struct FrameChunks {
    frames: Arc<Vec<u8>>,
    chunksize: usize,
    position: usize,
    repeat: bool,
    stop: Option<StopCondition>,
}

impl Iterator for FrameChunks {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.chunksize == 0 || self.frames.is_empty() {
            return None;
        }
        if self.stop.as_ref().is_some_and(|stop| stop()) {
            return None;
        }
        let len = self.frames.len();
        if self.repeat {
            let mut chunk = Vec::with_capacity(self.chunksize);
            while chunk.len() < self.chunksize {
                let take = (self.chunksize - chunk.len()).min(len - self.position);
                chunk.extend_from_slice(&self.frames[self.position..self.position + take]);
                self.position = (self.position + take) % len;
            }
            return Some(chunk);
        }
        if self.position >= len {
            return None;
        }
        let end = (self.position + self.chunksize).min(len);
        let mut chunk = self.frames[self.position..end].to_vec();
        chunk.resize(self.chunksize, 0);
        self.position = end;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ramp(frames: usize, samplerate: u32, nchannels: u16) -> Sample {
        let values: Vec<i64> = (0..frames * nchannels as usize).map(|i| (i % 1000) as i64 + 1).collect();
        Sample::from_int_values(&values, samplerate, 2, nchannels, "ramp").unwrap()
    }

    fn constant(value: i64, seconds: f64, samplerate: u32) -> Sample {
        let n = (seconds * samplerate as f64) as usize;
        Sample::from_int_values(&vec![value; n], samplerate, 2, 1, "const").unwrap()
    }

    #[test]
    fn rejects_ragged_frames() {
        assert!(Sample::from_raw_frames(vec![0; 3], 2, 44100, 1, "x").is_err());
        assert!(Sample::from_raw_frames(vec![0; 6], 3, 44100, 2, "x").is_ok());
    }

    #[test]
    fn locked_sample_rejects_mutation_but_allows_at_volume() {
        let mut s = constant(1000, 0.1, 1000);
        s.lock();
        assert!(matches!(s.amplify(2.0), Err(SynthError::Locked)));
        assert!(matches!(s.fadein(0.01, 0.0), Err(SynthError::Locked)));
        assert!(matches!(s.fadeout(0.01, 0.0), Err(SynthError::Locked)));
        assert!(matches!(s.envelope(0.01, 0.01, None, 0.5, 0.01), Err(SynthError::Locked)));
        let other = constant(5, 0.1, 1000);
        assert!(matches!(s.mix(&other, None, true), Err(SynthError::Locked)));
        assert!(matches!(s.mix_at(0.05, &other, None), Err(SynthError::Locked)));
        assert!(matches!(s.mix_at(0.0, &other, Some(0.01)), Err(SynthError::Locked)));
        assert!(matches!(s.bias(1), Err(SynthError::Locked)));
        assert!(matches!(s.modulate_amp([0.5]), Err(SynthError::Locked)));
        assert!(matches!(s.pan_lfo([0.5]), Err(SynthError::Locked)));
        assert!(matches!(s.stereo_mix(&other, Channel::Left, 1.0, 0.0, None), Err(SynthError::Locked)));
        assert_eq!(s.maximum(), 1000);
        assert_eq!(s.len(), 100);
        let louder = s.at_volume(2.0);
        assert!(!louder.is_locked());
        assert_eq!(louder.maximum(), 2000);
        assert_eq!(s.maximum(), 1000);
    }

    #[test]
    fn copy_is_unlocked_and_independent() {
        let mut s = constant(100, 0.1, 1000);
        s.lock();
        let mut c = s.copy();
        c.amplify(3.0).unwrap();
        assert_eq!(s.maximum(), 100);
        assert_eq!(c.maximum(), 300);
    }

    #[test]
    fn mix_requires_matching_format() {
        let mut a = constant(1, 0.1, 1000);
        let b = constant(1, 0.1, 2000);
        assert!(matches!(a.mix(&b, None, true), Err(SynthError::ParameterMismatch(_))));
    }

    #[test]
    fn mix_pads_shortest() {
        let mut a = constant(10, 0.1, 1000);
        let b = constant(5, 0.2, 1000);
        a.mix(&b, None, true).unwrap();
        assert_eq!(a.len(), 200);
        let values: Vec<i64> = pcm::samples(a.frames(), 2).collect();
        assert_eq!(values[0], 15);
        assert_eq!(values[150], 5);
    }

    #[test]
    fn mix_without_padding_keeps_length() {
        let mut a = constant(10, 0.1, 1000);
        let b = constant(5, 0.2, 1000);
        a.mix(&b, None, false).unwrap();
        assert_eq!(a.len(), 100);
    }

    #[test]
    fn mix_at_grows_buffer() {
        let mut a = constant(10, 1.0, 1000);
        let original = a.frames().to_vec();
        let b = constant(7, 0.5, 1000);
        a.mix_at(2.0, &b, None).unwrap();
        assert!((a.duration() - 2.5).abs() < 1e-9);
        let split = a.frame_idx(2.0);
        assert_eq!(&a.frames()[..original.len()], &original[..]);
        assert!(a.frames()[original.len()..split].iter().all(|&b| b == 0));
        assert_eq!(&a.frames()[split..], b.frames());
    }

    #[test]
    fn mix_takes_only_the_requested_part_of_other() {
        let mut a = constant(10, 0.1, 1000);
        let b = constant(5, 0.2, 1000);
        a.mix(&b, Some(0.05), true).unwrap();
        assert_eq!(a.len(), 100);
        let values: Vec<i64> = pcm::samples(a.frames(), 2).collect();
        assert_eq!(values[49], 15);
        assert_eq!(values[50], 10);

        let mut c = constant(10, 0.1, 1000);
        c.mix_at(0.08, &b, Some(0.05)).unwrap();
        assert_eq!(c.len(), 130);
        let values: Vec<i64> = pcm::samples(c.frames(), 2).collect();
        assert_eq!((values[79], values[80], values[99], values[100], values[129]), (10, 15, 15, 5, 5));
    }

    #[test]
    fn bias_shifts_and_saturates() {
        let mut s = Sample::from_int_values(&[0, -100, 32_000], 100, 2, 1, "b").unwrap();
        s.bias(1000).unwrap();
        assert_eq!(pcm::samples(s.frames(), 2).collect::<Vec<_>>(), vec![1000, 900, 32_767]);
    }

    #[test]
    fn modulate_amp_scales_each_frame() {
        let mut s = Sample::from_int_values(&[100, 200, 100, 200, 100, 200], 100, 2, 2, "st").unwrap();
        s.modulate_amp([0.5, -1.0]).unwrap();
        assert_eq!(pcm::samples(s.frames(), 2).collect::<Vec<_>>(), vec![50, 100, -100, -200, 100, 200]);

        let mut m = constant(1000, 0.04, 100);
        let lfo = Sample::from_int_values(&[0, 500, 1000, -1000], 100, 2, 1, "lfo").unwrap();
        m.modulate_amp_by(&lfo).unwrap();
        assert_eq!(pcm::samples(m.frames(), 2).collect::<Vec<_>>(), vec![0, 500, 1000, -1000]);
        assert!(m.modulate_amp_by(&constant(0, 0.01, 100)).is_err());
    }

    #[test]
    fn pan_lfo_moves_between_channels() {
        let mut s = constant(1000, 0.03, 100);
        s.pan_lfo([-1.0, 0.0]).unwrap();
        assert_eq!(s.nchannels(), 2);
        assert_eq!(pcm::samples(s.frames(), 2).collect::<Vec<_>>(), vec![1000, 0, 500, 500, 500, 500]);

        let mut st = Sample::from_int_values(&[800, 400, 800, 400], 100, 2, 2, "st").unwrap();
        st.pan_lfo([1.0, 0.5]).unwrap();
        assert_eq!(pcm::samples(st.frames(), 2).collect::<Vec<_>>(), vec![0, 400, 200, 300]);
    }

    #[test]
    fn stereo_mix_puts_mono_into_one_channel() {
        let mut s = constant(1000, 0.02, 100);
        let other = constant(300, 0.03, 100);
        s.stereo_mix(&other, Channel::Left, 0.5, 0.0, None).unwrap();
        assert_eq!(s.nchannels(), 2);
        assert_eq!(pcm::samples(s.frames(), 2).collect::<Vec<_>>(), vec![150, 1000, 150, 1000, 150, 0]);

        s.stereo_mix(&other, Channel::Right, 1.0, 0.01, Some(0.01)).unwrap();
        assert_eq!(pcm::samples(s.frames(), 2).collect::<Vec<_>>(), vec![150, 1000, 150, 1300, 150, 0]);

        let stereo = Sample::from_int_values(&[1, 1], 100, 2, 2, "st").unwrap();
        assert!(matches!(
            s.stereo_mix(&stereo, Channel::Left, 1.0, 0.0, None),
            Err(SynthError::ParameterMismatch(_))
        ));
    }

    #[test]
    fn db_levels_per_channel() {
        let silent = constant(0, 0.1, 100);
        assert_eq!(silent.level_db_peak(), (-60.0, -60.0));
        let full = Sample::from_int_values(&[32_767, 3_276, -32_767, -3_276], 100, 2, 2, "lr").unwrap();
        let (left, right) = full.level_db_peak();
        assert!(left.abs() < 1e-3);
        assert!((right + 20.0).abs() < 0.01);
        let (left_rms, right_rms) = full.level_db_rms();
        assert!((left_rms - left).abs() < 1e-3);
        assert!((right_rms - right).abs() < 1e-3);
        let mono = constant(3_276, 0.1, 100);
        let (l, r) = mono.level_db_rms();
        assert_eq!(l, r);
    }

    #[test]
    fn fadein_and_fadeout_are_linear() {
        let mut s = constant(1000, 1.0, 100);
        s.fadein(0.5, 0.0).unwrap();
        s.fadeout(0.5, 0.0).unwrap();
        let values: Vec<i64> = pcm::samples(s.frames(), 2).collect();
        assert_eq!(values[0], 0);
        assert_eq!(values[25], 500);
        assert_eq!(values[50], 1000);
        assert_eq!(values[75], 500);
    }

    #[test]
    fn envelope_shapes_segments() {
        let mut s = constant(10_000, 1.0, 100);
        s.envelope(0.1, 0.1, None, 0.5, 0.2).unwrap();
        assert_eq!(s.len(), 100);
        let values: Vec<i64> = pcm::samples(s.frames(), 2).collect();
        assert_eq!(values[0], 0);
        assert_eq!(values[10], 10_000);
        assert_eq!(values[50], 5_000);
        assert_eq!(values[80], 5_000);
        assert!(values[99] < 500);
    }

    #[test]
    fn envelope_with_fixed_sustain_truncates() {
        let mut s = constant(10_000, 1.0, 100);
        s.envelope(0.1, 0.1, Some(0.2), 0.5, 0.1).unwrap();
        assert_eq!(s.len(), 50);
    }

    #[test]
    fn split_and_join() {
        let mut s = ramp(100, 100, 1);
        let original = s.clone();
        let tail = s.split(0.3).unwrap();
        assert_eq!(s.len(), 30);
        assert_eq!(tail.len(), 70);
        s.join(&tail).unwrap();
        assert_eq!(s, original);
    }

    #[test]
    fn delay_keep_length() {
        let mut s = constant(3, 1.0, 100);
        s.delay(0.5, true).unwrap();
        assert_eq!(s.len(), 100);
        assert_eq!(pcm::samples(s.frames(), 2).filter(|&v| v == 0).count(), 50);
        s.delay(-0.5, false).unwrap();
        assert_eq!(s.len(), 50);
    }

    #[test]
    fn stereo_mono_round_trip() {
        let mut s = constant(100, 0.1, 1000);
        s.stereo(1.0, 0.5).unwrap();
        assert_eq!(s.nchannels(), 2);
        assert_eq!(pcm::samples(s.frames(), 2).take(2).collect::<Vec<_>>(), vec![100, 50]);
        s.right().unwrap();
        assert_eq!(s.nchannels(), 1);
        assert_eq!(s.maximum(), 50);
    }

    #[test]
    fn resample_halves_length() {
        let mut s = ramp(1000, 1000, 2);
        s.resample(500).unwrap();
        assert_eq!(s.len(), 500);
        assert_eq!(s.samplerate(), 500);
        assert!((s.duration() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reverse_keeps_frames_intact() {
        let mut s = Sample::from_int_values(&[1, 2, 3, 4], 100, 2, 2, "lr").unwrap();
        s.reverse().unwrap();
        assert_eq!(pcm::samples(s.frames(), 2).collect::<Vec<_>>(), vec![3, 4, 1, 2]);
    }

    #[test]
    fn echo_extends_sample() {
        let mut s = constant(1000, 1.0, 100);
        s.echo(0.5, 2, 0.5, 0.5).unwrap();
        assert!((s.duration() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn amplify_max_reaches_full_scale() {
        let mut s = constant(1000, 0.1, 100);
        s.amplify_max().unwrap();
        assert!((32765..=32766).contains(&s.maximum()));
    }

    #[test]
    fn width_conversions() {
        let mut s = constant(1000, 0.1, 100);
        s.make_32bit(false).unwrap();
        assert_eq!(s.samplewidth(), 4);
        assert_eq!(s.maximum(), 1000);
        s.make_16bit(false).unwrap();
        assert_eq!(s.maximum(), 0);
    }

    #[test]
    fn chunks_pad_last() {
        let n = 8;
        let s = Sample::from_raw_frames(vec![1u8; 3 * n + 4], 2, 100, 1, "c").unwrap();
        let chunks: Vec<Vec<u8>> = s.chunked_frame_data(n, false, None).collect();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() == n));
        assert_eq!(&chunks[3][..4], &[1, 1, 1, 1]);
        assert_eq!(&chunks[3][4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn repeated_chunks_tile_and_stop() {
        let s = Sample::from_raw_frames(vec![1, 2, 3, 4, 5, 6], 2, 100, 1, "r").unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let mut chunks = s.chunked_frame_data(4, true, Some(Box::new(move || flag.load(Ordering::Relaxed))));
        assert_eq!(chunks.next().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(chunks.next().unwrap(), vec![5, 6, 1, 2]);
        assert_eq!(chunks.next().unwrap(), vec![3, 4, 5, 6]);
        stop.store(true, Ordering::Relaxed);
        assert!(chunks.next().is_none());
    }

    #[test]
    fn float_values_saturate() {
        let s = Sample::from_float_values([0.5, 1.0, -1.0, 2.0], 100, 2, None, "f").unwrap();
        assert_eq!(pcm::samples(s.frames(), 2).collect::<Vec<_>>(), vec![16384, 32767, -32768, 32767]);
    }

    #[test]
    fn wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let mut s = ramp(300, 8000, 2);
        s.make_32bit(false).unwrap();
        s.write_wav(&path).unwrap();
        let loaded = Sample::load_wav(&path).unwrap();
        assert_eq!(loaded, s);
        assert_eq!(loaded.name(), "tone");
    }

    #[test]
    fn normalize_converts_format() {
        let mut s = Sample::from_int_values(&[100; 50], 22050, 4, 1, "n").unwrap();
        let params = AudioParams::default();
        s.normalize(&params).unwrap();
        assert!(s.matches_params(&params));
        assert_eq!(s.len(), 100);
    }
}
