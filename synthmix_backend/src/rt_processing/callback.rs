//! Lock-conscious realtime callback slot.
//!
//! Device callbacks ask for buffers of whatever size the driver picked; the
//! mixer produces fixed chunks. The slot bridges the two, keeping the unused
//! tail of the last chunk for the next callback.
//!
//! - No OS mutex in the callback path, only a `spin::Mutex::try_lock`.
//! - The mixer can be hot-swapped from another thread.
//! - If the slot is contended the callback gets silence instead of waiting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use synthmix_core::{AudioParams, pcm, sample::full_scale};

use crate::rt_processing::mixer::Mixer;

struct SlotState {
    mixer: Arc<Mixer>,
    /// Unconsumed bytes of the last chunk, from `offset` on.
    pending: Vec<u8>,
    offset: usize,
    /// Reused byte buffer for float callbacks.
    scratch: Vec<u8>,
}

impl SlotState {
    fn fill(&mut self, out: &mut [u8]) {
        let mut written = 0;
        while written < out.len() {
            if self.offset >= self.pending.len() {
                self.pending = self.mixer.next_chunk();
                self.offset = 0;
                if self.pending.is_empty() {
                    out[written..].fill(0);
                    return;
                }
            }
            let take = (out.len() - written).min(self.pending.len() - self.offset);
            out[written..written + take].copy_from_slice(&self.pending[self.offset..self.offset + take]);
            self.offset += take;
            written += take;
        }
    }
}

pub struct CallbackSlot {
    state: Arc<Mutex<SlotState>>,

    /// Frames handed to the device so far. Atomic so it can be read from other threads.
    frame_clock: AtomicU64,

    params: AudioParams,
}

impl CallbackSlot {
    pub fn new(mixer: Arc<Mixer>) -> Self {
        let params = *mixer.params();
        Self {
            state: Arc::new(Mutex::new(SlotState {
                mixer,
                pending: Vec::new(),
                offset: 0,
                scratch: Vec::new(),
            })),
            frame_clock: AtomicU64::new(0),
            params,
        }
    }

    /// Replaces the mixer, dropping any buffered bytes of the old one.
    ///
    /// Spins until the slot is free; swapping is rare and quick. Returns
    /// false if the new mixer's format differs, in which case nothing changes.
    pub fn swap_mixer(&self, mixer: Arc<Mixer>) -> bool {
        if *mixer.params() != self.params {
            return false;
        }
        let mut state = self.state.lock();
        state.mixer = mixer;
        state.pending.clear();
        state.offset = 0;
        true
    }

    pub fn mixer(&self) -> Arc<Mixer> {
        Arc::clone(&self.state.lock().mixer)
    }

    /// Fills an interleaved PCM byte buffer in the mixer's format.
    ///
    /// Returns `true` if mixer audio was written, `false` if the slot was
    /// busy and the buffer got silence.
    pub fn fill_bytes(&self, output: &mut [u8]) -> bool {
        let frames = output.len() / self.params.frame_size();
        if frames == 0 {
            return false;
        }
        self.frame_clock.fetch_add(frames as u64, Ordering::Relaxed);

        if let Some(mut state) = self.state.try_lock() {
            state.fill(output);
            true
        } else {
            output.fill(0);
            false
        }
    }

    /// Fills an interleaved `f32` buffer with values in [-1, 1].
    ///
    /// Allocates only while the scratch buffer grows to the largest size
    /// the device has asked for.
    pub fn fill_f32(&self, output: &mut [f32]) -> bool {
        let channels = self.params.nchannels as usize;
        let frames = output.len() / channels;
        if frames == 0 {
            return false;
        }
        self.frame_clock.fetch_add(frames as u64, Ordering::Relaxed);

        let Some(mut state) = self.state.try_lock() else {
            output.fill(0.0);
            return false;
        };
        let width = self.params.samplewidth as usize;
        let mut scratch = std::mem::take(&mut state.scratch);
        scratch.resize(output.len() * width, 0);
        state.fill(&mut scratch);
        let scale = full_scale(self.params.samplewidth) as f32;
        for (o, v) in output.iter_mut().zip(pcm::samples(&scratch, width)) {
            *o = v as f32 / scale;
        }
        state.scratch = scratch;
        true
    }

    /// Seconds of audio handed to the device.
    pub fn playback_time(&self) -> f64 {
        self.frame_count() as f64 / self.params.samplerate as f64
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_clock.load(Ordering::Relaxed)
    }
}
