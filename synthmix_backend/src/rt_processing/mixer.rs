//! Pull-based real-time mixer.
//!
//! The mixer owns no thread. One producer calls [`Mixer::next_chunk`] at the
//! rate the device wants; `add_sample`, `stop` and friends may be called from
//! any other thread. The registry lock is only held to snapshot or edit the
//! source list, never while a source produces its chunk.
//!
//! Activity callbacks fire under the registry lock, so a listener always sees
//! busy and idle in the same order the registry went through them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;

use synthmix_core::{AudioParams, EngineConfig, MixerLimits, Result, Sample, SynthError, pcm};

use crate::rt_processing::performance::{MixerStats, PerformanceMonitor};

pub type SourceId = u64;

/// Chunk producer of one active source. Every chunk must be at most the
/// mixer's chunk size; shorter chunks are padded with silence.
pub type ChunkStream = Box<dyn Iterator<Item = Vec<u8>> + Send>;

/// Receives `true` when the registry becomes empty, `false` when it stops
/// being empty.
type ActivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Fade applied to the first chunk of a source when pop prevention is on.
const FADE_IN_SECONDS: f64 = 0.005;
/// Fade applied to the last chunk of a stopped source when pop prevention is on.
const FADE_OUT_SECONDS: f64 = 0.02;

/// Shared between the registry and the producer's snapshot.
struct SourceCell {
    removed: AtomicBool,
    fade_out_requested: AtomicBool,
    started: AtomicBool,
    chunks: spin::Mutex<ChunkStream>,
}

struct ActiveSource {
    name: String,
    start_chunk: u64,
    repeat: bool,
    cell: Arc<SourceCell>,
}

#[derive(Default)]
struct Registry {
    sources: BTreeMap<SourceId, ActiveSource>,
    limits: HashMap<String, usize>,
    next_id: SourceId,
    on_activity: Option<ActivityCallback>,
}

impl Registry {
    fn count_named(&self, name: &str) -> usize {
        self.sources.values().filter(|s| s.name == name).count()
    }

    /// Why a new source would be refused, if it would.
    fn refusal(&self, name: &str, repeat: bool, limits: &MixerLimits) -> Option<&'static str> {
        if self.sources.len() >= limits.max_total {
            return Some("global source cap reached");
        }
        let count = self.count_named(name);
        if repeat && count >= 1 {
            return Some("repeating source already playing");
        }
        if name.is_empty() {
            return None;
        }
        let limit = self.limits.get(name).copied().unwrap_or(limits.max_per_name);
        if count >= limit {
            return Some("per-name limit reached");
        }
        None
    }

    fn insert(&mut self, id: SourceId, source: ActiveSource) {
        let was_idle = self.sources.is_empty();
        self.sources.insert(id, source);
        if was_idle {
            self.announce(false);
        }
    }

    /// Drops a source; false for unknown ids.
    fn remove(&mut self, id: SourceId) -> bool {
        let Some(source) = self.sources.remove(&id) else {
            return false;
        };
        source.cell.removed.store(true, Ordering::Release);
        if self.sources.is_empty() {
            self.announce(true);
        }
        true
    }

    fn clear(&mut self) -> bool {
        if self.sources.is_empty() {
            return false;
        }
        for source in self.sources.values() {
            source.cell.removed.store(true, Ordering::Release);
        }
        self.sources.clear();
        self.announce(true);
        true
    }

    fn announce(&self, idle: bool) {
        if idle {
            debug!("all sources played");
        }
        if let Some(callback) = &self.on_activity {
            callback(idle);
        }
    }
}

/// Sums the chunks of every active source into one output chunk.
pub struct Mixer {
    params: AudioParams,
    limits: MixerLimits,
    pop_prevention: bool,
    registry: Mutex<Registry>,
    chunk_counter: AtomicU64,
    monitor: PerformanceMonitor,
}

impl Mixer {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            params: config.audio,
            limits: config.limits,
            pop_prevention: config.pop_prevention,
            registry: Mutex::new(Registry {
                next_id: 1,
                ..Registry::default()
            }),
            chunk_counter: AtomicU64::new(0),
            monitor: PerformanceMonitor::new(config.audio.frames_per_chunk, config.audio.samplerate, 0.1),
        })
    }

    pub fn params(&self) -> &AudioParams {
        &self.params
    }

    pub fn chunksize(&self) -> usize {
        self.params.chunksize()
    }

    /// Called every time the last active source leaves the registry.
    ///
    /// Replaces any activity callback. Runs with the registry locked, so it
    /// must not call back into the mixer.
    pub fn set_all_played_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.set_activity_callback(move |idle| {
            if idle {
                callback();
            }
        });
    }

    /// Called with `false` when the first source enters an empty registry and
    /// with `true` when the last one leaves it.
    ///
    /// Runs with the registry locked, so it must not call back into the mixer.
    pub fn set_activity_callback(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.registry.lock().on_activity = Some(Arc::new(callback));
    }

    /// Schedules a sample to start `chunk_delay` chunks from now.
    ///
    /// Returns `Ok(None)` when admission limits refuse it. A sample whose
    /// format differs from the mixer's is an error.
    pub fn add_sample(&self, sample: &Sample, repeat: bool, chunk_delay: u64) -> Result<Option<SourceId>> {
        if !sample.matches_params(&self.params) {
            return Err(SynthError::mismatch(format!(
                "sample '{}' is {} Hz/{} bytes/{} ch, mixer expects {} Hz/{} bytes/{} ch",
                sample.name(),
                sample.samplerate(),
                sample.samplewidth(),
                sample.nchannels(),
                self.params.samplerate,
                self.params.samplewidth,
                self.params.nchannels
            )));
        }
        if sample.is_empty() {
            debug!("ignoring empty sample '{}'", sample.name());
            return Ok(None);
        }
        let chunks = sample.chunked_frame_data(self.chunksize(), repeat, None);
        Ok(self.admit(sample.name(), repeat, chunk_delay, Box::new(chunks)))
    }

    /// Schedules an arbitrary chunk stream, for example a decoder feed.
    ///
    /// The stream is treated as non-repeating for admission purposes.
    pub fn add_stream(&self, name: &str, chunks: ChunkStream, chunk_delay: u64) -> Option<SourceId> {
        self.admit(name, false, chunk_delay, chunks)
    }

    fn admit(&self, name: &str, repeat: bool, chunk_delay: u64, chunks: ChunkStream) -> Option<SourceId> {
        let mut registry = self.registry.lock();
        if let Some(reason) = registry.refusal(name, repeat, &self.limits) {
            drop(registry);
            self.monitor.record_rejected();
            debug!("source '{name}' rejected: {reason}");
            return None;
        }
        let id = registry.next_id;
        registry.next_id += 1;
        let start_chunk = self.chunk_counter.load(Ordering::Acquire) + chunk_delay;
        registry.insert(
            id,
            ActiveSource {
                name: name.to_owned(),
                start_chunk,
                repeat,
                cell: Arc::new(SourceCell {
                    removed: AtomicBool::new(false),
                    fade_out_requested: AtomicBool::new(false),
                    started: AtomicBool::new(false),
                    chunks: spin::Mutex::new(chunks),
                }),
            },
        );
        drop(registry);
        self.monitor.record_admitted();
        debug!("source {id} '{name}' admitted (start chunk {start_chunk}, repeat {repeat})");
        Some(id)
    }

    /// Stops one source. With pop prevention a source that already sounded
    /// plays one last faded chunk first. Returns false for unknown ids.
    pub fn stop(&self, id: SourceId) -> bool {
        let mut registry = self.registry.lock();
        let Some(source) = registry.sources.get(&id) else {
            return false;
        };
        if self.pop_prevention && source.cell.started.load(Ordering::Acquire) {
            source.cell.fade_out_requested.store(true, Ordering::Release);
            debug!("source {id} fading out");
            return true;
        }
        registry.remove(id);
        drop(registry);
        debug!("source {id} stopped");
        true
    }

    /// Stops every source with the given name; returns how many were found.
    pub fn clear_source(&self, name: &str) -> usize {
        let ids: Vec<SourceId> = {
            let registry = self.registry.lock();
            registry
                .sources
                .iter()
                .filter(|(_, s)| s.name == name)
                .map(|(id, _)| *id)
                .collect()
        };
        ids.into_iter().filter(|id| self.stop(*id)).count()
    }

    /// Removes every source at once, without fades.
    pub fn clear_sources(&self) {
        if self.registry.lock().clear() {
            debug!("all sources cleared");
        }
    }

    /// Overrides the per-name instance limit for one sample name.
    pub fn set_limit(&self, name: &str, max: usize) {
        self.registry.lock().limits.insert(name.to_owned(), max);
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().sources.len()
    }

    /// Ids of registered sources with their name and repeat flag.
    pub fn active_sources(&self) -> Vec<(SourceId, String, bool)> {
        self.registry
            .lock()
            .sources
            .iter()
            .map(|(id, s)| (*id, s.name.clone(), s.repeat))
            .collect()
    }

    pub fn chunks_mixed(&self) -> u64 {
        self.chunk_counter.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> MixerStats {
        self.monitor.snapshot(self.chunks_mixed())
    }

    /// Produces the next mixed chunk; always exactly `chunksize()` bytes.
    pub fn next_chunk(&self) -> Vec<u8> {
        let _timing = self.monitor.scoped_chunk();
        let current = self.chunk_counter.load(Ordering::Acquire);
        let chunksize = self.chunksize();
        let width = self.params.samplewidth as usize;

        let eligible: Vec<(SourceId, Arc<SourceCell>)> = {
            let registry = self.registry.lock();
            registry
                .sources
                .iter()
                .filter(|(_, s)| s.start_chunk <= current)
                .map(|(id, s)| (*id, Arc::clone(&s.cell)))
                .collect()
        };

        let mut mixed = vec![0u8; chunksize];
        let mut finished = Vec::new();
        for (id, cell) in &eligible {
            if cell.removed.load(Ordering::Acquire) {
                continue;
            }
            let pulled = cell.chunks.lock().next();
            match pulled {
                None => {
                    debug!("source {id} exhausted");
                    finished.push(*id);
                }
                Some(chunk) if chunk.len() > chunksize => {
                    warn!(
                        "source {id} produced a {} byte chunk, larger than {chunksize}; removing it",
                        chunk.len()
                    );
                    self.monitor.record_failed();
                    finished.push(*id);
                }
                Some(mut chunk) => {
                    chunk.resize(chunksize, 0);
                    if self.pop_prevention {
                        if !cell.started.swap(true, Ordering::AcqRel) {
                            self.fade(&mut chunk, FADE_IN_SECONDS, true);
                        }
                        if cell.fade_out_requested.load(Ordering::Acquire) {
                            self.fade(&mut chunk, FADE_OUT_SECONDS, false);
                            finished.push(*id);
                        }
                    } else {
                        cell.started.store(true, Ordering::Release);
                    }
                    if !cell.removed.load(Ordering::Acquire) {
                        pcm::add_into(&mut mixed, &chunk, width);
                    }
                }
            }
        }

        if !finished.is_empty() {
            let mut registry = self.registry.lock();
            for id in &finished {
                registry.remove(*id);
            }
        }

        self.chunk_counter.fetch_add(1, Ordering::AcqRel);
        mixed
    }

    /// Linear fade over the first `seconds` of a chunk; a fade-out silences
    /// whatever follows the ramp.
    fn fade(&self, chunk: &mut [u8], seconds: f64, fade_in: bool) {
        let width = self.params.samplewidth as usize;
        let frame_size = self.params.frame_size();
        let total = chunk.len() / frame_size;
        let ramp = ((seconds * self.params.samplerate as f64) as usize).clamp(1, total.max(1));
        for (i, frame) in chunk.chunks_exact_mut(frame_size).enumerate() {
            let progress = (i as f64 / ramp as f64).min(1.0);
            let factor = if fade_in { progress } else { 1.0 - progress };
            if factor >= 1.0 {
                if fade_in {
                    break;
                }
                continue;
            }
            for s in frame.chunks_exact_mut(width) {
                let v = pcm::read_sample(s, width) as f64 * factor;
                pcm::write_sample(s, width, v as i64);
            }
        }
    }
}
