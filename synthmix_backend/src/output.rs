//! Playback front end: the command surface callers use, and the glue that
//! drives mixed chunks into a device or file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use synthmix_core::{AudioParams, EngineConfig, Result, Sample, SynthError, pcm};

use crate::rt_processing::mixer::{Mixer, SourceId};

type PlayedCallback = Box<dyn FnMut(&Sample) + Send>;

/// Set while nothing is playing. Only the mixer's activity callback writes
/// it, so it changes in step with the registry.
struct PlayedSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl PlayedSignal {
    fn new() -> Self {
        Self {
            done: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    fn clear(&self) {
        *self.done.lock() = false;
    }

    fn is_set(&self) -> bool {
        *self.done.lock()
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

struct Shared {
    params: AudioParams,
    mixer: Arc<Mixer>,
    all_played: Arc<PlayedSignal>,
    notify_played: Mutex<Option<PlayedCallback>>,
}

impl Shared {
    fn next_chunk(&self) -> Vec<u8> {
        let chunk = self.mixer.next_chunk();
        let mut notify = self.notify_played.lock();
        if let Some(callback) = notify.as_mut() {
            let p = &self.params;
            match Sample::from_raw_frames(chunk.clone(), p.samplewidth, p.samplerate, p.nchannels, "") {
                Ok(sample) => callback(&sample),
                Err(e) => warn!("could not wrap chunk for the played callback: {e}"),
            }
        }
        chunk
    }
}

/// Destination for mixed chunks: a sound device, a file, a pipe.
pub trait ChunkSink: Send {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Flushes and closes the destination. Called once after the last chunk.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes chunks into a WAV file.
pub struct WavFileSink {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    samplewidth: usize,
}

impl WavFileSink {
    pub fn create(path: impl AsRef<Path>, params: &AudioParams) -> Result<Self> {
        params.validate()?;
        let spec = hound::WavSpec {
            channels: params.nchannels,
            sample_rate: params.samplerate,
            bits_per_sample: params.samplewidth * 8,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path.as_ref(), spec)?;
        info!("writing wav output to {}", path.as_ref().display());
        Ok(Self {
            writer: Some(writer),
            samplewidth: params.samplewidth as usize,
        })
    }
}

impl ChunkSink for WavFileSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(SynthError::invalid("wav sink already finished"));
        };
        for v in pcm::samples(chunk, self.samplewidth) {
            writer.write_sample(v as i32)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            let frames = writer.duration();
            writer.finalize()?;
            info!("wav output finished, {frames} frames");
        }
        Ok(())
    }
}

/// Writes raw interleaved PCM bytes to any writer.
pub struct RawSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> RawSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ChunkSink for RawSink<W> {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.out.write_all(chunk)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Handle to a background streaming thread.
pub struct StreamingHandle {
    stop_tx: Sender<()>,
    join: JoinHandle<Result<u64>>,
}

impl StreamingHandle {
    /// Stops the thread after its current chunk, finishes the sink, and
    /// returns the number of chunks written.
    pub fn stop(self) -> Result<u64> {
        // The thread may already be gone after a sink error.
        let _ = self.stop_tx.send(());
        self.join
            .join()
            .map_err(|_| SynthError::Streaming("streaming thread panicked".into()))?
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Plays samples through a mixer and hands its chunks to a consumer.
pub struct Output {
    shared: Arc<Shared>,
}

impl Output {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let mixer = Arc::new(Mixer::new(&config)?);
        let all_played = Arc::new(PlayedSignal::new());
        let signal = Arc::clone(&all_played);
        mixer.set_activity_callback(move |idle| if idle { signal.set() } else { signal.clear() });
        debug!(
            "output ready: {} Hz, {} bytes, {} ch, {} frames per chunk",
            config.audio.samplerate, config.audio.samplewidth, config.audio.nchannels, config.audio.frames_per_chunk
        );
        Ok(Self {
            shared: Arc::new(Shared {
                params: config.audio,
                mixer,
                all_played,
                notify_played: Mutex::new(None),
            }),
        })
    }

    pub fn params(&self) -> &AudioParams {
        &self.shared.params
    }

    pub fn mixer(&self) -> &Arc<Mixer> {
        &self.shared.mixer
    }

    /// Schedules `sample` to start after `delay` seconds, rounded down to
    /// whole chunks. Returns `Ok(None)` when admission limits refuse it.
    pub fn play(&self, sample: &Sample, repeat: bool, delay: f64) -> Result<Option<SourceId>> {
        let p = &self.shared.params;
        let chunk_delay = (p.samplerate as f64 * delay.max(0.0) / p.frames_per_chunk as f64) as u64;
        self.shared.mixer.add_sample(sample, repeat, chunk_delay)
    }

    pub fn stop(&self, id: SourceId) -> bool {
        self.shared.mixer.stop(id)
    }

    /// Stops every instance of a sample name.
    pub fn stop_name(&self, name: &str) -> usize {
        self.shared.mixer.clear_source(name)
    }

    pub fn silence(&self) {
        self.shared.mixer.clear_sources();
    }

    pub fn set_play_limit(&self, name: &str, max: usize) {
        self.shared.mixer.set_limit(name, max);
    }

    /// Blocks until every source has finished. Something else must be
    /// pulling chunks meanwhile, usually a streaming thread.
    pub fn wait_all_played(&self) {
        self.shared.all_played.wait();
    }

    /// Like [`wait_all_played`](Self::wait_all_played) with a timeout;
    /// true if everything finished in time.
    pub fn wait_all_played_timeout(&self, timeout: Duration) -> bool {
        self.shared.all_played.wait_for(timeout)
    }

    pub fn still_playing(&self) -> bool {
        !self.shared.all_played.is_set()
    }

    /// Called with every produced chunk, wrapped in an unnamed sample.
    pub fn register_notify_played(&self, callback: impl FnMut(&Sample) + Send + 'static) {
        *self.shared.notify_played.lock() = Some(Box::new(callback));
    }

    pub fn next_chunk(&self) -> Vec<u8> {
        self.shared.next_chunk()
    }

    /// Feeds chunks to `sink` on the calling thread until nothing is playing,
    /// then finishes it. Returns the number of chunks written.
    ///
    /// Never returns while a repeating source is active.
    pub fn stream_until_played(&self, sink: &mut dyn ChunkSink) -> Result<u64> {
        let mut written = 0;
        while self.still_playing() {
            sink.write_chunk(&self.shared.next_chunk())?;
            written += 1;
        }
        sink.finish()?;
        debug!("streamed {written} chunks");
        Ok(written)
    }

    /// Starts a thread that feeds chunks to `sink` until stopped.
    ///
    /// With `realtime` the thread paces itself to one chunk per chunk
    /// duration, like a device would; otherwise it runs as fast as the sink
    /// accepts data.
    pub fn spawn_streaming<S: ChunkSink + 'static>(&self, mut sink: S, realtime: bool) -> Result<StreamingHandle> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let period = Duration::from_secs_f64(self.shared.params.chunk_duration());
        let join = thread::Builder::new()
            .name("synthmix-stream".into())
            .spawn(move || -> Result<u64> {
                info!("streaming thread started");
                let mut written = 0u64;
                let mut next_deadline = Instant::now();
                loop {
                    let wait = if realtime {
                        next_deadline.saturating_duration_since(Instant::now())
                    } else {
                        Duration::ZERO
                    };
                    match stop_rx.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    if let Err(e) = sink.write_chunk(&shared.next_chunk()) {
                        warn!("sink rejected a chunk, streaming stops: {e}");
                        sink.finish()?;
                        return Err(e);
                    }
                    written += 1;
                    next_deadline += period;
                }
                sink.finish()?;
                info!("streaming thread stopped after {written} chunks");
                Ok(written)
            })?;
        Ok(StreamingHandle { stop_tx, join })
    }

    pub fn close(&self) {
        self.silence();
        *self.shared.notify_played.lock() = None;
        info!("output closed");
    }
}
