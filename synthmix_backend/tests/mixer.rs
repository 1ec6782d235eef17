use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use synthmix_backend::rt_processing::waveform::{OscParams, Oscillator, WaveformChunks};
use synthmix_backend::{CallbackSlot, Mixer, Output, RawSink, WavFileSink};
use synthmix_core::{AudioParams, EngineConfig, MixerLimits, PcmStreamChunks, Sample, pcm};

fn config(frames_per_chunk: usize) -> EngineConfig {
    EngineConfig {
        audio: AudioParams::new(1000, 2, 1, frames_per_chunk).unwrap(),
        ..EngineConfig::default()
    }
}

fn constant(frames: usize, value: i64, name: &str) -> Sample {
    Sample::from_int_values(&vec![value; frames], 1000, 2, 1, name).unwrap()
}

#[test]
fn non_repeating_sample_plays_three_chunks_then_reports_all_played() {
    let mixer = Mixer::new(&config(100)).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    mixer.set_all_played_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    mixer.add_sample(&constant(250, 1000, "tone"), false, 0).unwrap().unwrap();
    let chunks: Vec<Vec<i64>> = (0..3).map(|_| pcm::samples(&mixer.next_chunk(), 2).collect()).collect();
    assert!(chunks[0].iter().chain(&chunks[1]).all(|&v| v == 1000));
    assert!(chunks[2][..50].iter().all(|&v| v == 1000));
    assert!(chunks[2][50..].iter().all(|&v| v == 0));
    assert_eq!(mixer.active_count(), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    let after = mixer.next_chunk();
    assert!(after.iter().all(|&b| b == 0));
    assert_eq!(mixer.active_count(), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    mixer.next_chunk();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn all_played_fires_once_per_busy_period() {
    let mixer = Mixer::new(&config(10)).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    mixer.set_all_played_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    for round in 1..=3 {
        mixer.add_sample(&constant(10, 1, "a"), false, 0).unwrap();
        mixer.add_sample(&constant(20, 1, "b"), false, 0).unwrap();
        for _ in 0..4 {
            mixer.next_chunk();
        }
        assert_eq!(fired.load(Ordering::SeqCst), round);
    }
}

#[test]
fn fifth_instance_of_a_name_is_rejected() {
    let mixer = Mixer::new(&config(10)).unwrap();
    let sample = constant(100, 1, "snare");
    for _ in 0..4 {
        assert!(mixer.add_sample(&sample, false, 0).unwrap().is_some());
    }
    assert!(mixer.add_sample(&sample, false, 0).unwrap().is_none());
    assert_eq!(mixer.active_count(), 4);
}

#[test]
fn global_cap_holds_for_any_request_order() {
    let mixer = Mixer::new(&config(10)).unwrap();
    let names = ["a", "b", "c", "a", "", "d", "b", "", "e", "f", "a", "g", "", "h"];
    for (i, name) in names.iter().cycle().take(60).enumerate() {
        let _ = mixer.add_sample(&constant(30, 1, name), i % 3 == 0, (i % 4) as u64).unwrap();
        assert!(mixer.active_count() <= MixerLimits::default().max_total);
        if i % 7 == 0 {
            mixer.next_chunk();
        }
    }
}

#[test]
fn stop_from_another_thread_while_mixing() {
    let mixer = Arc::new(Mixer::new(&config(10)).unwrap());
    let id = mixer.add_sample(&constant(10, 5, "loop"), true, 0).unwrap().unwrap();
    let producer = {
        let mixer = Arc::clone(&mixer);
        std::thread::spawn(move || {
            let mut chunks = 0;
            while mixer.active_count() > 0 && chunks < 100_000 {
                mixer.next_chunk();
                chunks += 1;
            }
            chunks
        })
    };
    assert!(mixer.stop(id));
    let chunks = producer.join().unwrap();
    assert!(chunks < 100_000);
    assert!(mixer.next_chunk().iter().all(|&b| b == 0));
}

#[test]
fn playing_state_tracks_registry_under_contention() {
    let output = Output::new(config(10)).unwrap();
    let max_total = MixerLimits::default().max_total;
    let running = std::sync::atomic::AtomicBool::new(true);
    let short = constant(1, 2, "short");

    std::thread::scope(|scope| {
        scope.spawn(|| {
            while running.load(Ordering::SeqCst) {
                output.next_chunk();
                assert!(output.mixer().active_count() <= max_total);
            }
        });
        let players: Vec<_> = (0..4)
            .map(|t| {
                let (output, short) = (&output, &short);
                scope.spawn(move || {
                    let long = constant(30, 1, &format!("long{t}"));
                    for i in 0..300 {
                        let sample = if i % 3 == 0 { &long } else { short };
                        let Some(id) = output.play(sample, false, 0.0).unwrap() else {
                            continue;
                        };
                        // once idle is observed the source must already be gone
                        if !output.still_playing() {
                            assert!(output.mixer().active_sources().iter().all(|(active, ..)| *active != id));
                        }
                        assert!(output.mixer().active_count() <= max_total);
                    }
                })
            })
            .collect();
        let joined: Vec<_> = players.into_iter().map(|p| p.join()).collect();
        let drained = output.wait_all_played_timeout(std::time::Duration::from_secs(5));
        running.store(false, Ordering::SeqCst);
        assert!(joined.iter().all(|j| j.is_ok()));
        assert!(drained);
    });

    assert!(!output.still_playing());
    assert_eq!(output.mixer().active_count(), 0);
    let stats = output.mixer().stats();
    assert_eq!(stats.sources_admitted + stats.sources_rejected, 1200);
}

#[test]
fn waveform_stream_and_decoder_feed_mix_together() {
    let params = AudioParams::new(1000, 2, 1, 50).unwrap();
    let mixer = Mixer::new(&EngineConfig { audio: params, ..EngineConfig::default() }).unwrap();

    let square = Oscillator::square(OscParams::new(10.0).with_samplerate(1000).with_amplitude(0.25)).unwrap();
    let live = WaveformChunks::new(Box::new(square), &params, None).unwrap();
    mixer.add_stream("square", Box::new(live.take(2)), 0).unwrap();

    let decoded = pcm::from_values(vec![100i64; 75], 2);
    let feed = PcmStreamChunks::new(std::io::Cursor::new(decoded), params.chunksize());
    mixer.add_stream("decoded", Box::new(feed), 0).unwrap();

    let first: Vec<i64> = pcm::samples(&mixer.next_chunk(), 2).collect();
    assert_eq!(first[0], 8192 + 100);
    let second: Vec<i64> = pcm::samples(&mixer.next_chunk(), 2).collect();
    assert_eq!(second[10], -8192 + 100);
    assert_eq!(second[30], -8192);
    mixer.next_chunk();
    assert_eq!(mixer.active_count(), 0);
}

/// Decoder output arriving over a channel; an empty channel has no data
/// ready yet and a closed one is the end of the stream.
struct ChannelReader(crossbeam::channel::Receiver<Vec<u8>>);

impl std::io::Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        use crossbeam::channel::TryRecvError;
        match self.0.try_recv() {
            Ok(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Err(TryRecvError::Empty) => Err(std::io::ErrorKind::WouldBlock.into()),
            Err(TryRecvError::Disconnected) => Ok(0),
        }
    }
}

#[test]
fn non_blocking_decoder_plays_silence_until_data_arrives() {
    let params = AudioParams::new(1000, 2, 1, 4).unwrap();
    let mixer = Mixer::new(&EngineConfig { audio: params, ..EngineConfig::default() }).unwrap();
    let (tx, rx) = crossbeam::channel::unbounded();
    let feed = PcmStreamChunks::new(ChannelReader(rx), params.chunksize()).with_frame_size(params.frame_size());
    mixer.add_stream("decoder", Box::new(feed), 0).unwrap();

    assert!(mixer.next_chunk().iter().all(|&b| b == 0));
    assert_eq!(mixer.active_count(), 1);

    tx.send(pcm::from_values(vec![500i64; 4], 2)).unwrap();
    let played: Vec<i64> = pcm::samples(&mixer.next_chunk(), 2).collect();
    assert_eq!(played, vec![500; 4]);

    assert!(mixer.next_chunk().iter().all(|&b| b == 0));
    assert_eq!(mixer.active_count(), 1);

    drop(tx);
    mixer.next_chunk();
    assert_eq!(mixer.active_count(), 0);
}

#[test]
fn output_streams_to_wav_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.wav");
    let output = Output::new(config(100)).unwrap();
    output.play(&constant(250, 1234, "tone"), false, 0.0).unwrap().unwrap();
    output.play(&constant(100, 1, "late"), false, 0.2).unwrap().unwrap();

    let mut sink = WavFileSink::create(&path, output.params()).unwrap();
    let chunks = output.stream_until_played(&mut sink).unwrap();
    assert_eq!(chunks, 4);

    let written = Sample::load_wav(&path).unwrap();
    assert_eq!(written.len(), 400);
    let values: Vec<i64> = pcm::samples(written.frames(), 2).collect();
    assert_eq!(values[0], 1234);
    assert_eq!(values[200], 1235);
    assert_eq!(values[260], 1);
    assert_eq!(values[399], 0);
}

#[test]
fn callback_slot_drives_output_mixer() {
    let output = Output::new(config(64)).unwrap();
    output.play(&constant(100, 7, "tone"), false, 0.0).unwrap().unwrap();
    let slot = CallbackSlot::new(Arc::clone(output.mixer()));
    let mut buf = vec![0.0f32; 30];
    let mut loud = 0;
    for _ in 0..8 {
        assert!(slot.fill_f32(&mut buf));
        loud += buf.iter().filter(|&&v| v > 0.0).count();
    }
    assert_eq!(loud, 100);
    assert_eq!(slot.frame_count(), 240);
    assert!(!output.still_playing());
}

#[test]
fn raw_sink_receives_exact_chunks() {
    let output = Output::new(config(10)).unwrap();
    output.play(&constant(10, 3, "x"), false, 0.0).unwrap();
    let mut sink = RawSink::new(Vec::new());
    output.stream_until_played(&mut sink).unwrap();
    let bytes = sink.into_inner();
    assert_eq!(bytes.len() % output.params().chunksize(), 0);
    assert_eq!(pcm::samples(&bytes, 2).filter(|&v| v == 3).count(), 10);
}
