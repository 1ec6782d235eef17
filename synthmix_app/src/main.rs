use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, info};

use synthmix_backend::rt_processing::waveform::{
    EchoFilter, EnvelopeFilter, Harmonics, Linear, MixingFilter, OscParams, Oscillator, WaveformChunks, WaveformSource,
    WhiteNoise, render_sample,
};
use synthmix_backend::{ChunkSink, Output, WavFileSink};
use synthmix_core::{AudioParams, EngineConfig, Result, Sample};

const USAGE: &str = "usage: synthmix-app [OUTPUT.wav] [--config CONFIG.json]";

struct Args {
    output: PathBuf,
    config: Option<PathBuf>,
}

fn parse_args() -> std::result::Result<Args, String> {
    let mut output = None;
    let mut config = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().ok_or("--config needs a file name")?)),
            "-h" | "--help" => return Err(USAGE.to_owned()),
            _ if output.is_none() => output = Some(PathBuf::from(arg)),
            _ => return Err(format!("unexpected argument '{arg}'\n{USAGE}")),
        }
    }
    Ok(Args {
        output: output.unwrap_or_else(|| PathBuf::from("synthmix-demo.wav")),
        config,
    })
}

/// Renders a source into a locked sample in the output format.
fn instrument(source: &mut dyn WaveformSource, seconds: f64, name: &str, params: &AudioParams) -> Result<Sample> {
    let mut sample = render_sample(source, seconds, params.samplewidth, None, name)?;
    sample.normalize(params)?;
    sample.lock();
    Ok(sample)
}

fn kick(params: &AudioParams) -> Result<Sample> {
    let osc = OscParams::new(70.0).with_samplerate(params.samplerate).with_amplitude(0.9);
    let sweep = Linear::new(0.6)
        .with_increment(-2.0 / params.samplerate as f64)
        .with_range(-0.5, 0.6)?
        .with_samplerate(params.samplerate);
    let body = Oscillator::sine(osc)?.with_fm(sweep);
    let mut env = EnvelopeFilter::new(body, 0.005, 0.1, 0.05, 0.4, 0.15)?.with_stop_at_end(true);
    instrument(&mut env, 0.4, "kick", params)
}

fn hihat(params: &AudioParams) -> Result<Sample> {
    let noise = WhiteNoise::new(OscParams::new(params.samplerate as f64 / 2.0).with_samplerate(params.samplerate))?
        .with_seed(0x5eed);
    let mut env = EnvelopeFilter::new(noise, 0.001, 0.03, 0.0, 0.3, 0.05)?
        .with_stop_at_end(true);
    let mut hat = instrument(&mut env, 0.1, "hihat", params)?.copy();
    hat.amplify(0.4)?;
    if params.nchannels == 2 {
        hat.pan(0.3)?;
    }
    hat.lock();
    Ok(hat)
}

fn chord(params: &AudioParams) -> Result<Sample> {
    let sr = params.samplerate;
    let voices: Vec<Box<dyn WaveformSource>> = [220.0, 277.18, 329.63]
        .into_iter()
        .map(|f| Harmonics::square_h(OscParams::new(f).with_samplerate(sr).with_amplitude(0.25), 9))
        .map(|h| h.map(|h| Box::new(h) as Box<dyn WaveformSource>))
        .collect::<Result<_>>()?;
    let mixed = MixingFilter::new(voices)?;
    let mut env = EnvelopeFilter::new(mixed, 0.05, 0.2, 0.8, 0.6, 0.4)?.with_stop_at_end(true);
    instrument(&mut env, 1.5, "chord", params)
}

fn lead(params: &AudioParams) -> Result<Sample> {
    let sr = params.samplerate;
    let vibrato = Oscillator::sine(OscParams::new(5.0).with_samplerate(sr).with_amplitude(0.01))?;
    let pwm = Oscillator::triangle(OscParams::new(0.5).with_samplerate(sr).with_amplitude(0.3).with_bias(0.5))?;
    let osc = Oscillator::pulse(OscParams::new(440.0).with_samplerate(sr).with_amplitude(0.3), 0.5)?
        .with_fm(vibrato)
        .with_pwm(pwm);
    let env = EnvelopeFilter::new(osc, 0.02, 0.1, 0.3, 0.7, 0.2)?;
    let mut echo = EchoFilter::new(env, 0.6, 4, 0.15, 0.5)?;
    let duration = echo.echo_duration();
    instrument(&mut echo, duration, "lead", params)
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let params = config.audio;
    info!(
        "rendering demo at {} Hz, {} bit, {} channel(s)",
        params.samplerate,
        params.samplewidth * 8,
        params.nchannels
    );

    let kick = kick(&params)?;
    let hihat = hihat(&params)?;
    let chord = chord(&params)?;
    let lead = lead(&params)?;

    // (seconds, sample) in playing order
    let mut pattern: Vec<(f64, &Sample)> = Vec::new();
    for beat in 0..8 {
        let at = beat as f64 * 0.25;
        if beat % 2 == 0 {
            pattern.push((at, &kick));
        }
        pattern.push((at + 0.125, &hihat));
    }
    pattern.push((0.5, &chord));
    pattern.push((1.0, &lead));
    pattern.sort_by(|a, b| a.0.total_cmp(&b.0));

    let output = Output::new(config)?;
    let bass = Harmonics::sawtooth_h(OscParams::new(55.0).with_samplerate(params.samplerate).with_amplitude(0.3), 12)?;
    let bass = EnvelopeFilter::new(bass, 0.01, 0.2, 1.0, 0.5, 0.3)?.with_stop_at_end(true);
    let stream = WaveformChunks::new(Box::new(bass), &params, None)?;
    output.mixer().add_stream("bass", Box::new(stream), 0);

    let mut sink = WavFileSink::create(&args.output, &params)?;
    let mut chunks = 0u64;
    let mut pending = pattern.into_iter().peekable();
    while pending.peek().is_some() {
        let now = chunks as f64 * params.chunk_duration();
        let horizon = now + params.chunk_duration();
        while let Some((at, sample)) = pending.next_if(|(at, _)| *at < horizon) {
            if output.play(sample, false, (at - now).max(0.0))?.is_none() {
                info!("'{}' at {at:.3}s dropped by the mixer limits", sample.name());
            }
        }
        sink.write_chunk(&output.next_chunk())?;
        chunks += 1;
    }
    chunks += output.stream_until_played(&mut sink)?;
    let stats = output.mixer().stats();
    info!(
        "wrote {chunks} chunks to {}: {} sources played, {} rejected, mean chunk time {:.1} us ({:.2}% of budget)",
        args.output.display(),
        stats.sources_admitted,
        stats.sources_rejected,
        stats.ema_chunk_nanos / 1000.0,
        stats.load_percent
    );
    output.close();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
