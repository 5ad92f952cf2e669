//! Demo scanner: correlate a stream recording against a template recording.
//!
//! Both inputs are mono WAV files. Sample times are anchored at the Unix
//! epoch and the template pick is placed a configurable offset after the
//! template start. Detections are reported through tracing as they emerge.

use std::env;
use std::process;

use chrono::{Duration, TimeZone, Utc};
use tracing::{error, info};

use quakematch::record::{duration_from_secs, sample_interval, Record};
use quakematch::tracing_init::init_tracing;
use quakematch::{Detector, DetectorConfig, StreamConfig, TemplateOrigin};

const STREAM_ID: &str = "XX.DEMO..HHZ";

/// Read a mono WAV file into f64 samples plus its sample rate.
fn read_wav(path: &str) -> Result<(Vec<f64>, f64), String> {
    let reader =
        hound::WavReader::open(path).map_err(|e| format!("failed to open {path}: {e}"))?;
    let spec = reader.spec();

    if spec.channels != 1 {
        return Err(format!("expected mono audio, got {} channels", spec.channels));
    }

    let samples: Result<Vec<f64>, _> = match spec.sample_format {
        hound::SampleFormat::Int => match spec.bits_per_sample {
            16 => reader
                .into_samples::<i16>()
                .map(|s| s.map(|v| v as f64 / 32768.0))
                .collect(),
            _ => return Err(format!("unsupported bit depth: {}", spec.bits_per_sample)),
        },
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .map(|s| s.map(f64::from))
            .collect(),
    };

    samples
        .map(|s| (s, spec.sample_rate as f64))
        .map_err(|e| format!("failed to read samples: {e}"))
}

fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        eprintln!(
            "Usage: {} <template.wav> <stream.wav> <pick-offset-secs> [threshold]",
            args[0]
        );
        process::exit(1);
    }

    let (template_samples, template_fs) = read_wav(&args[1]).unwrap_or_else(|err| {
        error!(%err, "reading template failed");
        process::exit(1);
    });
    let (stream_samples, stream_fs) = read_wav(&args[2]).unwrap_or_else(|err| {
        error!(%err, "reading stream failed");
        process::exit(1);
    });
    if stream_fs != template_fs {
        error!(template_fs, stream_fs, "sample rates do not match");
        process::exit(1);
    }

    let pick_offset: f64 = args[3].parse().unwrap_or_else(|_| {
        eprintln!("invalid pick offset: {}", args[3]);
        process::exit(1);
    });
    let threshold: f64 = match args.get(4) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            eprintln!("invalid threshold: {raw}");
            process::exit(1);
        }),
        None => 0.7,
    };

    // The demo has no real hypocentre; detections inherit the epoch anchor.
    let epoch = Utc.timestamp_opt(0, 0).unwrap();
    let origin = TemplateOrigin {
        time: epoch,
        latitude: 0.0,
        longitude: 0.0,
        depth_km: 0.0,
        magnitude: None,
    };

    let mut detector = Detector::builder("qmscan", origin)
        .config(DetectorConfig {
            gap_tolerance: Duration::seconds(1),
            gap_interpolation: true,
            association_threshold: Some(threshold),
            ..DetectorConfig::default()
        })
        .stream(StreamConfig {
            stream_id: STREAM_ID.into(),
            template_samples,
            sampling_frequency: template_fs,
            template_start: epoch,
            template_pick: epoch + duration_from_secs(pick_offset),
            phase_hint: Some("P".into()),
            pick_id: None,
            weight: None,
            filter: None,
            detection_threshold: Some(threshold),
            merging_threshold: None,
        })
        .build()
        .unwrap_or_else(|err| {
            error!(%err, "building detector failed");
            process::exit(1);
        });

    let mut count = 0usize;
    let chunk = stream_fs as usize;
    for (i, block) in stream_samples.chunks(chunk).enumerate() {
        let record = Record {
            channel_id: STREAM_ID.into(),
            start_time: epoch + sample_interval(stream_fs) * (i * chunk) as i32,
            sampling_frequency: stream_fs,
            samples: block.to_vec(),
        };

        let fed = detector.feed(&record, |detection| {
            count += 1;
            info!(
                time = %detection.time,
                fit = detection.fit,
                channels = detection.num_channels_associated,
                "detection"
            );
        });
        if let Err(err) = fed {
            error!(%err, "processing failed");
            process::exit(1);
        }
    }

    detector.finalize(|detection| {
        count += 1;
        info!(time = %detection.time, fit = detection.fit, "detection at flush");
    });

    info!(detections = count, "scan complete");
}
