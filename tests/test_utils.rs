//! Shared utilities for integration tests

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use quakematch::record::Record;

/// Initialize tracing for tests (call once per test that needs tracing)
pub fn init_test_tracing() {
    static TRACING: Lazy<()> = Lazy::new(|| {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("quakematch=warn"));

        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_line_number(true)
            .with_test_writer()
            .try_init()
            .ok();
    });

    Lazy::force(&TRACING);
}

/// Fixed template epoch used throughout the scenarios.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 17, 0, 0, 0).unwrap()
}

/// Stream epoch a month after the template epoch.
pub fn u0() -> DateTime<Utc> {
    t0() + chrono::Duration::days(30)
}

pub fn record(channel_id: &str, start_time: DateTime<Utc>, samples: &[f64]) -> Record {
    Record {
        channel_id: channel_id.into(),
        start_time,
        sampling_frequency: 1.0,
        samples: samples.to_vec(),
    }
}

/// Seeded Gaussian noise for synthetic streams.
pub fn gaussian_noise(n: usize, sigma: f64, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).unwrap();
    (0..n).map(|_| normal.sample(&mut rng)).collect()
}

/// A noise stream of `total` samples with `pattern` mixed in at `offset`.
pub fn embed(pattern: &[f64], total: usize, offset: usize, sigma: f64, seed: u64) -> Vec<f64> {
    let mut samples = gaussian_noise(total, sigma, seed);
    for (i, &value) in pattern.iter().enumerate() {
        if let Some(slot) = samples.get_mut(offset + i) {
            *slot += value;
        }
    }
    samples
}
