//! Normalised cross-correlation of a template against a sample window.
//!
//! The template is demeaned once at construction; each lagged window view is
//! demeaned on the fly through running sums, so one pass produces the full
//! coefficient sequence. Correlation is done in the time domain; windows are
//! short (a few template lengths) and the streaming cadence makes the direct
//! form the simplest correct one.

use snafu::Snafu;

use crate::template::TemplateWaveform;

/// Slack allowed on the coefficient bound before declaring the kernel broken.
pub const COEFFICIENT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Snafu)]
#[snafu(display("correlation coefficient {value} outside [-1, 1]"))]
pub struct NumericInstabilityError {
    pub value: f64,
}

/// Correlation coefficients `c[k]` for every lag position of `template`
/// within `window`.
///
/// `window` must hold at least `template.len()` samples; the result has
/// `window.len() - template.len() + 1` entries. A lag whose window view is
/// constant has no defined coefficient and yields NaN, which downstream
/// treats as "no match". Finite coefficients outside `[-1, 1]` beyond
/// `COEFFICIENT_TOLERANCE` fail with `NumericInstabilityError`.
pub fn correlate(
    template: &TemplateWaveform,
    window: &[f64],
) -> Result<Vec<f64>, NumericInstabilityError> {
    let t = template.demeaned();
    let m = t.len();
    let n = window.len();
    debug_assert!(n >= m);

    let lags = n - m + 1;
    let mut coefficients = Vec::with_capacity(lags);

    let mut sum: f64 = window[..m].iter().sum();
    let mut sum_sq: f64 = window[..m].iter().map(|v| v * v).sum();

    for k in 0..lags {
        if k > 0 {
            let incoming = window[k + m - 1];
            let outgoing = window[k - 1];
            sum += incoming - outgoing;
            sum_sq += incoming * incoming - outgoing * outgoing;
        }

        // With a zero-mean template the window mean cancels out of the
        // numerator; only the denominator needs the centered energy.
        let dot: f64 = t
            .iter()
            .zip(&window[k..k + m])
            .map(|(a, b)| a * b)
            .sum();
        let centered_energy = (sum_sq - sum * sum / m as f64).max(0.0);
        let denominator = template.norm() * centered_energy.sqrt();

        let coefficient = if denominator > 0.0 {
            dot / denominator
        } else {
            f64::NAN
        };

        if coefficient.is_finite() && coefficient.abs() > 1.0 + COEFFICIENT_TOLERANCE {
            return NumericInstabilitySnafu { value: coefficient }.fail();
        }

        coefficients.push(coefficient);
    }

    Ok(coefficients)
}
