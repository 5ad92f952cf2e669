//! Magnitude interfaces.
//!
//! Estimation is downstream work; the core fixes the estimator trait, a
//! template-relative reference implementation, and the range gate. The gate
//! reports an out-of-range magnitude as a value, not a failure of the
//! estimator itself, so the caller decides whether to log or drop it.

use snafu::Snafu;

use crate::amplitude::Amplitude;

#[derive(Debug, Snafu, PartialEq)]
pub enum MagnitudeError {
    #[snafu(display(
        "magnitude out of range: magnitude={observed}, range=({lower:?}, {upper:?})"
    ))]
    OutOfRange {
        lower: Option<f64>,
        upper: Option<f64>,
        observed: f64,
    },
}

pub trait MagnitudeEstimator {
    fn estimate(&self, amplitude: &Amplitude) -> Result<f64, MagnitudeError>;
}

/// Magnitude relative to the template event, from the amplitude ratio.
#[derive(Debug, Clone, Copy)]
pub struct RelativeMagnitude {
    pub template_magnitude: f64,
    pub template_amplitude: f64,
}

impl MagnitudeEstimator for RelativeMagnitude {
    fn estimate(&self, amplitude: &Amplitude) -> Result<f64, MagnitudeError> {
        Ok(self.template_magnitude + (amplitude.value / self.template_amplitude).log10())
    }
}

/// Gates an estimator to a configured magnitude range. Unset bounds pass.
#[derive(Debug, Clone)]
pub struct MagnitudeRange<E> {
    inner: E,
    lower: Option<f64>,
    upper: Option<f64>,
}

impl<E> MagnitudeRange<E> {
    pub fn new(inner: E, lower: Option<f64>, upper: Option<f64>) -> Self {
        Self {
            inner,
            lower,
            upper,
        }
    }
}

impl<E: MagnitudeEstimator> MagnitudeEstimator for MagnitudeRange<E> {
    fn estimate(&self, amplitude: &Amplitude) -> Result<f64, MagnitudeError> {
        let observed = self.inner.estimate(amplitude)?;

        let below = self.lower.map_or(false, |lower| observed < lower);
        let above = self.upper.map_or(false, |upper| observed > upper);
        if below || above {
            return OutOfRangeSnafu {
                lower: self.lower,
                upper: self.upper,
                observed,
            }
            .fail();
        }

        Ok(observed)
    }
}
