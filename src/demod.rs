use crate::{AcqError, Result};
use ndarray::{Array1, ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use num_complex::Complex64;
use std::f64::consts::PI;

/// Lock-in demodulation at a fixed reference frequency.
///
/// The reference basis is built once per acquisition and shared by every
/// demodulation call. Each output sample is the mean over one IF period of
/// the input multiplied by `2 cos` (real part) and `2 sin` (imaginary part).
#[derive(Debug, Clone)]
pub struct DemodulationKernel {
    demod_frq: f64,
    sample_rate: f64,
    period: usize,
    demod_samples: usize,
    cos: Array1<f64>,
    sin: Array1<f64>,
}

impl DemodulationKernel {
    pub fn new(demod_frq: f64, sample_rate: f64, samples_per_record: usize) -> Result<Self> {
        if !demod_frq.is_finite() || demod_frq <= 0.0 {
            return Err(AcqError::Configuration(format!(
                "demodulation frequency must be positive, got {demod_frq}"
            )));
        }
        let period = (sample_rate / demod_frq + 0.5) as usize;
        if period == 0 {
            return Err(AcqError::Configuration(format!(
                "demodulation frequency {demod_frq} Hz is above the sampling rate {sample_rate} Hz"
            )));
        }
        let demod_samples = samples_per_record / period;
        let phase = |n: usize| 2.0 * PI * demod_frq * n as f64 / sample_rate;
        let cos = Array1::from_iter((0..samples_per_record).map(|n| phase(n).cos()));
        let sin = Array1::from_iter((0..samples_per_record).map(|n| phase(n).sin()));

        Ok(Self {
            demod_frq,
            sample_rate,
            period,
            demod_samples,
            cos,
            sin,
        })
    }

    pub fn demod_frq(&self) -> f64 {
        self.demod_frq
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Samples per IF period.
    pub fn period(&self) -> usize {
        self.period
    }

    /// Number of whole IF periods in a record. Zero when the period is longer
    /// than the record.
    pub fn demod_samples(&self) -> usize {
        self.demod_samples
    }

    pub fn samples_per_record(&self) -> usize {
        self.cos.len()
    }

    pub fn basis(&self) -> (&Array1<f64>, &Array1<f64>) {
        (&self.cos, &self.sin)
    }

    /// Start time of every IF period.
    pub fn demod_tvals(&self, tvals: &Array1<f64>) -> Array1<f64> {
        tvals
            .iter()
            .step_by(self.period)
            .take(self.demod_samples)
            .copied()
            .collect()
    }

    /// Demodulates `data` along `axis`, which must have one entry per sample
    /// of a record. All other axes are kept; `axis` shrinks to
    /// [`demod_samples`](Self::demod_samples).
    pub fn demodulate(&self, data: ArrayViewD<'_, f64>, axis: Axis) -> Result<ArrayD<Complex64>> {
        let len = data.len_of(axis);
        if len != self.samples_per_record() {
            return Err(AcqError::ShapeMismatch {
                expected: self.samples_per_record(),
                actual: len,
            });
        }

        let mut shape = data.shape().to_vec();
        shape[axis.index()] = self.demod_samples;
        let mut out = ArrayD::<Complex64>::zeros(IxDyn(&shape));
        if self.demod_samples == 0 {
            return Ok(out);
        }

        let period = self.period;
        let scale = 2.0 / period as f64;
        Zip::from(data.lanes(axis))
            .and(out.lanes_mut(axis))
            .for_each(|lane, mut demod| {
                for (k, value) in demod.iter_mut().enumerate() {
                    let window = k * period..(k + 1) * period;
                    let (mut re, mut im) = (0.0, 0.0);
                    for n in window {
                        re += lane[n] * self.cos[n];
                        im += lane[n] * self.sin[n];
                    }
                    *value = Complex64::new(re * scale, im * scale);
                }
            });
        Ok(out)
    }
}
