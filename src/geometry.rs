use crate::{AcqError, Result};
use ndarray::{Array1, ArrayView3};
use serde::Deserialize;
use std::{fmt, str::FromStr};

/// Smallest record length the card accepts.
pub const MIN_SAMPLES: usize = 384;
/// Record lengths must be a multiple of this.
pub const SAMPLE_GRANULARITY: usize = 128;

/// Model whose DMA buffers are laid out channel-major.
const CHANNEL_MAJOR_MODEL: &str = "ATS9870";

/// Physical memory layout of one DMA buffer.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BufferOrder {
    /// buffer, record, sample, channel
    Brsc,
    /// buffer, channel, record, sample
    Bcrs,
}

impl BufferOrder {
    pub fn for_model(model: &str) -> Self {
        if model == CHANNEL_MAJOR_MODEL {
            BufferOrder::Bcrs
        } else {
            BufferOrder::Brsc
        }
    }
}

impl FromStr for BufferOrder {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "brsc" => Ok(BufferOrder::Brsc),
            "bcrs" => Ok(BufferOrder::Bcrs),
            other => Err(AcqError::UnknownBufferOrder(other.to_string())),
        }
    }
}

impl fmt::Display for BufferOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferOrder::Brsc => write!(f, "brsc"),
            BufferOrder::Bcrs => write!(f, "bcrs"),
        }
    }
}

/// ADC resolution of the card.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleDepth {
    Bits8,
    /// 12 significant bits left-aligned in a little-endian u16.
    Bits12,
}

impl SampleDepth {
    pub fn bits(self) -> u32 {
        match self {
            SampleDepth::Bits8 => 8,
            SampleDepth::Bits12 => 12,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleDepth::Bits8 => 1,
            SampleDepth::Bits12 => 2,
        }
    }

    /// Right shift that moves a raw word down to its effective code.
    pub fn shift(self) -> u32 {
        match self {
            SampleDepth::Bits8 => 0,
            SampleDepth::Bits12 => 4,
        }
    }

    /// Largest raw word the card can deliver.
    pub fn max_raw(self) -> u64 {
        match self {
            SampleDepth::Bits8 => u8::MAX as u64,
            SampleDepth::Bits12 => 0xFFF0,
        }
    }

    pub fn full_scale(self) -> f64 {
        (1u64 << self.bits()) as f64
    }
}

impl TryFrom<u32> for SampleDepth {
    type Error = AcqError;

    fn try_from(bits: u32) -> Result<Self> {
        match bits {
            8 => Ok(SampleDepth::Bits8),
            12 => Ok(SampleDepth::Bits12),
            other => Err(AcqError::UnsupportedBitDepth(other)),
        }
    }
}

/// Settings of one acquisition, fixed once the driver hands them over.
#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionParameters {
    pub sample_rate: f64,
    pub samples_per_record: usize,
    pub records_per_buffer: usize,
    pub buffers_per_acquisition: usize,
    pub number_of_channels: usize,
    pub depth: SampleDepth,
    pub buffer_order: BufferOrder,
}

impl AcquisitionParameters {
    pub fn validate(&self) -> Result<()> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(AcqError::Configuration(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        let counts = [
            ("samples_per_record", self.samples_per_record),
            ("records_per_buffer", self.records_per_buffer),
            ("buffers_per_acquisition", self.buffers_per_acquisition),
            ("number_of_channels", self.number_of_channels),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(AcqError::Configuration(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    pub fn samples_per_buffer(&self) -> usize {
        self.records_per_buffer * self.samples_per_record * self.number_of_channels
    }

    pub fn bytes_per_buffer(&self) -> usize {
        self.samples_per_buffer() * self.depth.bytes_per_sample()
    }

    /// Sample times of one record in seconds.
    pub fn tvals(&self) -> Array1<f64> {
        Array1::from_iter((0..self.samples_per_record).map(|n| n as f64 / self.sample_rate))
    }
}

/// Converts a record duration to a sample count the card accepts.
///
/// The count is rounded down to a multiple of 128 and bumped by 128 if that
/// falls short of `t`, with a floor of [`MIN_SAMPLES`]. Negative, non-finite
/// or unrepresentable durations are rejected.
pub fn time2samples(t: f64, sample_rate: f64) -> Result<usize> {
    let invalid = || {
        AcqError::Configuration(format!(
            "cannot record for {t} s at {sample_rate} samples/s"
        ))
    };
    if t.is_nan() || t < 0.0 || sample_rate.is_nan() || sample_rate <= 0.0 {
        return Err(invalid());
    }
    let ideal = t * sample_rate;
    // float to int casts saturate, so overflow shows up in checked_mul
    let blocks = (ideal / SAMPLE_GRANULARITY as f64).floor() as usize;
    let mut nsamples = blocks
        .checked_mul(SAMPLE_GRANULARITY)
        .ok_or_else(invalid)?;
    if (nsamples as f64) / sample_rate < t {
        nsamples = nsamples
            .checked_add(SAMPLE_GRANULARITY)
            .ok_or_else(invalid)?;
    }
    Ok(nsamples.max(MIN_SAMPLES))
}

/// Maps the flat DMA buffer onto a `(records, samples, channels)` view.
#[derive(Debug, Clone)]
pub struct BufferGeometry {
    order: BufferOrder,
    depth: SampleDepth,
    records: usize,
    samples: usize,
    channels: usize,
}

impl BufferGeometry {
    pub fn new(params: &AcquisitionParameters) -> Self {
        Self {
            order: params.buffer_order,
            depth: params.depth,
            records: params.records_per_buffer,
            samples: params.samples_per_record,
            channels: params.number_of_channels,
        }
    }

    pub fn order(&self) -> BufferOrder {
        self.order
    }

    /// Shape the raw samples are laid out in.
    pub fn physical_shape(&self) -> [usize; 3] {
        match self.order {
            BufferOrder::Brsc => [self.records, self.samples, self.channels],
            BufferOrder::Bcrs => [self.channels, self.records, self.samples],
        }
    }

    /// Permutation from the physical axes to `(records, samples, channels)`.
    pub fn permutation(&self) -> [usize; 3] {
        match self.order {
            BufferOrder::Brsc => [0, 1, 2],
            BufferOrder::Bcrs => [1, 2, 0],
        }
    }

    pub fn logical_shape(&self) -> [usize; 3] {
        [self.records, self.samples, self.channels]
    }

    pub fn len(&self) -> usize {
        self.records * self.samples * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes `raw` into `scratch`, widening every sample to a u16 word.
    ///
    /// Fails without touching `scratch` when the byte count is wrong.
    pub fn decode_into(&self, raw: &[u8], scratch: &mut Vec<u16>) -> Result<()> {
        let expected = self.len() * self.depth.bytes_per_sample();
        if raw.len() != expected {
            return Err(AcqError::ShapeMismatch {
                expected,
                actual: raw.len(),
            });
        }
        scratch.clear();
        match self.depth {
            SampleDepth::Bits8 => scratch.extend(raw.iter().map(|&b| b as u16)),
            SampleDepth::Bits12 => scratch.extend(
                raw.chunks_exact(2)
                    .map(|word| u16::from_le_bytes([word[0], word[1]])),
            ),
        }
        Ok(())
    }

    /// Canonical `(records, samples, channels)` view over decoded samples.
    pub fn canonical_view<'a>(&self, samples: &'a [u16]) -> Result<ArrayView3<'a, u16>> {
        let view = ArrayView3::from_shape(self.physical_shape(), samples).map_err(|_| {
            AcqError::ShapeMismatch {
                expected: self.len(),
                actual: samples.len(),
            }
        })?;
        Ok(view.permuted_axes(self.permutation()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(depth: SampleDepth, order: BufferOrder) -> AcquisitionParameters {
        AcquisitionParameters {
            sample_rate: 1e9,
            samples_per_record: 384,
            records_per_buffer: 3,
            buffers_per_acquisition: 2,
            number_of_channels: 2,
            depth,
            buffer_order: order,
        }
    }

    #[test]
    fn physical_shape_covers_whole_buffer() {
        for depth in [SampleDepth::Bits8, SampleDepth::Bits12] {
            for order in [BufferOrder::Brsc, BufferOrder::Bcrs] {
                let p = params(depth, order);
                let geometry = BufferGeometry::new(&p);
                let total: usize = geometry.physical_shape().iter().product();
                assert_eq!(total, 384 * 3 * 2);
                assert_eq!(geometry.logical_shape(), [3, 384, 2]);
            }
        }
    }

    #[test]
    fn unknown_order_is_rejected() {
        assert!(matches!(
            "bsrc".parse::<BufferOrder>(),
            Err(AcqError::UnknownBufferOrder(_))
        ));
        assert_eq!("bcrs".parse::<BufferOrder>().unwrap(), BufferOrder::Bcrs);
    }

    #[test]
    fn model_selects_order() {
        assert_eq!(BufferOrder::for_model("ATS9870"), BufferOrder::Bcrs);
        assert_eq!(BufferOrder::for_model("ATS9360"), BufferOrder::Brsc);
    }

    #[test]
    fn unsupported_depth() {
        assert!(matches!(
            SampleDepth::try_from(10),
            Err(AcqError::UnsupportedBitDepth(10))
        ));
    }

    #[test]
    fn time2samples_rounds_up_to_granularity() {
        assert_eq!(time2samples(0.0, 1e9).unwrap(), MIN_SAMPLES);
        assert_eq!(time2samples(1e-6, 1e9).unwrap(), 1024);
        assert_eq!(time2samples(1.03e-6, 1e9).unwrap(), 1152);
        assert_eq!(time2samples(2e-6, 1e9).unwrap(), 2048);
    }

    #[test]
    fn time2samples_rejects_unusable_durations() {
        for (t, fs) in [
            (f64::INFINITY, 1e9),
            (1e300, 1e9),
            (f64::NAN, 1e9),
            (-1e-6, 1e9),
            (1e-6, 0.0),
        ] {
            assert!(
                matches!(time2samples(t, fs), Err(AcqError::Configuration(_))),
                "t = {t}, fs = {fs}"
            );
        }
    }

    #[test]
    fn time2samples_is_monotonic_and_long_enough() {
        let fs = 1.8e9;
        let mut last = 0;
        for i in 0..2000 {
            let t = i as f64 * 3.7e-9;
            let n = time2samples(t, fs).unwrap();
            assert!(n >= last);
            assert!(n % SAMPLE_GRANULARITY == 0 || n == MIN_SAMPLES);
            assert!(n as f64 / fs >= t);
            last = n;
        }
    }

    #[test]
    fn bcrs_is_permuted_to_canonical() {
        let p = AcquisitionParameters {
            samples_per_record: 4,
            records_per_buffer: 2,
            ..params(SampleDepth::Bits8, BufferOrder::Bcrs)
        };
        let geometry = BufferGeometry::new(&p);
        // value = 100 * channel + 10 * record + sample
        let mut raw = Vec::new();
        for c in 0..2u8 {
            for r in 0..2u8 {
                for s in 0..4u8 {
                    raw.push(100 * c + 10 * r + s);
                }
            }
        }
        let mut scratch = Vec::new();
        geometry.decode_into(&raw, &mut scratch).unwrap();
        let view = geometry.canonical_view(&scratch).unwrap();
        assert_eq!(view.shape(), &[2, 4, 2]);
        assert_eq!(view[[1, 3, 1]], 113);
        assert_eq!(view[[0, 2, 0]], 2);
    }

    #[test]
    fn twelve_bit_words_are_little_endian() {
        let p = AcquisitionParameters {
            samples_per_record: 1,
            records_per_buffer: 1,
            number_of_channels: 2,
            ..params(SampleDepth::Bits12, BufferOrder::Brsc)
        };
        let geometry = BufferGeometry::new(&p);
        let mut scratch = Vec::new();
        geometry
            .decode_into(&[0xF0, 0xFF, 0x10, 0x00], &mut scratch)
            .unwrap();
        assert_eq!(scratch, vec![0xFFF0, 0x0010]);
    }

    #[test]
    fn wrong_size_leaves_scratch_alone() {
        let p = params(SampleDepth::Bits12, BufferOrder::Brsc);
        let geometry = BufferGeometry::new(&p);
        let mut scratch = vec![7u16; 3];
        let err = geometry.decode_into(&[0u8; 10], &mut scratch).unwrap_err();
        assert!(matches!(
            err,
            AcqError::ShapeMismatch {
                expected: 4608,
                actual: 10
            }
        ));
        assert_eq!(scratch, vec![7, 7, 7]);
    }
}
