use crate::{AcqError, Result, SampleDepth};
use ndarray::{ArrayD, ArrayView3, ArrayViewMutD, Axis, IxDyn, Zip};

/// How a processed buffer is folded into the running result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccumulationPolicy {
    /// Keep every buffer in its own slot.
    PerBuffer,
    /// Sum all buffers into one slot.
    BufferAverage,
    /// Average over records, then keep every buffer in its own slot.
    RecordAverage,
}

/// Element type of the accumulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccumulatorDtype {
    U8,
    U16,
    U32,
    U64,
    F64,
}

impl AccumulatorDtype {
    /// Storing keeps the raw width, summing widens it, record means need a
    /// float.
    pub fn select(depth: SampleDepth, policy: AccumulationPolicy) -> Self {
        match (policy, depth) {
            (AccumulationPolicy::PerBuffer, SampleDepth::Bits8) => AccumulatorDtype::U8,
            (AccumulationPolicy::PerBuffer, SampleDepth::Bits12) => AccumulatorDtype::U16,
            (AccumulationPolicy::BufferAverage, SampleDepth::Bits8) => AccumulatorDtype::U32,
            (AccumulationPolicy::BufferAverage, SampleDepth::Bits12) => AccumulatorDtype::U64,
            (AccumulationPolicy::RecordAverage, _) => AccumulatorDtype::F64,
        }
    }

    /// Largest value representable without saturating.
    pub fn max_value(self) -> f64 {
        match self {
            AccumulatorDtype::U8 => u8::MAX as f64,
            AccumulatorDtype::U16 => u16::MAX as f64,
            AccumulatorDtype::U32 => u32::MAX as f64,
            AccumulatorDtype::U64 => u64::MAX as f64,
            AccumulatorDtype::F64 => f64::MAX,
        }
    }
}

/// Running result of one acquisition.
#[derive(Debug, Clone)]
pub enum Accumulator {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    U64(ArrayD<u64>),
    F64(ArrayD<f64>),
}

macro_rules! each_accumulator {
    ($acc:expr, $arr:ident => $body:expr) => {
        match $acc {
            Accumulator::U8($arr) => $body,
            Accumulator::U16($arr) => $body,
            Accumulator::U32($arr) => $body,
            Accumulator::U64($arr) => $body,
            Accumulator::F64($arr) => $body,
        }
    };
}

impl Accumulator {
    /// Allocates a zeroed accumulator of the given shape.
    pub fn zeros(dtype: AccumulatorDtype, shape: &[usize]) -> Self {
        let shape = IxDyn(shape);
        match dtype {
            AccumulatorDtype::U8 => Accumulator::U8(ArrayD::zeros(shape)),
            AccumulatorDtype::U16 => Accumulator::U16(ArrayD::zeros(shape)),
            AccumulatorDtype::U32 => Accumulator::U32(ArrayD::zeros(shape)),
            AccumulatorDtype::U64 => Accumulator::U64(ArrayD::zeros(shape)),
            AccumulatorDtype::F64 => Accumulator::F64(ArrayD::zeros(shape)),
        }
    }

    /// Fails when `additions` full-scale buffers could overflow `dtype`.
    pub fn check_headroom(
        dtype: AccumulatorDtype,
        depth: SampleDepth,
        additions: usize,
    ) -> Result<()> {
        let worst = depth.max_raw() as f64 * additions as f64;
        if worst > dtype.max_value() {
            return Err(AcqError::Configuration(format!(
                "summing {additions} buffers of {}-bit samples overflows a {dtype:?} accumulator",
                depth.bits()
            )));
        }
        Ok(())
    }

    pub fn dtype(&self) -> AccumulatorDtype {
        match self {
            Accumulator::U8(_) => AccumulatorDtype::U8,
            Accumulator::U16(_) => AccumulatorDtype::U16,
            Accumulator::U32(_) => AccumulatorDtype::U32,
            Accumulator::U64(_) => AccumulatorDtype::U64,
            Accumulator::F64(_) => AccumulatorDtype::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        each_accumulator!(self, arr => arr.shape())
    }

    fn slots(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    fn check_slot(&self, index: usize) -> Result<()> {
        let len = self.slots();
        if index >= len {
            return Err(AcqError::BufferIndexOutOfRange { index, len });
        }
        Ok(())
    }

    /// Folds one canonical `(records, samples, channels)` buffer in.
    pub fn fold(
        &mut self,
        policy: AccumulationPolicy,
        index: usize,
        buffer: ArrayView3<'_, u16>,
    ) -> Result<()> {
        match policy {
            AccumulationPolicy::PerBuffer => self.store(index, buffer),
            AccumulationPolicy::BufferAverage => self.add(buffer),
            AccumulationPolicy::RecordAverage => self.store_record_mean(index, buffer),
        }
    }

    /// Writes `buffer` into slot `index`.
    pub fn store(&mut self, index: usize, buffer: ArrayView3<'_, u16>) -> Result<()> {
        self.check_slot(index)?;
        let src = buffer.into_dyn();
        match self {
            Accumulator::U8(arr) => assign_with(arr.index_axis_mut(Axis(0), index), src, |v| v as u8),
            Accumulator::U16(arr) => assign_with(arr.index_axis_mut(Axis(0), index), src, |v| v),
            Accumulator::U32(arr) => {
                assign_with(arr.index_axis_mut(Axis(0), index), src, u32::from)
            }
            Accumulator::U64(arr) => {
                assign_with(arr.index_axis_mut(Axis(0), index), src, u64::from)
            }
            Accumulator::F64(arr) => {
                assign_with(arr.index_axis_mut(Axis(0), index), src, f64::from)
            }
        }
    }

    /// Adds `buffer` onto the single-slot sum.
    ///
    /// Only `U32`, `U64` and `F64` hold sums. Integer sums saturate, so the
    /// buffer count must pass [`Accumulator::check_headroom`] first.
    pub fn add(&mut self, buffer: ArrayView3<'_, u16>) -> Result<()> {
        let src = buffer.into_dyn();
        check_shape(self.shape(), src.shape())?;
        match self {
            Accumulator::U32(arr) => Zip::from(arr)
                .and(&src)
                .for_each(|a, &v| *a = a.saturating_add(u32::from(v))),
            Accumulator::U64(arr) => Zip::from(arr)
                .and(&src)
                .for_each(|a, &v| *a = a.saturating_add(u64::from(v))),
            Accumulator::F64(arr) => Zip::from(arr).and(&src).for_each(|a, &v| *a += f64::from(v)),
            other => {
                return Err(AcqError::Configuration(format!(
                    "buffer sums need at least a U32 accumulator, got {:?}",
                    other.dtype()
                )))
            }
        }
        Ok(())
    }

    /// Stores the mean over records of `buffer` into slot `index`.
    pub fn store_record_mean(&mut self, index: usize, buffer: ArrayView3<'_, u16>) -> Result<()> {
        self.check_slot(index)?;
        let records = buffer.len_of(Axis(0));
        if records == 0 {
            return Err(AcqError::Configuration(
                "cannot average a buffer without records".to_string(),
            ));
        }
        let mean = buffer
            .mapv(f64::from)
            .sum_axis(Axis(0))
            .mapv(|s| s / records as f64)
            .into_dyn();
        match self {
            Accumulator::F64(arr) => {
                let mut slot = arr.index_axis_mut(Axis(0), index);
                check_shape(slot.shape(), mean.shape())?;
                slot.assign(&mean);
                Ok(())
            }
            other => Err(AcqError::Configuration(format!(
                "record means need a float accumulator, got {:?}",
                other.dtype()
            ))),
        }
    }

    /// Converts to floats in `[-0.5, 0.5)`: shift raw words down to their
    /// effective code, divide by `divisor` and by the full scale, then
    /// remove the mid-scale offset.
    pub fn normalize(&self, depth: SampleDepth, divisor: f64) -> ArrayD<f64> {
        let shift = depth.shift();
        let scale = 1.0 / (divisor * depth.full_scale());
        match self {
            Accumulator::U8(arr) => arr.mapv(|v| ((v >> shift) as f64) * scale - 0.5),
            Accumulator::U16(arr) => arr.mapv(|v| ((v >> shift) as f64) * scale - 0.5),
            Accumulator::U32(arr) => arr.mapv(|v| ((v >> shift) as f64) * scale - 0.5),
            Accumulator::U64(arr) => arr.mapv(|v| ((v >> shift) as f64) * scale - 0.5),
            Accumulator::F64(arr) => {
                let shift = (1u32 << shift) as f64;
                arr.mapv(|v| (v / shift) * scale - 0.5)
            }
        }
    }
}

fn check_shape(expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(AcqError::ShapeMismatch {
            expected: expected.iter().product(),
            actual: actual.iter().product(),
        });
    }
    Ok(())
}

fn assign_with<T>(
    mut slot: ArrayViewMutD<'_, T>,
    src: ndarray::ArrayViewD<'_, u16>,
    convert: impl Fn(u16) -> T,
) -> Result<()> {
    check_shape(slot.shape(), src.shape())?;
    Zip::from(&mut slot)
        .and(&src)
        .for_each(|dst, &v| *dst = convert(v));
    Ok(())
}
