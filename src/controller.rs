use crate::{
    time2samples, AccumulationPolicy, Accumulator, AccumulatorDtype, AcqError,
    AcquisitionCallbacks, AcquisitionOverrides, AcquisitionParameters, AcquisitionSettings,
    BufferGeometry, BufferOrder, DemodulationKernel, DeviceInfo, Digitizer, HandlingTimes, Result,
    SampleDepth,
};
use log::{debug, info, trace, warn};
use ndarray::{Array1, ArrayD, Axis};
use num_complex::Complex64;
use serde::Deserialize;
use std::{fmt, str::FromStr, time::Instant};

pub const BUFFERS: &str = "buffers";
pub const RECORDS: &str = "records";
pub const SAMPLES: &str = "samples";
pub const IF_PERIODS: &str = "IF_periods";
pub const CHANNELS: &str = "channels";

/// Channels the card records unless told otherwise.
pub const DEFAULT_CHANNELS: usize = 2;

/// The reductions a controller can apply. Each one is a fixed composition of
/// an [`AccumulationPolicy`], an optional demodulation step at finalize and
/// an optional mean over IF periods.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    /// buffers x records x samples x channels, untouched.
    Raw,
    /// buffers x records x IF periods x channels.
    Demod,
    /// Mean over buffers: records x samples x channels.
    AvgBuf,
    /// Mean over records: buffers x samples x channels.
    AvgRec,
    /// Mean over buffers, then demodulated: records x IF periods x channels.
    AvgDemod,
    /// Mean over records, then demodulated: buffers x IF periods x channels.
    AvgRecDemod,
    /// As `AvgDemod`, then averaged over all IF periods: records x channels.
    AvgIq,
    /// As `AvgRecDemod`, then averaged over all IF periods: buffers x channels.
    AvgRecIq,
}

impl ControllerKind {
    pub const ALL: [ControllerKind; 8] = [
        ControllerKind::Raw,
        ControllerKind::Demod,
        ControllerKind::AvgBuf,
        ControllerKind::AvgRec,
        ControllerKind::AvgDemod,
        ControllerKind::AvgRecDemod,
        ControllerKind::AvgIq,
        ControllerKind::AvgRecIq,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ControllerKind::Raw => "raw",
            ControllerKind::Demod => "demod",
            ControllerKind::AvgBuf => "avg_buf",
            ControllerKind::AvgRec => "avg_rec",
            ControllerKind::AvgDemod => "avg_demod",
            ControllerKind::AvgRecDemod => "avg_rec_demod",
            ControllerKind::AvgIq => "avg_iq",
            ControllerKind::AvgRecIq => "avg_rec_iq",
        }
    }

    pub fn policy(self) -> AccumulationPolicy {
        match self {
            ControllerKind::Raw | ControllerKind::Demod => AccumulationPolicy::PerBuffer,
            ControllerKind::AvgBuf | ControllerKind::AvgDemod | ControllerKind::AvgIq => {
                AccumulationPolicy::BufferAverage
            }
            ControllerKind::AvgRec | ControllerKind::AvgRecDemod | ControllerKind::AvgRecIq => {
                AccumulationPolicy::RecordAverage
            }
        }
    }

    /// Axis of the accumulator holding the samples of a record, if this
    /// controller demodulates.
    pub fn demod_axis(self) -> Option<Axis> {
        match self {
            ControllerKind::Raw | ControllerKind::AvgBuf | ControllerKind::AvgRec => None,
            ControllerKind::Demod => Some(Axis(2)),
            ControllerKind::AvgDemod
            | ControllerKind::AvgRecDemod
            | ControllerKind::AvgIq
            | ControllerKind::AvgRecIq => Some(Axis(1)),
        }
    }

    pub fn demodulates(self) -> bool {
        self.demod_axis().is_some()
    }

    /// Whether the IF period axis is averaged away.
    pub fn reduces_periods(self) -> bool {
        matches!(self, ControllerKind::AvgIq | ControllerKind::AvgRecIq)
    }

    fn accumulator_dims(self) -> &'static [&'static str] {
        match self.policy() {
            AccumulationPolicy::PerBuffer => &[BUFFERS, RECORDS, SAMPLES, CHANNELS],
            AccumulationPolicy::BufferAverage => &[RECORDS, SAMPLES, CHANNELS],
            AccumulationPolicy::RecordAverage => &[BUFFERS, SAMPLES, CHANNELS],
        }
    }

    /// Shape of the accumulator before finalize.
    pub fn accumulator_shape(self, params: &AcquisitionParameters) -> Vec<usize> {
        self.accumulator_dims()
            .iter()
            .map(|&dim| match dim {
                BUFFERS => params.buffers_per_acquisition,
                RECORDS => params.records_per_buffer,
                SAMPLES => params.samples_per_record,
                _ => params.number_of_channels,
            })
            .collect()
    }

    /// Names of the dimensions of the finalized data.
    pub fn data_dims(self) -> Vec<&'static str> {
        let mut dims = self.accumulator_dims().to_vec();
        if let Some(axis) = self.demod_axis() {
            if self.reduces_periods() {
                dims.remove(axis.index());
            } else {
                dims[axis.index()] = IF_PERIODS;
            }
        }
        dims
    }

    /// Shape of the finalized data. `demod_samples` is only read by
    /// demodulating controllers.
    pub fn data_shape(self, params: &AcquisitionParameters, demod_samples: usize) -> Vec<usize> {
        let mut shape = self.accumulator_shape(params);
        if let Some(axis) = self.demod_axis() {
            if self.reduces_periods() {
                shape.remove(axis.index());
            } else {
                shape[axis.index()] = demod_samples;
            }
        }
        shape
    }
}

impl FromStr for ControllerKind {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self> {
        ControllerKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| AcqError::Configuration(format!("unknown controller {s:?}")))
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Finalized values.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionData {
    /// Normalized to `[-0.5, 0.5)`.
    Real(ArrayD<f64>),
    Complex(ArrayD<Complex64>),
}

impl AcquisitionData {
    pub fn shape(&self) -> &[usize] {
        match self {
            AcquisitionData::Real(arr) => arr.shape(),
            AcquisitionData::Complex(arr) => arr.shape(),
        }
    }

    pub fn as_real(&self) -> Option<&ArrayD<f64>> {
        match self {
            AcquisitionData::Real(arr) => Some(arr),
            AcquisitionData::Complex(_) => None,
        }
    }

    pub fn as_complex(&self) -> Option<&ArrayD<Complex64>> {
        match self {
            AcquisitionData::Real(_) => None,
            AcquisitionData::Complex(arr) => Some(arr),
        }
    }
}

/// Result of one acquisition.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub data: AcquisitionData,
    /// One name per axis of `data`.
    pub dims: Vec<&'static str>,
    /// Sample times of one record in seconds.
    pub tvals: Array1<f64>,
    /// Start time of every IF period, for demodulating controllers.
    pub demod_tvals: Option<Array1<f64>>,
    pub handling_times: HandlingTimes,
    pub buffers_received: usize,
}

impl Acquisition {
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    Idle,
    Configured,
    Acquiring,
}

impl ControllerState {
    fn as_str(self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Configured => "configured",
            ControllerState::Acquiring => "acquiring",
        }
    }
}

/// Everything that lives for exactly one acquisition.
struct AcquisitionContext {
    params: AcquisitionParameters,
    geometry: BufferGeometry,
    kernel: Option<DemodulationKernel>,
    accumulator: Accumulator,
    scratch: Vec<u16>,
    handling_times: HandlingTimes,
    buffers_received: usize,
}

type TriggerFn = Box<dyn FnMut(bool)>;

/// Reduces the buffers of one acquisition at a time into an [`Acquisition`].
pub struct AcquisitionController {
    kind: ControllerKind,
    device: DeviceInfo,
    depth: SampleDepth,
    buffer_order: BufferOrder,
    number_of_channels: usize,
    demod_frq: Option<f64>,
    acq_time: Option<f64>,
    acquisition_kwargs: AcquisitionOverrides,
    trigger: Option<TriggerFn>,
    state: ControllerState,
    context: Option<AcquisitionContext>,
}

impl fmt::Debug for AcquisitionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionController")
            .field("kind", &self.kind)
            .field("device", &self.device)
            .field("buffer_order", &self.buffer_order)
            .field("number_of_channels", &self.number_of_channels)
            .field("demod_frq", &self.demod_frq)
            .field("acq_time", &self.acq_time)
            .field("state", &self.state)
            .finish()
    }
}

impl AcquisitionController {
    /// Fails if the card's bit depth is not supported.
    pub fn new(kind: ControllerKind, device: DeviceInfo) -> Result<Self> {
        let depth = SampleDepth::try_from(device.bits_per_sample)?;
        let buffer_order = BufferOrder::for_model(&device.model);
        debug!(
            "{kind} controller for {} ({}-bit, {buffer_order})",
            device.model, device.bits_per_sample
        );
        Ok(Self {
            kind,
            device,
            depth,
            buffer_order,
            number_of_channels: DEFAULT_CHANNELS,
            demod_frq: None,
            acq_time: None,
            acquisition_kwargs: AcquisitionOverrides::default(),
            trigger: None,
            state: ControllerState::Idle,
            context: None,
        })
    }

    pub fn with_buffer_order(mut self, order: BufferOrder) -> Self {
        self.buffer_order = order;
        self
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn buffer_order(&self) -> BufferOrder {
        self.buffer_order
    }

    pub fn number_of_channels(&self) -> usize {
        self.number_of_channels
    }

    pub fn set_number_of_channels(&mut self, channels: usize) {
        self.number_of_channels = channels;
    }

    pub fn demod_frq(&self) -> Option<f64> {
        self.demod_frq
    }

    pub fn set_demod_frq(&mut self, demod_frq: Option<f64>) {
        self.demod_frq = demod_frq;
    }

    pub fn acq_time(&self) -> Option<f64> {
        self.acq_time
    }

    pub fn set_acq_time(&mut self, acq_time: Option<f64>) {
        self.acq_time = acq_time;
    }

    /// Called with `true` right before the first buffer and `false` once
    /// the acquisition ends or is aborted.
    pub fn set_trigger(&mut self, trigger: impl FnMut(bool) + 'static) {
        self.trigger = Some(Box::new(trigger));
    }

    pub fn clear_trigger(&mut self) {
        self.trigger = None;
    }

    pub fn acquisition_kwargs(&self) -> &AcquisitionOverrides {
        &self.acquisition_kwargs
    }

    /// Merges `overrides` into the settings passed to the driver. With an
    /// acquisition time set, the record length is derived from it unless
    /// `overrides` sets one explicitly. The stored settings are left alone
    /// if the acquisition time cannot be converted.
    pub fn update_acquisition_kwargs(
        &mut self,
        driver: &dyn Digitizer,
        mut overrides: AcquisitionOverrides,
    ) -> Result<()> {
        if let (Some(t), None) = (self.acq_time, overrides.samples_per_record) {
            let samples = time2samples(t, driver.sample_rate())?;
            debug!("acquisition time {t} s -> {samples} samples per record");
            overrides.samples_per_record = Some(samples);
        }
        self.acquisition_kwargs.merge(&overrides);
        Ok(())
    }

    pub fn parameters(&self, settings: &AcquisitionSettings) -> Result<AcquisitionParameters> {
        let params = AcquisitionParameters {
            sample_rate: settings.sample_rate,
            samples_per_record: settings.samples_per_record,
            records_per_buffer: settings.records_per_buffer,
            buffers_per_acquisition: settings.buffers_per_acquisition,
            number_of_channels: self.number_of_channels,
            depth: self.depth,
            buffer_order: self.buffer_order,
        };
        params.validate()?;
        Ok(params)
    }

    fn kernel(&self, params: &AcquisitionParameters) -> Result<Option<DemodulationKernel>> {
        if !self.kind.demodulates() {
            return Ok(None);
        }
        let demod_frq = self.demod_frq.ok_or(AcqError::MissingDemodFrequency)?;
        DemodulationKernel::new(demod_frq, params.sample_rate, params.samples_per_record).map(Some)
    }

    /// Shape of the data an acquisition with `settings` would return.
    pub fn data_shape(&self, settings: &AcquisitionSettings) -> Result<Vec<usize>> {
        let params = self.parameters(settings)?;
        let demod_samples = self
            .kernel(&params)?
            .map_or(0, |kernel| kernel.demod_samples());
        Ok(self.kind.data_shape(&params, demod_samples))
    }

    pub fn data_dims(&self) -> Vec<&'static str> {
        self.kind.data_dims()
    }

    pub fn is_idle(&self) -> bool {
        self.state == ControllerState::Idle
    }

    /// Runs one acquisition on `driver` with the stored acquisition kwargs.
    pub fn do_acquisition(&mut self, driver: &mut dyn Digitizer) -> Result<Acquisition> {
        self.expect_state(ControllerState::Idle)?;
        let kwargs = self.acquisition_kwargs.clone();
        driver.acquire(self, &kwargs)
    }

    fn expect_state(&self, expected: ControllerState) -> Result<()> {
        if self.state != expected {
            return Err(AcqError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn fire_trigger(&mut self, on: bool) {
        if let Some(trigger) = self.trigger.as_mut() {
            trace!("trigger {}", if on { "on" } else { "off" });
            trigger(on);
        }
    }

    fn finalize(&self, ctx: AcquisitionContext) -> Result<Acquisition> {
        let params = &ctx.params;
        let divisor = match self.kind.policy() {
            AccumulationPolicy::BufferAverage => {
                if ctx.buffers_received != params.buffers_per_acquisition {
                    warn!(
                        "averaged {} buffers but normalizing by {}",
                        ctx.buffers_received, params.buffers_per_acquisition
                    );
                }
                params.buffers_per_acquisition as f64
            }
            _ => 1.0,
        };
        let normalized = ctx.accumulator.normalize(params.depth, divisor);

        let data = match (&ctx.kernel, self.kind.demod_axis()) {
            (Some(kernel), Some(axis)) => {
                let demodulated = kernel.demodulate(normalized.view(), axis)?;
                if self.kind.reduces_periods() {
                    AcquisitionData::Complex(mean_over_periods(demodulated, axis))
                } else {
                    AcquisitionData::Complex(demodulated)
                }
            }
            _ => AcquisitionData::Real(normalized),
        };

        let demod_samples = ctx.kernel.as_ref().map_or(0, |k| k.demod_samples());
        let expected = self.kind.data_shape(params, demod_samples);
        if data.shape() != expected.as_slice() {
            return Err(AcqError::ShapeMismatch {
                expected: expected.iter().product(),
                actual: data.shape().iter().product(),
            });
        }

        let tvals = params.tvals();
        let demod_tvals = ctx.kernel.as_ref().map(|k| k.demod_tvals(&tvals));
        if let Some(mean) = ctx.handling_times.mean() {
            info!(
                "{} acquisition done: {} buffers, {:?} per buffer, shape {:?}",
                self.kind,
                ctx.buffers_received,
                mean,
                data.shape()
            );
        }
        Ok(Acquisition {
            data,
            dims: self.kind.data_dims(),
            tvals,
            demod_tvals,
            handling_times: ctx.handling_times,
            buffers_received: ctx.buffers_received,
        })
    }
}

fn mean_over_periods(data: ArrayD<Complex64>, axis: Axis) -> ArrayD<Complex64> {
    let periods = data.len_of(axis);
    if periods == 0 {
        warn!("no whole IF period fits in a record, IQ values are undefined");
    }
    data.sum_axis(axis).mapv(|v| v / periods as f64)
}

impl AcquisitionCallbacks for AcquisitionController {
    fn on_configure(&mut self, settings: &AcquisitionSettings) -> Result<()> {
        self.expect_state(ControllerState::Idle)?;
        let params = self.parameters(settings)?;
        let kernel = self.kernel(&params)?;
        if let Some(kernel) = &kernel {
            if kernel.demod_samples() == 0 {
                warn!(
                    "IF period of {} samples is longer than a record of {}",
                    kernel.period(),
                    params.samples_per_record
                );
            }
        }

        let policy = self.kind.policy();
        let dtype = AccumulatorDtype::select(params.depth, policy);
        if policy == AccumulationPolicy::BufferAverage {
            Accumulator::check_headroom(dtype, params.depth, params.buffers_per_acquisition)?;
        }
        let shape = self.kind.accumulator_shape(&params);
        debug!("allocating {dtype:?} accumulator of shape {shape:?}");

        self.context = Some(AcquisitionContext {
            geometry: BufferGeometry::new(&params),
            kernel,
            accumulator: Accumulator::zeros(dtype, &shape),
            scratch: Vec::with_capacity(params.samples_per_buffer()),
            handling_times: HandlingTimes::with_capacity(params.buffers_per_acquisition),
            buffers_received: 0,
            params,
        });
        self.state = ControllerState::Configured;
        Ok(())
    }

    fn on_acquisition_start(&mut self) -> Result<()> {
        self.expect_state(ControllerState::Configured)?;
        self.fire_trigger(true);
        self.state = ControllerState::Acquiring;
        Ok(())
    }

    fn on_buffer(&mut self, index: Option<usize>, raw: &[u8]) -> Result<()> {
        self.expect_state(ControllerState::Acquiring)?;
        let t0 = Instant::now();
        let policy = self.kind.policy();
        let ctx = self.context.as_mut().ok_or(AcqError::InvalidState {
            expected: "configured",
            actual: "idle",
        })?;

        let slot = match policy {
            AccumulationPolicy::BufferAverage => 0,
            _ => index.unwrap_or(ctx.buffers_received),
        };
        ctx.geometry.decode_into(raw, &mut ctx.scratch)?;
        let buffer = ctx.geometry.canonical_view(&ctx.scratch)?;
        ctx.accumulator.fold(policy, slot, buffer)?;

        ctx.buffers_received += 1;
        let elapsed = t0.elapsed();
        ctx.handling_times.record(elapsed);
        trace!("buffer {slot} handled in {elapsed:?}");
        Ok(())
    }

    fn on_acquisition_end(&mut self) -> Result<Acquisition> {
        self.expect_state(ControllerState::Acquiring)?;
        self.fire_trigger(false);
        self.state = ControllerState::Idle;
        let ctx = self.context.take().ok_or(AcqError::InvalidState {
            expected: "acquiring",
            actual: "idle",
        })?;
        self.finalize(ctx)
    }

    fn on_abort(&mut self) {
        if self.state == ControllerState::Acquiring {
            self.fire_trigger(false);
        }
        if let Some(ctx) = self.context.take() {
            warn!(
                "acquisition aborted after {} buffers, discarding partial data",
                ctx.buffers_received
            );
        }
        self.state = ControllerState::Idle;
    }
}
