use crate::{
    Acquisition, AcquisitionCallbacks, AcquisitionOverrides, AcquisitionSettings, AcqError,
    BufferOrder, Counter, DeviceInfo, Digitizer, Result, SampleDepth,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{f64::consts::PI, thread};

/// DMA buffers kept in flight between the card and the host.
const DEFAULT_POOL_SIZE: usize = 4;

/// Test tone fed to every channel, in normalized units where the full ADC
/// range spans `[-0.5, 0.5)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tone {
    pub frequency: f64,
    pub amplitude: f64,
    /// Radians.
    pub phase: f64,
    pub offset: f64,
    /// Peak amplitude of uniform noise.
    pub noise: f64,
    pub seed: u64,
}

impl Default for Tone {
    fn default() -> Self {
        Self {
            frequency: 50e6,
            amplitude: 0.25,
            phase: 0.0,
            offset: 0.0,
            noise: 0.0,
            seed: 0,
        }
    }
}

/// Card settings of the simulated digitizer.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardSetup {
    pub model: String,
    pub serial: String,
    pub bits_per_sample: u32,
    pub sample_rate: f64,
    pub samples_per_record: usize,
    pub records_per_buffer: usize,
    pub buffers_per_acquisition: usize,
    pub number_of_channels: usize,
}

/// An in-process digitizer that synthesizes a tone and hands it to a
/// controller through the same hooks a real card driver uses.
///
/// Buffers are filled on a producer thread and recycled through a fixed
/// pool, so the controller only ever borrows them for one callback.
#[derive(Debug)]
pub struct SimulatedDigitizer {
    setup: BoardSetup,
    depth: SampleDepth,
    order: BufferOrder,
    tone: Tone,
    pool_size: usize,
    truncate_buffer: Option<usize>,
    counter: Counter,
}

impl SimulatedDigitizer {
    pub fn new(setup: BoardSetup, tone: Tone) -> Result<Self> {
        let depth = SampleDepth::try_from(setup.bits_per_sample)?;
        let order = BufferOrder::for_model(&setup.model);
        Ok(Self {
            setup,
            depth,
            order,
            tone,
            pool_size: DEFAULT_POOL_SIZE,
            truncate_buffer: None,
            counter: Counter::new(),
        })
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Delivers buffer `index` one sample short, as a misconfigured card
    /// would.
    pub fn with_truncated_buffer(mut self, index: usize) -> Self {
        self.truncate_buffer = Some(index);
        self
    }

    pub fn setup(&self) -> &BoardSetup {
        &self.setup
    }

    pub fn tone_mut(&mut self) -> &mut Tone {
        &mut self.tone
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    fn settings(&self, overrides: &AcquisitionOverrides) -> AcquisitionSettings {
        AcquisitionSettings {
            sample_rate: self.setup.sample_rate,
            samples_per_record: overrides
                .samples_per_record
                .unwrap_or(self.setup.samples_per_record),
            records_per_buffer: overrides
                .records_per_buffer
                .unwrap_or(self.setup.records_per_buffer),
            buffers_per_acquisition: overrides
                .buffers_per_acquisition
                .unwrap_or(self.setup.buffers_per_acquisition),
        }
    }

    fn stream(
        &mut self,
        controller: &mut dyn AcquisitionCallbacks,
        settings: &AcquisitionSettings,
    ) -> Result<()> {
        let synth = Synthesizer {
            tone: self.tone.clone(),
            depth: self.depth,
            order: self.order,
            settings: *settings,
            channels: self.setup.number_of_channels,
        };
        let bytes = synth.bytes_per_buffer();
        let buffers = settings.buffers_per_acquisition;
        let truncate = self.truncate_buffer;
        let counter = &mut self.counter;
        counter.restart();

        let (free_tx, free_rx) = bounded::<Vec<u8>>(self.pool_size);
        let (full_tx, full_rx) = bounded::<(usize, Vec<u8>)>(self.pool_size);
        for _ in 0..self.pool_size {
            free_tx
                .send(vec![0u8; bytes])
                .map_err(|e| AcqError::Driver(e.to_string()))?;
        }

        thread::scope(|scope| {
            scope.spawn(move || synth.produce(buffers, truncate, free_rx, full_tx));

            let result = consume(controller, buffers, &full_rx, &free_tx, counter);
            // hang up so the producer stops if we bailed out early
            drop(full_rx);
            drop(free_tx);
            result
        })
    }
}

fn consume(
    controller: &mut dyn AcquisitionCallbacks,
    buffers: usize,
    full_rx: &Receiver<(usize, Vec<u8>)>,
    free_tx: &Sender<Vec<u8>>,
    counter: &mut Counter,
) -> Result<()> {
    for _ in 0..buffers {
        let (index, buffer) = full_rx
            .recv()
            .map_err(|_| AcqError::Driver("buffer producer stopped".to_string()))?;
        controller.on_buffer(Some(index), &buffer)?;
        counter.record(buffer.len());
        // the producer may already be gone after the last buffer
        let _ = free_tx.send(buffer);
    }
    Ok(())
}

struct Synthesizer {
    tone: Tone,
    depth: SampleDepth,
    order: BufferOrder,
    settings: AcquisitionSettings,
    channels: usize,
}

impl Synthesizer {
    fn bytes_per_buffer(&self) -> usize {
        self.settings.records_per_buffer
            * self.settings.samples_per_record
            * self.channels
            * self.depth.bytes_per_sample()
    }

    fn produce(
        self,
        buffers: usize,
        truncate: Option<usize>,
        free_rx: Receiver<Vec<u8>>,
        full_tx: Sender<(usize, Vec<u8>)>,
    ) {
        let mut rng = StdRng::seed_from_u64(self.tone.seed);
        for index in 0..buffers {
            let Ok(mut buffer) = free_rx.recv() else {
                debug!("buffer pool closed after {index} buffers");
                return;
            };
            buffer.resize(self.bytes_per_buffer(), 0);
            self.fill(&mut buffer, &mut rng);
            if truncate == Some(index) {
                buffer.truncate(buffer.len() - self.depth.bytes_per_sample());
            }
            if full_tx.send((index, buffer)).is_err() {
                debug!("consumer hung up at buffer {index}");
                return;
            }
        }
    }

    /// Quantized sample `n` of a record.
    fn code(&self, n: usize, rng: &mut StdRng) -> u16 {
        let t = n as f64 / self.settings.sample_rate;
        let mut v = self.tone.offset
            + self.tone.amplitude * (2.0 * PI * self.tone.frequency * t + self.tone.phase).cos();
        if self.tone.noise > 0.0 {
            v += self.tone.noise * rng.random_range(-1.0_f64..=1.0);
        }
        let full_scale = self.depth.full_scale();
        ((v + 0.5) * full_scale).round().clamp(0.0, full_scale - 1.0) as u16
    }

    fn fill(&self, buffer: &mut [u8], rng: &mut StdRng) {
        let records = self.settings.records_per_buffer;
        let samples = self.settings.samples_per_record;
        let channels = self.channels;
        let width = self.depth.bytes_per_sample();

        for r in 0..records {
            for n in 0..samples {
                for c in 0..channels {
                    let flat = match self.order {
                        BufferOrder::Brsc => (r * samples + n) * channels + c,
                        BufferOrder::Bcrs => (c * records + r) * samples + n,
                    };
                    let code = self.code(n, rng);
                    let at = flat * width;
                    match self.depth {
                        SampleDepth::Bits8 => buffer[at] = code as u8,
                        SampleDepth::Bits12 => {
                            buffer[at..at + 2].copy_from_slice(&(code << 4).to_le_bytes())
                        }
                    }
                }
            }
        }
    }
}

impl Digitizer for SimulatedDigitizer {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            model: self.setup.model.clone(),
            serial: self.setup.serial.clone(),
            bits_per_sample: self.setup.bits_per_sample,
        }
    }

    fn sample_rate(&self) -> f64 {
        self.setup.sample_rate
    }

    fn samples_per_record(&self) -> usize {
        self.setup.samples_per_record
    }

    fn records_per_buffer(&self) -> usize {
        self.setup.records_per_buffer
    }

    fn buffers_per_acquisition(&self) -> usize {
        self.setup.buffers_per_acquisition
    }

    fn acquire(
        &mut self,
        controller: &mut dyn AcquisitionCallbacks,
        overrides: &AcquisitionOverrides,
    ) -> Result<Acquisition> {
        let settings = self.settings(overrides);
        debug!("acquiring with {settings:?}");
        controller.on_configure(&settings)?;

        let streamed = match controller.on_acquisition_start() {
            Ok(()) => self.stream(controller, &settings),
            Err(e) => Err(e),
        };
        if let Err(e) = streamed {
            controller.on_abort();
            return Err(e);
        }

        info!(
            "{} {}: {} buffers, {:.2} MB/s average, {:.2} MB/s over the last second",
            self.setup.model,
            self.setup.serial,
            self.counter.buffers(),
            self.counter.average_rate(),
            self.counter.window_rate()
        );
        controller.on_acquisition_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AcquisitionController, ControllerKind};

    fn board(model: &str, bits: u32) -> BoardSetup {
        BoardSetup {
            model: model.to_string(),
            serial: "sim-0".to_string(),
            bits_per_sample: bits,
            sample_rate: 1e9,
            samples_per_record: 2000,
            records_per_buffer: 4,
            buffers_per_acquisition: 6,
            number_of_channels: 2,
        }
    }

    fn controller(dig: &SimulatedDigitizer, kind: ControllerKind) -> AcquisitionController {
        let mut ctl = AcquisitionController::new(kind, dig.device_info()).unwrap();
        ctl.set_demod_frq(Some(50e6));
        ctl
    }

    #[test]
    fn iq_recovers_amplitude_and_phase() {
        let tone = Tone {
            amplitude: 0.2,
            phase: PI / 4.0,
            ..Tone::default()
        };
        let mut dig = SimulatedDigitizer::new(board("ATS9360", 12), tone).unwrap();
        let mut ctl = controller(&dig, ControllerKind::AvgIq);
        let acq = ctl.do_acquisition(&mut dig).unwrap();
        assert_eq!(acq.dims, vec!["records", "channels"]);
        assert_eq!(acq.buffers_received, 6);
        for z in acq.data.as_complex().unwrap().iter() {
            assert!((z.norm() - 0.2).abs() < 1e-3, "{z}");
            assert!((z.arg() + PI / 4.0).abs() < 1e-2, "{z}");
        }
        assert_eq!(dig.counter().buffers(), 6);
    }

    #[test]
    fn channel_major_eight_bit_card() {
        let mut dig = SimulatedDigitizer::new(board("ATS9870", 8), Tone::default()).unwrap();
        let mut ctl = controller(&dig, ControllerKind::AvgRecIq);
        assert_eq!(ctl.buffer_order(), BufferOrder::Bcrs);
        let acq = ctl.do_acquisition(&mut dig).unwrap();
        assert_eq!(acq.shape(), &[6, 2]);
        for z in acq.data.as_complex().unwrap().iter() {
            assert!((z.re - 0.25).abs() < 1e-2, "{z}");
            assert!(z.im.abs() < 1e-2, "{z}");
        }
    }

    #[test]
    fn noisy_average_stays_close() {
        let tone = Tone {
            noise: 0.05,
            seed: 7,
            ..Tone::default()
        };
        let mut dig = SimulatedDigitizer::new(board("ATS9360", 12), tone)
            .unwrap()
            .with_pool_size(2);
        let mut ctl = controller(&dig, ControllerKind::AvgIq);
        let acq = ctl.do_acquisition(&mut dig).unwrap();
        for z in acq.data.as_complex().unwrap().iter() {
            assert!((z.re - 0.25).abs() < 1e-2, "{z}");
        }
    }

    #[test]
    fn acq_time_sets_record_length() {
        let dig = SimulatedDigitizer::new(board("ATS9360", 12), Tone::default()).unwrap();
        let mut ctl = controller(&dig, ControllerKind::AvgBuf);
        ctl.set_acq_time(Some(1e-6));
        ctl.update_acquisition_kwargs(&dig, AcquisitionOverrides::default())
            .unwrap();
        assert_eq!(ctl.acquisition_kwargs().samples_per_record, Some(1024));

        ctl.update_acquisition_kwargs(
            &dig,
            AcquisitionOverrides {
                samples_per_record: Some(512),
                records_per_buffer: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(ctl.acquisition_kwargs().samples_per_record, Some(512));

        let mut dig = dig;
        let acq = ctl.do_acquisition(&mut dig).unwrap();
        assert_eq!(acq.shape(), &[2, 512, 2]);
        assert_eq!(acq.tvals.len(), 512);
    }

    #[test]
    fn endless_acq_time_is_rejected() {
        let dig = SimulatedDigitizer::new(board("ATS9360", 12), Tone::default()).unwrap();
        let mut ctl = controller(&dig, ControllerKind::AvgBuf);
        ctl.set_acq_time(Some(f64::INFINITY));
        assert!(matches!(
            ctl.update_acquisition_kwargs(&dig, AcquisitionOverrides::default()),
            Err(AcqError::Configuration(_))
        ));
        assert_eq!(ctl.acquisition_kwargs(), &AcquisitionOverrides::default());
    }

    #[test]
    fn truncated_buffer_aborts_acquisition() {
        let mut dig = SimulatedDigitizer::new(board("ATS9360", 12), Tone::default())
            .unwrap()
            .with_truncated_buffer(2);
        let mut ctl = controller(&dig, ControllerKind::Demod);
        let err = ctl.do_acquisition(&mut dig).unwrap_err();
        assert!(matches!(err, AcqError::ShapeMismatch { .. }));
        assert!(ctl.is_idle());
        assert_eq!(dig.counter().buffers(), 2);

        let mut dig = SimulatedDigitizer::new(board("ATS9360", 12), Tone::default()).unwrap();
        let acq = ctl.do_acquisition(&mut dig).unwrap();
        assert_eq!(acq.shape(), &[6, 4, 100, 2]);
    }

    #[test]
    fn repeated_acquisitions_are_independent() {
        let mut dig = SimulatedDigitizer::new(board("ATS9360", 12), Tone::default()).unwrap();
        let mut ctl = controller(&dig, ControllerKind::AvgBuf);
        let first = ctl.do_acquisition(&mut dig).unwrap();
        let second = ctl.do_acquisition(&mut dig).unwrap();
        assert_eq!(first.data, second.data);
    }

    #[test]
    fn missing_frequency_leaves_driver_idle() {
        let mut dig = SimulatedDigitizer::new(board("ATS9360", 12), Tone::default()).unwrap();
        let mut ctl = controller(&dig, ControllerKind::AvgDemod);
        ctl.set_demod_frq(None);
        assert!(matches!(
            ctl.do_acquisition(&mut dig),
            Err(AcqError::MissingDemodFrequency)
        ));
        assert_eq!(dig.counter().buffers(), 0);
    }
}
