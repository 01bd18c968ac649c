use crate::{
    AcquisitionController, BoardSetup, BufferOrder, ControllerKind, DeviceInfo, Tone,
};
use anyhow::{Context, Result};
use confique::Config;
use std::path::Path;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub controller: ControllerSettings,
    #[config(nested)]
    pub digitizer: DigitizerSettings,
    #[config(nested)]
    pub signal: SignalSettings,
    #[config(nested)]
    pub sweep: SweepSettings,
}

#[derive(Config, Debug, Clone)]
pub struct ControllerSettings {
    #[config(default = "avg_demod")]
    pub variant: ControllerKind,
    #[config(default = 2)]
    pub channels: usize,
    /// Seconds per record. Overrides the card's record length.
    pub acq_time: Option<f64>,
    /// Hz. Required by the demodulating variants.
    pub demod_frq: Option<f64>,
    /// Defaults to the order the card model is known for.
    pub buffer_order: Option<BufferOrder>,
}

#[derive(Config, Debug, Clone)]
pub struct DigitizerSettings {
    #[config(default = "ATS9360")]
    pub model: String,
    #[config(default = "sim-0")]
    pub serial: String,
    #[config(default = 12)]
    pub bits: u32,
    #[config(default = 1.0e9)]
    pub sample_rate: f64,
    #[config(default = 1024)]
    pub samples_per_record: usize,
    #[config(default = 16)]
    pub records_per_buffer: usize,
    #[config(default = 32)]
    pub buffers_per_acquisition: usize,
}

#[derive(Config, Debug, Clone)]
pub struct SignalSettings {
    #[config(default = 50.0e6)]
    pub frequency: f64,
    #[config(default = 0.25)]
    pub amplitude: f64,
    #[config(default = 0.0)]
    pub phase: f64,
    #[config(default = 0.0)]
    pub offset: f64,
    #[config(default = 0.0)]
    pub noise: f64,
    #[config(default = 0)]
    pub seed: u64,
}

#[derive(Config, Debug, Clone)]
pub struct SweepSettings {
    /// Demodulation frequencies visited by the `sweep` command, in Hz.
    #[config(default = [])]
    pub demod_frqs: Vec<f64>,
}

impl Conf {
    pub fn load(path: &Path) -> Result<Self> {
        Conf::builder()
            .file(path)
            .load()
            .with_context(|| format!("failed to load config from {}", path.display()))
    }

    pub fn board_setup(&self) -> BoardSetup {
        let d = &self.digitizer;
        BoardSetup {
            model: d.model.clone(),
            serial: d.serial.clone(),
            bits_per_sample: d.bits,
            sample_rate: d.sample_rate,
            samples_per_record: d.samples_per_record,
            records_per_buffer: d.records_per_buffer,
            buffers_per_acquisition: d.buffers_per_acquisition,
            number_of_channels: self.controller.channels,
        }
    }

    pub fn tone(&self) -> Tone {
        let s = &self.signal;
        Tone {
            frequency: s.frequency,
            amplitude: s.amplitude,
            phase: s.phase,
            offset: s.offset,
            noise: s.noise,
            seed: s.seed,
        }
    }

    /// Builds the configured controller for `device`.
    pub fn controller(&self, device: DeviceInfo) -> crate::Result<AcquisitionController> {
        let c = &self.controller;
        let mut controller = AcquisitionController::new(c.variant, device)?;
        if let Some(order) = c.buffer_order {
            controller = controller.with_buffer_order(order);
        }
        controller.set_number_of_channels(c.channels);
        controller.set_demod_frq(c.demod_frq);
        controller.set_acq_time(c.acq_time);
        Ok(controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, path::PathBuf};

    fn write_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "alazar_reduce_{}_{name}.toml",
            std::process::id()
        ));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn empty_file_gives_defaults() {
        let path = write_config("defaults", "");
        let conf = Conf::load(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(conf.controller.variant, ControllerKind::AvgDemod);
        assert_eq!(conf.controller.channels, 2);
        assert_eq!(conf.controller.demod_frq, None);
        assert_eq!(conf.digitizer.bits, 12);
        assert_eq!(conf.digitizer.sample_rate, 1.0e9);
        assert!(conf.sweep.demod_frqs.is_empty());
        assert_eq!(conf.tone(), Tone::default());
    }

    #[test]
    fn sections_are_read() {
        let path = write_config(
            "sections",
            r#"
[controller]
variant = "avg_rec_iq"
channels = 1
demod_frq = 20e6
buffer_order = "bcrs"

[digitizer]
model = "ATS9870"
bits = 8
samples_per_record = 512
records_per_buffer = 4
buffers_per_acquisition = 2

[signal]
frequency = 20e6
noise = 0.01
seed = 7

[sweep]
demod_frqs = [10e6, 20e6]
"#,
        );
        let conf = Conf::load(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(conf.controller.variant, ControllerKind::AvgRecIq);
        assert_eq!(conf.controller.buffer_order, Some(BufferOrder::Bcrs));
        assert_eq!(conf.sweep.demod_frqs, vec![10e6, 20e6]);

        let setup = conf.board_setup();
        assert_eq!(setup.model, "ATS9870");
        assert_eq!(setup.bits_per_sample, 8);
        assert_eq!(setup.number_of_channels, 1);
        assert_eq!(conf.tone().seed, 7);

        let controller = conf
            .controller(DeviceInfo {
                model: setup.model.clone(),
                serial: setup.serial.clone(),
                bits_per_sample: setup.bits_per_sample,
            })
            .unwrap();
        assert_eq!(controller.kind(), ControllerKind::AvgRecIq);
        assert_eq!(controller.number_of_channels(), 1);
        assert_eq!(controller.demod_frq(), Some(20e6));
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let path = write_config("bad_variant", "[controller]\nvariant = \"avg_everything\"\n");
        let result = Conf::load(&path);
        fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }
}
