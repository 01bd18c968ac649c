use crate::{Acquisition, Result};

/// Identity reported by the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    pub serial: String,
    pub bits_per_sample: u32,
}

/// Record and buffer counts the driver settled on for one acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionSettings {
    pub sample_rate: f64,
    pub samples_per_record: usize,
    pub records_per_buffer: usize,
    pub buffers_per_acquisition: usize,
}

/// Per-acquisition settings a controller asks the driver to apply.
///
/// Unset fields keep the driver's current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquisitionOverrides {
    pub samples_per_record: Option<usize>,
    pub records_per_buffer: Option<usize>,
    pub buffers_per_acquisition: Option<usize>,
}

impl AcquisitionOverrides {
    /// Fields set in `other` win.
    pub fn merge(&mut self, other: &AcquisitionOverrides) {
        if other.samples_per_record.is_some() {
            self.samples_per_record = other.samples_per_record;
        }
        if other.records_per_buffer.is_some() {
            self.records_per_buffer = other.records_per_buffer;
        }
        if other.buffers_per_acquisition.is_some() {
            self.buffers_per_acquisition = other.buffers_per_acquisition;
        }
    }
}

/// Hooks a driver calls while it runs one acquisition.
///
/// The driver calls them on one thread, in order: `on_configure`,
/// `on_acquisition_start`, `on_buffer` once per completed DMA buffer and
/// finally `on_acquisition_end`. If anything fails after `on_configure` the
/// driver calls `on_abort` instead of `on_acquisition_end`.
pub trait AcquisitionCallbacks {
    fn on_configure(&mut self, settings: &AcquisitionSettings) -> Result<()>;

    fn on_acquisition_start(&mut self) -> Result<()>;

    /// `raw` is only valid for the duration of the call. `index` is `None`
    /// when the driver does not number its buffers.
    fn on_buffer(&mut self, index: Option<usize>, raw: &[u8]) -> Result<()>;

    fn on_acquisition_end(&mut self) -> Result<Acquisition>;

    fn on_abort(&mut self);
}

/// Driver side of the contract.
pub trait Digitizer {
    fn device_info(&self) -> DeviceInfo;

    fn sample_rate(&self) -> f64;

    fn samples_per_record(&self) -> usize;

    fn records_per_buffer(&self) -> usize;

    fn buffers_per_acquisition(&self) -> usize;

    /// Runs one full acquisition, driving `controller` through its hooks.
    fn acquire(
        &mut self,
        controller: &mut dyn AcquisitionCallbacks,
        overrides: &AcquisitionOverrides,
    ) -> Result<Acquisition>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_unset_fields() {
        let mut base = AcquisitionOverrides {
            samples_per_record: Some(1024),
            records_per_buffer: Some(4),
            buffers_per_acquisition: None,
        };
        base.merge(&AcquisitionOverrides {
            samples_per_record: Some(2048),
            buffers_per_acquisition: Some(8),
            ..Default::default()
        });
        assert_eq!(base.samples_per_record, Some(2048));
        assert_eq!(base.records_per_buffer, Some(4));
        assert_eq!(base.buffers_per_acquisition, Some(8));
    }
}
