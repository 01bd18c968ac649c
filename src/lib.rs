pub mod accumulator;
pub mod config;
pub mod controller;
pub mod demod;
pub mod digitizer;
pub mod error;
pub mod geometry;
pub mod simulator;
pub mod sweep;
pub mod utils;

pub use accumulator::{AccumulationPolicy, Accumulator, AccumulatorDtype};
pub use config::Conf;
pub use controller::{
    Acquisition, AcquisitionController, AcquisitionData, ControllerKind, BUFFERS, CHANNELS,
    DEFAULT_CHANNELS, IF_PERIODS, RECORDS, SAMPLES,
};
pub use demod::DemodulationKernel;
pub use digitizer::{
    AcquisitionCallbacks, AcquisitionOverrides, AcquisitionSettings, DeviceInfo, Digitizer,
};
pub use error::{AcqError, Result};
pub use geometry::{
    time2samples, AcquisitionParameters, BufferGeometry, BufferOrder, SampleDepth, MIN_SAMPLES,
    SAMPLE_GRANULARITY,
};
pub use simulator::{BoardSetup, SimulatedDigitizer, Tone};
pub use utils::{Counter, HandlingTimes};
