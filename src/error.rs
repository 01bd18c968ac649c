use thiserror::Error;

pub type Result<T> = std::result::Result<T, AcqError>;

/// Errors raised while configuring a controller or reducing digitizer buffers.
#[derive(Debug, Error)]
pub enum AcqError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unsupported number of bits per sample: {0}")]
    UnsupportedBitDepth(u32),
    #[error("unknown buffer order {0:?}")]
    UnknownBufferOrder(String),
    #[error("demodulation frequency must be set for this controller")]
    MissingDemodFrequency,
    #[error("buffer size mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("buffer index {index} out of range for {len} buffers")]
    BufferIndexOutOfRange { index: usize, len: usize },
    #[error("controller is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("digitizer error: {0}")]
    Driver(String),
}
