/// Result alias that carries the custom [`RhythmError`] type.
pub type Result<T> = std::result::Result<T, RhythmError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum RhythmError {
    /// Free-form failure surfaced to the application as a readable message.
    #[error("{0}")]
    Message(String),
    /// A tempo, signature, ratio or analysis constant outside its valid range.
    #[error("invalid {name}: {value}")]
    InvalidParameter { name: &'static str, value: String },
    /// The live input stream is missing, denied or has been disconnected.
    #[error("input unavailable: {0}")]
    InputUnavailable(&'static str),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON configuration.
    #[error("config: {0}")]
    Json(#[from] serde_json::Error),
    /// Transform failure inside the spectrum analyser.
    #[error("fft: {0}")]
    Fft(#[from] realfft::FftError),
}

impl RhythmError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Rejection of a parameter value, keeping its textual form for the log.
    pub fn invalid(name: &'static str, value: impl ToString) -> Self {
        Self::InvalidParameter {
            name,
            value: value.to_string(),
        }
    }
}

impl From<&str> for RhythmError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for RhythmError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
