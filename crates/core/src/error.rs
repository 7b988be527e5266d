use crate::connection::ConnectionState;

/// Result alias that carries the custom [`MocapError`] type.
pub type Result<T> = std::result::Result<T, MocapError>;

/// Common error type for the core crate.
///
/// Backend call outcomes are reported through [`crate::Status`] rather than
/// through this type. `MocapError` covers configuration mistakes, lifecycle
/// misuse and failures of the shared state guarding the backend.
#[derive(Debug, thiserror::Error)]
pub enum MocapError {
    /// Free-form error used where no dedicated variant exists.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// A caller supplied a value the core cannot work with.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// A connection target could not be parsed.
    #[error("invalid endpoint `{0}`")]
    InvalidEndpoint(String),
    /// A TOML configuration file failed to parse.
    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
    /// A JSON configuration file failed to parse.
    #[error("failed to parse JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
    /// A shared lock was poisoned by a panicking holder.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    /// A lifecycle operation was requested from a state that does not allow it.
    #[error("cannot run '{action}' while connection is {state:?}")]
    InvalidState {
        state: ConnectionState,
        action: &'static str,
    },
    /// The background connection task panicked before it could be joined.
    #[error("connection worker panicked")]
    WorkerPanicked,
}

impl MocapError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for MocapError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for MocapError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_invalid_state_with_action() {
        let err = MocapError::InvalidState {
            state: ConnectionState::Connected,
            action: "start",
        };
        assert_eq!(
            err.to_string(),
            "cannot run 'start' while connection is Connected"
        );
    }

    #[test]
    fn converts_plain_strings() {
        let err: MocapError = "boom".into();
        assert!(matches!(err, MocapError::Message(ref m) if m == "boom"));
    }
}
