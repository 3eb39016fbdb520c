use thiserror::Error;

/// Transport and session failures. Always caught at the link boundary and
/// turned into a `connected=false` status event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Not connected")]
    NotConnected,

    #[error("Scan failed: {0}")]
    Scan(String),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("I/O error on {0}: {1}")]
    Io(String, String),

    #[error("Timed out after {0:.1}s")]
    Timeout(f64),

    #[error("Device disconnected")]
    Disconnected,
}

/// Marks persistence failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid marks file: {0}")]
    Json(#[from] serde_json::Error),
}

pub type LinkResult<T> = Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            LinkError::Io("main".into(), "gatt read".into()).to_string(),
            "I/O error on main: gatt read"
        );
        assert_eq!(LinkError::Timeout(2.0).to_string(), "Timed out after 2.0s");
    }
}
