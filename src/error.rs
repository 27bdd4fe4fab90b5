use std::fmt;

use thiserror::Error;

use crate::native::ReturnCode;

/// Source provenance reported by the engine alongside a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}()", self.file, self.line, self.function)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Closed resource: {0}")]
    ClosedResource(String),

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Engine error ({rc:?}): {message}{}", provenance(.location, .related))]
    NativeEngine {
        rc: ReturnCode,
        message: String,
        location: Option<Location>,
        related: Option<String>,
    },

    #[error("Unsupported handle kind: tag {0:#04x}")]
    UnsupportedHandleKind(u8),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Engine return code for `NativeEngine` errors.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::NativeEngine { rc, .. } => Some(rc.code()),
            _ => None,
        }
    }

    pub fn is_closed_resource(&self) -> bool {
        matches!(self, Error::ClosedResource(_))
    }
}

fn provenance(location: &Option<Location>, related: &Option<String>) -> String {
    let mut out = String::new();
    if let Some(location) = location {
        out.push_str(&format!(" [{}]", location));
    }
    if let Some(related) = related {
        out.push_str(&format!(" (related: {})", related));
    }
    out
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_error_message_includes_provenance() {
        let err = Error::NativeEngine {
            rc: ReturnCode::InvalidArgument,
            message: "key too long".to_string(),
            location: Some(Location {
                file: "hash.c".to_string(),
                line: 42,
                function: "hash_add".to_string(),
            }),
            related: Some("#<Table Users>".to_string()),
        };

        let text = err.to_string();
        assert!(text.contains("key too long"));
        assert!(text.contains("hash.c:42: hash_add()"));
        assert!(text.contains("#<Table Users>"));
        assert_eq!(err.code(), Some(-22));
    }

    #[test]
    fn test_closed_resource_has_no_code() {
        let err = Error::ClosedResource("table".to_string());
        assert!(err.is_closed_resource());
        assert_eq!(err.code(), None);
    }
}
