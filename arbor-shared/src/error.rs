//! Error types used across the arbord daemon.
//!
//! Every failure is tagged with a finite [`ErrorKind`] that travels over
//! the wire, plus a human-readable message and an optional errno. Wrapping
//! an error with more context preserves the original kind.

use std::fmt;

/// Result type for arbord operations.
pub type ArborResult<T> = Result<T, ArborError>;

/// Finite error taxonomy serialized into RPC responses.
///
/// The numeric codes are part of the wire protocol and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
pub enum ErrorKind {
    Success = 0,
    Unknown = 1,
    InvalidMethod = 2,
    InvalidValue = 3,
    InvalidProperty = 4,
    InvalidState = 5,
    InvalidPath = 6,
    InvalidData = 7,
    Permission = 8,
    NotSupported = 9,
    ResourceNotAvailable = 10,
    NoSpace = 11,
    Busy = 12,
    /// Internal: the handler will respond later (used by Wait).
    Queued = 13,
    ContainerDoesNotExist = 14,
    ContainerAlreadyExists = 15,
    VolumeNotFound = 16,
    VolumeAlreadyExists = 17,
    VolumeAlreadyLinked = 18,
    VolumeNotLinked = 19,
    VolumeNotReady = 20,
    LayerNotFound = 21,
    LayerAlreadyExists = 22,
    Docker = 23,
    DockerImageNotFound = 24,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ErrorKind::Success,
            2 => ErrorKind::InvalidMethod,
            3 => ErrorKind::InvalidValue,
            4 => ErrorKind::InvalidProperty,
            5 => ErrorKind::InvalidState,
            6 => ErrorKind::InvalidPath,
            7 => ErrorKind::InvalidData,
            8 => ErrorKind::Permission,
            9 => ErrorKind::NotSupported,
            10 => ErrorKind::ResourceNotAvailable,
            11 => ErrorKind::NoSpace,
            12 => ErrorKind::Busy,
            13 => ErrorKind::Queued,
            14 => ErrorKind::ContainerDoesNotExist,
            15 => ErrorKind::ContainerAlreadyExists,
            16 => ErrorKind::VolumeNotFound,
            17 => ErrorKind::VolumeAlreadyExists,
            18 => ErrorKind::VolumeAlreadyLinked,
            19 => ErrorKind::VolumeNotLinked,
            20 => ErrorKind::VolumeNotReady,
            21 => ErrorKind::LayerNotFound,
            22 => ErrorKind::LayerAlreadyExists,
            23 => ErrorKind::Docker,
            24 => ErrorKind::DockerImageNotFound,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Success => "Success",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidMethod => "InvalidMethod",
            ErrorKind::InvalidValue => "InvalidValue",
            ErrorKind::InvalidProperty => "InvalidProperty",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::InvalidPath => "InvalidPath",
            ErrorKind::InvalidData => "InvalidData",
            ErrorKind::Permission => "Permission",
            ErrorKind::NotSupported => "NotSupported",
            ErrorKind::ResourceNotAvailable => "ResourceNotAvailable",
            ErrorKind::NoSpace => "NoSpace",
            ErrorKind::Busy => "Busy",
            ErrorKind::Queued => "Queued",
            ErrorKind::ContainerDoesNotExist => "ContainerDoesNotExist",
            ErrorKind::ContainerAlreadyExists => "ContainerAlreadyExists",
            ErrorKind::VolumeNotFound => "VolumeNotFound",
            ErrorKind::VolumeAlreadyExists => "VolumeAlreadyExists",
            ErrorKind::VolumeAlreadyLinked => "VolumeAlreadyLinked",
            ErrorKind::VolumeNotLinked => "VolumeNotLinked",
            ErrorKind::VolumeNotReady => "VolumeNotReady",
            ErrorKind::LayerNotFound => "LayerNotFound",
            ErrorKind::LayerAlreadyExists => "LayerAlreadyExists",
            ErrorKind::Docker => "Docker",
            ErrorKind::DockerImageNotFound => "DockerImageNotFound",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error with a wire-visible kind, a message, and an optional errno.
///
/// The errno travels alongside the message rather than inside it, so
/// handlers can branch on it (EINTR retries, EINVAL layer limits).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ArborError {
    pub kind: ErrorKind,
    pub message: String,
    pub errno: Option<i32>,
}

impl ArborError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            errno: None,
        }
    }

    pub fn with_errno(kind: ErrorKind, errno: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            errno: Some(errno),
        }
    }

    /// Add context to the message, keeping the original kind and errno.
    pub fn context(mut self, ctx: impl fmt::Display) -> Self {
        self.message = format!("{}: {}", ctx, self.message);
        self
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn invalid_method(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidMethod, message)
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidValue, message)
    }

    pub fn invalid_property(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidProperty, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPath, message)
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidData, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceNotAvailable, message)
    }

    pub fn no_space(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoSpace, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn queued() -> Self {
        Self::new(ErrorKind::Queued, "request queued")
    }

    pub fn no_container(name: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::ContainerDoesNotExist,
            format!("container {} does not exist", name),
        )
    }

    pub fn container_exists(name: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::ContainerAlreadyExists,
            format!("container {} already exists", name),
        )
    }

    pub fn no_volume(path: impl fmt::Display) -> Self {
        Self::new(ErrorKind::VolumeNotFound, format!("volume {} not found", path))
    }

    pub fn volume_exists(path: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::VolumeAlreadyExists,
            format!("volume {} already exists", path),
        )
    }

    pub fn volume_not_ready(path: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::VolumeNotReady,
            format!("volume {} is not ready", path),
        )
    }

    pub fn no_layer(name: impl fmt::Display) -> Self {
        Self::new(ErrorKind::LayerNotFound, format!("layer {} not found", name))
    }

    pub fn layer_exists(name: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::LayerAlreadyExists,
            format!("layer {} already exists", name),
        )
    }

    /// True for errors a caller may retry after a signal interruption.
    pub fn is_retryable(&self) -> bool {
        self.errno == Some(libc_eintr()) || self.kind == ErrorKind::Busy
    }
}

// Avoid a libc dependency in the shared crate for one constant.
const fn libc_eintr() -> i32 {
    4
}

impl From<std::io::Error> for ArborError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::InvalidPath,
            std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            std::io::ErrorKind::AlreadyExists => ErrorKind::Busy,
            _ => ErrorKind::Unknown,
        };
        Self {
            kind,
            message: err.to_string(),
            errno: err.raw_os_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_code_roundtrip() {
        for code in 0..=24 {
            let kind = ErrorKind::from_code(code);
            if kind != ErrorKind::Unknown || code == 1 {
                assert_eq!(kind.code(), code);
            }
        }
        assert_eq!(ErrorKind::from_code(-5), ErrorKind::Unknown);
        assert_eq!(ErrorKind::from_code(9999), ErrorKind::Unknown);
    }

    #[test]
    fn test_context_preserves_kind() {
        let err = ArborError::no_volume("/place/v1").context("building overlay");
        assert_eq!(err.kind, ErrorKind::VolumeNotFound);
        assert!(err.message.starts_with("building overlay: "));
    }

    #[test]
    fn test_io_error_carries_errno() {
        let io = std::io::Error::from_raw_os_error(13);
        let err = ArborError::from(io);
        assert_eq!(err.kind, ErrorKind::Permission);
        assert_eq!(err.errno, Some(13));
    }
}
