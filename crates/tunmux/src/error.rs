//! Error types for TUN/TAP operations.

use std::io;

/// Result type for TUN/TAP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during TUN/TAP operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Device name too long (max 15 characters).
    #[error("device name too long: {name} ({len} > 15 characters)")]
    NameTooLong {
        /// The name that was too long.
        name: String,
        /// The length of the name.
        len: usize,
    },

    /// Invalid device name.
    #[error("invalid device name: {0}")]
    InvalidName(String),

    /// No mode specified (must be TUN or TAP).
    #[error("no mode specified (must be tun or tap)")]
    NoModeSpecified,

    /// Invalid IPv4 address or netmask.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// MTU outside the range a TUN/TAP link accepts.
    #[error("invalid MTU: {0}")]
    InvalidMtu(u32),

    /// The kernel refused to create the device.
    #[error("allocating device {name} failed: {source}")]
    Allocation {
        /// The requested device name.
        name: String,
        /// The underlying error.
        source: io::Error,
    },

    /// A configuration request against an existing device failed.
    #[error("{operation}: {source}")]
    Configuration {
        /// The operation that failed, including the device name.
        operation: String,
        /// The underlying error.
        source: io::Error,
    },

    /// ioctl failed.
    #[error("ioctl {name} failed: {source}")]
    Ioctl {
        /// The ioctl name.
        name: &'static str,
        /// The underlying error.
        source: io::Error,
    },

    /// Setting up the readiness worker failed.
    #[error("readiness setup failed ({operation}): {source}")]
    Readiness {
        /// The setup step that failed.
        operation: &'static str,
        /// The underlying error.
        source: io::Error,
    },
}

impl Error {
    /// Create an ioctl error.
    pub fn ioctl(name: &'static str, source: io::Error) -> Self {
        Error::Ioctl { name, source }
    }

    /// Create an ioctl error from the calling thread's errno.
    pub(crate) fn last_ioctl(name: &'static str) -> Self {
        Error::ioctl(name, io::Error::last_os_error())
    }

    /// Create a readiness setup error from the calling thread's errno.
    pub(crate) fn last_readiness(operation: &'static str) -> Self {
        Error::Readiness {
            operation,
            source: io::Error::last_os_error(),
        }
    }

    /// Add context to this error.
    ///
    /// Wraps system errors into [`Error::Configuration`]. Validation errors
    /// and errors that already carry context are returned unchanged.
    pub fn with_context(self, operation: impl Into<String>) -> Self {
        match self {
            Self::Io(source) | Self::Ioctl { source, .. } => Self::Configuration {
                operation: operation.into(),
                source,
            },
            other => other,
        }
    }

    /// Turn a system error raised while creating `name` into
    /// [`Error::Allocation`].
    pub(crate) fn into_allocation(self, name: &str) -> Self {
        match self {
            Self::Io(source) | Self::Ioctl { source, .. } => Self::Allocation {
                name: name.to_string(),
                source,
            },
            other => other,
        }
    }

    /// The underlying I/O error, if any.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Self::Io(source)
            | Self::Allocation { source, .. }
            | Self::Configuration { source, .. }
            | Self::Ioctl { source, .. }
            | Self::Readiness { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Get the errno value if this error came from the kernel.
    pub fn errno(&self) -> Option<i32> {
        self.io_error().and_then(io::Error::raw_os_error)
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.errno(), Some(libc::EPERM | libc::EACCES))
    }

    /// Check if this is a "device busy" error (EBUSY).
    pub fn is_busy(&self) -> bool {
        self.errno() == Some(libc::EBUSY)
    }

    /// Check if this is a "not found" error (ENOENT, ENODEV).
    pub fn is_not_found(&self) -> bool {
        matches!(self.errno(), Some(libc::ENOENT | libc::ENODEV))
    }
}
