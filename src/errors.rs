use std::fmt;
use std::io;

use thiserror::Error;

/// What ran out when an operation reports [`Error::ResourceExhausted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// The buffer pool has no free buffer.
    Pool,
    /// A queue ring has no free descriptor.
    Queue,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Pool => write!(f, "buffer pool"),
            Resource::Queue => write!(f, "queue"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} exhausted")]
    ResourceExhausted(Resource),
    #[error("invalid data window: {requested} bytes requested, {available} available")]
    InvalidWindow { requested: usize, available: usize },
    #[error("lock is held by another owner")]
    LockContended,
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("buffer is shared with another handle")]
    SharedBuffer,
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Only seen when panics unwind. Builds with `panic = "abort"`, as this
    /// crate's own profiles are, end the process instead.
    #[error("worker on lcore {0} panicked")]
    WorkerPanicked(u32),
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn window(requested: usize, available: usize) -> Self {
        Error::InvalidWindow {
            requested,
            available,
        }
    }

    /// Negative errno-style code used at the foreign-function boundary.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Error::ResourceExhausted(_) => libc::ENOBUFS,
            Error::InvalidWindow { .. } | Error::Config(_) => libc::EINVAL,
            Error::LockContended | Error::InvalidState(_) => libc::EBUSY,
            Error::UnsupportedFeature(_) => libc::ENOTSUP,
            Error::InvalidHandle(_) => libc::ENODEV,
            Error::SharedBuffer => libc::EPERM,
            Error::WorkerPanicked(_) => libc::ECANCELED,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        };
        -code
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_negative() {
        let errors = [
            Error::ResourceExhausted(Resource::Pool),
            Error::window(4, 2),
            Error::LockContended,
            Error::UnsupportedFeature("rtm"),
            Error::InvalidHandle("port 9".into()),
            Error::SharedBuffer,
            Error::Io(io::Error::from_raw_os_error(libc::EACCES)),
        ];
        for err in &errors {
            assert!(err.errno() < 0, "{err}");
        }
        assert_eq!(errors[0].errno(), -libc::ENOBUFS);
        assert_eq!(errors[6].errno(), -libc::EACCES);
    }

    #[test]
    fn window_message() {
        let err = Error::window(10, 3);
        assert_eq!(
            err.to_string(),
            "invalid data window: 10 bytes requested, 3 available"
        );
    }
}
