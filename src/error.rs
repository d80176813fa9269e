use std::io;
use std::path::PathBuf;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// A named file operation failed on `path`.
    Syscall {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    InvalidHeader,
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    ChunkCorrupted {
        path: PathBuf,
        offset: u64,
    },
    CorruptFreelist(String),
    FreelistInconsistent(String),
    MutexPoisoned,
    InvalidState(String),
    InvalidOperation(String),
}

impl Error {
    pub(crate) fn syscall(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Syscall {
            op,
            path: path.into(),
            source,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Syscall { op, path, source } => write!(
                f,
                "{} failed on {} (errno {}): {}",
                op,
                path.display(),
                source.raw_os_error().unwrap_or(0),
                source
            ),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::ChunkCorrupted { path, offset } => write!(
                f,
                "Storage chunk corrupted in {} at offset {}",
                path.display(),
                offset
            ),
            Error::CorruptFreelist(msg) => write!(f, "Corrupt free-list: {}", msg),
            Error::FreelistInconsistent(msg) => write!(f, "Inconsistent free-list: {}", msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            Error::Syscall { source, .. } => Some(source),
            Error::Decode(_, err) | Error::Encode(_, err) => Some(err),
            _ => None,
        }
    }
}
