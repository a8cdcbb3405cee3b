use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// A file on disk does not decode to what its name promises.
    Corruption(String),
    /// Segment ranges overlap, leave a gap, or the registry is otherwise broken.
    Consistency(String),
    /// Perfect-hash construction failed for every seed in the list.
    IndexBuild(String),
    /// Paired components were asked to merge different ranges.
    MergeMismatch(String),
    InvalidState(String),
    LockPoisoned,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Corruption(msg) => write!(f, "Corrupted file: {}", msg),
            Error::Consistency(msg) => write!(f, "Consistency violation: {}", msg),
            Error::IndexBuild(msg) => write!(f, "Index build failed: {}", msg),
            Error::MergeMismatch(msg) => write!(f, "Merge range mismatch: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::LockPoisoned => write!(f, "Lock was poisoned"),
        }
    }
}

impl std::error::Error for Error {}
