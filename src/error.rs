use std::fmt::Display;

/// Litecask errors.
///
/// Every public operation returns `Result<T, Error>`; there is no panicking
/// control flow on user input. The variants form a closed taxonomy so that
/// callers can match on the exact failure kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// An operation was attempted on a store that is not open.
    StoreNotOpen,
    /// `open` was called on a store that is already open.
    StoreAlreadyOpen,
    /// The store directory is locked by another live process.
    StoreAlreadyInUse,
    /// The store directory cannot be created, read or enumerated.
    CannotOpenStore,
    /// A disk read or write failed.
    BadDiskAccess,
    /// The key length is outside 1..=65534.
    BadKeySize,
    /// The value length exceeds the maximum (0xFFFF0000 - 1).
    BadValueSize,
    /// A key index is empty, exceeds the key bounds, or there are too many.
    InconsistentKeyIndex,
    /// The key index list is not strictly ordered on (start_idx, size).
    UnorderedKeyIndex,
    /// The entry does not exist, was removed, or its TTL expired.
    EntryNotFound,
    /// The on-disk record failed its checksum verification.
    EntryCorrupted,
    /// An in-memory arena is exhausted; the operation did not apply.
    OutOfMemory,
    /// A configuration field is out of its valid range.
    BadParameterValue,
    /// Two configuration fields contradict each other.
    InconsistentParameterValues,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::StoreNotOpen => write!(f, "datastore is not open"),
            Error::StoreAlreadyOpen => write!(f, "datastore is already open"),
            Error::StoreAlreadyInUse => {
                write!(f, "datastore already open and locked by another process")
            }
            Error::CannotOpenStore => write!(f, "cannot access the datastore directory path"),
            Error::BadDiskAccess => write!(f, "bad disk access"),
            Error::BadKeySize => write!(f, "key size is out of bounds"),
            Error::BadValueSize => write!(f, "value size is out of bounds"),
            Error::InconsistentKeyIndex => write!(f, "key indexes are inconsistent"),
            Error::UnorderedKeyIndex => write!(f, "key indexes are not ordered"),
            Error::EntryNotFound => write!(f, "entry has not been found"),
            Error::EntryCorrupted => write!(f, "entry is corrupted"),
            Error::OutOfMemory => write!(f, "operation failed due to out of memory"),
            Error::BadParameterValue => write!(f, "bad parameter value"),
            Error::InconsistentParameterValues => write!(f, "inconsistent parameter values"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(_err: std::io::Error) -> Self {
        Error::BadDiskAccess
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_err: std::sync::PoisonError<T>) -> Self {
        Error::BadDiskAccess
    }
}

/// A litecask Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_stable() {
        assert_eq!(Error::StoreNotOpen.to_string(), "datastore is not open");
        assert_eq!(Error::EntryNotFound.to_string(), "entry has not been found");
        assert_eq!(
            Error::InconsistentParameterValues.to_string(),
            "inconsistent parameter values"
        );
    }

    #[test]
    fn test_io_error_maps_to_disk_access() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(Error::from(io), Error::BadDiskAccess);
    }
}
