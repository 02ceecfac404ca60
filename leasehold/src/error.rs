use std::fmt;

use crate::lease::SetType;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the lease coordinator and its components.
#[derive(Debug)]
pub enum Error {
    /// The backing store rejected or failed an operation. Conditional
    /// failures are terminal; unavailability has already been retried up to
    /// the operation cap by the manager.
    Store(StoreError),
    /// A guarded metadata update referenced a lease this worker does not
    /// currently hold.
    LeaseNotHeld(String),
    /// A guarded metadata update carried a concurrency token that does not
    /// match the held copy. The lease was lost and re-acquired between the
    /// caller's read and this update.
    TokenNotMatch(String),
    /// A typed-set metadata value did not match its declared set type.
    ValueTypeMismatch(SetType),
    /// Invalid or missing configuration. Terminal at initialization.
    InvalidConfig(String),
    /// A store item could not be decoded into a lease.
    Codec(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Store(err) => write!(f, "store: {}", err),
            Error::LeaseNotHeld(key) => {
                write!(f, "lease {:?} is not held by this worker", key)
            }
            Error::TokenNotMatch(key) => {
                write!(f, "stale concurrency token for lease {:?}", key)
            }
            Error::ValueTypeMismatch(set_type) => {
                write!(f, "value does not match set type {:?}", set_type)
            }
            Error::InvalidConfig(reason) => write!(f, "invalid config: {}", reason),
            Error::Codec(reason) => write!(f, "lease codec: {}", reason),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}

/// True if the error is an optimistic-concurrency conditional failure.
/// These are terminal per call and reconciled by the next list cycle.
pub fn is_conditional(err: &Error) -> bool {
    matches!(err, Error::Store(StoreError::ConditionalCheckFailed))
}
