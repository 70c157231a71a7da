use std::error::Error;
use std::convert::From;

use jedi::JSONError;

use crate::api::{ErrorCode, RemoteError};

/// Where an error lands once a coordinator looks at it. Lower layers never
/// swallow errors, they hand them up and the coordinators sort them into one
/// of these buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate limits, blips in the network. Retried by the scheduler.
    Transient,
    /// One bad entity. Skip it, warn, keep going.
    EntityFatal,
    /// Kills the scope (primary or one linked notebook) we're working on.
    ScopeFatal,
    /// Kills the whole run.
    RunFatal,
    /// Somebody asked us to stop.
    Cancelled,
}

quick_error! {
    #[derive(Debug)]
    /// The sync engine's main error object.
    pub enum NError {
        Boxed(err: Box<dyn Error + Send + Sync>) {
            display("error: {}", err)
        }
        Msg(str: String) {
            display("error: {}", str)
        }
        BadValue(str: String) {
            display("bad value: {}", str)
        }
        MissingField(str: String) {
            display("missing field: {}", str)
        }
        /// A scope's download didn't make it this run, so its upload could
        /// write over remote changes we never saw.
        NotDownloaded(scope: String) {
            display("{} didn't download this run, holding its upload back", scope)
        }
        NotFound(str: String) {
            display("not found: {}", str)
        }
        JSON(err: JSONError) {
            source(err)
            display("json error: {}", err)
        }
        Remote(err: RemoteError) {
            source(err)
            display("remote error: {}", err)
        }
        /// The remote side handed us something that breaks the protocol for
        /// a single entity (a missing guid, a missing USN in a response).
        Internal(str: String) {
            display("internal error: {}", str)
        }
        /// The remote side broke the protocol for a whole scope (a chunk that
        /// doesn't advance, a sync state that makes no sense).
        Protocol(str: String) {
            display("protocol violation: {}", str)
        }
        /// The remote side broke a contract we can't work around at all (a
        /// rate limit without a positive wait).
        BrokenContract(str: String) {
            display("broken contract: {}", str)
        }
        TagCycle(tag: String) {
            display("cycle detected in tag hierarchy at tag {}", tag)
        }
        AuthFailed(scope: String, msg: String) {
            display("authentication failed for {}: {}", scope, msg)
        }
        CannotAuthenticate(guid: String, msg: String) {
            display("cannot authenticate to linked notebook {}: {}", guid, msg)
        }
        StorageUnavailable(str: String) {
            display("local store unavailable: {}", str)
        }
        Cancelled {
            display("sync cancelled")
        }
    }
}

impl NError {
    /// Sort this error into one of our handling buckets
    pub fn class(&self) -> ErrorClass {
        match *self {
            NError::Cancelled => ErrorClass::Cancelled,
            NError::StorageUnavailable(..) | NError::BrokenContract(..) => ErrorClass::RunFatal,
            NError::Internal(..) | NError::NotFound(..) | NError::BadValue(..) | NError::MissingField(..) => ErrorClass::EntityFatal,
            NError::Remote(ref err) => {
                match *err {
                    RemoteError::User(ErrorCode::AuthExpired, _) | RemoteError::User(ErrorCode::InvalidAuth, _) => ErrorClass::ScopeFatal,
                    RemoteError::User(..) | RemoteError::NotFound(..) => ErrorClass::EntityFatal,
                    RemoteError::System(ErrorCode::RateLimitReached, _) => ErrorClass::Transient,
                    RemoteError::System(..) | RemoteError::Transport(..) => ErrorClass::ScopeFatal,
                }
            }
            _ => ErrorClass::ScopeFatal,
        }
    }

    /// Shorthand for checking if this error should kill the entire run
    pub fn is_run_fatal(&self) -> bool {
        match self.class() {
            ErrorClass::RunFatal | ErrorClass::Cancelled => true,
            _ => false,
        }
    }
}

/// converts non-NError errors to NError, via the From trait.
#[macro_export]
macro_rules! toterr {
    ($e:expr) => (
        {
            let err: $crate::error::NError = From::from($e);
            err
        }
    )
}

/// Return an error, logging where it came from on the way out. Handy when
/// tracking down which of the many paths in a coordinator blew up.
#[macro_export]
macro_rules! NErr {
    ($e:expr) => {{
        let err = $e;
        debug!("NErr -- {}::{} -- {}", file!(), line!(), err);
        Err(err)
    }}
}

/// A macro to make it easy to create From impls for NError
macro_rules! from_err {
    ($t:ty) => (
        impl From<$t> for NError {
            fn from(err: $t) -> NError {
                NError::Boxed(Box::new(err))
            }
        }
    )
}

impl From<JSONError> for NError {
    fn from(err: JSONError) -> NError {
        match err {
            JSONError::Boxed(x) => NError::Boxed(x),
            _ => NError::JSON(err),
        }
    }
}
impl From<RemoteError> for NError {
    fn from(err: RemoteError) -> NError {
        NError::Remote(err)
    }
}
impl From<Box<dyn std::any::Any + Send>> for NError {
    fn from(err: Box<dyn std::any::Any + Send>) -> NError {
        NError::Msg(format!("thread panicked: {:?}", err))
    }
}
from_err!(std::io::Error);
from_err!(log::SetLoggerError);
from_err!(time::error::Format);

pub type NResult<T> = Result<T, NError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert_eq!(NError::Cancelled.class(), ErrorClass::Cancelled);
        assert_eq!(NError::StorageUnavailable(String::from("gone")).class(), ErrorClass::RunFatal);
        assert_eq!(NError::BrokenContract(String::from("rate limit of 0s")).class(), ErrorClass::RunFatal);
        assert_eq!(NError::TagCycle(String::from("a")).class(), ErrorClass::ScopeFatal);
        assert_eq!(NError::Internal(String::from("no usn")).class(), ErrorClass::EntityFatal);
        assert_eq!(NError::Remote(RemoteError::User(ErrorCode::DataConflict, None)).class(), ErrorClass::EntityFatal);
        assert_eq!(NError::Remote(RemoteError::User(ErrorCode::AuthExpired, None)).class(), ErrorClass::ScopeFatal);
        assert_eq!(NError::Remote(RemoteError::System(ErrorCode::RateLimitReached, Some(3))).class(), ErrorClass::Transient);
        assert_eq!(NError::Remote(RemoteError::Transport(String::from("reset by peer"))).class(), ErrorClass::ScopeFatal);
        assert!(NError::StorageUnavailable(String::from("gone")).is_run_fatal());
        assert!(!NError::TagCycle(String::from("a")).is_run_fatal());
        assert_eq!(NError::NotDownloaded(String::from("primary")).class(), ErrorClass::ScopeFatal);
    }
}
