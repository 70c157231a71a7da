use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use time::OffsetDateTime;
use time::macros::format_description;

use crate::error::NResult;

#[macro_use]
mod macros {
    macro_rules! do_lock {
        ($lock:expr) => {{
            //println!(" >>> lock {} ({}::{})", stringify!($lock), file!(), line!());
            $lock.expect(concat!("notesync::util::do_lock!() -- failed to grab lock at ", file!(), "::", line!()))
        }}
    }

    /// A macro that wraps locking mutexes. Really handy for debugging deadlocks.
    macro_rules! lock {
        ($lockable:expr) => { do_lock!($lockable.lock()) }
    }

    /// A macro that wraps read-locking RwLocks. Really handy for debugging
    /// deadlocks.
    macro_rules! lockr {
        ($lockable:expr) => { do_lock!($lockable.read()) }
    }

    /// A macro that wraps write-locking RwLocks. Really handy for debugging
    /// deadlocks.
    macro_rules! lockw {
        ($lockable:expr) => { do_lock!($lockable.write()) }
    }
}

pub mod logger;
pub mod event;
pub mod stopper;
pub mod thredder;

/// Go to sleep
pub fn sleep(millis: u64) {
    thread::sleep(Duration::from_millis(millis));
}

/// Milliseconds since the epoch
pub fn now_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(x) => x.as_millis() as i64,
        Err(_) => 0,
    }
}

/// A human-readable (UTC) timestamp, ie `2019-03-01 14:02:59`
pub fn timestamp() -> NResult<String> {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    Ok(OffsetDateTime::now_utc().format(&format)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_timestamps() {
        let ts = timestamp().unwrap();
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], " ");
        assert!(now_ms() > 1_500_000_000_000);
    }
}
