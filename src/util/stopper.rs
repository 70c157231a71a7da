//! A thread-safe started/stopped switch. Loops running in threads check it
//! between steps, and other threads flip it to ask them to wind down. Waiting
//! on a stopper sleeps until either the time is up or somebody stops it.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct Stopper {
    run: Mutex<bool>,
    signal: Condvar,
}

impl Stopper {
    /// Create a new stopper (in the running state)
    pub fn new() -> Stopper {
        Stopper {
            run: Mutex::new(true),
            signal: Condvar::new(),
        }
    }

    /// Sets the running state
    pub fn set(&self, val: bool) {
        let mut guard = lock!(self.run);
        *guard = val;
        self.signal.notify_all();
    }

    /// Shorthand for `set(false)`
    pub fn stop(&self) {
        self.set(false);
    }

    /// Check if we're running
    pub fn running(&self) -> bool {
        match self.run.lock() {
            Ok(x) => *x,
            Err(_) => false,
        }
    }

    /// Sleep for `duration` or until we're stopped, whichever comes first.
    /// Returns whether we're still running.
    pub fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = lock!(self.run);
        loop {
            if !*guard { return false; }
            let now = Instant::now();
            if now >= deadline { return true; }
            guard = match self.signal.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            };
        }
    }
}

impl Default for Stopper {
    fn default() -> Stopper {
        Stopper::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn stops_waiters_early() {
        let stopper = Arc::new(Stopper::new());
        assert!(stopper.running());
        assert!(stopper.wait(Duration::from_millis(5)));
        let stopper2 = stopper.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stopper2.stop();
        });
        let start = Instant::now();
        assert!(!stopper.wait(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(!stopper.running());
        handle.join().unwrap();
    }
}
