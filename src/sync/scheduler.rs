//! Every remote call goes through here. Rate limits put the calling workflow
//! to sleep for as long as the service asks and then replay the exact same
//! call; brief network failures get a few retries with backoff; expired auth
//! gets one refresh through the pool.
//!
//! Nothing here is global and nothing is locked while waiting: each scope's
//! workflow runs on its own thread and hands its pool slot over while it
//! sleeps, so a rate-limited linked notebook only ever delays itself.

use std::sync::Arc;
use std::time::Duration;

use crate::api::{RemoteError, RResult};
use crate::error::{NError, NResult};
use crate::messaging::{self, Messenger};
use crate::models::Scope;
use crate::sync::pool::{AuthContext, NoteStorePool};
use crate::util::stopper::Stopper;
use crate::util::thredder;

/// A one-shot timer. Waits out `duration` unless the stopper stops first, and
/// returns whether we're still running.
pub trait Timer: Send + Sync {
    fn wait(&self, duration: Duration, stopper: &Stopper) -> bool;
}

/// Sleeps on the calling thread (waking early on cancellation)
pub struct ThreadTimer;

impl Timer for ThreadTimer {
    fn wait(&self, duration: Duration, stopper: &Stopper) -> bool {
        stopper.wait(duration)
    }
}

/// Doesn't wait at all. Handy when a test scripts rate limits.
pub struct NoWaitTimer;

impl Timer for NoWaitTimer {
    fn wait(&self, _duration: Duration, stopper: &Stopper) -> bool {
        stopper.running()
    }
}

pub struct RetryScheduler {
    timer: Arc<dyn Timer>,
    stopper: Arc<Stopper>,
    messenger: Arc<Messenger>,
    transport_retries: u32,
    transport_backoff_ms: u64,
}

impl RetryScheduler {
    pub fn new(timer: Arc<dyn Timer>, stopper: Arc<Stopper>, messenger: Arc<Messenger>, transport_retries: u32, transport_backoff_ms: u64) -> RetryScheduler {
        RetryScheduler {
            timer: timer,
            stopper: stopper,
            messenger: messenger,
            transport_retries: transport_retries,
            transport_backoff_ms: transport_backoff_ms,
        }
    }

    fn check_cancel(&self) -> NResult<()> {
        if self.stopper.running() { Ok(()) } else { Err(NError::Cancelled) }
    }

    /// Wait on the timer. A scope running on a worker pool gives its slot up
    /// while it waits, so other scopes keep going.
    fn wait(&self, duration: Duration) -> bool {
        thredder::idle(|| self.timer.wait(duration, &self.stopper))
    }

    /// Run a remote call, riding out rate limits and network blips.
    pub fn call<T, F>(&self, scope: &Scope, op: &str, mut f: F) -> NResult<T>
        where F: FnMut() -> RResult<T>
    {
        let mut transport_failures: u32 = 0;
        loop {
            self.check_cancel()?;
            let err = match f() {
                Ok(x) => return Ok(x),
                Err(e) => e,
            };
            match err {
                RemoteError::System(_, duration) if err.is_rate_limit() => {
                    let secs = match duration {
                        Some(x) if x > 0 => x,
                        _ => {
                            error!("RetryScheduler.call() -- {}: {}: rate limit without a usable wait ({:?})", scope, op, duration);
                            return Err(NError::BrokenContract(format!("{}: rate limit with a wait of {:?}", op, duration)));
                        }
                    };
                    warn!("RetryScheduler.call() -- {}: {}: rate limited, retrying in {}s", scope, op, secs);
                    self.messenger.event(messaging::EV_RATE_LIMIT, json!({
                        "scope": scope.to_string(),
                        "op": op,
                        "seconds": secs,
                    }));
                    if !self.wait(Duration::from_secs(secs as u64)) {
                        return Err(NError::Cancelled);
                    }
                }
                RemoteError::Transport(ref msg) => {
                    if transport_failures >= self.transport_retries {
                        return Err(NError::Remote(err.clone()));
                    }
                    let backoff = self.transport_backoff_ms.saturating_mul(1 << transport_failures.min(16));
                    transport_failures += 1;
                    warn!("RetryScheduler.call() -- {}: {}: {} (retry {} in {}ms)", scope, op, msg, transport_failures, backoff);
                    if !self.wait(Duration::from_millis(backoff)) {
                        return Err(NError::Cancelled);
                    }
                }
                _ => return Err(NError::Remote(err)),
            }
        }
    }

    /// Run a remote call that needs a client/token for `scope`. A rejected
    /// token gets refreshed once, a second rejection fails the scope.
    pub fn call_with_auth<T, F>(&self, pool: &NoteStorePool, scope: &Scope, op: &str, mut f: F) -> NResult<T>
        where F: FnMut(&AuthContext) -> RResult<T>
    {
        let auth = pool.acquire(scope, self)?;
        match self.call(scope, op, || f(&auth)) {
            Err(NError::Remote(ref e)) if e.is_auth_error() => {
                warn!("RetryScheduler.call_with_auth() -- {}: {}: {}, refreshing token", scope, op, e);
            }
            x => return x,
        }
        pool.invalidate(scope)?;
        let auth = pool.acquire(scope, self)?;
        match self.call(scope, op, || f(&auth)) {
            Err(NError::Remote(ref e)) if e.is_auth_error() => {
                error!("RetryScheduler.call_with_auth() -- {}: {}: still rejected after refresh", scope, op);
                Err(NError::AuthFailed(scope.to_string(), e.to_string()))
            }
            x => x,
        }
    }
}
