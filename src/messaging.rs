//! Progress reporting. The sync engine fires events at a `Messenger` as it
//! works, and whoever cares (a UI, a test, a logger) binds to them.

use jedi::Value;

use crate::util::event::{Bindings, Emitter, EventEmitter};

/// Fired once when a run starts
pub const EV_STARTED: &str = "sync:started";
/// Fired when a scope's download or upload starts
pub const EV_SCOPE_STARTED: &str = "sync:scope:started";
/// Fired for every chunk that comes down (payload has a `count`)
pub const EV_CHUNK_DOWNLOADED: &str = "sync:chunk:downloaded";
/// Fired for every entity written on either side (payload has an `action`:
/// add, update, conflict, expunge, upload)
pub const EV_ENTITY_APPLIED: &str = "sync:entity:applied";
/// Fired for every entity we had to skip
pub const EV_ENTITY_SKIPPED: &str = "sync:entity:skipped";
/// Fired when a scope's download or upload ends (payload has a `status`)
pub const EV_SCOPE_FINISHED: &str = "sync:scope:finished";
/// Fired when a call gets rate limited and we go to sleep
pub const EV_RATE_LIMIT: &str = "sync:rate-limit";
/// Fired once when a run ends
pub const EV_FINISHED: &str = "sync:finished";

/// Wraps an event emitter, logging everything that goes out.
pub struct Messenger {
    emitter: EventEmitter,
}

impl Messenger {
    pub fn new() -> Messenger {
        Messenger {
            emitter: EventEmitter::new(),
        }
    }

    /// Send an event out to anyone listening
    pub fn event(&self, name: &str, data: Value) {
        trace!("messaging::event() -- {}: {}", name, data);
        self.trigger(name, &data);
    }
}

impl Emitter for Messenger {
    fn bindings(&self) -> &Bindings {
        self.emitter.bindings()
    }
}

impl Default for Messenger {
    fn default() -> Messenger {
        Messenger::new()
    }
}
