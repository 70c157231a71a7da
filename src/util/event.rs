//! An event emitter that passes JSON values to bound callbacks. The sync
//! engine uses it to report progress to whoever is listening (a UI, a test).
//!
//! Bindings live behind an RwLock, so an emitter can be bound and triggered
//! from any thread. Callbacks are run *outside* the lock, so a callback is
//! free to bind/unbind/trigger on the same emitter.

use std::sync::{Arc, RwLock};
use std::collections::HashMap;

use jedi::Value;

/// Defines what type of binding we have
#[derive(Clone, Copy, PartialEq)]
enum BindType {
    Every,
    Once,
}

/// Define a trait for our event callbacks.
pub trait EventThunk: Send + Sync + 'static {
    fn call_box(&self, val: &Value);
}
impl<F: Fn(&Value) + Send + Sync + 'static> EventThunk for F {
    fn call_box(&self, val: &Value) {
        (*self)(val);
    }
}

/// Holds information about a callback.
#[derive(Clone)]
pub struct Callback {
    cb: Arc<dyn EventThunk>,
    binding: BindType,
    name: String,
}

/// An alias to make returning the bindings object easier
pub type Bindings = RwLock<HashMap<String, Vec<Callback>>>;

/// Holds a set of event bindings. Implements `Emitter`.
pub struct EventEmitter {
    bindings: Bindings,
}

/// Defines an interface for an event emitter, including binding/triggering
/// events. The only non-provided method is `bindings`.
pub trait Emitter {
    /// Grab this emitter's bindings
    fn bindings(&self) -> &Bindings;

    /// Binds a callback to an event name. Binding the same event/name pair
    /// twice replaces the first binding.
    fn do_bind(&self, event_name: &str, cb: Callback) {
        self.unbind(event_name, cb.name.as_str());
        let mut guard = lockw!(self.bindings());
        let events = guard.entry(String::from(event_name)).or_insert_with(|| Vec::with_capacity(3));
        events.push(cb);
    }

    /// Bind a callback to an event name. The binding takes a name, which makes
    /// it easy to unbind later (by name).
    fn bind<F>(&self, event_name: &str, cb: F, bind_name: &str)
        where F: Fn(&Value) + Send + Sync + 'static
    {
        self.do_bind(event_name, Callback {
            cb: Arc::new(cb),
            binding: BindType::Every,
            name: String::from(bind_name),
        });
    }

    /// Bind a one-time callback to an event name.
    fn bind_once<F>(&self, event_name: &str, cb: F, bind_name: &str)
        where F: Fn(&Value) + Send + Sync + 'static
    {
        self.do_bind(event_name, Callback {
            cb: Arc::new(cb),
            binding: BindType::Once,
            name: String::from(bind_name),
        });
    }

    /// Unbind an event/listener from this emitter.
    fn unbind(&self, event_name: &str, bind_name: &str) -> bool {
        let mut guard = lockw!(self.bindings());
        match guard.get_mut(event_name) {
            Some(x) => {
                let len = x.len();
                x.retain(|cb| cb.name != bind_name);
                len != x.len()
            }
            None => false
        }
    }

    /// Trigger an event. Any function bound to the event name gets fired, with
    /// `data` passed as the only argument.
    fn trigger(&self, event_name: &str, data: &Value) {
        let callbacks = {
            let mut guard = lockw!(self.bindings());
            match guard.get_mut(event_name) {
                Some(x) => {
                    let callbacks = x.clone();
                    x.retain(|cb| cb.binding != BindType::Once);
                    callbacks
                }
                None => return,
            }
        };
        for callback in callbacks {
            callback.cb.call_box(data);
        }
    }
}

impl EventEmitter {
    /// Make a new Emitter.
    pub fn new() -> EventEmitter {
        EventEmitter { bindings: RwLock::new(HashMap::new()) }
    }
}

impl Emitter for EventEmitter {
    fn bindings(&self) -> &Bindings {
        &self.bindings
    }
}

impl Default for EventEmitter {
    fn default() -> EventEmitter {
        EventEmitter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, RwLock};

    fn counter() -> Arc<RwLock<Vec<i64>>> {
        Arc::new(RwLock::new(Vec::new()))
    }

    #[test]
    fn bind_trigger() {
        let seen = counter();
        let emitter = EventEmitter::new();
        let seen2 = seen.clone();
        emitter.bind("sync:chunk:downloaded", move |x: &Value| {
            seen2.write().unwrap().push(jedi::get(&["count"], x).unwrap());
        }, "test:chunks");
        emitter.trigger("sync:started", &json!({"count": 1}));
        assert_eq!(seen.read().unwrap().len(), 0);
        emitter.trigger("sync:chunk:downloaded", &json!({"count": 3}));
        emitter.trigger("sync:chunk:downloaded", &json!({"count": 7}));
        assert_eq!(*seen.read().unwrap(), vec![3, 7]);
    }

    #[test]
    fn bind_once_and_replace() {
        let seen = counter();
        let emitter = EventEmitter::new();
        let seen2 = seen.clone();
        emitter.bind_once("sync:finished", move |_| { seen2.write().unwrap().push(1); }, "test:once");
        emitter.trigger("sync:finished", &jedi::obj());
        emitter.trigger("sync:finished", &jedi::obj());
        assert_eq!(*seen.read().unwrap(), vec![1]);

        let seen3 = seen.clone();
        emitter.bind("sync:finished", move |_| { seen3.write().unwrap().push(2); }, "test:every");
        // replaces the binding above. does nothing.
        emitter.bind("sync:finished", move |_| {}, "test:every");
        emitter.trigger("sync:finished", &jedi::obj());
        assert_eq!(*seen.read().unwrap(), vec![1]);
    }

    #[test]
    fn unbind_and_rebind_from_callback() {
        let seen = counter();
        let emitter = Arc::new(EventEmitter::new());
        let seen2 = seen.clone();
        let emitter2 = emitter.clone();
        emitter.bind("sync:scope:finished", move |_| {
            seen2.write().unwrap().push(1);
            // must not deadlock
            emitter2.unbind("sync:scope:finished", "test:self");
        }, "test:self");
        emitter.trigger("sync:scope:finished", &jedi::obj());
        emitter.trigger("sync:scope:finished", &jedi::obj());
        assert_eq!(*seen.read().unwrap(), vec![1]);
        assert!(!emitter.unbind("sync:scope:finished", "test:self"));
    }
}
