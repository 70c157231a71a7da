//! Thredder is a small bounded worker pool. Hand it a list of jobs and it runs
//! each one on its own (scoped) thread, but only lets `workers` of them do
//! work at once. A job that has to sit and wait (say, out a rate limit) can
//! hand its slot to the next job with `idle()`. Results come back in the same
//! order the jobs came in.

use std::cell::RefCell;
use std::cmp;
use std::sync::{Arc, Condvar, Mutex};

use crossbeam::channel;

use crate::error::{NError, NResult};

/// Counts how many more jobs are allowed to work right now
struct Slots {
    free: Mutex<usize>,
    signal: Condvar,
}

impl Slots {
    fn new(count: usize) -> Slots {
        Slots {
            free: Mutex::new(count),
            signal: Condvar::new(),
        }
    }

    fn take(&self) {
        let mut free = lock!(self.free);
        while *free == 0 {
            free = match self.signal.wait(free) {
                Ok(x) => x,
                Err(e) => e.into_inner(),
            };
        }
        *free -= 1;
    }

    fn give(&self) {
        let mut free = lock!(self.free);
        *free += 1;
        self.signal.notify_one();
    }
}

/// Holds a slot for a job, giving it back however the job ends
struct SlotGuard(Arc<Slots>);

impl SlotGuard {
    fn take(slots: Arc<Slots>) -> SlotGuard {
        slots.take();
        SLOTS.with(|x| *x.borrow_mut() = Some(slots.clone()));
        SlotGuard(slots)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        SLOTS.with(|x| *x.borrow_mut() = None);
        self.0.give();
    }
}

thread_local! {
    /// The slots of the pool the current thread is working for, if any
    static SLOTS: RefCell<Option<Arc<Slots>>> = RefCell::new(None);
}

/// Run `f` without holding a worker slot, so another job can work while this
/// one waits. Outside of a pool this just runs `f`.
pub fn idle<T, F>(f: F) -> T
    where F: FnOnce() -> T
{
    let slots = SLOTS.with(|x| x.borrow().clone());
    match slots {
        Some(slots) => {
            slots.give();
            let res = f();
            slots.take();
            res
        }
        None => f(),
    }
}

/// Stores state information for our pool.
pub struct Thredder {
    /// Our Thredder's name (threads are named `<name>-<n>`)
    pub name: String,
    workers: usize,
}

impl Thredder {
    /// Create a new thredder
    pub fn new(name: &str, workers: usize) -> Thredder {
        Thredder {
            name: String::from(name),
            workers: cmp::max(workers, 1),
        }
    }

    /// How many jobs work at once, at most
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `run` over each item in the pool. Blocks until all items are done.
    /// A job that panics poisons the whole batch.
    pub fn map<I, T, F>(&self, items: Vec<I>, run: F) -> NResult<Vec<T>>
        where I: Send,
              T: Send,
              F: Fn(I) -> T + Sync
    {
        let count = items.len();
        if count == 0 { return Ok(Vec::new()); }
        let (res_tx, res_rx) = channel::unbounded::<(usize, T)>();
        let slots = Arc::new(Slots::new(cmp::min(self.workers, count)));
        let run = &run;
        crossbeam::scope(|scope| -> NResult<()> {
            for (idx, item) in items.into_iter().enumerate() {
                let res_tx = res_tx.clone();
                let slots = slots.clone();
                scope.builder()
                    .name(format!("{}-{}", self.name, idx))
                    .spawn(move |_| {
                        let guard = SlotGuard::take(slots);
                        let res = run(item);
                        drop(guard);
                        if res_tx.send((idx, res)).is_err() {
                            warn!("Thredder.map() -- result queue closed");
                        }
                    })?;
            }
            Ok(())
        })??;
        drop(res_tx);
        let mut results: Vec<(usize, T)> = res_rx.iter().collect();
        if results.len() != count {
            return Err(NError::Msg(format!("Thredder.map() -- {}: {} of {} jobs came back", self.name, results.len(), count)));
        }
        results.sort_by_key(|x| x.0);
        Ok(results.into_iter().map(|x| x.1).collect())
    }
}
