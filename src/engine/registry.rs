//! Working directory to engine session table.
//!
//! A key is reserved before any work starts: the first caller inserts a
//! `Starting` slot and runs the creation closure outside every map lock,
//! while later callers for the same key block on the slot until it turns
//! `Ready` or `Failed`. A failed slot is evicted so the next call retries.
//! When the creator gave up (cancelled or panicked) the slot is `Abandoned`
//! and waiters race to reserve a fresh one instead of inheriting the
//! creator's cancellation.
use super::context::ExecutionOptions;
use super::error::{EngineError, EngineResult};
use super::host::{EngineClient, ProcessHandle, Session};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A live, initialized engine session for one working directory.
pub struct EngineInstance {
    client: Arc<dyn EngineClient>,
    process: Box<dyn ProcessHandle>,
    options: ExecutionOptions,
    engine: PathBuf,
}

impl EngineInstance {
    pub fn new(session: Session, options: ExecutionOptions, engine: PathBuf) -> Self {
        Self {
            client: session.client,
            process: session.process,
            options,
            engine,
        }
    }

    pub fn client(&self) -> &dyn EngineClient {
        self.client.as_ref()
    }

    /// Options of the call that created the session.
    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn engine(&self) -> &Path {
        &self.engine
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn terminate(&self) -> EngineResult<()> {
        self.process.terminate()
    }
}

enum SlotState {
    Starting,
    Ready(Arc<EngineInstance>),
    Failed(Arc<EngineError>),
    Abandoned,
}

/// What a waiter finds once a slot settles.
enum Settled {
    Ready(Arc<EngineInstance>),
    Failed(Arc<EngineError>),
    Abandoned,
}

struct Slot {
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl Slot {
    fn starting() -> Self {
        Self {
            state: Mutex::new(SlotState::Starting),
            changed: Condvar::new(),
        }
    }

    fn settle(&self, state: SlotState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }

    /// Block until the slot leaves `Starting`.
    fn wait(&self) -> Settled {
        let mut state = self.state.lock();
        loop {
            match &*state {
                SlotState::Starting => {}
                SlotState::Ready(instance) => return Settled::Ready(Arc::clone(instance)),
                SlotState::Failed(err) => return Settled::Failed(Arc::clone(err)),
                SlotState::Abandoned => return Settled::Abandoned,
            }
            self.changed.wait(&mut state);
        }
    }
}

/// Concurrent map from working directory to engine instance.
#[derive(Default)]
pub struct InstanceRegistry {
    slots: DashMap<String, Arc<Slot>>,
    closed: AtomicBool,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse every later `get_or_create`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Return the instance for `key`, running `create` if none exists yet.
    ///
    /// `create` runs at most once per key at a time, on the calling thread,
    /// without any map lock held. Waiters see the creator's error as is,
    /// except a cancelled or abandoned start, after which they try again.
    pub fn get_or_create<F>(&self, key: &str, create: F) -> EngineResult<Arc<EngineInstance>>
    where
        F: FnOnce() -> EngineResult<EngineInstance>,
    {
        let slot = loop {
            if self.is_closed() {
                return Err(EngineError::RegistryClosed);
            }
            let existing = match self.slots.entry(key.to_string()) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    let slot = Arc::new(Slot::starting());
                    entry.insert(Arc::clone(&slot));
                    break slot;
                }
            };
            match existing.wait() {
                Settled::Ready(instance) => return Ok(instance),
                Settled::Failed(err) => return Err(err.duplicate()),
                Settled::Abandoned => {
                    tracing::debug!(working_dir = key, "engine start-up abandoned, retrying");
                }
            }
        };

        tracing::debug!(working_dir = key, "starting engine instance");
        let mut reservation = Reservation {
            registry: self,
            key,
            slot: &slot,
            settled: false,
        };
        let instance = match create() {
            Ok(instance) => Arc::new(instance),
            Err(EngineError::Cancelled) => {
                reservation.abandon();
                return Err(EngineError::Cancelled);
            }
            Err(err) => {
                let err = Arc::new(err);
                reservation.fail(SlotState::Failed(Arc::clone(&err)));
                return Err(err.duplicate());
            }
        };

        let mut state = slot.state.lock();
        if self.is_closed() {
            *state = SlotState::Failed(Arc::new(EngineError::RegistryClosed));
            slot.changed.notify_all();
            drop(state);
            reservation.settled = true;
            self.evict(key, &slot);
            if let Err(err) = instance.terminate() {
                tracing::warn!(working_dir = key, error = %err, "failed to terminate engine");
            }
            return Err(EngineError::RegistryClosed);
        }
        *state = SlotState::Ready(Arc::clone(&instance));
        slot.changed.notify_all();
        reservation.settled = true;
        Ok(instance)
    }

    /// Remove every entry, waiting for in-progress creations to settle.
    ///
    /// Only ready instances are returned; failed starts are skipped.
    pub fn drain(&self) -> Vec<(String, Arc<EngineInstance>)> {
        let keys: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        let mut instances = Vec::with_capacity(keys.len());
        for key in keys {
            let Some((key, slot)) = self.slots.remove(&key) else {
                continue;
            };
            if let Settled::Ready(instance) = slot.wait() {
                instances.push((key, instance));
            }
        }
        instances.sort_by(|a, b| a.0.cmp(&b.0));
        instances
    }

    fn evict(&self, key: &str, slot: &Arc<Slot>) {
        self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, slot));
    }
}

/// Settles a reserved slot when the creator returns early or panics.
struct Reservation<'a> {
    registry: &'a InstanceRegistry,
    key: &'a str,
    slot: &'a Arc<Slot>,
    settled: bool,
}

impl Reservation<'_> {
    fn fail(&mut self, state: SlotState) {
        self.registry.evict(self.key, self.slot);
        self.slot.settle(state);
        self.settled = true;
    }

    fn abandon(&mut self) {
        self.fail(SlotState::Abandoned);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.abandon();
        }
    }
}
