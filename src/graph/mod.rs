//! # Graph Directory
//!
//! Process-local cache of every known device, signal and map, local or
//! remote. Records live in an arena keyed by `ObjectId`; handles hold a
//! `Graph` plus an id and look the record up on every access.
//!
//! `poll` is the only place the directory changes in response to the
//! network. It drains the engine, applies each message under the write
//! lock, then releases the lock and runs the listeners queued along the
//! way on the calling thread.

pub(crate) mod directory;
pub(crate) mod record;
mod event;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::engine::{EndpointId, Engine, Message, ObjectSnapshot, SignalUpdate};
use crate::model::*;
use crate::object::{Device, GraphObject, Instance, Map, Signal};
use crate::pool::Activation;
use crate::query::{List, Plan};
use crate::Result;

use directory::Directory;
use record::{Callback, Listener, Record};

pub use event::{Event, Subject};
pub(crate) use event::{Pending, Target};

/// Lifecycle bits delivered to graph-level listeners.
const LIFECYCLE: Status = Status::NEW
    .union(Status::MODIFIED)
    .union(Status::REMOVED)
    .union(Status::EXPIRED);

// ============================================================================
// State behind the lock
// ============================================================================

pub(crate) struct GraphListener {
    pub id: ListenerId,
    pub kinds: ObjectKinds,
    pub mask: Status,
    pub callback: Callback,
}

#[derive(Default)]
pub(crate) struct GraphState {
    pub dir: Directory,
    pub listeners: Vec<GraphListener>,
    /// Events waiting for the next dispatch.
    pub pending: Vec<Pending>,
}

impl GraphState {
    pub fn queue(&mut self, target: Target, status: Status, value: Option<SignalValue>, time: Timestamp) {
        self.pending.push(Pending { target, status, value, time });
    }

    /// Mark `id` and its dependents gone and queue one event per record.
    pub fn mark_gone(&mut self, id: ObjectId, bit: Status, now: Timestamp) -> usize {
        let affected = self.dir.mark_gone(id, bit);
        for (gone, kind) in &affected {
            self.queue(Target::Object(*gone, *kind), bit, None, now);
        }
        affected.len()
    }

    /// Turn a pool activation into status bits and events. Returns the
    /// instance that now carries the stream, or `None` on overflow.
    pub fn settle_activation(
        &mut self,
        signal: ObjectId,
        activation: &Activation,
        now: Timestamp,
    ) -> Option<InstanceId> {
        let incoming = self
            .dir
            .get(signal)
            .and_then(Record::signal)
            .is_some_and(|s| s.direction == Direction::Incoming);
        match activation {
            Activation::Existing(id) | Activation::Activated(id) => Some(*id),
            Activation::Stolen { id, evicted, value } => {
                if let Some(record) = self.dir.get_mut(signal) {
                    record.status |= Status::OVERFLOW;
                }
                let release = if incoming { Status::UPSTREAM_RELEASE } else { Status::DOWNSTREAM_RELEASE };
                debug!(%signal, instance = %id, evicted = %evicted, "instance stolen");
                self.queue(Target::Object(signal, ObjectKind::Signal), Status::OVERFLOW, None, now);
                self.queue(Target::Instance(signal, *evicted), release, value.clone(), now);
                Some(*id)
            }
            Activation::Overflow => {
                if let Some(record) = self.dir.get_mut(signal) {
                    record.status |= Status::OVERFLOW;
                }
                warn!(%signal, "instance pool exhausted");
                self.queue(Target::Object(signal, ObjectKind::Signal), Status::OVERFLOW, None, now);
                None
            }
        }
    }

    /// Apply one engine message. Returns a map id this graph must accept.
    fn apply(&mut self, message: Message, now: Timestamp, max_instances: usize) -> Option<ObjectId> {
        match message {
            Message::Registered { device, name, ordinal, host, port } => {
                let Some(record) = self.dir.get_live_mut(device) else {
                    debug!(%device, "registration for unknown device");
                    return None;
                };
                record.props.put(Property::Name, name.as_str(), true);
                record.props.put(Property::Ordinal, ordinal, true);
                record.props.put(Property::Host, host, true);
                record.props.put(Property::Port, port, true);
                record.status.remove(Status::STAGED);
                record.status |= Status::ACTIVE | Status::MODIFIED;
                info!(%device, %name, port, "device ready");
                self.queue(Target::Object(device, ObjectKind::Device), Status::MODIFIED, None, now);
                None
            }
            Message::Upsert(snapshot) => {
                self.upsert(snapshot, now, max_instances);
                None
            }
            Message::MapProposed(snapshot) => {
                let id = snapshot.id;
                self.upsert(snapshot, now, max_instances);
                Some(id)
            }
            Message::Modified { id, changes } => {
                let Some(record) = self.dir.get_live_mut(id) else { return None };
                if record.props.apply_remote(&changes) {
                    record.status |= Status::MODIFIED;
                    let kind = record.kind;
                    self.queue(Target::Object(id, kind), Status::MODIFIED, None, now);
                }
                None
            }
            Message::Deliver(update) => {
                self.deliver(update, now);
                None
            }
            Message::Removed { id } => {
                self.mark_gone(id, Status::REMOVED, now);
                None
            }
            Message::Expired { id } => {
                self.mark_gone(id, Status::EXPIRED, now);
                None
            }
        }
    }

    fn upsert(&mut self, snapshot: ObjectSnapshot, now: Timestamp, max_instances: usize) {
        let id = snapshot.id;
        if let Some(record) = self.dir.get_mut(id) {
            if record.is_gone() {
                return;
            }
            let changes: Vec<Change> = snapshot
                .props
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect();
            let mut changed = record.props.apply_remote(&changes);
            if snapshot.active && !record.status.contains(Status::ACTIVE) {
                record.status.remove(Status::STAGED);
                record.status |= Status::ACTIVE;
                changed = true;
                if record.kind == ObjectKind::Map {
                    info!(map = %id, "map ready");
                }
            }
            if changed {
                record.status |= Status::MODIFIED;
                let kind = record.kind;
                self.queue(Target::Object(id, kind), Status::MODIFIED, None, now);
            }
            return;
        }
        if self.dir.status_of(id).is_some() {
            debug!(object = %id, "ignoring announcement of a purged object");
            return;
        }
        let record = Record::from_snapshot(&snapshot, max_instances);
        debug!(object = %id, kind = %record.kind, "object discovered");
        self.dir.insert(record);
        self.queue(Target::Object(id, snapshot.kind), Status::NEW, None, now);
    }

    fn deliver(&mut self, update: SignalUpdate, now: Timestamp) {
        let signal = update.signal;
        let Some(record) = self.dir.get_live_mut(signal).filter(|r| r.local) else {
            debug!(%signal, "dropping update for a signal this graph does not own");
            return;
        };
        let stealing = record.stealing();
        let Some(sig) = record.signal_mut() else { return };
        let instanced = sig.pool.use_instances();
        let instance = if instanced { update.instance } else { InstanceId(0) };
        let target = if instanced {
            Target::Instance(signal, instance)
        } else {
            Target::Object(signal, ObjectKind::Signal)
        };

        let Some(value) = update.value else {
            if instanced && sig.pool.release(instance, false) {
                let last = sig.pool.value(instance).cloned();
                self.queue(target, Status::UPSTREAM_RELEASE, last, update.time);
            }
            return;
        };
        if value.has_nan() {
            return;
        }
        let value = if value.data_type() != sig.data_type || value.len() != sig.length {
            value.coerce(sig.data_type, sig.length)
        } else {
            value
        };
        let activation = sig.pool.activate(instance, stealing, update.time);
        let Some(instance) = self.settle_activation(signal, &activation, now) else { return };

        let Some(record) = self.dir.get_mut(signal) else { return };
        if let Some(sig) = record.signal_mut() {
            sig.pool.set_value(instance, value.clone(), update.time, Status::REMOTE_UPDATE);
        }
        record.status |= Status::HAS_VALUE | Status::NEW_VALUE | Status::REMOTE_UPDATE;
        let target = if instanced {
            Target::Instance(signal, instance)
        } else {
            Target::Object(signal, ObjectKind::Signal)
        };
        self.queue(target, Status::REMOTE_UPDATE, Some(value), update.time);
    }
}

// ============================================================================
// Graph handle
// ============================================================================

struct GraphInner {
    engine: Engine,
    endpoint: EndpointId,
    state: RwLock<GraphState>,
    /// Set while `poll` runs; a second poll from a callback is refused.
    dispatching: AtomicBool,
    next_listener: AtomicU64,
}

impl Drop for GraphInner {
    fn drop(&mut self) {
        debug!(endpoint = self.endpoint.0, "graph dropped, detaching");
        self.engine.backend().detach(self.endpoint);
    }
}

/// Shared handle to one directory. Cloning is cheap.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

/// Clears the dispatching flag when poll returns.
struct PollGuard<'a>(&'a AtomicBool);

impl<'a> PollGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PollGuard(flag))
    }
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Graph {
    /// Attach a new directory to the engine. Active objects already known
    /// to the engine arrive on the first poll.
    pub fn new(engine: &Engine) -> Result<Self> {
        let endpoint = engine.backend().attach()?;
        debug!(endpoint = endpoint.0, "graph attached");
        Ok(Self {
            inner: Arc::new(GraphInner {
                engine: engine.clone(),
                endpoint,
                state: RwLock::new(GraphState::default()),
                dispatching: AtomicBool::new(false),
                next_listener: AtomicU64::new(1),
            }),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub(crate) fn endpoint(&self) -> EndpointId {
        self.inner.endpoint
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&GraphState) -> R) -> R {
        f(&self.inner.state.read())
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut GraphState) -> R) -> R {
        f(&mut self.inner.state.write())
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    /// Drain the engine for up to `timeout_ms`, apply what arrived, run due
    /// listeners, and return the number of messages processed.
    ///
    /// Returns immediately when `timeout_ms` is 0 and nothing is pending.
    /// Calling `poll` from inside a listener returns 0 without doing
    /// anything.
    pub fn poll(&self, timeout_ms: u64) -> usize {
        let Some(_guard) = PollGuard::enter(&self.inner.dispatching) else {
            warn!(endpoint = self.inner.endpoint.0, "poll refused: already polling");
            return 0;
        };
        let engine = self.inner.engine.backend();
        let messages = engine.receive(self.inner.endpoint, Duration::from_millis(timeout_ms));
        let processed = messages.len();

        let max_instances = engine.config().max_instances;
        let now = Utc::now();
        let accept: Vec<ObjectId> = {
            let mut state = self.inner.state.write();
            messages
                .into_iter()
                .filter_map(|m| state.apply(m, now, max_instances))
                .collect()
        };
        for map in accept {
            if let Err(e) = engine.accept_map(self.inner.endpoint, map) {
                warn!(%map, error = %e, "could not accept map");
            }
        }

        self.dispatch();
        let purged = self.inner.state.write().dir.purge();
        if purged > 0 {
            debug!(purged, "purged removed objects");
        }
        processed
    }

    /// Run every queued event through the matching listeners, with no lock
    /// held while callbacks execute. Events queued by callbacks wait for
    /// the next poll.
    fn dispatch(&self) {
        let pending = std::mem::take(&mut self.inner.state.write().pending);
        if pending.is_empty() {
            return;
        }
        let deliveries: Vec<(Callback, Event)> = {
            let state = self.inner.state.read();
            let mut out = Vec::new();
            for p in pending {
                let mut callbacks: Vec<Callback> = state
                    .dir
                    .get(p.target.record())
                    .into_iter()
                    .flat_map(|r| r.listeners.iter())
                    .filter(|l| l.mask.intersects(p.status))
                    .map(|l| l.callback.clone())
                    .collect();
                if let Target::Object(_, kind) = p.target {
                    if p.status.intersects(LIFECYCLE) {
                        callbacks.extend(
                            state
                                .listeners
                                .iter()
                                .filter(|l| l.kinds.admits(kind) && l.mask.intersects(p.status))
                                .map(|l| l.callback.clone()),
                        );
                    }
                }
                if callbacks.is_empty() {
                    continue;
                }
                let event = self.event_for(&p);
                out.extend(callbacks.into_iter().map(|cb| (cb, event.clone())));
            }
            out
        };
        for (callback, event) in deliveries {
            let mut guard = callback.lock();
            let f = &mut *guard;
            f(&event);
        }
    }

    fn event_for(&self, pending: &Pending) -> Event {
        let subject = match pending.target {
            Target::Object(id, ObjectKind::Device) => Subject::Device(Device::from_parts(self.clone(), id)),
            Target::Object(id, ObjectKind::Signal) => Subject::Signal(Signal::from_parts(self.clone(), id)),
            Target::Object(id, ObjectKind::Map) => Subject::Map(Map::from_parts(self.clone(), id)),
            Target::Instance(signal, id) => {
                Subject::Instance(Instance::new(Signal::from_parts(self.clone(), signal), id))
            }
        };
        Event {
            subject,
            status: pending.status,
            value: pending.value.clone(),
            time: pending.time,
        }
    }

    // ------------------------------------------------------------------------
    // Enumerations
    // ------------------------------------------------------------------------

    pub fn devices(&self) -> List<Device> {
        List::query(self.clone(), Plan::Scan { kind: ObjectKind::Device, direction: Direction::Any })
    }

    pub fn signals(&self, direction: Direction) -> List<Signal> {
        List::query(self.clone(), Plan::Scan { kind: ObjectKind::Signal, direction })
    }

    pub fn maps(&self) -> List<Map> {
        List::query(self.clone(), Plan::Scan { kind: ObjectKind::Map, direction: Direction::Any })
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    /// Hear NEW, MODIFIED, REMOVED and EXPIRED for every record of `kinds`,
    /// narrowed by `events`.
    pub fn add_listener(
        &self,
        kinds: impl Into<ObjectKinds>,
        events: Status,
        f: impl FnMut(&Event) + Send + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id();
        let listener = GraphListener {
            id,
            kinds: kinds.into(),
            mask: events,
            callback: Arc::new(Mutex::new(Box::new(f))),
        };
        self.write(|state| state.listeners.push(listener));
        id
    }

    /// Attach a listener to one record. Ignored when the record is gone.
    pub(crate) fn add_record_listener(
        &self,
        object: ObjectId,
        mask: Status,
        f: Box<dyn FnMut(&Event) + Send>,
    ) -> ListenerId {
        let id = self.next_listener_id();
        let attached = self.write(|state| match state.dir.get_live_mut(object) {
            Some(record) => {
                record.listeners.push(Listener { id, mask, callback: Arc::new(Mutex::new(f)) });
                true
            }
            None => false,
        });
        if !attached {
            debug!(%object, "listener not attached: object is gone");
        }
        id
    }

    /// Unregister a graph-level or object listener. Returns false if `id`
    /// was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.write(|state| {
            let before = state.listeners.len();
            state.listeners.retain(|l| l.id != id);
            if state.listeners.len() != before {
                return true;
            }
            for record in state.dir.records_mut() {
                let before = record.listeners.len();
                record.listeners.retain(|l| l.id != id);
                if record.listeners.len() != before {
                    return true;
                }
            }
            false
        })
    }

    /// Serialize the live directory as JSON.
    pub fn export_json(&self) -> Result<String> {
        crate::export::to_json(self)
    }
}

impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph").field("endpoint", &self.inner.endpoint.0).finish()
    }
}
