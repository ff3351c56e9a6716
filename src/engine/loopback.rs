//! In-process loopback engine.
//!
//! This is the reference implementation of `MappingEngine`. Every attached
//! graph gets an inbox; announcements, map handshakes and value routing all
//! happen inside one mutex-protected bus.
//!
//! ## Limitations
//!
//! - **Single process**: peers are graphs attached to the same engine.
//! - **No clock sync**: timestamps are taken from the sender's wall clock.
//! - **Unbounded inboxes**: a graph that never polls accumulates messages.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::expr::{self, Expression};
use crate::model::*;
use crate::{Error, Result};
use super::{EndpointId, MappingEngine, Message, ObjectSnapshot, SignalUpdate};

const FIRST_PORT: i64 = 9000;

// ============================================================================
// LoopbackEngine
// ============================================================================

/// In-process signal bus.
pub struct LoopbackEngine {
    config: EngineConfig,
    state: Mutex<BusState>,
    wake: Condvar,
    next_endpoint: AtomicU64,
    next_object: AtomicU64,
}

#[derive(Default)]
struct BusState {
    inboxes: HashMap<EndpointId, VecDeque<Message>>,
    /// Every live object, in announcement order.
    objects: IndexMap<ObjectId, Entry>,
    routes: HashMap<ObjectId, Route>,
    next_port: i64,
    shutdown: bool,
}

struct Entry {
    owner: EndpointId,
    snapshot: ObjectSnapshot,
}

/// Routing state of one map.
struct Route {
    sources: Vec<ObjectId>,
    destinations: Vec<ObjectId>,
    /// Owners that have not accepted yet.
    pending: BTreeSet<EndpointId>,
    expression: Expression,
    muted: bool,
    established: bool,
}

impl LoopbackEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BusState { next_port: FIRST_PORT, ..BusState::default() }),
            wake: Condvar::new(),
            next_endpoint: AtomicU64::new(1),
            next_object: AtomicU64::new(1),
        }
    }

    /// Number of live objects on the bus.
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    fn parse_expression(&self, source: &str) -> Result<Expression> {
        expr::parse(source, self.config.expression_depth)
    }
}

impl BusState {
    fn check_open(&self) -> Result<()> {
        if self.shutdown { Err(Error::EngineShutdown) } else { Ok(()) }
    }

    fn push(&mut self, to: EndpointId, msg: Message) {
        match self.inboxes.get_mut(&to) {
            Some(inbox) => inbox.push_back(msg),
            None => debug!(endpoint = to.0, "dropping message for detached endpoint"),
        }
    }

    fn broadcast(&mut self, except: Option<EndpointId>, msg: &Message) {
        for (ep, inbox) in self.inboxes.iter_mut() {
            if Some(*ep) != except {
                inbox.push_back(msg.clone());
            }
        }
    }

    fn owner_of(&self, id: ObjectId) -> Option<EndpointId> {
        self.objects.get(&id).map(|e| e.owner)
    }

    fn is_signal(&self, id: ObjectId) -> bool {
        self.objects.get(&id).is_some_and(|e| e.snapshot.kind == ObjectKind::Signal)
    }

    /// `id` plus everything that depends on it, dependents first.
    fn cascade(&self, id: ObjectId) -> Vec<ObjectId> {
        let Some(entry) = self.objects.get(&id) else { return Vec::new() };
        let signals: Vec<ObjectId> = match entry.snapshot.kind {
            ObjectKind::Device => self
                .objects
                .values()
                .filter(|e| e.snapshot.parent == Some(id))
                .map(|e| e.snapshot.id)
                .collect(),
            ObjectKind::Signal => vec![id],
            ObjectKind::Map => return vec![id],
        };
        let mut out: Vec<ObjectId> = self
            .routes
            .iter()
            .filter(|(_, r)| r.sources.iter().chain(&r.destinations).any(|s| signals.contains(s)))
            .map(|(map, _)| *map)
            .collect();
        out.sort();
        out.extend(signals.iter().copied().filter(|s| *s != id));
        out.push(id);
        out
    }

    fn forget(&mut self, ids: &[ObjectId]) {
        for id in ids {
            self.objects.shift_remove(id);
            self.routes.remove(id);
        }
    }

    /// Lowest ordinal not taken by a live device with the same name prefix.
    fn allocate_ordinal(&self, prefix: &str) -> i64 {
        let taken: BTreeSet<i64> = self
            .objects
            .values()
            .filter(|e| e.snapshot.kind == ObjectKind::Device)
            .filter_map(|e| {
                let name = e.snapshot.prop(Property::Name)?.as_str()?;
                let (p, ord) = name.rsplit_once('.')?;
                (p == prefix).then(|| ord.parse::<i64>().ok()).flatten()
            })
            .collect();
        (1..).find(|n| !taken.contains(n)).unwrap_or(1)
    }
}

// ============================================================================
// MappingEngine impl
// ============================================================================

impl MappingEngine for LoopbackEngine {
    fn config(&self) -> &EngineConfig { &self.config }

    fn attach(&self) -> Result<EndpointId> {
        let mut state = self.state.lock();
        state.check_open()?;
        let ep = EndpointId(self.next_endpoint.fetch_add(1, Ordering::Relaxed));
        let backlog: VecDeque<Message> = state
            .objects
            .values()
            .filter(|e| e.snapshot.active)
            .map(|e| Message::Upsert(e.snapshot.clone()))
            .collect();
        debug!(endpoint = ep.0, backlog = backlog.len(), "endpoint attached");
        state.inboxes.insert(ep, backlog);
        Ok(ep)
    }

    fn detach(&self, endpoint: EndpointId) {
        let mut state = self.state.lock();
        if state.inboxes.remove(&endpoint).is_none() {
            return;
        }
        let owned: Vec<ObjectId> = state
            .objects
            .values()
            .filter(|e| e.owner == endpoint && e.snapshot.kind == ObjectKind::Device)
            .map(|e| e.snapshot.id)
            .collect();
        let mut expired = Vec::new();
        for id in owned {
            let ids = state.cascade(id);
            state.forget(&ids);
            expired.extend(ids);
        }
        for id in &expired {
            state.broadcast(None, &Message::Expired { id: *id });
        }
        debug!(endpoint = endpoint.0, expired = expired.len(), "endpoint detached");
        drop(state);
        self.wake.notify_all();
    }

    fn next_id(&self) -> ObjectId {
        ObjectId(self.next_object.fetch_add(1, Ordering::Relaxed))
    }

    fn announce(&self, from: EndpointId, mut object: ObjectSnapshot) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        match object.kind {
            ObjectKind::Device => {
                let prefix = object
                    .prop(Property::Name)
                    .and_then(Value::as_str)
                    .unwrap_or("device")
                    .to_owned();
                let ordinal = state.allocate_ordinal(&prefix);
                let name = format!("{prefix}.{ordinal}");
                let port = state.next_port;
                state.next_port += 1;
                object.set_prop(Property::Name, name.as_str());
                object.set_prop(Property::Ordinal, ordinal);
                object.set_prop(Property::Host, "localhost");
                object.set_prop(Property::Port, port);
                object.active = true;
                info!(device = %object.id, %name, port, "device registered");
                state.push(from, Message::Registered {
                    device: object.id,
                    name,
                    ordinal,
                    host: "localhost".into(),
                    port,
                });
            }
            ObjectKind::Signal => {
                let parent = object.parent.ok_or_else(|| {
                    Error::InvalidArgument(format!("signal {} has no device", object.id))
                })?;
                if state.owner_of(parent) != Some(from) {
                    return Err(Error::NotFound(format!("device {parent}")));
                }
                object.active = true;
            }
            ObjectKind::Map => {
                return Err(Error::InvalidArgument("maps are created with request_map".into()));
            }
        }
        state.broadcast(Some(from), &Message::Upsert(object.clone()));
        state.objects.insert(object.id, Entry { owner: from, snapshot: object });
        drop(state);
        self.wake.notify_all();
        Ok(())
    }

    fn withdraw(&self, from: EndpointId, id: ObjectId) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        let entry = state.objects.get(&id).ok_or_else(|| Error::NotFound(format!("object {id}")))?;
        if entry.owner != from && entry.snapshot.kind != ObjectKind::Map {
            return Err(Error::InvalidArgument(format!("object {id} is owned by another endpoint")));
        }
        let ids = state.cascade(id);
        state.forget(&ids);
        for removed in &ids {
            state.broadcast(Some(from), &Message::Removed { id: *removed });
        }
        debug!(object = %id, cascade = ids.len(), "object withdrawn");
        drop(state);
        self.wake.notify_all();
        Ok(())
    }

    fn publish(&self, from: EndpointId, id: ObjectId, mut changes: Vec<Change>) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        if !state.objects.contains_key(&id) {
            return Err(Error::NotFound(format!("object {id}")));
        }
        if let Some(route) = state.routes.get_mut(&id) {
            changes.retain(|(key, value)| match (key.property(), value) {
                (Some(Property::Expression), Some(v)) => {
                    match v.as_str().map(|s| self.parse_expression(s)) {
                        Some(Ok(parsed)) => {
                            route.expression = parsed;
                            true
                        }
                        Some(Err(e)) => {
                            warn!(map = %id, error = %e, "rejecting map expression");
                            false
                        }
                        None => {
                            warn!(map = %id, value = %v, "map expression must be a string");
                            false
                        }
                    }
                }
                (Some(Property::Muted), Some(v)) => {
                    route.muted = v.as_bool().unwrap_or(false);
                    true
                }
                _ => true,
            });
        }
        if changes.is_empty() {
            return Ok(());
        }
        if let Some(entry) = state.objects.get_mut(&id) {
            entry.snapshot.apply(&changes);
        }
        state.broadcast(Some(from), &Message::Modified { id, changes });
        drop(state);
        self.wake.notify_all();
        Ok(())
    }

    fn request_map(&self, from: EndpointId, mut map: ObjectSnapshot) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        if map.sources.is_empty() || map.destinations.is_empty() {
            return Err(Error::InvalidArgument("a map needs sources and destinations".into()));
        }
        if let Some(missing) = map.sources.iter().chain(&map.destinations).find(|s| !state.is_signal(**s)) {
            return Err(Error::NotFound(format!("signal {missing}")));
        }
        let source = match map.prop(Property::Expression).and_then(Value::as_str) {
            Some(s) => s.to_owned(),
            None => self.config.default_expression.clone(),
        };
        let expression = match self.parse_expression(&source) {
            Ok(e) => e,
            Err(e) => {
                warn!(map = %map.id, error = %e, "falling back to default expression");
                self.parse_expression(&self.config.default_expression)?
            }
        };
        map.set_prop(Property::Expression, expression.source());
        map.active = false;

        let pending: BTreeSet<EndpointId> = map
            .sources
            .iter()
            .chain(&map.destinations)
            .filter_map(|s| state.owner_of(*s))
            .collect();
        for ep in &pending {
            state.push(*ep, Message::MapProposed(map.clone()));
        }
        debug!(map = %map.id, acceptors = pending.len(), "map proposed");
        state.routes.insert(map.id, Route {
            sources: map.sources.clone(),
            destinations: map.destinations.clone(),
            pending,
            expression,
            muted: map.prop(Property::Muted).and_then(Value::as_bool).unwrap_or(false),
            established: false,
        });
        state.objects.insert(map.id, Entry { owner: from, snapshot: map });
        drop(state);
        self.wake.notify_all();
        Ok(())
    }

    fn accept_map(&self, from: EndpointId, id: ObjectId) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        let route = state.routes.get_mut(&id).ok_or_else(|| Error::NotFound(format!("map {id}")))?;
        route.pending.remove(&from);
        if !route.pending.is_empty() || route.established {
            return Ok(());
        }
        route.established = true;
        let Some(entry) = state.objects.get_mut(&id) else { return Ok(()) };
        entry.snapshot.active = true;
        let snapshot = entry.snapshot.clone();
        info!(map = %id, expression = ?snapshot.prop(Property::Expression), "map established");
        state.broadcast(None, &Message::Upsert(snapshot));
        drop(state);
        self.wake.notify_all();
        Ok(())
    }

    fn release_map(&self, from: EndpointId, id: ObjectId) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        if state.routes.remove(&id).is_none() {
            return Err(Error::NotFound(format!("map {id}")));
        }
        state.objects.shift_remove(&id);
        state.broadcast(Some(from), &Message::Removed { id });
        debug!(map = %id, "map released");
        drop(state);
        self.wake.notify_all();
        Ok(())
    }

    fn send(&self, _from: EndpointId, update: SignalUpdate) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        let input = update.value.as_ref().map(SignalValue::to_f64s);

        let mut deliveries = Vec::new();
        for (map_id, route) in state.routes.iter() {
            if !route.established || route.muted || !route.sources.contains(&update.signal) {
                continue;
            }
            for dst in &route.destinations {
                let Some(entry) = state.objects.get(dst) else { continue };
                let ty = entry
                    .snapshot
                    .prop(Property::Type)
                    .and_then(DataType::from_value)
                    .unwrap_or(DataType::Float32);
                let len = entry
                    .snapshot
                    .prop(Property::Length)
                    .and_then(Value::as_int)
                    .map_or(1, |l| l.max(1) as usize);
                let value = match &input {
                    None => None,
                    Some(x) => match route.expression.evaluate(x, len) {
                        Ok(mut y) => {
                            y.resize(len, 0.0);
                            if y.iter().any(|v| v.is_nan()) {
                                debug!(map = %map_id, "dropping NaN result");
                                continue;
                            }
                            Some(SignalValue::from_f64s(ty, &y))
                        }
                        Err(e) => {
                            warn!(map = %map_id, error = %e, "expression evaluation failed");
                            continue;
                        }
                    },
                };
                deliveries.push((entry.owner, SignalUpdate {
                    signal: *dst,
                    instance: update.instance,
                    value,
                    time: update.time,
                }));
            }
        }

        if deliveries.is_empty() {
            return Ok(());
        }
        for (owner, delivery) in deliveries {
            state.push(owner, Message::Deliver(delivery));
        }
        drop(state);
        self.wake.notify_all();
        Ok(())
    }

    fn receive(&self, endpoint: EndpointId, timeout: Duration) -> Vec<Message> {
        let mut state = self.state.lock();
        if !timeout.is_zero() {
            let deadline = Instant::now() + timeout;
            while !state.shutdown && state.inboxes.get(&endpoint).is_some_and(VecDeque::is_empty) {
                if self.wake.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }
        let batch = self.config.poll_batch;
        match state.inboxes.get_mut(&endpoint) {
            Some(inbox) => {
                let n = inbox.len().min(batch);
                inbox.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wake.notify_all();
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}
