//! # Mapping Engine Boundary
//!
//! This is THE contract between the object model and whatever moves data
//! between peers. Graphs talk to the network only through `MappingEngine`;
//! everything that comes back arrives as a `Message` drained by `receive`.
//!
//! ## Implementations
//!
//! | Engine | Module | Description |
//! |--------|--------|-------------|
//! | `LoopbackEngine` | `loopback` | In-process bus for embedding and tests |

pub mod loopback;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::model::*;
use crate::Result;

pub use loopback::LoopbackEngine;

// ============================================================================
// Wire vocabulary
// ============================================================================

/// One attached graph, as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub u64);

/// Everything a peer needs to materialize an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub id: ObjectId,
    pub kind: ObjectKind,
    /// Owning device of a signal.
    pub parent: Option<ObjectId>,
    /// Map endpoints; empty for devices and signals.
    pub sources: Vec<ObjectId>,
    pub destinations: Vec<ObjectId>,
    pub props: Vec<(Key, Value)>,
    /// Registered devices and established maps are active.
    pub active: bool,
}

impl ObjectSnapshot {
    pub fn prop(&self, key: impl Into<Key>) -> Option<&Value> {
        let key = key.into();
        self.props.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn set_prop(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.props.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.props.push((key, value)),
        }
    }

    pub fn apply(&mut self, changes: &[Change]) {
        for (key, value) in changes {
            match value {
                Some(v) => self.set_prop(key, v.clone()),
                None => self.props.retain(|(k, _)| k != key),
            }
        }
    }
}

/// One value (or release, when `value` is `None`) travelling along a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalUpdate {
    pub signal: ObjectId,
    pub instance: InstanceId,
    pub value: Option<SignalValue>,
    pub time: Timestamp,
}

/// What `receive` hands back to a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// A local device now has a network identity.
    Registered { device: ObjectId, name: String, ordinal: i64, host: String, port: i64 },
    /// An object appeared or was re-announced.
    Upsert(ObjectSnapshot),
    /// Published properties of an object changed.
    Modified { id: ObjectId, changes: Vec<Change> },
    /// A map touching one of our signals awaits our acceptance.
    MapProposed(ObjectSnapshot),
    /// A value (or release) for one of our signals.
    Deliver(SignalUpdate),
    /// An object was withdrawn by its owner.
    Removed { id: ObjectId },
    /// The owner of an object went away without withdrawing it.
    Expired { id: ObjectId },
}

// ============================================================================
// The trait
// ============================================================================

/// Network layer consumed by graphs.
///
/// Implementations must be callable from any thread; graphs drive them from
/// whichever thread polls.
pub trait MappingEngine: Send + Sync + 'static {
    fn config(&self) -> &EngineConfig;

    /// Open a new inbox for a graph.
    fn attach(&self) -> Result<EndpointId>;

    /// Close an inbox. Objects still owned by the endpoint expire.
    fn detach(&self, endpoint: EndpointId);

    /// Allocate a network-wide object id.
    fn next_id(&self) -> ObjectId;

    /// Make a locally created device or signal known to peers.
    fn announce(&self, from: EndpointId, object: ObjectSnapshot) -> Result<()>;

    /// Remove an owned device or signal (and whatever depends on it).
    fn withdraw(&self, from: EndpointId, id: ObjectId) -> Result<()>;

    /// Publish property changes of an object.
    fn publish(&self, from: EndpointId, id: ObjectId, changes: Vec<Change>) -> Result<()>;

    /// Propose a map. It becomes active once every endpoint owner accepts.
    fn request_map(&self, from: EndpointId, map: ObjectSnapshot) -> Result<()>;

    fn accept_map(&self, from: EndpointId, id: ObjectId) -> Result<()>;

    /// Tear a map down. Any endpoint may release any map.
    fn release_map(&self, from: EndpointId, id: ObjectId) -> Result<()>;

    /// Push a value from a local signal into the maps leaving it.
    fn send(&self, from: EndpointId, update: SignalUpdate) -> Result<()>;

    /// Drain pending messages, waiting up to `timeout` for the first one.
    fn receive(&self, endpoint: EndpointId, timeout: Duration) -> Vec<Message>;

    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;
}

// ============================================================================
// Engine handle
// ============================================================================

/// Process-wide engine handle, created once and shared by every graph.
///
/// Lifecycle is explicit: construct with `loopback` or `with_backend`, tear
/// down with `shutdown`. Dropping the last handle does not notify peers.
#[derive(Clone)]
pub struct Engine {
    backend: Arc<dyn MappingEngine>,
}

impl Engine {
    /// In-process loopback engine with a validated configuration.
    pub fn loopback(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_backend(LoopbackEngine::new(config)))
    }

    pub fn loopback_default() -> Self {
        Self::with_backend(LoopbackEngine::new(EngineConfig::default()))
    }

    pub fn with_backend(backend: impl MappingEngine) -> Self {
        Self { backend: Arc::new(backend) }
    }

    pub fn config(&self) -> &EngineConfig {
        self.backend.config()
    }

    pub fn shutdown(&self) {
        tracing::info!("mapping engine shutting down");
        self.backend.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.backend.is_shutdown()
    }

    pub(crate) fn backend(&self) -> &dyn MappingEngine {
        &*self.backend
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", self.config())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl PartialEq for Engine {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_props() {
        let mut snap = ObjectSnapshot {
            id: ObjectId(1),
            kind: ObjectKind::Signal,
            parent: Some(ObjectId(0)),
            sources: vec![],
            destinations: vec![],
            props: vec![(Key::from("name"), Value::from("a"))],
            active: true,
        };
        snap.set_prop(Property::Name, "b");
        snap.apply(&[(Key::from("unit"), Some(Value::from("m")))]);
        assert_eq!(snap.prop("name"), Some(&Value::from("b")));
        assert_eq!(snap.props.len(), 2);
        snap.apply(&[(Key::from("unit"), None)]);
        assert_eq!(snap.prop(Property::Unit), None);
    }

    #[test]
    fn test_engine_handle() {
        let a = Engine::loopback_default();
        let b = a.clone();
        assert_eq!(a, b);
        assert!(Engine::loopback(EngineConfig::default().with_poll_batch(0)).is_err());
        b.shutdown();
        assert!(a.is_shutdown());
    }
}
