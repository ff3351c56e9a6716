//! # Object Handles
//!
//! `Device`, `Signal` and `Map` are thin handles: a `Graph` and an id. Every
//! accessor looks the record up in the graph's arena, so a handle never
//! dangles. Once its record is gone, reads come back empty and writes do
//! nothing.
//!
//! `Instance` is a handle to one slot of a signal's instance pool.

// ============================================================================
// Shared handle plumbing
// ============================================================================

macro_rules! graph_object {
    ($ty:ident, $kind:expr) => {
        impl $crate::object::GraphObject for $ty {
            const KIND: $crate::model::ObjectKind = $kind;

            fn from_parts(graph: $crate::graph::Graph, id: $crate::model::ObjectId) -> Self {
                Self { graph, id }
            }

            fn graph(&self) -> &$crate::graph::Graph {
                &self.graph
            }

            fn id(&self) -> $crate::model::ObjectId {
                self.id
            }
        }

        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($ty)).field("id", &self.id).finish()
            }
        }
    };
}

mod device;
mod signal;
mod instance;
mod map;

use tracing::{debug, warn};

use crate::graph::{Event, Graph};
use crate::model::*;
use crate::Result;

pub use crate::pool::UserRef;
pub use device::{Device, SignalOptions};
pub use instance::Instance;
pub use map::Map;
pub use signal::Signal;

// ============================================================================
// GraphObject
// ============================================================================

/// Behaviour shared by every directory entry.
pub trait GraphObject: Clone + Sized {
    const KIND: ObjectKind;

    #[doc(hidden)]
    fn from_parts(graph: Graph, id: ObjectId) -> Self;

    fn graph(&self) -> &Graph;

    fn id(&self) -> ObjectId;

    /// The record exists and has not been removed or expired.
    fn is_valid(&self) -> bool {
        let id = self.id();
        self.graph()
            .read(|s| s.dir.get_live(id).is_some_and(|r| r.kind == Self::KIND))
    }

    /// Created through this graph rather than learned from a peer.
    fn is_local(&self) -> bool {
        let id = self.id();
        self.graph().read(|s| s.dir.get(id).is_some_and(|r| r.local))
    }

    fn properties(&self) -> Properties<'_> {
        Properties { graph: self.graph(), id: self.id() }
    }

    /// Current status. With `clear_volatile` the one-shot bits are cleared
    /// in the same step, so each event is observed once.
    ///
    /// A purged record reads as the REMOVED or EXPIRED it ended with.
    fn status(&self, clear_volatile: bool) -> Status {
        let id = self.id();
        self.graph().write(|s| match s.dir.get_mut(id) {
            Some(record) => record.status.take(clear_volatile),
            None => s.dir.status_of(id).unwrap_or(Status::REMOVED),
        })
    }

    /// Publish every staged property write in one change set. The first
    /// push of a staged map proposes it, staged writes included.
    fn push(&self) -> Result<()> {
        let id = self.id();
        if Self::KIND == ObjectKind::Map && map::propose(self.graph(), id)? {
            return Ok(());
        }
        let changes = self
            .graph()
            .write(|s| s.dir.get_live_mut(id).map(|r| r.props.take_staged()))
            .unwrap_or_default();
        if changes.is_empty() {
            return Ok(());
        }
        debug!(object = %id, changes = changes.len(), "pushing staged properties");
        let graph = self.graph();
        graph.engine().backend().publish(graph.endpoint(), id, changes)
    }

    /// Listen for REMOTE_UPDATE events on this object.
    fn add_listener(&self, f: impl FnMut(&Event) + Send + 'static) -> ListenerId {
        self.add_listener_for(Status::REMOTE_UPDATE, f)
    }

    /// Listen for the events selected by `events`.
    fn add_listener_for(&self, events: Status, f: impl FnMut(&Event) + Send + 'static) -> ListenerId {
        self.graph().add_record_listener(self.id(), events, Box::new(f))
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.graph().remove_listener(id)
    }
}

// ============================================================================
// Properties
// ============================================================================

/// Property view of one object.
pub struct Properties<'a> {
    graph: &'a Graph,
    id: ObjectId,
}

impl Properties<'_> {
    pub fn get(&self, key: impl Into<Key>) -> Option<Value> {
        let key = key.into();
        self.graph
            .read(|s| s.dir.get_live(self.id).and_then(|r| r.props.get(&key).cloned()))
    }

    /// Write a property. Published writes reach peers right away; the rest
    /// wait for `push`. Returns true when the visible value changed.
    ///
    /// Refused, returning false: writes to properties the graph maintains
    /// (a signal's length, type, name, ...), enumerated values naming no
    /// variant, and map expressions that do not parse. Enumerated values
    /// are stored as their integer code.
    pub fn put(&self, key: impl Into<Key>, value: impl Into<Value>, publish: bool) -> bool {
        let key = key.into();
        let Some((kind, announced)) = self.writable(&key) else { return false };
        let value = match key.property() {
            Some(property) => match property.canonical(value.into()) {
                Some(value) => value,
                None => {
                    debug!(object = %self.id, %key, "ignoring value outside the property's variants");
                    return false;
                }
            },
            None => value.into(),
        };
        if kind == ObjectKind::Map && key.property() == Some(Property::Expression) {
            let depth = self.graph.engine().config().expression_depth;
            let parsed = value
                .as_str()
                .ok_or_else(|| crate::Error::Expression("expression must be a string".into()))
                .and_then(|src| crate::expr::parse(src, depth));
            if let Err(e) = parsed {
                warn!(map = %self.id, error = %e, "rejecting map expression");
                return false;
            }
        }

        let changed = self.graph.write(|s| match s.dir.get_live_mut(self.id) {
            Some(record) => record.props.put(&key, value.clone(), publish),
            None => false,
        });
        if publish && announced {
            let engine = self.graph.engine().backend();
            if let Err(e) = engine.publish(self.graph.endpoint(), self.id, vec![(key, Some(value))]) {
                debug!(object = %self.id, error = %e, "publish failed");
            }
        }
        changed
    }

    /// Stage a write until the next `push`.
    pub fn put_staged(&self, key: impl Into<Key>, value: impl Into<Value>) -> bool {
        self.put(key, value, false)
    }

    pub fn remove(&self, key: impl Into<Key>, publish: bool) -> bool {
        let key = key.into();
        let Some((_, announced)) = self.writable(&key) else { return false };
        let present = self.graph.write(|s| match s.dir.get_live_mut(self.id) {
            Some(record) => record.props.remove(&key, publish),
            None => false,
        });
        if present && publish && announced {
            let engine = self.graph.engine().backend();
            if let Err(e) = engine.publish(self.graph.endpoint(), self.id, vec![(key, None)]) {
                debug!(object = %self.id, error = %e, "publish failed");
            }
        }
        present
    }

    pub fn contains_key(&self, key: impl Into<Key>) -> bool {
        let key = key.into();
        self.graph
            .read(|s| s.dir.get_live(self.id).is_some_and(|r| r.props.contains_key(&key)))
    }

    pub fn contains_value(&self, value: impl Into<Value>) -> bool {
        let value = value.into();
        self.graph
            .read(|s| s.dir.get_live(self.id).is_some_and(|r| r.props.contains_value(&value)))
    }

    pub fn len(&self) -> usize {
        self.graph.read(|s| s.dir.get_live(self.id).map_or(0, |r| r.props.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<Key> {
        self.graph
            .read(|s| s.dir.get_live(self.id).map(|r| r.props.keys().cloned().collect()))
            .unwrap_or_default()
    }

    /// Visible entries, staged writes included.
    pub fn to_vec(&self) -> Vec<(Key, Value)> {
        self.graph
            .read(|s| {
                s.dir
                    .get_live(self.id)
                    .map(|r| r.props.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            })
            .unwrap_or_default()
    }

    /// Kind of the live record when `key` may be changed on it, and
    /// whether the engine knows the record yet.
    fn writable(&self, key: &Key) -> Option<(ObjectKind, bool)> {
        let found = self.graph.read(|s| s.dir.get_live(self.id).map(|r| (r.kind, r.is_announced())));
        let Some((kind, announced)) = found else {
            debug!(object = %self.id, %key, "ignoring write to a removed object");
            return None;
        };
        if key.property().is_some_and(|p| p.is_read_only(kind)) {
            debug!(object = %self.id, %key, "ignoring write to a read-only property");
            return None;
        }
        Some((kind, announced))
    }

    /// Drop staged writes without publishing them.
    pub fn clear_staged(&self) {
        self.graph.write(|s| {
            if let Some(record) = s.dir.get_live_mut(self.id) {
                record.props.clear_staged();
            }
        });
    }
}


/// Read one property of a live record.
pub(crate) fn read_prop<T>(graph: &Graph, id: ObjectId, key: Property, f: impl FnOnce(&Value) -> Option<T>) -> Option<T> {
    graph.read(|s| s.dir.get_live(id).and_then(|r| r.props.get(key)).and_then(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    #[test]
    fn test_staged_writes_wait_for_push() {
        let engine = Engine::loopback_default();
        let dev = Device::new("staging", &engine).unwrap();
        let props = dev.properties();

        assert!(props.put_staged("color", "red"));
        assert!(props.put_staged(Property::Description, "test rig"));
        assert_eq!(props.get("color"), Some(Value::from("red")));
        assert!(dev.graph().read(|s| s.dir.get(dev.id()).unwrap().props.has_staged()));

        dev.push().unwrap();
        assert!(!dev.graph().read(|s| s.dir.get(dev.id()).unwrap().props.has_staged()));
        assert_eq!(props.get("description"), Some(Value::from("test rig")));
    }

    #[test]
    fn test_clear_staged_restores_published() {
        let engine = Engine::loopback_default();
        let dev = Device::new("staging", &engine).unwrap();
        let props = dev.properties();
        props.put("rate", 10, true);
        props.put_staged("rate", 20);
        assert_eq!(props.get("rate"), Some(Value::Int(20)));
        props.clear_staged();
        assert_eq!(props.get("rate"), Some(Value::Int(10)));
    }

    #[test]
    fn test_missing_key_is_absent() {
        let engine = Engine::loopback_default();
        let dev = Device::new("absent", &engine).unwrap();
        assert_eq!(dev.properties().get("nothing here"), None);
        assert!(!dev.properties().contains_key(Property::Version));
        assert!(!dev.properties().remove("nothing here", true));
    }

    #[test]
    fn test_aliases_share_a_slot() {
        let engine = Engine::loopback_default();
        let dev = Device::new("alias", &engine).unwrap();
        let sig = dev.add_signal(Direction::Outgoing, "out", 1, DataType::Float32).unwrap();
        assert_eq!(sig.properties().get("len"), sig.properties().get(Property::Length));
        assert_eq!(sig.properties().get("dir"), Some(Value::Int(Direction::Outgoing.code())));
        assert!(sig.properties().contains_value(Direction::Outgoing));
    }

    #[test]
    fn test_read_only_signal_properties() {
        let engine = Engine::loopback_default();
        let dev = Device::new("fixed", &engine).unwrap();
        let sig = dev.add_signal(Direction::Outgoing, "out", 1, DataType::Float32).unwrap();
        let props = sig.properties();

        assert!(!props.put(Property::Length, 3, true));
        assert!(!props.put("type", "int32", true));
        assert!(!props.put(Property::Name, "renamed", true));
        assert!(!props.put(Property::NumInstances, 8, true));
        assert!(!props.remove(Property::Direction, true));
        assert_eq!(props.get(Property::Length), Some(Value::Int(1)));
        assert_eq!(sig.name().as_deref(), Some("out"));
        sig.set_value(0.5f32).unwrap();
        assert!(matches!(sig.set_value([1.0f32, 2.0, 3.0]), Err(crate::Error::LengthMismatch { .. })));

        assert!(props.put(Property::Unit, "Hz", true));
        assert!(!dev.properties().put(Property::Ordinal, 7, true));
    }

    #[test]
    fn test_enumerated_writes_store_codes() {
        let engine = Engine::loopback_default();
        let dev = Device::new("codes", &engine).unwrap();
        let sig = dev.add_signal(Direction::Incoming, "in", 1, DataType::Int32).unwrap();

        assert!(sig.properties().put("steal_mode", "newest", true));
        assert_eq!(sig.properties().get(Property::Stealing), Some(Value::Int(Stealing::Newest.code())));
        assert_eq!(sig.stealing(), Some(Stealing::Newest));

        assert!(!sig.properties().put(Property::Stealing, "loudest", true));
        assert!(!sig.properties().put(Property::Stealing, 1.5, true));
        assert_eq!(sig.stealing(), Some(Stealing::Newest));
    }

    #[test]
    fn test_invalid_handle_reads_empty() {
        let engine = Engine::loopback_default();
        let dev = Device::new("gone", &engine).unwrap();
        let sig = dev.add_signal(Direction::Outgoing, "out", 1, DataType::Int32).unwrap();
        dev.remove_signal(&sig).unwrap();

        assert!(!sig.is_valid());
        assert_eq!(sig.properties().get(Property::Name), None);
        assert!(sig.properties().is_empty());
        assert!(!sig.properties().put("x", 1, true));
        assert!(sig.status(false).contains(Status::REMOVED));
    }
}
