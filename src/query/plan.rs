//! Query plans: relation leaves composed with set algebra and filters.
//!
//! A plan is evaluated against the live directory every time a list needs
//! its members, so it always reflects the current graph.

use indexmap::IndexSet;

use crate::graph::directory::Directory;
use crate::model::*;

/// Logical plan node.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Every live record of a kind; signals narrowed by direction
    Scan { kind: ObjectKind, direction: Direction },
    /// Signals of a device
    SignalsOf { device: ObjectId, direction: Direction },
    /// Maps leaving (outgoing) or entering (incoming) a signal
    MapsOfSignal { signal: ObjectId, direction: Direction },
    /// Maps leaving or entering any signal of a device
    MapsOfDevice { device: ObjectId, direction: Direction },
    /// Source and/or destination signals of a map
    Endpoints { map: ObjectId, location: Location },
    Union(Box<Plan>, Box<Plan>),
    Intersection(Box<Plan>, Box<Plan>),
    Difference(Box<Plan>, Box<Plan>),
    /// Keep records whose property at `key` satisfies `op` against `value`
    Filter { input: Box<Plan>, key: Key, value: Value, op: Operator },
}

impl Plan {
    /// Members in first-seen order.
    pub(crate) fn evaluate(&self, dir: &Directory) -> IndexSet<ObjectId> {
        match self {
            Plan::Scan { kind, direction } => dir
                .live_of_kind(*kind)
                .filter(|r| r.signal().is_none_or(|s| direction.admits(s.direction)))
                .map(|r| r.id)
                .collect(),
            Plan::SignalsOf { device, direction } => {
                dir.signals_of(*device, *direction).map(|r| r.id).collect()
            }
            Plan::MapsOfSignal { signal, direction } => {
                dir.maps_of_signal(*signal, *direction).map(|r| r.id).collect()
            }
            Plan::MapsOfDevice { device, direction } => {
                let signals: Vec<ObjectId> =
                    dir.signals_of(*device, Direction::Any).map(|r| r.id).collect();
                dir.live_of_kind(ObjectKind::Map)
                    .filter(|r| {
                        r.map().is_some_and(|m| signals.iter().any(|s| m.has_signal(*s, *direction)))
                    })
                    .map(|r| r.id)
                    .collect()
            }
            Plan::Endpoints { map, location } => {
                let Some(m) = dir.get_live(*map).and_then(|r| r.map()) else {
                    return IndexSet::new();
                };
                let mut out = IndexSet::new();
                if location.admits(Location::Source) {
                    out.extend(m.sources.iter().copied());
                }
                if location.admits(Location::Destination) {
                    out.extend(m.destinations.iter().copied());
                }
                out.retain(|id| dir.get_live(*id).is_some());
                out
            }
            Plan::Union(a, b) => {
                let mut out = a.evaluate(dir);
                out.extend(b.evaluate(dir));
                out
            }
            Plan::Intersection(a, b) => {
                let right = b.evaluate(dir);
                let mut out = a.evaluate(dir);
                out.retain(|id| right.contains(id));
                out
            }
            Plan::Difference(a, b) => {
                let right = b.evaluate(dir);
                let mut out = a.evaluate(dir);
                out.retain(|id| !right.contains(id));
                out
            }
            Plan::Filter { input, key, value, op } => {
                let mut out = input.evaluate(dir);
                out.retain(|id| dir.get(*id).is_some_and(|r| op.matches(r.props.get(key), value)));
                out
            }
        }
    }
}
