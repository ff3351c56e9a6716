//! Listener events.

use crate::model::{InstanceId, ObjectId, ObjectKind, SignalValue, Status, Timestamp};
use crate::object::{Device, Instance, Map, Signal};

/// What an event is about.
#[derive(Debug, Clone, PartialEq)]
pub enum Subject {
    Device(Device),
    Signal(Signal),
    Instance(Instance),
    Map(Map),
}

/// One status transition, delivered to listeners during `poll`.
///
/// `status` holds exactly one event bit. `value` is set for value updates
/// and for releases that carry the last value.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub subject: Subject,
    pub status: Status,
    pub value: Option<SignalValue>,
    pub time: Timestamp,
}

impl Event {
    pub fn signal(&self) -> Option<&Signal> {
        match &self.subject {
            Subject::Signal(s) => Some(s),
            _ => None,
        }
    }

    pub fn instance(&self) -> Option<&Instance> {
        match &self.subject {
            Subject::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match &self.subject {
            Subject::Device(_) => ObjectKind::Device,
            Subject::Signal(_) | Subject::Instance(_) => ObjectKind::Signal,
            Subject::Map(_) => ObjectKind::Map,
        }
    }
}

/// Event waiting for dispatch. Holds ids only; handles are built when the
/// event is delivered.
#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub target: Target,
    pub status: Status,
    pub value: Option<SignalValue>,
    pub time: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Object(ObjectId, ObjectKind),
    Instance(ObjectId, InstanceId),
}

impl Target {
    /// The record whose listeners hear this event.
    pub fn record(self) -> ObjectId {
        match self {
            Target::Object(id, _) | Target::Instance(id, _) => id,
        }
    }
}
