use crate::model::*;
use crate::Result;

use super::{Signal, UserRef};

/// One concurrent value stream of a signal.
///
/// The handle names a slot by id; it stays usable across activations and
/// releases and turns invalid once the slot is removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    signal: Signal,
    id: InstanceId,
}

impl Instance {
    pub(crate) fn new(signal: Signal, id: InstanceId) -> Self {
        Self { signal, id }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn is_valid(&self) -> bool {
        self.signal.with_slot(self.id, |_| ()).is_some()
    }

    pub fn is_active(&self) -> bool {
        self.signal
            .with_slot(self.id, |slot| slot.status.contains(Status::ACTIVE))
            .unwrap_or(false)
    }

    pub fn set_value(&self, value: impl Into<SignalValue>) -> Result<()> {
        self.signal.set_instance_value(self.id, value)
    }

    pub fn value(&self) -> Option<SignalValue> {
        self.signal.with_slot(self.id, |slot| slot.value.clone()).flatten()
    }

    pub fn has_value(&self) -> bool {
        self.signal
            .with_slot(self.id, |slot| slot.value.is_some())
            .unwrap_or(false)
    }

    /// Time of the last value.
    pub fn updated_at(&self) -> Option<Timestamp> {
        self.signal.with_slot(self.id, |slot| slot.time).flatten()
    }

    /// Time this slot was last activated.
    pub fn activated_at(&self) -> Option<Timestamp> {
        self.signal.with_slot(self.id, |slot| slot.activated).flatten()
    }

    pub fn release(&self) -> Result<()> {
        self.signal.release_instance(self.id)
    }

    pub fn remove(&self) -> Result<()> {
        self.signal.remove_instance(self.id)
    }

    pub fn user_ref(&self) -> Option<UserRef> {
        self.signal.with_slot(self.id, |slot| slot.user_ref.clone()).flatten()
    }

    /// Attach opaque data to this instance. Returns false if the slot is gone.
    pub fn set_user_ref(&self, user_ref: Option<UserRef>) -> bool {
        self.signal
            .with_slot_mut(self.id, |slot| slot.user_ref = user_ref)
            .is_some()
    }

    /// Slot status; a removed slot reads REMOVED.
    pub fn status(&self, clear_volatile: bool) -> Status {
        self.signal
            .with_slot_mut(self.id, |slot| slot.status.take(clear_volatile))
            .unwrap_or(Status::REMOVED)
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", crate::object::GraphObject::id(&self.signal), self.id)
    }
}
