//! # Instance Pool
//!
//! Per-signal set of instance slots. A slot is reserved (free), active
//! (carrying a live stream) or released (stream ended, value retained until
//! the slot is reused). Removing a slot destroys it.
//!
//! When every slot is active and another instance is demanded, the signal's
//! stealing mode picks a victim by activation order; without one the demand
//! overflows.

use std::any::Any;
use std::sync::Arc;

use crate::model::{InstanceId, SignalValue, Status, Stealing, Timestamp};

/// Opaque user data attached to an instance.
pub type UserRef = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Reserved,
    Active,
    Released,
}

#[derive(Clone)]
pub struct Slot {
    pub id: InstanceId,
    pub state: SlotState,
    pub user_ref: Option<UserRef>,
    pub value: Option<SignalValue>,
    /// Time of the last value.
    pub time: Option<Timestamp>,
    /// Time of the last activation.
    pub activated: Option<Timestamp>,
    /// Activation order; larger is newer.
    pub seq: u64,
    pub status: Status,
}

impl Slot {
    fn reserved(id: InstanceId) -> Self {
        Self {
            id,
            state: SlotState::Reserved,
            user_ref: None,
            value: None,
            time: None,
            activated: None,
            seq: 0,
            status: Status::STAGED,
        }
    }

    fn is_active(&self) -> bool {
        self.state == SlotState::Active
    }

    /// Reuse this slot under `id` for a fresh stream.
    fn activate(&mut self, id: InstanceId, seq: u64, now: Timestamp) {
        self.id = id;
        self.state = SlotState::Active;
        self.value = None;
        self.time = None;
        self.user_ref = None;
        self.activated = Some(now);
        self.seq = seq;
        self.status = Status::ACTIVE | Status::NEW;
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("has_user_ref", &self.user_ref.is_some())
            .field("value", &self.value)
            .field("seq", &self.seq)
            .field("status", &self.status)
            .finish()
    }
}

/// Outcome of demanding an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    /// The id was already active.
    Existing(InstanceId),
    /// A free slot was activated.
    Activated(InstanceId),
    /// An active slot was evicted to make room.
    Stolen { id: InstanceId, evicted: InstanceId, value: Option<SignalValue> },
    /// No slot available and no stealing mode.
    Overflow,
}

/// Instance slots of one signal.
#[derive(Debug, Clone)]
pub struct InstancePool {
    slots: Vec<Slot>,
    use_instances: bool,
    /// The default slot 0 has never been touched.
    pristine: bool,
    next_seq: u64,
    max: usize,
}

impl InstancePool {
    /// A fresh pool owns one default slot, id 0.
    pub fn new(max: usize) -> Self {
        Self {
            slots: vec![Slot::reserved(InstanceId(0))],
            use_instances: false,
            pristine: true,
            next_seq: 1,
            max: max.max(1),
        }
    }

    pub fn use_instances(&self) -> bool { self.use_instances }
    pub fn len(&self) -> usize { self.slots.len() }
    pub fn is_empty(&self) -> bool { self.slots.is_empty() }

    pub fn get(&self, id: InstanceId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> + '_ {
        self.slots.iter()
    }

    fn lowest_unused_id(&self) -> InstanceId {
        (0..)
            .map(InstanceId)
            .find(|id| self.get(*id).is_none())
            .unwrap_or(InstanceId(u64::MAX))
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Drop the untouched default slot before the first reservation.
    fn switch_to_instances(&mut self) {
        if self.pristine {
            self.slots.clear();
            self.pristine = false;
        }
        self.use_instances = true;
    }

    /// Grow by `n` slots with pool-assigned ids. Returns how many were added.
    pub fn reserve(&mut self, n: usize) -> usize {
        self.switch_to_instances();
        let mut added = 0;
        while added < n && self.slots.len() < self.max {
            let id = self.lowest_unused_id();
            self.slots.push(Slot::reserved(id));
            added += 1;
        }
        added
    }

    /// Grow with explicit ids. Ids already present are skipped.
    pub fn reserve_ids(&mut self, ids: &[InstanceId]) -> usize {
        self.switch_to_instances();
        let mut added = 0;
        for id in ids {
            if self.slots.len() >= self.max {
                break;
            }
            if self.get(*id).is_none() {
                self.slots.push(Slot::reserved(*id));
                added += 1;
            }
        }
        added
    }

    /// Demand instance `id`, activating or stealing a slot as needed.
    pub fn activate(&mut self, id: InstanceId, stealing: Stealing, now: Timestamp) -> Activation {
        self.pristine = false;
        let seq = self.next_seq;
        if let Some(slot) = self.get_mut(id) {
            if slot.is_active() {
                return Activation::Existing(id);
            }
            slot.activate(id, seq, now);
            self.next_seq += 1;
            return Activation::Activated(id);
        }
        self.activate_free(Some(id), stealing, now)
    }

    /// Demand an instance with a pool-assigned id.
    pub fn activate_any(&mut self, stealing: Stealing, now: Timestamp) -> Activation {
        self.pristine = false;
        self.activate_free(None, stealing, now)
    }

    fn activate_free(&mut self, id: Option<InstanceId>, stealing: Stealing, now: Timestamp) -> Activation {
        let free = self
            .free_slot(SlotState::Reserved)
            .or_else(|| self.free_slot(SlotState::Released));
        if let Some(index) = free {
            let id = id.unwrap_or(self.slots[index].id);
            let seq = self.take_seq();
            self.slots[index].activate(id, seq, now);
            return Activation::Activated(id);
        }

        let victim = match stealing {
            Stealing::None => None,
            Stealing::Oldest => self.active_index_by(|a, b| a.seq < b.seq),
            Stealing::Newest => self.active_index_by(|a, b| a.seq > b.seq),
        };
        let Some(index) = victim else { return Activation::Overflow };

        let id = id.unwrap_or_else(|| self.lowest_unused_id());
        let evicted = self.slots[index].id;
        let value = self.slots[index].value.clone();
        let seq = self.take_seq();
        self.slots[index].activate(id, seq, now);
        Activation::Stolen { id, evicted, value }
    }

    /// Lowest-id slot in `state`.
    fn free_slot(&self, state: SlotState) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == state)
            .min_by_key(|(_, s)| s.id)
            .map(|(i, _)| i)
    }

    fn active_index_by(&self, better: impl Fn(&Slot, &Slot) -> bool) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, slot) in self.slots.iter().enumerate().filter(|(_, s)| s.is_active()) {
            match best {
                Some(b) if !better(slot, &self.slots[b]) => {}
                _ => best = Some(i),
            }
        }
        best
    }

    pub fn oldest_active(&self) -> Option<InstanceId> {
        self.active_index_by(|a, b| a.seq < b.seq).map(|i| self.slots[i].id)
    }

    pub fn newest_active(&self) -> Option<InstanceId> {
        self.active_index_by(|a, b| a.seq > b.seq).map(|i| self.slots[i].id)
    }

    /// Store a value on an existing slot. `provenance` is LOCAL_UPDATE or
    /// REMOTE_UPDATE. Returns false if the slot is missing.
    pub fn set_value(&mut self, id: InstanceId, value: SignalValue, now: Timestamp, provenance: Status) -> bool {
        self.pristine = false;
        let Some(slot) = self.get_mut(id) else { return false };
        slot.value = Some(value);
        slot.time = Some(now);
        slot.status |= Status::HAS_VALUE | Status::NEW_VALUE | provenance;
        true
    }

    /// End an active stream. The value is kept; the slot becomes reusable.
    pub fn release(&mut self, id: InstanceId, local: bool) -> bool {
        let Some(slot) = self.get_mut(id) else { return false };
        if !slot.is_active() {
            return false;
        }
        slot.state = SlotState::Released;
        slot.status.remove(Status::ACTIVE);
        slot.status |= Status::STAGED
            | if local { Status::DOWNSTREAM_RELEASE } else { Status::UPSTREAM_RELEASE };
        true
    }

    /// Destroy a slot.
    pub fn remove(&mut self, id: InstanceId) -> Option<Slot> {
        let index = self.slots.iter().position(|s| s.id == id)?;
        self.pristine = false;
        Some(self.slots.remove(index))
    }

    pub fn has_value(&self, id: InstanceId) -> bool {
        self.get(id).is_some_and(|s| s.value.is_some())
    }

    pub fn value(&self, id: InstanceId) -> Option<&SignalValue> {
        self.get(id).and_then(|s| s.value.as_ref())
    }

    /// Ids of slots whose status intersects `mask`.
    pub fn matching(&self, mask: Status) -> Vec<InstanceId> {
        self.slots.iter().filter(|s| s.status.intersects(mask)).map(|s| s.id).collect()
    }

    pub fn count(&self, mask: Status) -> usize {
        self.slots.iter().filter(|s| s.status.intersects(mask)).count()
    }

    pub fn find_user_ref(&self, user_ref: &UserRef) -> Option<InstanceId> {
        self.slots
            .iter()
            .find(|s| s.user_ref.as_ref().is_some_and(|r| Arc::ptr_eq(r, user_ref)))
            .map(|s| s.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc::now() + Duration::seconds(secs)
    }

    #[test]
    fn test_fresh_pool_has_default_slot() {
        let pool = InstancePool::new(16);
        assert_eq!(pool.len(), 1);
        assert!(!pool.use_instances());
        assert!(!pool.has_value(InstanceId(0)));
    }

    #[test]
    fn test_reserve_overwrites_default() {
        let mut pool = InstancePool::new(16);
        assert_eq!(pool.reserve(4), 4);
        assert_eq!(pool.len(), 4);
        let ids: Vec<u64> = pool.slots().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        pool.reserve_ids(&[InstanceId(2), InstanceId(10)]);
        assert_eq!(pool.len(), 5);
    }

    #[test]
    fn test_reserve_respects_capacity() {
        let mut pool = InstancePool::new(3);
        assert_eq!(pool.reserve(10), 3);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_activation_relabels_free_slot() {
        let mut pool = InstancePool::new(16);
        pool.reserve(2);
        assert_eq!(pool.activate(InstanceId(42), Stealing::None, at(0)), Activation::Activated(InstanceId(42)));
        assert_eq!(pool.activate(InstanceId(42), Stealing::None, at(1)), Activation::Existing(InstanceId(42)));
        assert!(pool.get(InstanceId(42)).is_some_and(|s| s.status.contains(Status::ACTIVE)));
    }

    #[test]
    fn test_overflow_without_stealing() {
        let mut pool = InstancePool::new(16);
        pool.reserve(1);
        pool.activate(InstanceId(1), Stealing::None, at(0));
        assert_eq!(pool.activate(InstanceId(2), Stealing::None, at(1)), Activation::Overflow);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_steal_oldest_and_newest() {
        let mut pool = InstancePool::new(16);
        pool.reserve(2);
        pool.activate(InstanceId(10), Stealing::Oldest, at(0));
        pool.activate(InstanceId(11), Stealing::Oldest, at(1));
        pool.set_value(InstanceId(10), SignalValue::from(1), at(2), Status::LOCAL_UPDATE);

        match pool.activate(InstanceId(12), Stealing::Oldest, at(3)) {
            Activation::Stolen { evicted, value, .. } => {
                assert_eq!(evicted, InstanceId(10));
                assert_eq!(value, Some(SignalValue::from(1)));
            }
            other => panic!("expected steal, got {other:?}"),
        }
        assert_eq!(pool.oldest_active(), Some(InstanceId(11)));
        assert_eq!(pool.newest_active(), Some(InstanceId(12)));

        match pool.activate(InstanceId(13), Stealing::Newest, at(4)) {
            Activation::Stolen { evicted, .. } => assert_eq!(evicted, InstanceId(12)),
            other => panic!("expected steal, got {other:?}"),
        }
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_release_then_reuse() {
        let mut pool = InstancePool::new(16);
        pool.reserve(1);
        pool.activate(InstanceId(5), Stealing::None, at(0));
        pool.set_value(InstanceId(5), SignalValue::from(2.5f32), at(0), Status::REMOTE_UPDATE);
        assert!(pool.release(InstanceId(5), false));
        let slot = pool.get(InstanceId(5)).unwrap();
        assert!(slot.status.contains(Status::STAGED | Status::UPSTREAM_RELEASE));
        assert!(!slot.status.contains(Status::ACTIVE));
        assert!(pool.has_value(InstanceId(5)));

        assert_eq!(pool.activate(InstanceId(6), Stealing::None, at(1)), Activation::Activated(InstanceId(6)));
        assert!(!pool.has_value(InstanceId(6)));
    }

    #[test]
    fn test_activate_any_uses_slot_ids() {
        let mut pool = InstancePool::new(16);
        pool.reserve(2);
        assert_eq!(pool.activate_any(Stealing::None, at(0)), Activation::Activated(InstanceId(0)));
        assert_eq!(pool.activate_any(Stealing::None, at(1)), Activation::Activated(InstanceId(1)));
        match pool.activate_any(Stealing::Oldest, at(2)) {
            Activation::Stolen { id, evicted, .. } => {
                assert_eq!(evicted, InstanceId(0));
                assert_eq!(id, InstanceId(2));
            }
            other => panic!("expected steal, got {other:?}"),
        }
    }

    #[test]
    fn test_remove_and_user_ref() {
        let mut pool = InstancePool::new(16);
        pool.reserve(2);
        pool.activate(InstanceId(0), Stealing::None, at(0));
        let data: UserRef = Arc::new("finger");
        pool.get_mut(InstanceId(0)).unwrap().user_ref = Some(data.clone());
        assert_eq!(pool.find_user_ref(&data), Some(InstanceId(0)));
        assert!(pool.remove(InstanceId(0)).is_some());
        assert_eq!(pool.find_user_ref(&data), None);
        assert_eq!(pool.len(), 1);
    }
}
