use chrono::Utc;
use tracing::debug;

use crate::engine::SignalUpdate;
use crate::graph::record::SignalData;
use crate::graph::{Graph, GraphState, Target};
use crate::model::*;
use crate::pool::{Activation, Slot};
use crate::query::{List, Plan};
use crate::{Error, Result};

use super::{read_prop, Device, GraphObject, Instance, Map, UserRef};

/// A named, typed, fixed-length channel on a device.
///
/// Values live in the signal's instance pool. A signal that never reserved
/// instances keeps a single default slot, id 0, which `set_value` and
/// `value` address.
#[derive(Clone, PartialEq)]
pub struct Signal {
    graph: Graph,
    id: ObjectId,
}

graph_object!(Signal, ObjectKind::Signal);

/// Instance that now carries the stream, the instance evicted for it, and
/// whether the signal is local.
type Demand = (InstanceId, Option<InstanceId>, bool);

impl Signal {
    pub fn device(&self) -> Option<Device> {
        let parent = self.graph.read(|s| s.dir.get_live(self.id).and_then(|r| r.parent))?;
        Some(Device::from_parts(self.graph.clone(), parent))
    }

    pub fn name(&self) -> Option<String> {
        read_prop(&self.graph, self.id, Property::Name, |v| v.as_str().map(str::to_owned))
    }

    pub fn direction(&self) -> Option<Direction> {
        self.with_data(|d| d.direction)
    }

    pub fn length(&self) -> Option<usize> {
        self.with_data(|d| d.length)
    }

    pub fn data_type(&self) -> Option<DataType> {
        self.with_data(|d| d.data_type)
    }

    pub fn stealing(&self) -> Option<Stealing> {
        self.graph.read(|s| s.dir.get_live(self.id).map(|r| r.stealing()))
    }

    /// Choose what happens when every slot is active and another instance
    /// is demanded.
    pub fn set_stealing(&self, mode: Stealing) -> bool {
        self.properties().put(Property::Stealing, mode, true)
    }

    /// Maps reading from (`Outgoing`) or writing to (`Incoming`) this signal.
    pub fn maps(&self, direction: Direction) -> List<Map> {
        List::query(self.graph.clone(), Plan::MapsOfSignal { signal: self.id, direction })
    }

    fn with_data<R>(&self, f: impl FnOnce(&SignalData) -> R) -> Option<R> {
        self.graph.read(|s| s.dir.get_live(self.id).and_then(|r| r.signal()).map(f))
    }

    pub(crate) fn with_slot<R>(&self, id: InstanceId, f: impl FnOnce(&Slot) -> R) -> Option<R> {
        self.graph.read(|s| {
            s.dir
                .get_live(self.id)
                .and_then(|r| r.signal())
                .and_then(|d| d.pool.get(id))
                .map(f)
        })
    }

    pub(crate) fn with_slot_mut<R>(&self, id: InstanceId, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        self.graph.write(|s| {
            s.dir
                .get_live_mut(self.id)
                .and_then(|r| r.signal_mut())
                .and_then(|d| d.pool.get_mut(id))
                .map(f)
        })
    }

    fn send(&self, instance: InstanceId, value: Option<SignalValue>, time: Timestamp) -> Result<()> {
        let update = SignalUpdate { signal: self.id, instance, value, time };
        self.graph.engine().backend().send(self.graph.endpoint(), update)
    }

    fn send_eviction(&self, demand: &Demand, time: Timestamp) -> Result<()> {
        match demand {
            (_, Some(evicted), true) => self.send(*evicted, None, time),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Instance pool
    // ------------------------------------------------------------------------

    /// Add `n` slots with pool-assigned ids. Returns how many were added.
    pub fn reserve_instances(&self, n: usize) -> usize {
        self.reserve_with(|d| d.pool.reserve(n))
    }

    /// Add slots with explicit ids; ids already present are skipped.
    pub fn reserve_instance_ids(&self, ids: &[InstanceId]) -> usize {
        self.reserve_with(|d| d.pool.reserve_ids(ids))
    }

    fn reserve_with(&self, reserve: impl FnOnce(&mut SignalData) -> usize) -> usize {
        let reserved = self.graph.write(|s| {
            let record = s.dir.get_live_mut(self.id)?;
            let data = record.signal_mut()?;
            let added = reserve(data);
            let total = data.pool.len();
            record.props.put(Property::NumInstances, total, true);
            record.props.put(Property::UseInstances, true, true);
            Some((added, total, record.local))
        });
        let Some((added, total, local)) = reserved else { return 0 };
        debug!(signal = %self.id, added, total, "instances reserved");
        if local {
            let changes = vec![
                (Key::from(Property::NumInstances), Some(Value::from(total))),
                (Key::from(Property::UseInstances), Some(Value::Bool(true))),
            ];
            if let Err(e) = self.graph.engine().backend().publish(self.graph.endpoint(), self.id, changes) {
                debug!(signal = %self.id, error = %e, "publish failed");
            }
        }
        added
    }

    /// Activate a slot for `id` (or a pool-assigned id), stealing if the
    /// pool is full. `None` on overflow.
    fn demand(&self, id: Option<InstanceId>, now: Timestamp) -> Option<Demand> {
        let demand = self.graph.write(|s: &mut GraphState| -> Option<Demand> {
            let record = s.dir.get_live_mut(self.id)?;
            let stealing = record.stealing();
            let local = record.local;
            let data = record.signal_mut()?;
            // a plain signal only ever has its default slot
            let id = if data.pool.use_instances() { id } else { Some(InstanceId(0)) };
            let activation = match id {
                Some(id) => data.pool.activate(id, stealing, now),
                None => data.pool.activate_any(stealing, now),
            };
            let evicted = match &activation {
                Activation::Stolen { evicted, .. } => Some(*evicted),
                _ => None,
            };
            let instance = s.settle_activation(self.id, &activation, now)?;
            Some((instance, evicted, local))
        })?;
        if let Err(e) = self.send_eviction(&demand, now) {
            debug!(signal = %self.id, error = %e, "could not release evicted instance");
        }
        Some(demand)
    }

    /// Activate instance `id`, reusing it if already active. On a signal
    /// that never reserved instances this is the default instance,
    /// whatever `id` says.
    pub fn instance(&self, id: impl Into<InstanceId>) -> Option<Instance> {
        let (id, _, _) = self.demand(Some(id.into()), Utc::now())?;
        Some(Instance::new(self.clone(), id))
    }

    /// Activate an instance with a pool-assigned id.
    pub fn new_instance(&self) -> Option<Instance> {
        let (id, _, _) = self.demand(None, Utc::now())?;
        Some(Instance::new(self.clone(), id))
    }

    /// The instance carrying `user_ref`, activating a fresh one for it when
    /// none does.
    pub fn instance_for(&self, user_ref: &UserRef) -> Option<Instance> {
        let found = self.graph.read(|s| {
            s.dir
                .get_live(self.id)
                .and_then(|r| r.signal())
                .and_then(|d| d.pool.find_user_ref(user_ref))
        });
        if let Some(id) = found {
            return Some(Instance::new(self.clone(), id));
        }
        let instance = self.new_instance()?;
        self.with_slot_mut(instance.id(), |slot| slot.user_ref = Some(user_ref.clone()));
        Some(instance)
    }

    pub fn oldest_active_instance(&self) -> Option<Instance> {
        let id = self.with_data(|d| d.pool.oldest_active()).flatten()?;
        Some(Instance::new(self.clone(), id))
    }

    pub fn newest_active_instance(&self) -> Option<Instance> {
        let id = self.with_data(|d| d.pool.newest_active()).flatten()?;
        Some(Instance::new(self.clone(), id))
    }

    /// Slots whose status intersects `mask`.
    pub fn num_instances(&self, mask: Status) -> usize {
        self.with_data(|d| d.pool.count(mask)).unwrap_or(0)
    }

    /// Snapshot of the instances whose status intersects `mask`. The
    /// volatile bits of `mask` are cleared on every instance returned, so
    /// asking again before the next poll yields only new events.
    pub fn instances(&self, mask: Status) -> List<Instance> {
        let consumed = mask.volatile_part();
        let ids = self.graph.write(|s| {
            let Some(data) = s.dir.get_live_mut(self.id).and_then(|r| r.signal_mut()) else {
                return Vec::new();
            };
            let ids = data.pool.matching(mask);
            for id in &ids {
                if let Some(slot) = data.pool.get_mut(*id) {
                    slot.status.remove(consumed);
                }
            }
            ids
        });
        List::snapshot(ids.into_iter().map(|id| Instance::new(self.clone(), id)).collect())
    }

    // ------------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------------

    /// Update the default instance.
    pub fn set_value(&self, value: impl Into<SignalValue>) -> Result<()> {
        self.set_instance_value(InstanceId(0), value)
    }

    /// Update instance `id`, activating it if needed, and push the value
    /// into the maps leaving this signal.
    ///
    /// The value must match the declared type and length. Values
    /// containing NaN are ignored.
    pub fn set_instance_value(&self, id: impl Into<InstanceId>, value: impl Into<SignalValue>) -> Result<()> {
        let id = id.into();
        let value = value.into();
        let now = Utc::now();

        let demand = self.graph.write(|s: &mut GraphState| -> Result<Option<Demand>> {
            let Some(record) = s.dir.get_live_mut(self.id) else { return Ok(None) };
            let stealing = record.stealing();
            let local = record.local;
            let Some(data) = record.signal_mut() else { return Ok(None) };
            check_value(data, &value)?;
            if value.has_nan() {
                return Ok(None);
            }
            let instanced = data.pool.use_instances();
            let wanted = if instanced { id } else { InstanceId(0) };
            let activation = data.pool.activate(wanted, stealing, now);
            let evicted = match &activation {
                Activation::Stolen { evicted, .. } => Some(*evicted),
                _ => None,
            };
            let Some(instance) = s.settle_activation(self.id, &activation, now) else { return Ok(None) };

            let Some(record) = s.dir.get_mut(self.id) else { return Ok(None) };
            if let Some(data) = record.signal_mut() {
                data.pool.set_value(instance, value.clone(), now, Status::LOCAL_UPDATE);
            }
            record.status |= Status::HAS_VALUE | Status::NEW_VALUE | Status::LOCAL_UPDATE;
            let target = if instanced {
                Target::Instance(self.id, instance)
            } else {
                Target::Object(self.id, ObjectKind::Signal)
            };
            s.queue(target, Status::LOCAL_UPDATE, Some(value.clone()), now);
            Ok(Some((instance, evicted, local)))
        })?;

        let Some(demand) = demand else { return Ok(()) };
        if !demand.2 {
            return Ok(());
        }
        self.send_eviction(&demand, now)?;
        self.send(demand.0, Some(value), now)
    }

    /// Last value of the default instance; `None` until one arrives.
    ///
    /// The default instance is id 0. Once instances are reserved it only
    /// exists if id 0 was among them, so a pool reserved with other ids
    /// reads `None` here; read those through `instance` or `instances`.
    pub fn value(&self) -> Option<SignalValue> {
        self.with_slot(InstanceId(0), |slot| slot.value.clone()).flatten()
    }

    /// Last value of the default instance as elements of `T`. Asking for an
    /// element type other than the declared one is an error.
    pub fn value_as<T: Sample>(&self) -> Result<Option<Vec<T>>> {
        let Some(declared) = self.data_type() else { return Ok(None) };
        if declared != T::TYPE {
            return Err(Error::TypeMismatch {
                expected: declared.to_string(),
                got: T::TYPE.to_string(),
            });
        }
        Ok(self.value().and_then(|v| v.as_slice::<T>().map(<[T]>::to_vec)))
    }

    /// Whether instance 0 holds a value; see `value`.
    pub fn has_value(&self) -> bool {
        self.with_data(|d| d.pool.has_value(InstanceId(0))).unwrap_or(false)
    }

    /// End the stream on instance `id`. Its last value is kept.
    pub fn release_instance(&self, id: impl Into<InstanceId>) -> Result<()> {
        let id = id.into();
        let now = Utc::now();
        let local = self.graph.write(|s| {
            let record = s.dir.get_live_mut(self.id)?;
            let local = record.local;
            let data = record.signal_mut()?;
            if !data.pool.release(id, true) {
                return None;
            }
            let last = data.pool.value(id).cloned();
            s.queue(Target::Instance(self.id, id), Status::DOWNSTREAM_RELEASE, last, now);
            Some(local)
        });
        match local {
            Some(true) => self.send(id, None, now),
            _ => Ok(()),
        }
    }

    /// Destroy instance `id`, releasing it first if it is active.
    pub fn remove_instance(&self, id: impl Into<InstanceId>) -> Result<()> {
        let id = id.into();
        if self.with_slot(id, |slot| slot.status.contains(Status::ACTIVE)) == Some(true) {
            self.release_instance(id)?;
        }
        self.graph.write(|s| {
            if let Some(data) = s.dir.get_live_mut(self.id).and_then(|r| r.signal_mut()) {
                data.pool.remove(id);
            }
        });
        Ok(())
    }
}

fn check_value(data: &SignalData, value: &SignalValue) -> Result<()> {
    if value.data_type() != data.data_type {
        return Err(Error::TypeMismatch {
            expected: data.data_type.to_string(),
            got: value.data_type().to_string(),
        });
    }
    if value.len() != data.length {
        return Err(Error::LengthMismatch { expected: data.length, got: value.len() });
    }
    Ok(())
}
