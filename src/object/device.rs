use chrono::Utc;
use tracing::info;

use crate::engine::Engine;
use crate::graph::record::{Record, RecordData, SignalData};
use crate::graph::{Graph, Target};
use crate::model::*;
use crate::pool::InstancePool;
use crate::query::{List, Plan};
use crate::{Error, Result};

use super::{read_prop, GraphObject, Map, Signal};

/// A network-addressable container of signals.
///
/// A local device becomes `ready` once the engine has registered it under
/// a unique `name.ordinal`; until then `poll` must be called.
#[derive(Clone, PartialEq)]
pub struct Device {
    graph: Graph,
    id: ObjectId,
}

graph_object!(Device, ObjectKind::Device);

impl Device {
    /// Create a local device on a graph of its own.
    pub fn new(name: &str, engine: &Engine) -> Result<Device> {
        let graph = Graph::new(engine)?;
        Self::with_graph(name, &graph)
    }

    /// Create a local device on an existing graph.
    pub fn with_graph(name: &str, graph: &Graph) -> Result<Device> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidArgument(format!("invalid device name {name:?}")));
        }
        let engine = graph.engine().backend();
        let id = engine.next_id();
        let mut record = Record::new(id, ObjectKind::Device, true, RecordData::Device);
        record.props.put(Property::Name, name, true);
        record.status = Status::NEW | Status::STAGED;

        engine.announce(graph.endpoint(), record.snapshot())?;
        graph.write(|s| {
            s.dir.insert(record);
            s.queue(Target::Object(id, ObjectKind::Device), Status::NEW, None, Utc::now());
        });
        info!(device = %id, name, "device created");
        Ok(Device { graph: graph.clone(), id })
    }

    /// Registered name (`prefix.ordinal`) once ready, the requested prefix
    /// before that.
    pub fn name(&self) -> Option<String> {
        read_prop(&self.graph, self.id, Property::Name, |v| v.as_str().map(str::to_owned))
    }

    pub fn ordinal(&self) -> Option<i64> {
        read_prop(&self.graph, self.id, Property::Ordinal, Value::as_int)
    }

    pub fn ready(&self) -> bool {
        self.graph
            .read(|s| s.dir.get_live(self.id).is_some_and(|r| r.status.contains(Status::ACTIVE)))
    }

    /// Poll this device's graph.
    pub fn poll(&self, timeout_ms: u64) -> usize {
        self.graph.poll(timeout_ms)
    }

    /// Create a local signal. A signal with the same name on this device is
    /// returned as is.
    pub fn add_signal(
        &self,
        direction: Direction,
        name: &str,
        length: usize,
        data_type: DataType,
    ) -> Result<Signal> {
        self.add_signal_with(direction, name, length, data_type, SignalOptions::default())
    }

    /// `add_signal` with unit, range and instances set before the signal
    /// is announced. The options are ignored when the name already exists.
    pub fn add_signal_with(
        &self,
        direction: Direction,
        name: &str,
        length: usize,
        data_type: DataType,
        options: SignalOptions,
    ) -> Result<Signal> {
        if direction == Direction::Any {
            return Err(Error::InvalidArgument("a signal is either incoming or outgoing".into()));
        }
        if length == 0 {
            return Err(Error::InvalidArgument("signal length must be at least 1".into()));
        }
        if name.is_empty() {
            return Err(Error::InvalidArgument("signal name must not be empty".into()));
        }
        if !self.is_valid() || !self.is_local() {
            return Err(Error::NotFound(format!("local device {}", self.id)));
        }
        if let Some(existing) = self.signal(name) {
            return Ok(existing);
        }

        let engine = self.graph.engine().backend();
        let max_instances = engine.config().max_instances;
        let id = engine.next_id();
        let mut record = Record::new(
            id,
            ObjectKind::Signal,
            true,
            RecordData::Signal(SignalData {
                direction,
                length,
                data_type,
                pool: InstancePool::new(max_instances),
            }),
        );
        record.parent = Some(self.id);
        record.props.put(Property::Name, name, true);
        record.props.put(Property::Direction, direction, true);
        record.props.put(Property::Length, length, true);
        record.props.put(Property::Type, data_type, true);
        record.props.put(Property::NumInstances, 1, true);
        record.props.put(Property::UseInstances, false, true);
        record.props.put(Property::Stealing, Stealing::None, true);
        options.apply(&mut record);
        record.status = Status::NEW | Status::ACTIVE;

        engine.announce(self.graph.endpoint(), record.snapshot())?;
        self.graph.write(|s| {
            s.dir.insert(record);
            s.queue(Target::Object(id, ObjectKind::Signal), Status::NEW, None, Utc::now());
        });
        info!(device = %self.id, signal = %id, name, %direction, length, %data_type, "signal created");
        Ok(Signal::from_parts(self.graph.clone(), id))
    }

    /// Withdraw one of this device's signals and the maps touching it.
    pub fn remove_signal(&self, signal: &Signal) -> Result<()> {
        let sid = signal.id();
        let owned = self.graph.read(|s| {
            s.dir
                .get_live(sid)
                .is_some_and(|r| r.local && r.parent == Some(self.id))
        });
        if !owned {
            return Err(Error::NotFound(format!("signal {sid} on device {}", self.id)));
        }
        self.graph.engine().backend().withdraw(self.graph.endpoint(), sid)?;
        let gone = self.graph.write(|s| s.mark_gone(sid, Status::REMOVED, Utc::now()));
        info!(signal = %sid, cascade = gone, "signal removed");
        Ok(())
    }

    pub fn signals(&self, direction: Direction) -> List<Signal> {
        List::query(self.graph.clone(), Plan::SignalsOf { device: self.id, direction })
    }

    /// The signal called `name` on this device.
    pub fn signal(&self, name: &str) -> Option<Signal> {
        let id = self.graph.read(|s| {
            s.dir
                .signals_of(self.id, Direction::Any)
                .find(|r| r.name() == Some(name))
                .map(|r| r.id)
        })?;
        Some(Signal::from_parts(self.graph.clone(), id))
    }

    /// Maps leaving (`Outgoing`) or entering (`Incoming`) any signal of
    /// this device.
    pub fn maps(&self, direction: Direction) -> List<Map> {
        List::query(self.graph.clone(), Plan::MapsOfDevice { device: self.id, direction })
    }

    /// Withdraw a local device with all of its signals and their maps.
    /// Peers observe REMOVED.
    pub fn free(self) -> Result<()> {
        if !self.is_local() || !self.is_valid() {
            return Err(Error::NotFound(format!("local device {}", self.id)));
        }
        self.graph.engine().backend().withdraw(self.graph.endpoint(), self.id)?;
        let gone = self.graph.write(|s| s.mark_gone(self.id, Status::REMOVED, Utc::now()));
        info!(device = %self.id, cascade = gone, "device freed");
        Ok(())
    }
}

/// Settings a signal can be created with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalOptions {
    pub unit: Option<String>,
    pub min: Option<Value>,
    pub max: Option<Value>,
    /// Reserve this many instances up front.
    pub num_instances: Option<usize>,
}

impl SignalOptions {
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Bounds, either scalars or one entry per element.
    pub fn range(mut self, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        self.min = Some(min.into());
        self.max = Some(max.into());
        self
    }

    pub fn instances(mut self, n: usize) -> Self {
        self.num_instances = Some(n);
        self
    }

    fn apply(self, record: &mut Record) {
        if let Some(unit) = self.unit {
            record.props.put(Property::Unit, unit, true);
        }
        if let Some(min) = self.min {
            record.props.put(Property::Min, min, true);
        }
        if let Some(max) = self.max {
            record.props.put(Property::Max, max, true);
        }
        let Some(n) = self.num_instances.filter(|n| *n > 0) else { return };
        let Some(data) = record.signal_mut() else { return };
        data.pool.reserve(n);
        let total = data.pool.len();
        record.props.put(Property::NumInstances, total, true);
        record.props.put(Property::UseInstances, true, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_becomes_ready_after_poll() {
        let engine = Engine::loopback_default();
        let dev = Device::new("synth", &engine).unwrap();
        assert!(!dev.ready());
        assert_eq!(dev.name().as_deref(), Some("synth"));

        dev.poll(10);
        assert!(dev.ready());
        assert_eq!(dev.name().as_deref(), Some("synth.1"));
        assert_eq!(dev.ordinal(), Some(1));
        assert!(dev.properties().contains_key(Property::Port));
    }

    #[test]
    fn test_add_signal_validates() {
        let engine = Engine::loopback_default();
        let dev = Device::new("synth", &engine).unwrap();
        assert!(matches!(
            dev.add_signal(Direction::Any, "s", 1, DataType::Int32),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            dev.add_signal(Direction::Outgoing, "s", 0, DataType::Int32),
            Err(Error::InvalidArgument(_))
        ));

        let a = dev.add_signal(Direction::Outgoing, "s", 2, DataType::Float64).unwrap();
        let b = dev.add_signal(Direction::Outgoing, "s", 2, DataType::Float64).unwrap();
        assert_eq!(a, b);
        assert_eq!(dev.signals(Direction::Any).len(), 1);
    }

    #[test]
    fn test_add_signal_with_options() {
        let engine = Engine::loopback_default();
        let dev = Device::new("synth", &engine).unwrap();
        let options = SignalOptions::default().unit("Hz").range(2, 10).instances(3);
        let sig = dev
            .add_signal_with(Direction::Incoming, "pitch", 1, DataType::Float32, options)
            .unwrap();

        let props = sig.properties();
        assert_eq!(props.get(Property::Unit), Some(Value::from("Hz")));
        assert_eq!(props.get(Property::Min), Some(Value::Int(2)));
        assert_eq!(props.get(Property::Max), Some(Value::Int(10)));
        assert_eq!(props.get(Property::NumInstances), Some(Value::Int(3)));
        assert_eq!(props.get(Property::UseInstances), Some(Value::Bool(true)));
        assert_eq!(sig.num_instances(Status::ANY), 3);

        let plain = dev
            .add_signal_with(Direction::Outgoing, "gate", 1, DataType::Int32, SignalOptions::default().instances(0))
            .unwrap();
        assert_eq!(plain.properties().get(Property::UseInstances), Some(Value::Bool(false)));
        assert_eq!(plain.properties().get(Property::Unit), None);
    }

    #[test]
    fn test_signals_by_direction() {
        let engine = Engine::loopback_default();
        let dev = Device::new("synth", &engine).unwrap();
        dev.add_signal(Direction::Outgoing, "out1", 1, DataType::Int32).unwrap();
        dev.add_signal(Direction::Outgoing, "out2", 1, DataType::Int32).unwrap();
        dev.add_signal(Direction::Incoming, "in1", 1, DataType::Int32).unwrap();

        assert_eq!(dev.signals(Direction::Outgoing).len(), 2);
        assert_eq!(dev.signals(Direction::Incoming).len(), 1);
        assert_eq!(dev.signals(Direction::Any).len(), 3);
        assert!(dev.signal("in1").is_some());
        assert!(dev.signal("in2").is_none());
    }

    #[test]
    fn test_free_cascades_to_signals() {
        let engine = Engine::loopback_default();
        let dev = Device::new("synth", &engine).unwrap();
        let sig = dev.add_signal(Direction::Outgoing, "out", 1, DataType::Int32).unwrap();
        let graph = dev.graph().clone();
        dev.free().unwrap();

        assert!(!sig.is_valid());
        assert!(graph.devices().is_empty());
        assert!(graph.signals(Direction::Any).is_empty());
    }
}
