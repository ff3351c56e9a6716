//! Directory records: the authoritative state behind every handle.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::ObjectSnapshot;
use crate::model::*;
use crate::pool::InstancePool;
use super::Event;

/// Shared listener callback. Invoked on the polling thread with no graph
/// lock held.
pub(crate) type Callback = Arc<Mutex<Box<dyn FnMut(&Event) + Send>>>;

pub(crate) struct Listener {
    pub id: ListenerId,
    pub mask: Status,
    pub callback: Callback,
}

pub(crate) struct Record {
    pub id: ObjectId,
    pub kind: ObjectKind,
    /// Created through this graph rather than learned from a peer.
    pub local: bool,
    /// Device of a signal.
    pub parent: Option<ObjectId>,
    pub props: PropertyStore,
    pub status: Status,
    pub listeners: Vec<Listener>,
    pub data: RecordData,
}

pub(crate) enum RecordData {
    Device,
    Signal(SignalData),
    Map(MapData),
}

pub(crate) struct SignalData {
    pub direction: Direction,
    pub length: usize,
    pub data_type: DataType,
    pub pool: InstancePool,
}

pub(crate) struct MapData {
    pub sources: Vec<ObjectId>,
    pub destinations: Vec<ObjectId>,
    /// Handed to the engine. A local map stays unproposed until its
    /// first push.
    pub proposed: bool,
}

impl Record {
    pub fn new(id: ObjectId, kind: ObjectKind, local: bool, data: RecordData) -> Self {
        Self {
            id,
            kind,
            local,
            parent: None,
            props: PropertyStore::new(),
            status: Status::empty(),
            listeners: Vec::new(),
            data,
        }
    }

    /// Materialize a record announced by a peer.
    pub fn from_snapshot(snapshot: &ObjectSnapshot, max_instances: usize) -> Self {
        let props: PropertyStore = snapshot.props.iter().cloned().collect();
        let data = match snapshot.kind {
            ObjectKind::Device => RecordData::Device,
            ObjectKind::Signal => RecordData::Signal(SignalData {
                direction: props
                    .get(Property::Direction)
                    .and_then(Direction::from_value)
                    .unwrap_or(Direction::Outgoing),
                length: props
                    .get(Property::Length)
                    .and_then(Value::as_int)
                    .map_or(1, |l| l.max(1) as usize),
                data_type: props
                    .get(Property::Type)
                    .and_then(DataType::from_value)
                    .unwrap_or(DataType::Float32),
                pool: InstancePool::new(max_instances),
            }),
            ObjectKind::Map => RecordData::Map(MapData {
                sources: snapshot.sources.clone(),
                destinations: snapshot.destinations.clone(),
                proposed: true,
            }),
        };
        let mut record = Record::new(snapshot.id, snapshot.kind, false, data);
        record.parent = snapshot.parent;
        record.props = props;
        record.status = Status::NEW;
        if snapshot.active {
            record.status |= Status::ACTIVE;
        }
        record
    }

    /// Published view of this record, as announced to peers.
    pub fn snapshot(&self) -> ObjectSnapshot {
        let (sources, destinations) = match &self.data {
            RecordData::Map(m) => (m.sources.clone(), m.destinations.clone()),
            _ => (Vec::new(), Vec::new()),
        };
        ObjectSnapshot {
            id: self.id,
            kind: self.kind,
            parent: self.parent,
            sources,
            destinations,
            props: self.props.published().map(|(k, v)| (k.clone(), v.clone())).collect(),
            active: self.status.contains(Status::ACTIVE),
        }
    }

    pub fn is_gone(&self) -> bool {
        self.status.intersects(Status::REMOVED | Status::EXPIRED)
    }

    pub fn signal(&self) -> Option<&SignalData> {
        match &self.data {
            RecordData::Signal(s) => Some(s),
            _ => None,
        }
    }

    pub fn signal_mut(&mut self) -> Option<&mut SignalData> {
        match &mut self.data {
            RecordData::Signal(s) => Some(s),
            _ => None,
        }
    }

    pub fn map(&self) -> Option<&MapData> {
        match &self.data {
            RecordData::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn map_mut(&mut self) -> Option<&mut MapData> {
        match &mut self.data {
            RecordData::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Known to the engine, so property changes can be published.
    pub fn is_announced(&self) -> bool {
        self.map().is_none_or(|m| m.proposed)
    }

    pub fn name(&self) -> Option<&str> {
        self.props.get(Property::Name).and_then(Value::as_str)
    }

    pub fn stealing(&self) -> Stealing {
        self.props
            .get(Property::Stealing)
            .and_then(Stealing::from_value)
            .unwrap_or(Stealing::None)
    }
}

impl MapData {
    pub fn touches(&self, signal: ObjectId) -> bool {
        self.sources.contains(&signal) || self.destinations.contains(&signal)
    }

    /// Whether `signal` sits on the side of this map that `dir` selects,
    /// seen from the signal: outgoing maps read from it, incoming maps
    /// write to it.
    pub fn has_signal(&self, signal: ObjectId, dir: Direction) -> bool {
        match dir {
            Direction::Outgoing => self.sources.contains(&signal),
            Direction::Incoming => self.destinations.contains(&signal),
            Direction::Any => self.touches(signal),
        }
    }
}
