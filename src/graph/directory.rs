//! Arena of records keyed by object id.

use indexmap::IndexMap;

use crate::model::{Direction, ObjectId, ObjectKind, Status};
use super::record::{Record, RecordData};

#[derive(Default)]
pub(crate) struct Directory {
    records: IndexMap<ObjectId, Record>,
    /// Final status of purged records, so stale handles still read
    /// REMOVED or EXPIRED. Oldest first, capped at `MAX_TOMBSTONES`.
    tombstones: IndexMap<ObjectId, Status>,
}

/// Once evicted, a purged id reads as unknown: handles fall back to
/// REMOVED and a late announcement of it is treated as new.
const MAX_TOMBSTONES: usize = 1024;

impl Directory {
    pub fn get(&self, id: ObjectId) -> Option<&Record> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Record> {
        self.records.get_mut(&id)
    }

    /// A record that has not been removed or expired.
    pub fn get_live(&self, id: ObjectId) -> Option<&Record> {
        self.records.get(&id).filter(|r| !r.is_gone())
    }

    pub fn get_live_mut(&mut self, id: ObjectId) -> Option<&mut Record> {
        self.records.get_mut(&id).filter(|r| !r.is_gone())
    }

    pub fn insert(&mut self, record: Record) {
        self.tombstones.shift_remove(&record.id);
        self.records.insert(record.id, record);
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut Record> + '_ {
        self.records.values_mut()
    }

    pub fn live(&self) -> impl Iterator<Item = &Record> + '_ {
        self.records.values().filter(|r| !r.is_gone())
    }

    pub fn live_of_kind(&self, kind: ObjectKind) -> impl Iterator<Item = &Record> + '_ {
        self.live().filter(move |r| r.kind == kind)
    }

    /// Status of a record, or of its tombstone once purged.
    pub fn status_of(&self, id: ObjectId) -> Option<Status> {
        self.records
            .get(&id)
            .map(|r| r.status)
            .or_else(|| self.tombstones.get(&id).copied())
    }

    /// Live signals of `device` admitted by `dir`.
    pub fn signals_of(&self, device: ObjectId, dir: Direction) -> impl Iterator<Item = &Record> + '_ {
        self.live_of_kind(ObjectKind::Signal).filter(move |r| {
            r.parent == Some(device) && r.signal().is_some_and(|s| dir.admits(s.direction))
        })
    }

    /// Live maps with `signal` on the side selected by `dir`.
    pub fn maps_of_signal(&self, signal: ObjectId, dir: Direction) -> impl Iterator<Item = &Record> + '_ {
        self.live_of_kind(ObjectKind::Map)
            .filter(move |r| r.map().is_some_and(|m| m.has_signal(signal, dir)))
    }

    /// Mark `id` and its dependents gone with `bit` (REMOVED or EXPIRED).
    /// Returns the newly affected records, dependents first.
    pub fn mark_gone(&mut self, id: ObjectId, bit: Status) -> Vec<(ObjectId, ObjectKind)> {
        let Some(root) = self.get_live(id) else { return Vec::new() };
        let signals: Vec<ObjectId> = match root.kind {
            ObjectKind::Device => self
                .live_of_kind(ObjectKind::Signal)
                .filter(|r| r.parent == Some(id))
                .map(|r| r.id)
                .collect(),
            ObjectKind::Signal => vec![id],
            ObjectKind::Map => Vec::new(),
        };
        let mut affected: Vec<(ObjectId, ObjectKind)> = self
            .live_of_kind(ObjectKind::Map)
            .filter(|r| r.map().is_some_and(|m| signals.iter().any(|s| m.touches(*s))))
            .map(|r| (r.id, ObjectKind::Map))
            .collect();
        affected.extend(signals.iter().filter(|s| **s != id).map(|s| (*s, ObjectKind::Signal)));
        affected.push((id, root.kind));

        for (gone, _) in &affected {
            if let Some(record) = self.records.get_mut(gone) {
                record.status |= bit;
                record.status.remove(Status::ACTIVE);
            }
        }
        affected
    }

    /// Drop removed and expired records, keeping tombstones. Returns the
    /// number purged.
    pub fn purge(&mut self) -> usize {
        let gone: Vec<ObjectId> = self.records.values().filter(|r| r.is_gone()).map(|r| r.id).collect();
        for id in &gone {
            if let Some(record) = self.records.shift_remove(id) {
                self.tombstones.insert(*id, record.status.intersection(Status::REMOVED | Status::EXPIRED));
            }
        }
        let excess = self.tombstones.len().saturating_sub(MAX_TOMBSTONES);
        if excess > 0 {
            self.tombstones.drain(..excess);
        }
        gone.len()
    }

    /// Signal records whose pools hold instances, for export.
    pub fn signal_records(&self) -> impl Iterator<Item = &Record> + '_ {
        self.live().filter(|r| matches!(r.data, RecordData::Signal(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::record::{MapData, SignalData};
    use crate::model::DataType;
    use crate::pool::InstancePool;

    fn device(id: u64) -> Record {
        Record::new(ObjectId(id), ObjectKind::Device, true, RecordData::Device)
    }

    fn signal(id: u64, dev: u64, direction: Direction) -> Record {
        let mut r = Record::new(
            ObjectId(id),
            ObjectKind::Signal,
            true,
            RecordData::Signal(SignalData {
                direction,
                length: 1,
                data_type: DataType::Int32,
                pool: InstancePool::new(4),
            }),
        );
        r.parent = Some(ObjectId(dev));
        r
    }

    fn map(id: u64, src: u64, dst: u64) -> Record {
        Record::new(
            ObjectId(id),
            ObjectKind::Map,
            true,
            RecordData::Map(MapData {
                sources: vec![ObjectId(src)],
                destinations: vec![ObjectId(dst)],
                proposed: true,
            }),
        )
    }

    fn sample() -> Directory {
        let mut dir = Directory::default();
        dir.insert(device(1));
        dir.insert(signal(2, 1, Direction::Outgoing));
        dir.insert(signal(3, 1, Direction::Incoming));
        dir.insert(device(4));
        dir.insert(signal(5, 4, Direction::Incoming));
        dir.insert(map(6, 2, 5));
        dir
    }

    #[test]
    fn test_relations() {
        let dir = sample();
        assert_eq!(dir.signals_of(ObjectId(1), Direction::Any).count(), 2);
        assert_eq!(dir.signals_of(ObjectId(1), Direction::Outgoing).count(), 1);
        assert_eq!(dir.maps_of_signal(ObjectId(2), Direction::Outgoing).count(), 1);
        assert_eq!(dir.maps_of_signal(ObjectId(2), Direction::Incoming).count(), 0);
        assert_eq!(dir.maps_of_signal(ObjectId(5), Direction::Incoming).count(), 1);
    }

    #[test]
    fn test_mark_gone_cascades() {
        let mut dir = sample();
        let affected = dir.mark_gone(ObjectId(1), Status::EXPIRED);
        let ids: Vec<u64> = affected.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![6, 2, 3, 1]);
        assert!(dir.get_live(ObjectId(6)).is_none());
        assert!(dir.mark_gone(ObjectId(1), Status::REMOVED).is_empty());

        assert_eq!(dir.purge(), 4);
        assert_eq!(dir.live().count(), 2);
        assert_eq!(dir.status_of(ObjectId(2)), Some(Status::EXPIRED));
    }

    #[test]
    fn test_tombstones_are_capped() {
        let mut dir = Directory::default();
        let total = MAX_TOMBSTONES as u64 + 10;
        for id in 1..=total {
            dir.insert(device(id));
            dir.mark_gone(ObjectId(id), Status::REMOVED);
            assert_eq!(dir.purge(), 1);
        }
        assert_eq!(dir.tombstones.len(), MAX_TOMBSTONES);
        // the oldest are evicted first
        assert_eq!(dir.status_of(ObjectId(1)), None);
        assert_eq!(dir.status_of(ObjectId(10)), None);
        assert_eq!(dir.status_of(ObjectId(11)), Some(Status::REMOVED));
        assert_eq!(dir.status_of(ObjectId(total)), Some(Status::REMOVED));
    }
}
