use chrono::Utc;
use tracing::{debug, info};

use crate::graph::record::{MapData, Record, RecordData};
use crate::graph::{Graph, Target};
use crate::model::*;
use crate::query::{List, Plan};
use crate::{Error, Result};

use super::{read_prop, GraphObject, Signal};

/// A routing rule from source signals to destination signals.
///
/// A new map is staged until every device owning one of its signals has
/// accepted it; `ready` turns true after the poll that observes that.
#[derive(Clone, PartialEq)]
pub struct Map {
    graph: Graph,
    id: ObjectId,
}

graph_object!(Map, ObjectKind::Map);

impl Map {
    /// Propose a map right away: `staged` followed by `push`.
    pub fn new(sources: &[&Signal], destinations: &[&Signal]) -> Result<Map> {
        let map = Self::staged(sources, destinations)?;
        if let Err(e) = map.push() {
            map.graph.write(|s| s.mark_gone(map.id, Status::REMOVED, Utc::now()));
            return Err(e);
        }
        Ok(map)
    }

    /// Build a map locally without proposing it. Signals are resolved by
    /// id in the graph of the first source, which must already know every
    /// endpoint. Properties written before the first `push` travel with
    /// the proposal.
    pub fn staged(sources: &[&Signal], destinations: &[&Signal]) -> Result<Map> {
        let (Some(first), false) = (sources.first(), destinations.is_empty()) else {
            return Err(Error::InvalidArgument("a map needs sources and destinations".into()));
        };
        let graph = first.graph().clone();
        let src: Vec<ObjectId> = sources.iter().map(|s| s.id()).collect();
        let dst: Vec<ObjectId> = destinations.iter().map(|s| s.id()).collect();
        if let Some(overlap) = src.iter().find(|s| dst.contains(s)) {
            return Err(Error::InvalidArgument(format!("signal {overlap} is both source and destination")));
        }
        let missing = graph.read(|s| {
            src.iter()
                .chain(&dst)
                .find(|id| s.dir.get_live(**id).is_none_or(|r| r.kind != ObjectKind::Signal))
                .copied()
        });
        if let Some(missing) = missing {
            return Err(Error::NotFound(format!("signal {missing}")));
        }

        let engine = graph.engine().backend();
        let id = engine.next_id();
        let mut record = Record::new(
            id,
            ObjectKind::Map,
            true,
            RecordData::Map(MapData { sources: src, destinations: dst, proposed: false }),
        );
        record.props.put(Property::Expression, engine.config().default_expression.as_str(), true);
        record.props.put(Property::Protocol, Protocol::Udp, true);
        record.props.put(Property::ProcessLocation, Location::Source, true);
        record.props.put(Property::Muted, false, true);
        record.props.put(Property::NumSignals, sources.len() + destinations.len(), true);
        record.status = Status::NEW | Status::STAGED;

        graph.write(|s| {
            s.dir.insert(record);
            s.queue(Target::Object(id, ObjectKind::Map), Status::NEW, None, Utc::now());
        });
        debug!(map = %id, "map staged");
        Ok(Map { graph, id })
    }

    /// Stage a map described by an expression whose endpoints are
    /// placeholders: `%y` takes the next signal as the destination, `%x`
    /// the next one as a source. `Map::from_expression("%y=(%x+100)*2",
    /// &[&input, &output])` maps `output` into `input`.
    pub fn from_expression(template: &str, signals: &[&Signal]) -> Result<Map> {
        let mut expression = String::with_capacity(template.len());
        let mut sources: Vec<&Signal> = Vec::new();
        let mut destination: Option<&Signal> = None;
        let mut next = signals.iter();
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            if c != '%' {
                expression.push(c);
                continue;
            }
            let role = chars.next();
            let Some(&signal) = next.next() else {
                return Err(Error::InvalidArgument(format!("no signal left for the placeholder in {template:?}")));
            };
            match role {
                Some('x') => {
                    if !sources.contains(&signal) {
                        sources.push(signal);
                    }
                    expression.push('x');
                }
                Some('y') => {
                    if destination.is_some_and(|d| d != signal) {
                        return Err(Error::InvalidArgument("an expression writes a single destination".into()));
                    }
                    destination = Some(signal);
                    expression.push('y');
                }
                other => {
                    let shown = other.map(String::from).unwrap_or_default();
                    return Err(Error::InvalidArgument(format!("unknown placeholder '%{shown}'")));
                }
            }
        }
        if next.next().is_some() {
            return Err(Error::InvalidArgument(format!("more signals than placeholders in {template:?}")));
        }
        let Some(destination) = destination else {
            return Err(Error::InvalidArgument(format!("no destination placeholder in {template:?}")));
        };

        let first = sources.first().unwrap_or(&destination);
        crate::expr::parse(&expression, first.graph().engine().config().expression_depth)?;
        let map = Self::staged(&sources, &[destination])?;
        map.graph.write(|s| {
            if let Some(record) = s.dir.get_live_mut(map.id) {
                record.props.put(Property::Expression, expression.as_str(), true);
            }
        });
        Ok(map)
    }

    pub fn ready(&self) -> bool {
        self.graph
            .read(|s| s.dir.get_live(self.id).is_some_and(|r| r.status.contains(Status::ACTIVE)))
    }

    /// Source and/or destination signals.
    pub fn signals(&self, location: Location) -> List<Signal> {
        List::query(self.graph.clone(), Plan::Endpoints { map: self.id, location })
    }

    pub fn expression(&self) -> Option<String> {
        read_prop(&self.graph, self.id, Property::Expression, |v| v.as_str().map(str::to_owned))
    }

    /// Replace the expression, checking its syntax first.
    pub fn set_expression(&self, source: &str) -> Result<()> {
        crate::expr::parse(source, self.graph.engine().config().expression_depth)?;
        self.properties().put(Property::Expression, source, true);
        Ok(())
    }

    pub fn is_muted(&self) -> bool {
        read_prop(&self.graph, self.id, Property::Muted, Value::as_bool).unwrap_or(false)
    }

    /// Stop (or resume) routing without tearing the map down.
    pub fn set_muted(&self, muted: bool) -> bool {
        self.properties().put(Property::Muted, muted, true)
    }

    /// Tear the map down for every peer.
    pub fn release(self) -> Result<()> {
        let Some(proposed) = self.graph.read(|s| s.dir.get_live(self.id).map(|r| r.is_announced())) else {
            return Ok(());
        };
        if proposed {
            self.graph.engine().backend().release_map(self.graph.endpoint(), self.id)?;
        }
        self.graph.write(|s| s.mark_gone(self.id, Status::REMOVED, Utc::now()));
        info!(map = %self.id, "map released");
        Ok(())
    }
}

/// Hand a staged local map to the engine. `Ok(false)` when `id` is not
/// one, so the caller pushes properties as usual.
pub(super) fn propose(graph: &Graph, id: ObjectId) -> Result<bool> {
    let snapshot = graph.write(|s| {
        let record = s.dir.get_live_mut(id).filter(|r| r.local && !r.is_announced())?;
        record.props.take_staged();
        Some(record.snapshot())
    });
    let Some(snapshot) = snapshot else { return Ok(false) };
    let (sources, destinations) = (snapshot.sources.len(), snapshot.destinations.len());

    graph.engine().backend().request_map(graph.endpoint(), snapshot)?;
    graph.write(|s| {
        if let Some(map) = s.dir.get_mut(id).and_then(Record::map_mut) {
            map.proposed = true;
        }
    });
    info!(map = %id, sources, destinations, "map requested");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::object::Device;

    fn pair() -> (Device, Signal, Signal) {
        let engine = Engine::loopback_default();
        let dev = Device::new("pair", &engine).unwrap();
        let out = dev.add_signal(Direction::Outgoing, "out", 1, DataType::Float32).unwrap();
        let inp = dev.add_signal(Direction::Incoming, "in", 1, DataType::Float32).unwrap();
        (dev, out, inp)
    }

    #[test]
    fn test_map_becomes_ready() {
        let (dev, out, inp) = pair();
        let map = Map::new(&[&out], &[&inp]).unwrap();
        assert!(!map.ready());
        assert!(map.status(false).contains(Status::STAGED));
        assert_eq!(map.expression().as_deref(), Some("y=x"));

        for _ in 0..10 {
            if map.ready() {
                break;
            }
            dev.poll(10);
        }
        assert!(map.ready());
        assert!(!map.status(false).contains(Status::STAGED));
        assert_eq!(out.maps(Direction::Outgoing).len(), 1);
        assert_eq!(inp.maps(Direction::Incoming).len(), 1);
        assert!(out.maps(Direction::Incoming).is_empty());
        assert_eq!(map.signals(Location::Source).to_vec(), vec![out.clone()]);
        assert_eq!(map.signals(Location::Any).len(), 2);
    }

    #[test]
    fn test_map_arguments_are_checked() {
        let (_dev, out, inp) = pair();
        assert!(matches!(Map::new(&[], &[&inp]), Err(Error::InvalidArgument(_))));
        assert!(matches!(Map::new(&[&out], &[&out]), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_bad_expression_is_refused() {
        let (_dev, out, inp) = pair();
        let map = Map::new(&[&out], &[&inp]).unwrap();
        assert!(matches!(map.set_expression("y=(x"), Err(Error::SyntaxError { .. })));
        assert!(!map.properties().put(Property::Expression, "x=y", true));
        assert_eq!(map.expression().as_deref(), Some("y=x"));

        map.set_expression("y=x*2").unwrap();
        assert_eq!(map.expression().as_deref(), Some("y=x*2"));
    }

    fn poll_until_ready(dev: &Device, map: &Map) -> bool {
        for _ in 0..10 {
            if map.ready() {
                return true;
            }
            dev.poll(10);
        }
        map.ready()
    }

    #[test]
    fn test_staged_map_waits_for_push() {
        let (dev, out, inp) = pair();
        let map = Map::staged(&[&out], &[&inp]).unwrap();
        map.set_expression("y=x+1").unwrap();
        map.properties().put_staged("color", "blue");
        dev.poll(10);
        assert!(!map.ready());
        assert!(map.status(false).contains(Status::STAGED));
        assert_eq!(out.maps(Direction::Outgoing).len(), 1);

        map.push().unwrap();
        assert!(poll_until_ready(&dev, &map));
        assert_eq!(map.expression().as_deref(), Some("y=x+1"));
        assert_eq!(map.properties().get("color"), Some(Value::from("blue")));

        // a second push only carries properties
        map.properties().put_staged(Property::Muted, true);
        map.push().unwrap();
        assert!(map.is_muted());
    }

    #[test]
    fn test_unproposed_map_releases_locally() {
        let (_dev, out, inp) = pair();
        let map = Map::staged(&[&out], &[&inp]).unwrap();
        let handle = map.clone();
        map.release().unwrap();
        assert!(!handle.is_valid());
        assert!(out.maps(Direction::Any).is_empty());
    }

    #[test]
    fn test_map_from_expression() {
        let (dev, out, inp) = pair();
        let map = Map::from_expression("%y=(%x+100)*2", &[&inp, &out]).unwrap();
        assert_eq!(map.expression().as_deref(), Some("y=(x+100)*2"));
        assert_eq!(map.signals(Location::Source).to_vec(), vec![out.clone()]);
        assert_eq!(map.signals(Location::Destination).to_vec(), vec![inp.clone()]);
        assert!(!map.ready());

        map.push().unwrap();
        assert!(poll_until_ready(&dev, &map));
        out.set_value(1.0f32).unwrap();
        for _ in 0..10 {
            if inp.has_value() {
                break;
            }
            dev.poll(10);
        }
        assert_eq!(inp.value_as::<f32>().unwrap(), Some(vec![202.0]));
    }

    #[test]
    fn test_map_from_expression_placeholders_are_checked() {
        let (_dev, out, inp) = pair();
        let bad = [
            Map::from_expression("%y=%x", &[&inp]),
            Map::from_expression("%y=%x", &[&inp, &out, &out]),
            Map::from_expression("y=%x", &[&out]),
            Map::from_expression("%y=%z", &[&inp, &out]),
            Map::from_expression("%y=%x", &[&out, &out]),
        ];
        for result in bad {
            assert!(matches!(result, Err(Error::InvalidArgument(_))), "{result:?}");
        }
        assert!(matches!(
            Map::from_expression("%y=(%x", &[&inp, &out]),
            Err(Error::SyntaxError { .. })
        ));
        assert!(out.maps(Direction::Any).is_empty());
    }

    #[test]
    fn test_release_removes_map() {
        let (dev, out, inp) = pair();
        let map = Map::new(&[&out], &[&inp]).unwrap();
        dev.poll(10);
        let handle = map.clone();
        map.release().unwrap();
        assert!(!handle.is_valid());
        assert!(out.maps(Direction::Any).is_empty());
        dev.poll(0);
        assert_eq!(handle.status(false), Status::REMOVED);
    }
}
