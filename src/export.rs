//! JSON export: serialize a graph directory for inspection or tooling.
//!
//! ```text
//! Graph → to_json() → { "devices": [ { ..., "signals": [...] } ], "maps": [...] }
//! ```
//!
//! Enumerated properties are written as their integer codes, as stored.
//! Status words are written as flag names.

use serde_json::{json, Map as JsonMap, Value as Json};

use crate::graph::directory::Directory;
use crate::graph::record::Record;
use crate::graph::Graph;
use crate::model::*;
use crate::Result;

/// Render every live device (with its signals and their instances) and
/// every live map as a pretty-printed JSON document.
pub fn to_json(graph: &Graph) -> Result<String> {
    let document = graph.read(|s| render(&s.dir));
    Ok(serde_json::to_string_pretty(&document)?)
}

fn render(dir: &Directory) -> Json {
    let devices: Vec<Json> = dir
        .live_of_kind(ObjectKind::Device)
        .map(|device| {
            let mut out = object_header(device);
            let signals: Vec<Json> = dir
                .signals_of(device.id, Direction::Any)
                .map(render_signal)
                .collect();
            out.insert("signals".into(), Json::Array(signals));
            Json::Object(out)
        })
        .collect();

    let maps: Vec<Json> = dir
        .live_of_kind(ObjectKind::Map)
        .filter_map(|record| {
            let data = record.map()?;
            let mut out = object_header(record);
            out.insert("sources".into(), json!(data.sources.iter().map(|id| id.0).collect::<Vec<_>>()));
            out.insert(
                "destinations".into(),
                json!(data.destinations.iter().map(|id| id.0).collect::<Vec<_>>()),
            );
            Some(Json::Object(out))
        })
        .collect();

    let orphans = dir
        .signal_records()
        .filter(|r| r.parent.is_none_or(|p| dir.get_live(p).is_none()))
        .count();

    json!({
        "devices": devices,
        "maps": maps,
        "orphan_signals": orphans,
    })
}

fn object_header(record: &Record) -> JsonMap<String, Json> {
    let mut out = JsonMap::new();
    out.insert("id".into(), json!(record.id.0));
    out.insert("local".into(), json!(record.local));
    out.insert("status".into(), json!(record.status.to_string()));
    out.insert("properties".into(), format_properties(record));
    out
}

fn render_signal(record: &Record) -> Json {
    let mut out = object_header(record);
    if let Some(data) = record.signal() {
        let instances: Vec<Json> = data
            .pool
            .slots()
            .map(|slot| {
                json!({
                    "id": slot.id.0,
                    "status": slot.status.to_string(),
                    "value": slot.value.as_ref().map(|v| format_value(&Value::from(v))),
                })
            })
            .collect();
        out.insert("instances".into(), Json::Array(instances));
    }
    Json::Object(out)
}

/// Properties as a JSON object, keyed by canonical name.
fn format_properties(record: &Record) -> Json {
    let props: JsonMap<String, Json> = record
        .props
        .iter()
        .map(|(key, value)| (key.as_str().to_owned(), format_value(value)))
        .collect();
    Json::Object(props)
}

fn format_value(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::String(s) => json!(s),
        Value::List(items) => Json::Array(items.iter().map(format_value).collect()),
    }
}
