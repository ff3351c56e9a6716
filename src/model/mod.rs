//! # Object Model
//!
//! Plain data shared by the directory, the engine boundary and user code.
//!
//! Design rule: nothing in here knows about graphs, engines or locks.
//! This module is pure data. No I/O, no state.

pub mod id;
pub mod value;
pub mod signal_value;
pub mod property;
pub mod property_map;
pub mod status;
pub mod types;

pub use id::{ObjectId, InstanceId, ListenerId, Timestamp};
pub use value::Value;
pub use signal_value::{SignalValue, Sample};
pub use property::{Key, Property};
pub use property_map::{PropertyStore, Change};
pub use status::Status;
pub use types::{
    Direction, DataType, Stealing, Location, Protocol, ObjectKind, ObjectKinds, Operator,
};
