//! # mapper-rs: Client Object Model for Distributed Signal Mapping
//!
//! Independent devices expose named, typed signals; maps route and transform
//! values from source signals to destination signals across the network.
//! This crate is the client-side view of that network: a live directory of
//! devices, signals and maps, a lazy query algebra over it, per-signal
//! instance pools, and a status/event model that drives callbacks.
//!
//! ## Design Principles
//!
//! 1. **Engine as a trait**: `MappingEngine` is the contract with the network layer
//! 2. **Arena, not pointers**: every record lives in its `Graph`, handles carry ids
//! 3. **One suspension point**: all mutation and dispatch happen inside `poll()`
//! 4. **Lazy queries**: `List` evaluates against the live directory on demand
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mapper_rs::{DataType, Device, Direction, Engine, GraphObject, Map, Property};
//!
//! # fn example() -> mapper_rs::Result<()> {
//! let engine = Engine::loopback_default();
//! let src = Device::new("src", &engine)?;
//! let dst = Device::new("dst", &engine)?;
//! let out = src.add_signal(Direction::Outgoing, "outsig1", 1, DataType::Int32)?;
//! let inp = dst.add_signal(Direction::Incoming, "insig1", 1, DataType::Int32)?;
//!
//! while !src.ready() || !dst.ready() {
//!     src.poll(10);
//!     dst.poll(10);
//! }
//!
//! let map = Map::new(&[&out], &[&inp])?;
//! map.properties().put(Property::Expression, "y=x*100", true);
//! while !map.ready() {
//!     src.poll(10);
//!     dst.poll(10);
//! }
//!
//! out.set_value(3)?;
//! src.poll(0);
//! dst.poll(10);
//! assert_eq!(inp.value_as::<i32>()?, Some(vec![300]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Engines
//!
//! | Engine | Module | Description |
//! |--------|--------|-------------|
//! | `LoopbackEngine` | `engine::loopback` | In-process bus for embedding and tests |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod config;
pub mod expr;
pub mod engine;
pub mod graph;
pub mod object;
pub mod pool;
pub mod query;
pub mod export;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    Value, SignalValue, Sample, Key, Property, PropertyStore, Status,
    Direction, DataType, Stealing, Location, Protocol, ObjectKind, ObjectKinds, Operator,
    ObjectId, InstanceId, ListenerId, Timestamp,
};

// ============================================================================
// Re-exports: Engine, Graph, Objects, Queries
// ============================================================================

pub use config::EngineConfig;
pub use engine::{Engine, MappingEngine, LoopbackEngine};
pub use graph::{Graph, Event, Subject};
pub use object::{GraphObject, Properties, Device, SignalOptions, Signal, Instance, Map, UserRef};
pub use query::{List, CursorQuery, IndexedSnapshot, ListItem, ListIter};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Expression syntax error at position {position}: {message}")]
    SyntaxError { position: usize, message: String },

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Lists belong to different graphs")]
    GraphMismatch,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Mapping engine has been shut down")]
    EngineShutdown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
