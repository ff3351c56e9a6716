//! Enumerated semantics shared across the network.
//!
//! Every enum here has a canonical integer code. That code is what goes into
//! a `PropertyStore`, so peers never have to agree on display strings.

use serde::{Deserialize, Serialize};

use super::Value;

/// Declares a fieldless enum with a canonical code and string aliases.
macro_rules! coded_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $code:expr => [$($alias:literal),+] ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Canonical integer code.
            pub fn code(self) -> i64 {
                match self { $( $name::$variant => $code ),+ }
            }

            pub fn from_code(code: i64) -> Option<Self> {
                match code {
                    $( c if c == $code => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Display name (first alias).
            pub fn name(self) -> &'static str {
                match self { $( $name::$variant => [$($alias),+][0] ),+ }
            }

            /// Parse from any accepted alias, case-insensitively.
            pub fn from_name(s: &str) -> Option<Self> {
                let lower = s.to_ascii_lowercase();
                $( if [$($alias),+].contains(&lower.as_str()) { return Some($name::$variant); } )+
                None
            }

            /// Read back from a stored property value (code or alias).
            pub fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::Int(code) => Self::from_code(*code),
                    Value::String(s) => Self::from_name(s),
                    _ => None,
                }
            }
        }

        impl From<$name> for Value {
            fn from(v: $name) -> Self { Value::Int(v.code()) }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

coded_enum! {
    /// Signal or map direction relative to a device or signal.
    pub enum Direction {
        Incoming = 1 => ["incoming", "in", "input"],
        Outgoing = 2 => ["outgoing", "out", "output"],
        Any = 3 => ["any", "both"],
    }
}

coded_enum! {
    /// Element type of a signal's value vector. Codes are the wire type tags.
    pub enum DataType {
        Int32 = 0x69 => ["int32", "i", "int"],
        Float32 = 0x66 => ["float", "f", "float32"],
        Float64 = 0x64 => ["double", "d", "float64"],
    }
}

coded_enum! {
    /// What to do when a signal needs a new instance and every slot is active.
    pub enum Stealing {
        None = 0 => ["none"],
        Oldest = 1 => ["oldest"],
        Newest = 2 => ["newest"],
    }
}

coded_enum! {
    /// Which end of a map performs the expression evaluation.
    pub enum Location {
        Source = 1 => ["source", "src"],
        Destination = 2 => ["destination", "dst"],
        Any = 3 => ["any"],
    }
}

coded_enum! {
    /// Transport used by a map.
    pub enum Protocol {
        Udp = 1 => ["udp", "osc.udp"],
        Tcp = 2 => ["tcp", "osc.tcp"],
    }
}

coded_enum! {
    /// Kind of a directory record.
    pub enum ObjectKind {
        Device = 0x01 => ["device"],
        Signal = 0x02 => ["signal"],
        Map = 0x08 => ["map"],
    }
}

coded_enum! {
    /// Comparison used by `List::filter`.
    pub enum Operator {
        DoesNotExist = 0 => ["does_not_exist", "!exists"],
        Equal = 1 => ["equal", "=="],
        Exists = 2 => ["exists"],
        GreaterThan = 3 => ["greater_than", ">"],
        GreaterThanOrEqual = 4 => ["greater_than_or_equal", ">="],
        LessThan = 5 => ["less_than", "<"],
        LessThanOrEqual = 6 => ["less_than_or_equal", "<="],
        NotEqual = 7 => ["not_equal", "!="],
    }
}

impl Direction {
    /// True when `self`, used as a query filter, admits `dir`.
    pub fn admits(self, dir: Direction) -> bool {
        self == Direction::Any || self == dir || dir == Direction::Any
    }
}

impl Location {
    pub fn admits(self, loc: Location) -> bool {
        self == Location::Any || self == loc
    }
}

impl Operator {
    /// Evaluate the operator against a record's property (`None` if absent).
    pub fn matches(self, found: Option<&Value>, target: &Value) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Operator::DoesNotExist => found.is_none(),
            Operator::Exists => found.is_some(),
            Operator::Equal => found.is_some_and(|v| v.loosely_equals(target)),
            Operator::NotEqual => !Operator::Equal.matches(found, target),
            Operator::GreaterThan => found.and_then(|v| v.compare(target)) == Some(Greater),
            Operator::GreaterThanOrEqual => {
                matches!(found.and_then(|v| v.compare(target)), Some(Greater | Equal))
            }
            Operator::LessThan => found.and_then(|v| v.compare(target)) == Some(Less),
            Operator::LessThanOrEqual => {
                matches!(found.and_then(|v| v.compare(target)), Some(Less | Equal))
            }
        }
    }
}

impl DataType {
    pub fn size_of(self) -> usize {
        match self {
            DataType::Int32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }
}

bitflags::bitflags! {
    /// Set of record kinds, used to scope graph-level listeners.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ObjectKinds: u32 {
        const DEVICE = 0x01;
        const SIGNAL = 0x02;
        const MAP = 0x08;
        const ALL = 0x0B;
    }
}

impl From<ObjectKind> for ObjectKinds {
    fn from(kind: ObjectKind) -> Self {
        ObjectKinds::from_bits_truncate(kind.code() as u32)
    }
}

impl ObjectKinds {
    pub fn admits(self, kind: ObjectKind) -> bool {
        self.contains(ObjectKinds::from(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_through_value() {
        let v = Value::from(Stealing::Newest);
        assert_eq!(v, Value::Int(2));
        assert_eq!(Stealing::from_value(&v), Some(Stealing::Newest));
        assert_eq!(Stealing::from_value(&Value::from("oldest")), Some(Stealing::Oldest));
        assert_eq!(DataType::from_value(&Value::Int(0x69)), Some(DataType::Int32));
    }

    #[test]
    fn test_direction_admits() {
        assert!(Direction::Any.admits(Direction::Incoming));
        assert!(Direction::Outgoing.admits(Direction::Outgoing));
        assert!(!Direction::Outgoing.admits(Direction::Incoming));
    }

    #[test]
    fn test_operator_matches() {
        let three = Value::Int(3);
        assert!(Operator::Equal.matches(Some(&three), &Value::Float(3.0)));
        assert!(Operator::NotEqual.matches(None, &three));
        assert!(Operator::GreaterThan.matches(Some(&Value::Int(4)), &three));
        assert!(!Operator::GreaterThan.matches(None, &three));
        assert!(Operator::LessThanOrEqual.matches(Some(&three), &three));
        assert!(Operator::DoesNotExist.matches(None, &Value::Null));
        assert!(Operator::Exists.matches(Some(&Value::Null), &Value::Null));
    }

    #[test]
    fn test_object_kinds() {
        assert!(ObjectKinds::ALL.admits(ObjectKind::Map));
        assert!(!ObjectKinds::DEVICE.admits(ObjectKind::Signal));
    }
}
