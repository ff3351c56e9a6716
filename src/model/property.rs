//! Property keys.
//!
//! A key is either a well-known identifier or a free-form string. Strings that
//! name a well-known identifier (or one of its aliases) resolve to it, so
//! `Key::from("name")` and `Key::from(Property::Name)` address the same slot.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{DataType, Direction, Location, ObjectKind, Protocol, Stealing, Value};

macro_rules! properties {
    ( $( $variant:ident => [$($alias:literal),+] ),+ $(,)? ) => {
        /// Well-known property identifiers.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum Property {
            $( $variant ),+
        }

        impl Property {
            pub const ALL: &'static [Property] = &[ $( Property::$variant ),+ ];

            /// Canonical name as published on the network.
            pub fn name(self) -> &'static str {
                match self { $( Property::$variant => [$($alias),+][0] ),+ }
            }

            pub fn lookup(s: &str) -> Option<Property> {
                $( if [$($alias),+].iter().any(|a| a.eq_ignore_ascii_case(s)) {
                    return Some(Property::$variant);
                } )+
                None
            }
        }
    };
}

properties! {
    Id => ["id"],
    Name => ["name"],
    Device => ["device"],
    Direction => ["direction", "dir"],
    Length => ["length", "len"],
    Type => ["type"],
    Min => ["min", "minimum"],
    Max => ["max", "maximum"],
    Unit => ["unit", "units"],
    Ordinal => ["ordinal"],
    Port => ["port"],
    Host => ["host"],
    Expression => ["expr", "expression"],
    Stealing => ["stealing", "steal_mode"],
    NumInstances => ["num_inst", "num_instances"],
    UseInstances => ["use_inst", "use_instances"],
    Protocol => ["protocol"],
    ProcessLocation => ["process_loc", "process_location"],
    Muted => ["muted"],
    Version => ["version"],
    Rate => ["rate"],
    Description => ["description"],
    NumSignals => ["num_sigs", "num_signals"],
    NumMaps => ["num_maps"],
    IsLocal => ["is_local"],
}

impl Property {
    /// Maintained by the graph itself on objects of `kind`; user writes
    /// are refused.
    pub fn is_read_only(self, kind: ObjectKind) -> bool {
        use Property as P;
        match kind {
            ObjectKind::Signal => matches!(
                self,
                P::Id | P::Name | P::Device | P::Direction | P::Length | P::Type
                    | P::NumInstances | P::UseInstances | P::NumMaps | P::IsLocal
            ),
            ObjectKind::Device => {
                matches!(self, P::Id | P::Name | P::Ordinal | P::NumSignals | P::NumMaps | P::IsLocal)
            }
            ObjectKind::Map => matches!(self, P::Id | P::NumSignals | P::IsLocal),
        }
    }

    /// Stored form of `value` under this property. Enumerated properties
    /// keep the integer code whichever alias was given; `None` when the
    /// value names no variant.
    pub fn canonical(self, value: Value) -> Option<Value> {
        match self {
            Property::Direction => Direction::from_value(&value).map(Value::from),
            Property::Type => DataType::from_value(&value).map(Value::from),
            Property::Stealing => Stealing::from_value(&value).map(Value::from),
            Property::Protocol => Protocol::from_value(&value).map(Value::from),
            Property::ProcessLocation => Location::from_value(&value).map(Value::from),
            _ => Some(value),
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key into a `PropertyStore`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    Property(Property),
    Named(String),
}

impl Key {
    pub fn as_str(&self) -> &str {
        match self {
            Key::Property(p) => p.name(),
            Key::Named(s) => s,
        }
    }

    pub fn property(&self) -> Option<Property> {
        match self {
            Key::Property(p) => Some(*p),
            Key::Named(_) => None,
        }
    }
}

impl From<Property> for Key {
    fn from(p: Property) -> Self { Key::Property(p) }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        match Property::lookup(s) {
            Some(p) => Key::Property(p),
            None => Key::Named(s.to_owned()),
        }
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        match Property::lookup(&s) {
            Some(p) => Key::Property(p),
            None => Key::Named(s),
        }
    }
}

impl From<&Key> for Key {
    fn from(k: &Key) -> Self { k.clone() }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_resolve_to_same_key() {
        assert_eq!(Key::from("name"), Key::from(Property::Name));
        assert_eq!(Key::from("expression"), Key::Property(Property::Expression));
        assert_eq!(Key::from("expr"), Key::Property(Property::Expression));
        assert_eq!(Key::from("steal_mode"), Key::Property(Property::Stealing));
        assert_eq!(Key::from("NAME"), Key::Property(Property::Name));
    }

    #[test]
    fn test_free_form_key() {
        let k = Key::from("colour");
        assert_eq!(k, Key::Named("colour".into()));
        assert_eq!(k.property(), None);
        assert_eq!(k.to_string(), "colour");
    }

    #[test]
    fn test_enumerated_values_become_codes() {
        assert_eq!(Property::Stealing.canonical(Value::from("newest")), Some(Value::Int(2)));
        assert_eq!(Property::Type.canonical(Value::from("float")), Some(Value::Int(0x66)));
        assert_eq!(Property::Protocol.canonical(Value::Int(2)), Some(Value::Int(2)));
        assert_eq!(Property::ProcessLocation.canonical(Value::from("dst")), Some(Value::Int(2)));
        assert_eq!(Property::Stealing.canonical(Value::from("loudest")), None);
        assert_eq!(Property::Direction.canonical(Value::Int(9)), None);
        assert_eq!(Property::Unit.canonical(Value::from("Hz")), Some(Value::from("Hz")));
    }

    #[test]
    fn test_read_only_depends_on_kind() {
        assert!(Property::Length.is_read_only(ObjectKind::Signal));
        assert!(Property::Ordinal.is_read_only(ObjectKind::Device));
        assert!(!Property::Stealing.is_read_only(ObjectKind::Signal));
        assert!(!Property::Min.is_read_only(ObjectKind::Signal));
        assert!(!Property::Expression.is_read_only(ObjectKind::Map));
    }

    #[test]
    fn test_every_property_round_trips_by_name() {
        for p in Property::ALL {
            assert_eq!(Property::lookup(p.name()), Some(*p));
        }
    }
}
