//! Status bitmask for objects and instances.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Lifecycle and update-provenance flags. Every flag is a distinct bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Status: u32 {
        const NEW = 0x0001;
        const MODIFIED = 0x0002;
        const REMOVED = 0x0004;
        const EXPIRED = 0x0008;
        const STAGED = 0x0010;
        const ACTIVE = 0x0020;
        const HAS_VALUE = 0x0040;
        const NEW_VALUE = 0x0080;
        const LOCAL_UPDATE = 0x0100;
        const REMOTE_UPDATE = 0x0200;
        const UPSTREAM_RELEASE = 0x0400;
        const DOWNSTREAM_RELEASE = 0x0800;
        const OVERFLOW = 0x1000;
        const ANY = 0x1FFF;
    }
}

impl Status {
    /// Bits that survive `status(true)`.
    pub const PERSISTENT: Status = Status::EXPIRED
        .union(Status::STAGED)
        .union(Status::ACTIVE)
        .union(Status::HAS_VALUE);

    /// One-shot event bits, cleared when read with `clear_volatile`.
    pub const VOLATILE: Status = Status::ANY.difference(Status::PERSISTENT);

    /// Bits that can trigger a listener, in dispatch order.
    pub const EVENT_BITS: [Status; 10] = [
        Status::NEW,
        Status::MODIFIED,
        Status::REMOVED,
        Status::EXPIRED,
        Status::NEW_VALUE,
        Status::LOCAL_UPDATE,
        Status::REMOTE_UPDATE,
        Status::UPSTREAM_RELEASE,
        Status::DOWNSTREAM_RELEASE,
        Status::OVERFLOW,
    ];

    /// Read `self`, clearing the volatile bits in place when asked.
    pub fn take(&mut self, clear_volatile: bool) -> Status {
        let current = *self;
        if clear_volatile {
            self.remove(Status::VOLATILE);
        }
        current
    }

    /// Volatile bits in `mask` only; persistent bits in a query mask are
    /// filters, not events to consume.
    pub fn volatile_part(self) -> Status {
        self.intersection(Status::VOLATILE)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        bitflags::parser::to_writer(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_do_not_overlap() {
        let mut seen = Status::empty();
        for (_, flag) in Status::all().iter_names().filter(|(n, _)| *n != "ANY") {
            assert!(!seen.intersects(flag));
            seen |= flag;
        }
        assert_eq!(seen, Status::ANY);
    }

    #[test]
    fn test_take_clears_volatile_only() {
        let mut s = Status::ACTIVE | Status::HAS_VALUE | Status::REMOTE_UPDATE | Status::OVERFLOW;
        let first = s.take(true);
        assert!(first.contains(Status::REMOTE_UPDATE | Status::OVERFLOW));
        let second = s.take(true);
        assert_eq!(second, Status::ACTIVE | Status::HAS_VALUE);
        assert_eq!(s.take(false), second);
    }

    #[test]
    fn test_volatile_partition() {
        assert_eq!(Status::PERSISTENT | Status::VOLATILE, Status::ANY);
        assert!(!Status::PERSISTENT.intersects(Status::VOLATILE));
        assert!(Status::VOLATILE.contains(Status::NEW_VALUE | Status::LOCAL_UPDATE));
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::empty().to_string(), "NONE");
        assert_eq!((Status::NEW | Status::ACTIVE).to_string(), "NEW | ACTIVE");
    }
}
