//! Typed ID definitions.

use crate::{define_counter_id, define_id};

// =============================================================================
// Counter IDs
// =============================================================================

define_counter_id!(
    /// Allocation handle issued by the ledger. Monotonic, starts at 1, never reused.
    AllocationId,
    u64
);

define_counter_id!(
    /// Process id issued by the host.
    Pid,
    u64
);

define_counter_id!(
    /// Address of a simulated inter-process port.
    PortId,
    u32
);

impl AllocationId {
    /// The first id a fresh ledger hands out.
    pub const FIRST: Self = Self::new(1);
}

impl PortId {
    /// Well-known port of the memory service.
    pub const MEMORY: Self = Self::new(1);

    /// Well-known port of the launch service.
    pub const LAUNCH: Self = Self::new(2);

    /// First port handed out for ephemeral response and done-signal channels.
    pub const EPHEMERAL_START: Self = Self::new(1000);

    /// Whether this port lies in the ephemeral range.
    pub const fn is_ephemeral(&self) -> bool {
        self.value() >= Self::EPHEMERAL_START.value()
    }
}

// =============================================================================
// ULID IDs
// =============================================================================

define_id!(BatchId, "batch");
define_id!(RequestId, "req");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_batch_id_roundtrip() {
        let id = BatchId::new();
        let parsed: BatchId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("batch_"));
    }

    #[test]
    fn test_ulid_ids_reject_foreign_or_broken_input() {
        for input in [
            "req_01HV4Z2WQXKJNM8GPQY6VBKC3D",
            "batch01HV4Z2WQXKJNM8GPQY6VBKC3D",
            "batch_nope",
            "batch_",
        ] {
            assert!(
                matches!(
                    input.parse::<BatchId>().unwrap_err(),
                    crate::IdError::Malformed { kind: "batch", .. }
                ),
                "{input}"
            );
        }
        assert_eq!("".parse::<RequestId>().unwrap_err(), crate::IdError::Empty);
    }

    #[test]
    fn test_ulid_id_serializes_as_string() {
        let id = RequestId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        assert_eq!(serde_json::from_str::<RequestId>(&json).unwrap(), id);
        assert!(serde_json::from_str::<RequestId>("\"batch_01HV4Z2WQXKJNM8GPQY6VBKC3D\"").is_err());
    }

    #[test]
    fn test_batch_ids_sortable() {
        let id1 = BatchId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = BatchId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_allocation_id_serializes_as_number() {
        let id = AllocationId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let parsed: AllocationId = serde_json::from_str("42").unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_allocation_id_next() {
        assert_eq!(AllocationId::FIRST.value(), 1);
        assert_eq!(AllocationId::FIRST.next().value(), 2);
    }

    #[test]
    fn test_counter_parse_rejects_garbage() {
        assert!(matches!(
            "abc".parse::<AllocationId>().unwrap_err(),
            crate::IdError::InvalidNumber(_)
        ));
        assert!(matches!(
            "  ".parse::<Pid>().unwrap_err(),
            crate::IdError::Empty
        ));
        assert_eq!(" 7 ".parse::<Pid>().unwrap(), Pid::new(7));
    }

    #[test]
    fn test_port_ranges() {
        assert!(!PortId::MEMORY.is_ephemeral());
        assert!(!PortId::LAUNCH.is_ephemeral());
        assert!(PortId::EPHEMERAL_START.is_ephemeral());
    }

    proptest! {
        #[test]
        fn prop_counter_display_parse_roundtrip(n in any::<u64>()) {
            let id = AllocationId::new(n);
            let parsed: AllocationId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
