//! Link-name formatting: `"{scope.id};{connection.id}:{session.id}:{link.id}"`
//! (spec.md §3, §8).

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing per-process counters standing in for the
/// connection/session/link sequence numbers the spec's naming scheme wants.
/// `fe2o3-amqp`'s public handles don't expose their own internal ids, so the
/// scope mints its own — stable for the lifetime of the process, unique
/// within it, which is all the naming law in spec.md §8 requires.
#[derive(Debug, Default)]
pub struct IdSequence(AtomicU64);

impl IdSequence {
    pub const fn new() -> Self {
        IdSequence(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Formats a link name as `"{scope_id};{connection_id}:{session_id}:{link_id}"`.
pub fn format_link_name(scope_id: &str, connection_id: u64, session_id: u64, link_id: u64) -> String {
    format!("{scope_id};{connection_id}:{session_id}:{link_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_spec_pattern() {
        let name = format_link_name("eh-aaaaaaaa", 1, 2, 3);
        assert_eq!(name, "eh-aaaaaaaa;1:2:3");
    }

    #[test]
    fn id_sequence_increments() {
        let seq = IdSequence::new();
        assert_eq!(seq.next(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }
}
