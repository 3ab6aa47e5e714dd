//! Round-robin selection over a live address set

use std::sync::atomic::{AtomicUsize, Ordering};

/// Cursor-based round robin.
///
/// The cursor advances on every pick and is taken modulo the snapshot's
/// current size, so the set growing or shrinking between picks re-normalizes
/// the cursor instead of panicking an in-flight selection. Over a stable,
/// sorted snapshot the rotation is deterministic: N picks visit N addresses
/// exactly once each.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next address from the snapshot, or `None` when it is empty.
    pub fn pick<'a>(&self, addresses: &'a [String]) -> Option<&'a str> {
        if addresses.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % addresses.len();
        Some(addresses[index].as_str())
    }
}
