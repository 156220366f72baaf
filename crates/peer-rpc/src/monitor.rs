//! Consumers of clock-offset measurements.

use crate::offset::RemoteOffset;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Receives offset estimates keyed by peer address.
///
/// Updates are fire-and-forget; implementations must not block.
pub trait RemoteClockMonitor: Send + Sync {
    fn update_offset(&self, addr: &str, offset: RemoteOffset);
}

/// Keeps the latest offset reported for each address.
#[derive(Debug, Default)]
pub struct OffsetTable {
    offsets: Mutex<HashMap<String, RemoteOffset>>,
}

impl OffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest offset recorded for `addr`.
    pub fn get(&self, addr: &str) -> Option<RemoteOffset> {
        self.offsets.lock().get(addr).copied()
    }

    /// Copy of every recorded offset, sorted by address.
    pub fn snapshot(&self) -> Vec<(String, RemoteOffset)> {
        let mut entries: Vec<_> = self
            .offsets
            .lock()
            .iter()
            .map(|(addr, offset)| (addr.clone(), *offset))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.offsets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.lock().is_empty()
    }
}

impl RemoteClockMonitor for OffsetTable {
    fn update_offset(&self, addr: &str, offset: RemoteOffset) {
        self.offsets.lock().insert(addr.to_string(), offset);
    }
}
