//! File identifier allocation.

use crate::protocol::FileId;
use std::sync::atomic::{AtomicU32, Ordering};

/// Hands out file identifiers, strictly increasing for the process lifetime.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> FileId {
        FileId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
