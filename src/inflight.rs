//! Outbound packet-identifier window.
//!
//! One per session. Identifiers for QoS 1 deliveries are allocated here and
//! stay reserved until the matching PUBACK arrives, so an id is never reused
//! while a delivery is pending. The pending messages themselves live with
//! the retry scheduler.

use std::collections::BTreeSet;
use std::num::NonZeroU16;

use crate::{MqttError, Result};

pub struct Inflight {
    next: u16,
    pending: BTreeSet<u16>,
}

impl Default for Inflight {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflight {
    pub fn new() -> Self {
        Self { next: 1, pending: BTreeSet::new() }
    }

    /// Allocates the next free packet identifier and marks it pending.
    /// Zero is never produced.
    pub fn next_id(&mut self) -> Result<NonZeroU16, MqttError> {
        for _ in 0..u16::MAX {
            let id = self.next;
            self.next = self.next.checked_add(1).unwrap_or(1);
            if id == 0 || self.pending.contains(&id) {
                continue;
            }
            self.pending.insert(id);
            if let Some(id) = NonZeroU16::new(id) {
                return Ok(id);
            }
        }
        Err(MqttError::PacketIdExhausted)
    }

    /// Releases an identifier after its PUBACK. Returns false for ids that
    /// were not pending.
    pub fn remove(&mut self, id: NonZeroU16) -> bool {
        self.pending.remove(&id.get())
    }

    #[inline]
    pub fn contains(&self, id: NonZeroU16) -> bool {
        self.pending.contains(&id.get())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
