//! Arbitration of a physical device shared by multiple logical units.
//!
//! Multi-slot boards expose several FPGAs behind one transport, and a
//! conversation with one slot must not interleave with another's frames on
//! the wire. Every transport interaction (select, configure, send, read)
//! therefore happens inside a bus acquisition, held for the whole span.
//!
//! The common case is one slot per board; the arbiter takes no lock at all
//! there so single-unit devices pay nothing for the generality.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

struct BusShared {
    units: usize,
    // The lock's payload is the currently selected slot; None when no unit
    // holds the bus.
    selected: Mutex<Option<usize>>,
}

/// One logical unit's handle onto its physical device's bus.
///
/// Each unit holds its own handle (a shared reference plus its slot index),
/// never a copy of the lock itself.
#[derive(Clone)]
pub struct SharedBus {
    shared: Arc<BusShared>,
    slot: usize,
}

impl SharedBus {
    /// Create one handle per logical unit of a physical device.
    pub fn for_units(units: usize) -> Vec<SharedBus> {
        let shared = Arc::new(BusShared {
            units,
            selected: Mutex::new(None),
        });
        (0..units)
            .map(|slot| SharedBus {
                shared: Arc::clone(&shared),
                slot,
            })
            .collect()
    }

    /// The slot index this handle selects when it acquires the bus.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// True when more than one logical unit shares the transport.
    pub fn is_shared(&self) -> bool {
        self.shared.units > 1
    }

    /// Acquire exclusive use of the transport for this unit.
    ///
    /// Blocks until the bus is free when the device hosts multiple units; a
    /// no-op otherwise. The returned guard releases the bus (and clears the
    /// selected-slot marker) on drop, so release happens on every exit path.
    pub async fn acquire(&self) -> BusGuard<'_> {
        if !self.is_shared() {
            return BusGuard { inner: None };
        }

        let mut guard = self.shared.selected.lock().await;
        *guard = Some(self.slot);
        BusGuard { inner: Some(guard) }
    }
}

/// Scoped bus acquisition. Dropping it releases the bus.
pub struct BusGuard<'a> {
    inner: Option<MutexGuard<'a, Option<usize>>>,
}

impl BusGuard<'_> {
    /// The slot currently selected, if the bus is actually shared.
    pub fn selected(&self) -> Option<usize> {
        self.inner.as_ref().and_then(|g| **g)
    }
}

impl Drop for BusGuard<'_> {
    fn drop(&mut self) {
        if let Some(guard) = self.inner.as_mut() {
            **guard = None;
        }
    }
}
