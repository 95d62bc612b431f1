//! Transfer descriptor pool
//!
//! A fixed arena of request slots, each pairing a data buffer with the
//! transport's descriptor for it. Slots are indexed `0..queue_depth` and
//! carry an explicit in-flight tag: while a slot is submitted, its buffer
//! belongs to the device stack and must neither be freed nor touched.

use crate::error::{EngineError, Result};
use std::fmt;
use tracing::{debug, error};

/// One reusable request slot
pub struct TransferSlot<D> {
    index: usize,
    buffer: Vec<u8>,
    descriptor: D,
    in_flight: bool,
}

impl<D> TransferSlot<D> {
    /// Slot index within the pool
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn descriptor(&self) -> &D {
        &self.descriptor
    }

    /// Buffer and descriptor together, for binding one to the other on submit
    pub fn parts_mut(&mut self) -> (&mut [u8], &mut D) {
        (&mut self.buffer, &mut self.descriptor)
    }

    /// Whether the slot's request is currently submitted
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub(crate) fn mark_in_flight(&mut self) {
        self.in_flight = true;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.in_flight = false;
    }
}

impl<D> fmt::Debug for TransferSlot<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSlot")
            .field("index", &self.index)
            .field("buffer_len", &self.buffer.len())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

/// Fixed-size set of request slots for one run
pub struct TransferPool<D> {
    slots: Vec<TransferSlot<D>>,
    buffer_size: usize,
}

impl<D> TransferPool<D> {
    /// Allocate `queue_depth` slots of `buffer_size` bytes each
    ///
    /// `alloc_descriptor` is called once per slot index. Allocation is
    /// all-or-nothing: on the first failure every slot acquired so far is
    /// dropped and [`EngineError::OutOfMemory`] is returned.
    pub fn allocate<F, E>(
        queue_depth: usize,
        buffer_size: usize,
        mut alloc_descriptor: F,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> std::result::Result<D, E>,
        E: fmt::Display,
    {
        let mut slots: Vec<TransferSlot<D>> = Vec::new();
        slots
            .try_reserve_exact(queue_depth)
            .map_err(|e| EngineError::OutOfMemory {
                slot: 0,
                reason: e.to_string(),
            })?;

        for index in 0..queue_depth {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(buffer_size)
                .map_err(|e| EngineError::OutOfMemory {
                    slot: index,
                    reason: e.to_string(),
                })?;
            buffer.resize(buffer_size, 0);

            let descriptor = alloc_descriptor(index).map_err(|e| EngineError::OutOfMemory {
                slot: index,
                reason: e.to_string(),
            })?;

            slots.push(TransferSlot {
                index,
                buffer,
                descriptor,
                in_flight: false,
            });
        }

        debug!(
            "Allocated {} transfer slots of {} bytes",
            queue_depth, buffer_size
        );
        Ok(Self { slots, buffer_size })
    }

    /// Free every slot
    ///
    /// Safe to call repeatedly and on an empty pool. Refuses while any slot
    /// is still in flight, since the device may still write into it.
    pub fn release_all(&mut self) -> Result<()> {
        let in_flight = self.in_flight_count();
        if in_flight > 0 {
            return Err(EngineError::ReleaseWhileInFlight(in_flight));
        }

        if !self.slots.is_empty() {
            debug!("Releasing {} transfer slots", self.slots.len());
        }
        self.slots.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn slots(&self) -> &[TransferSlot<D>] {
        &self.slots
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut TransferSlot<D>> {
        self.slots.get_mut(index)
    }

    /// Number of slots tagged in flight
    pub fn in_flight_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_flight).count()
    }
}

impl<D> Drop for TransferPool<D> {
    fn drop(&mut self) {
        // Slots still owned by the device stack are leaked rather than freed.
        for slot in std::mem::take(&mut self.slots) {
            if slot.in_flight {
                error!(
                    "Transfer slot {} dropped while in flight; leaking its buffer",
                    slot.index
                );
                std::mem::forget(slot);
            }
        }
    }
}
