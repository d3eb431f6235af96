use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::decoding::DecodingState;
use crate::error::{EngineError, Result};
use crate::request::RequestId;

/// Batch slot allocator
/// Hands out the fixed set of `max_batch_size` slots the compute step indexes
/// into, and resets a slot's decoding state before it can be reused.
#[derive(Debug)]
pub struct SlotAllocator {
    /// Owner of each slot, `None` while free
    owners: Mutex<Vec<Option<RequestId>>>,
}

impl SlotAllocator {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            owners: Mutex::new(vec![None; max_batch_size]),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.owners.lock().len()
    }

    /// Take the lowest free slot for `request_id`
    pub fn acquire(&self, request_id: RequestId) -> Result<usize> {
        let mut owners = self.owners.lock();
        if let Some(held) = owners.iter().position(|o| *o == Some(request_id)) {
            return Err(EngineError::invalid_state(format!(
                "request {} already holds slot {}",
                request_id, held
            )));
        }
        let slot = owners
            .iter()
            .position(Option::is_none)
            .ok_or(EngineError::NoCapacity {
                max_batch_size: owners.len(),
            })?;
        owners[slot] = Some(request_id);
        debug!("Assigned slot {} to request {}", slot, request_id);
        Ok(slot)
    }

    /// Reset the slot's decoding state, then free it
    pub fn release(&self, slot: usize, decoding: &mut DecodingState) -> Result<RequestId> {
        let mut owners = self.owners.lock();
        let owner = owners
            .get(slot)
            .copied()
            .flatten()
            .ok_or_else(|| EngineError::invalid_argument(format!("slot {} is not in use", slot)))?;
        decoding.reset_slot(slot);
        owners[slot] = None;
        debug!("Released slot {} from request {}", slot, owner);
        Ok(owner)
    }

    pub fn owner(&self, slot: usize) -> Option<RequestId> {
        self.owners.lock().get(slot).copied().flatten()
    }

    pub fn num_free_slots(&self) -> usize {
        self.owners.lock().iter().filter(|o| o.is_none()).count()
    }

    pub fn stats(&self) -> SlotStats {
        let owners = self.owners.lock();
        let free_slots = owners.iter().filter(|o| o.is_none()).count();
        SlotStats {
            total_slots: owners.len(),
            free_slots,
            used_slots: owners.len() - free_slots,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    pub total_slots: usize,
    pub free_slots: usize,
    pub used_slots: usize,
}
