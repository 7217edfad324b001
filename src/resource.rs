//! Process-wide tracker for the probe's programmable I/O state-machine
//! slots (spec.md §5): two PIO blocks × four state machines = eight slots,
//! shared across however many [`crate::session::Target`] sessions are alive
//! in this process. Each session acquires one slot on connect and releases
//! it on disconnect, even on an error path — modeled here as scoped
//! acquisition ([`PioSlot`]'s `Drop` releases the slot).

use std::sync::{Mutex, OnceLock};

use crate::error::DebugError;

pub const BLOCK_COUNT: usize = 2;
pub const SM_PER_BLOCK: usize = 4;
pub const SLOT_COUNT: usize = BLOCK_COUNT * SM_PER_BLOCK;

fn registry() -> &'static Mutex<[bool; SLOT_COUNT]> {
    static REGISTRY: OnceLock<Mutex<[bool; SLOT_COUNT]>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new([false; SLOT_COUNT]))
}

/// A held PIO slot; releases itself on drop, so a session's slot is
/// returned to the pool however the session goes away.
#[derive(Debug)]
pub struct PioSlot(usize);

impl PioSlot {
    pub fn index(&self) -> usize {
        self.0
    }

    pub fn block(&self) -> usize {
        self.0 / SM_PER_BLOCK
    }

    pub fn state_machine(&self) -> usize {
        self.0 % SM_PER_BLOCK
    }
}

impl Drop for PioSlot {
    fn drop(&mut self) {
        registry().lock().unwrap()[self.0] = false;
    }
}

/// Acquire `requested`, or the first free slot if `None`. Two sessions can
/// never bind the same slot.
pub fn acquire(requested: Option<usize>) -> Result<PioSlot, DebugError> {
    let mut slots = registry().lock().unwrap();
    let idx = match requested {
        Some(i) if i >= SLOT_COUNT => return Err(DebugError::InvalidParam),
        Some(i) => {
            if slots[i] {
                return Err(DebugError::ResourceBusy);
            }
            i
        }
        None => slots
            .iter()
            .position(|taken| !taken)
            .ok_or(DebugError::ResourceBusy)?,
    };
    slots[idx] = true;
    Ok(PioSlot(idx))
}

/// `{active_sessions, pio_block_slots[0..4]×2}` (spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct ResourceUsage {
    pub active_sessions: usize,
    pub pio_block_slots: [[bool; SM_PER_BLOCK]; BLOCK_COUNT],
}

pub fn usage() -> ResourceUsage {
    let slots = registry().lock().unwrap();
    let mut pio_block_slots = [[false; SM_PER_BLOCK]; BLOCK_COUNT];
    let mut active_sessions = 0;
    for (i, taken) in slots.iter().enumerate() {
        pio_block_slots[i / SM_PER_BLOCK][i % SM_PER_BLOCK] = *taken;
        if *taken {
            active_sessions += 1;
        }
    }
    ResourceUsage {
        active_sessions,
        pio_block_slots,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test below claims its own dedicated slot indices so parallel
    // test execution against the shared process-wide registry can't
    // interfere between tests.

    #[test]
    fn same_slot_cannot_be_acquired_twice() {
        let first = acquire(Some(5)).unwrap();
        assert!(matches!(acquire(Some(5)), Err(DebugError::ResourceBusy)));
        drop(first);
        assert!(acquire(Some(5)).is_ok());
    }

    #[test]
    fn out_of_range_slot_is_invalid_param() {
        assert!(matches!(acquire(Some(99)), Err(DebugError::InvalidParam)));
    }

    #[test]
    fn slot_is_released_on_drop() {
        {
            let _slot = acquire(Some(6)).unwrap();
            assert!(registry().lock().unwrap()[6]);
        }
        assert!(!registry().lock().unwrap()[6]);
    }
}
