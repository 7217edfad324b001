//! Per-hart cache and halt-state tracking (spec.md §3, §4.8).
//!
//! A fixed two-entry table — "architectural headroom for up to 1024
//! (10-bit hartsel)" per spec.md §9, but the target has exactly two harts,
//! so a `[HartState; 2]` is the extension point rather than a `Vec`.

/// Tracked state for a single hart.
#[derive(Debug, Clone, Copy)]
pub struct HartState {
    /// `false` after init or a raw reset: callers MUST query `DMSTATUS`
    /// rather than trust `halted`.
    pub halt_state_known: bool,
    pub halted: bool,
    pub cache_valid: bool,
    pub cached_gprs: [u32; 32],
}

impl HartState {
    pub fn new() -> Self {
        HartState {
            halt_state_known: false,
            halted: false,
            cache_valid: false,
            cached_gprs: [0; 32],
        }
    }

    /// Resume, step, and reset all invalidate the GPR mirror and record the
    /// hart's new halt state as known (spec.md §3).
    pub fn set_known_state(&mut self, halted: bool) {
        self.halted = halted;
        self.halt_state_known = true;
        self.cache_valid = false;
    }

    pub fn invalidate_cache(&mut self) {
        self.cache_valid = false;
    }

    pub fn update_cached_gpr(&mut self, n: u8, value: u32, cache_enabled: bool) {
        if cache_enabled && n != 0 {
            self.cached_gprs[n as usize] = value;
        }
    }
}

impl Default for HartState {
    fn default() -> Self {
        Self::new()
    }
}
