//! The root aggregate: owns Wire-Engine resources, DAP state, DM state, and
//! the per-hart table (spec.md §3). `Target` is the externally observable
//! Session API (spec.md §6) — everything below it (`wire`, `dap`, `dm`,
//! `resource`) is an internal collaborator.

use crate::config::WireConfig;
use crate::dap::DapEngine;
use crate::dm::DmDriver;
use crate::error::{DebugError, ErrorDetail, Result};
use crate::resource::{self, PioSlot, ResourceUsage};
use crate::wire::{DpReg, PioBackend, WireEngine};

/// A single traced instruction (spec.md §4.7).
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub pc: u32,
    pub instruction: u32,
    pub gprs: Option<[u32; 32]>,
}

/// The root session aggregate (spec.md §3).
pub struct Target {
    dm: DmDriver,
    slot: Option<PioSlot>,
    initialized: bool,
    last_error: ErrorDetail,
}

impl Target {
    /// Create a session from a configuration record and a probe-specific
    /// PIO backend; does not yet touch the wire (spec.md §3: a session is
    /// *created*, then separately *connects*).
    pub fn new(backend: Box<dyn PioBackend>, config: WireConfig) -> Self {
        let wire = WireEngine::new(backend, config);
        let dap = DapEngine::new(wire);
        Target {
            dm: DmDriver::new(dap),
            slot: None,
            initialized: false,
            last_error: ErrorDetail::default(),
        }
    }

    fn fail(&mut self, e: impl Into<DebugError>) -> DebugError {
        let e = e.into();
        tracing::error!(?e, "session: operation failed");
        self.last_error.set(e);
        e
    }

    pub fn last_error_detail(&self) -> &str {
        self.last_error.as_str()
    }

    // -- Connection lifecycle ------------------------------------------

    /// Dormant→SWD activation, IDCODE read, debug-domain power-up, and DM and
    /// SBA init (spec.md §3). Acquires a process-wide PIO slot first so a
    /// failed connect still leaves resources consistent.
    pub fn connect(&mut self, requested_slot: Option<usize>) -> Result<u32> {
        let slot = resource::acquire(requested_slot).map_err(|e| self.fail(e))?;
        let idcode = match self.dm_dap_mut().connect() {
            Ok(v) => v,
            Err(e) => return Err(self.fail(e)),
        };
        if let Err(e) = self.dm_dap_mut().power_up() {
            return Err(self.fail(e));
        }
        if let Err(e) = self.dm.init() {
            return Err(self.fail(e));
        }
        self.initialized = true;
        self.slot = Some(slot);
        Ok(idcode)
    }

    /// Releases the PIO slot (via `PioSlot`'s `Drop`) even though nothing
    /// here can fail.
    pub fn disconnect(&mut self) {
        tracing::debug!("session: disconnecting");
        self.dm_dap_mut().disconnect();
        self.initialized = false;
        self.slot = None;
    }

    pub fn is_connected(&self) -> bool {
        self.dm_dap().is_connected()
    }

    pub fn get_frequency(&self) -> u32 {
        self.dm_dap().get_frequency()
    }

    pub fn set_frequency(&mut self, khz: u32) {
        self.dm_dap_mut().set_frequency(khz)
    }

    pub fn is_powered(&self) -> bool {
        self.dm_dap().is_powered()
    }

    pub fn clear_errors(&mut self) -> Result<()> {
        self.dm_dap_mut().clear_errors().map_err(|e| self.fail(e))
    }

    fn require_connected(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Err(self.fail(DebugError::NotConnected));
        }
        Ok(())
    }

    // -- DAP passthrough --------------------------------------------------

    pub fn read_dp(&mut self, reg: DpReg) -> Result<u32> {
        self.require_connected()?;
        self.dm_dap_mut().read_dp(reg).map_err(|e| self.fail(e))
    }

    pub fn write_dp(&mut self, reg: DpReg, value: u32) -> Result<()> {
        self.require_connected()?;
        self.dm_dap_mut()
            .write_dp(reg, value)
            .map_err(|e| self.fail(e))
    }

    pub fn read_ap(&mut self, apsel: u8, reg: u8) -> Result<u32> {
        self.require_connected()?;
        self.dm_dap_mut()
            .ap_read(apsel, reg)
            .map_err(|e| self.fail(e))
    }

    pub fn write_ap(&mut self, apsel: u8, reg: u8, value: u32) -> Result<()> {
        self.require_connected()?;
        self.dm_dap_mut()
            .ap_write(apsel, reg, value)
            .map_err(|e| self.fail(e))
    }

    pub fn dap_read_mem32(&mut self, addr: u32) -> Result<u32> {
        self.require_connected()?;
        self.dm_dap_mut().read_mem32(addr).map_err(|e| self.fail(e))
    }

    pub fn dap_write_mem32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.require_connected()?;
        self.dm_dap_mut()
            .write_mem32(addr, value)
            .map_err(|e| self.fail(e))
    }

    // -- DM lifecycle / hart control --------------------------------------

    pub fn init(&mut self) -> Result<()> {
        self.require_connected()?;
        self.dm.init().map_err(|e| self.fail(e))
    }

    pub fn is_initialized(&self) -> bool {
        self.dm.is_initialized()
    }

    fn require_initialized(&mut self) -> Result<()> {
        self.require_connected()?;
        if !self.dm.is_initialized() {
            return Err(self.fail(DebugError::NotInitialized));
        }
        Ok(())
    }

    pub fn halt(&mut self, hart_id: u8) -> Result<()> {
        self.require_initialized()?;
        match self.dm.halt(hart_id) {
            Ok(()) => Ok(()),
            Err(crate::error::DmError::AlreadyHalted) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn resume(&mut self, hart_id: u8) -> Result<()> {
        self.require_initialized()?;
        self.dm.resume(hart_id).map_err(|e| self.fail(e))
    }

    pub fn step(&mut self, hart_id: u8) -> Result<()> {
        self.require_initialized()?;
        self.dm.step(hart_id).map_err(|e| self.fail(e))
    }

    pub fn reset(&mut self, hart_id: u8, halt_on_reset: bool) -> Result<()> {
        self.require_initialized()?;
        self.dm
            .reset(hart_id, halt_on_reset)
            .map_err(|e| self.fail(e))
    }

    pub fn is_halted(&self, hart_id: u8) -> Option<bool> {
        self.dm.is_halted(hart_id)
    }

    pub fn read_reg(&mut self, hart_id: u8, n: u8) -> Result<u32> {
        self.require_initialized()?;
        self.dm.read_reg(hart_id, n).map_err(|e| self.fail(e))
    }

    pub fn write_reg(&mut self, hart_id: u8, n: u8, value: u32) -> Result<()> {
        self.require_initialized()?;
        self.dm
            .write_reg(hart_id, n, value)
            .map_err(|e| self.fail(e))
    }

    pub fn read_all_regs(&mut self, hart_id: u8) -> Result<[u32; 32]> {
        self.require_initialized()?;
        self.dm.read_all_regs(hart_id).map_err(|e| self.fail(e))
    }

    pub fn read_pc(&mut self, hart_id: u8) -> Result<u32> {
        self.require_initialized()?;
        self.dm.read_pc(hart_id).map_err(|e| self.fail(e))
    }

    pub fn write_pc(&mut self, hart_id: u8, value: u32) -> Result<()> {
        self.require_initialized()?;
        self.dm.write_pc(hart_id, value).map_err(|e| self.fail(e))
    }

    pub fn read_csr(&mut self, hart_id: u8, csr: u16) -> Result<u32> {
        self.require_initialized()?;
        self.dm.read_csr(hart_id, csr).map_err(|e| self.fail(e))
    }

    pub fn write_csr(&mut self, hart_id: u8, csr: u16, value: u32) -> Result<()> {
        self.require_initialized()?;
        self.dm
            .write_csr(hart_id, csr, value)
            .map_err(|e| self.fail(e))
    }

    pub fn enable_cache(&mut self, enabled: bool) {
        self.dm.enable_cache(enabled);
    }

    pub fn invalidate_cache(&mut self, hart_id: u8) {
        self.dm.invalidate_cache(hart_id);
    }

    /// `execute_progbuf`: run a raw two-word program-buffer snippet
    /// (caller-composed instruction + `ebreak`) and return nothing beyond
    /// success/failure — register effects are observed via `read_reg`.
    pub fn execute_progbuf(&mut self, hart_id: u8, words: [u32; 2]) -> Result<()> {
        self.require_initialized()?;
        self.dm
            .run_progbuf(hart_id, words)
            .map_err(|e| self.fail(e))
    }

    // -- Memory (SBA preferred, MEM-AP-via-hart fallback) -----------------

    fn mem_read32(&mut self, hart_id: u8, addr: u32) -> Result<u32> {
        self.require_initialized()?;
        if self.dm.is_sba_available() {
            self.dm.sba_read32(addr).map_err(|e| self.fail(e))
        } else {
            self.dm
                .mem_via_progbuf_read32(hart_id, addr)
                .map_err(|e| self.fail(e))
        }
    }

    fn mem_write32(&mut self, hart_id: u8, addr: u32, value: u32) -> Result<()> {
        self.require_initialized()?;
        if self.dm.is_sba_available() {
            self.dm.sba_write32(addr, value).map_err(|e| self.fail(e))
        } else {
            self.dm
                .mem_via_progbuf_write32(hart_id, addr, value)
                .map_err(|e| self.fail(e))
        }
    }

    pub fn read_mem32(&mut self, addr: u32) -> Result<u32> {
        self.mem_read32(0, addr)
    }

    pub fn write_mem32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.mem_write32(0, addr, value)
    }

    pub fn read_mem16(&mut self, addr: u32) -> Result<u16> {
        if !addr.is_multiple_of(2) {
            return Err(self.fail(DebugError::Alignment));
        }
        let word = self.read_mem32(addr & !3)?;
        Ok(if addr & 2 == 0 {
            word as u16
        } else {
            (word >> 16) as u16
        })
    }

    pub fn write_mem16(&mut self, addr: u32, value: u16) -> Result<()> {
        if !addr.is_multiple_of(2) {
            return Err(self.fail(DebugError::Alignment));
        }
        let base = addr & !3;
        let word = self.read_mem32(base)?;
        let merged = if addr & 2 == 0 {
            (word & 0xFFFF_0000) | value as u32
        } else {
            (word & 0x0000_FFFF) | ((value as u32) << 16)
        };
        self.write_mem32(base, merged)
    }

    pub fn read_mem8(&mut self, addr: u32) -> Result<u8> {
        let base = addr & !3;
        let shift = (addr & 3) * 8;
        let word = self.read_mem32(base)?;
        Ok((word >> shift) as u8)
    }

    pub fn write_mem8(&mut self, addr: u32, value: u8) -> Result<()> {
        let base = addr & !3;
        let shift = (addr & 3) * 8;
        let word = self.read_mem32(base)?;
        let mask = 0xFFu32 << shift;
        let merged = (word & !mask) | ((value as u32) << shift);
        self.write_mem32(base, merged)
    }

    pub fn read_mem_block(&mut self, addr: u32, out: &mut [u32]) -> Result<()> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read_mem32(addr.wrapping_add((i as u32) * 4))?;
        }
        Ok(())
    }

    /// Plain block write (spec.md §4.5: not verified — see `upload_code`
    /// for the verified variant, spec.md §9 Open Question 3).
    pub fn write_mem_block(&mut self, addr: u32, words: &[u32]) -> Result<()> {
        for (i, word) in words.iter().enumerate() {
            self.write_mem32(addr.wrapping_add((i as u32) * 4), *word)?;
        }
        Ok(())
    }

    /// `upload_code`: each word is written then read back; any mismatch
    /// fails the whole upload with `Verify` (spec.md §4.6).
    pub fn upload_code(&mut self, addr: u32, words: &[u32]) -> Result<()> {
        for (i, word) in words.iter().enumerate() {
            let a = addr.wrapping_add((i as u32) * 4);
            self.write_mem32(a, *word)?;
            if self.read_mem32(a)? != *word {
                return Err(self.fail(DebugError::Verify));
            }
        }
        Ok(())
    }

    /// `execute_code`: upload, halt if running, set PC, verify it stuck,
    /// resume. The hart is left running (spec.md §4.6).
    pub fn execute_code(&mut self, hart_id: u8, entry: u32, words: &[u32]) -> Result<()> {
        self.upload_code(entry, words)?;
        self.halt(hart_id)?;
        self.write_pc(hart_id, entry)?;
        if self.read_pc(hart_id)? != entry {
            return Err(self.fail(DebugError::Verify));
        }
        self.resume(hart_id)
    }

    // -- Single-step tracer ------------------------------------------------

    /// `trace`: halt if needed (treating `AlreadyHalted` as success), then
    /// read-PC/read-instruction/[read-GPRs]/callback/step in a loop.
    /// `max == 0` means unlimited. Returns the count of instructions
    /// successfully traced, swallowing a terminal error once at least one
    /// instruction made it through (spec.md §4.7).
    pub fn trace(
        &mut self,
        hart_id: u8,
        max: u32,
        capture_regs: bool,
        mut callback: impl FnMut(&TraceRecord) -> bool,
    ) -> std::result::Result<u32, DebugError> {
        self.halt(hart_id)?;

        let mut count = 0u32;
        loop {
            if max != 0 && count >= max {
                return Ok(count);
            }
            let step_result = (|| -> Result<TraceRecord> {
                let pc = self.read_pc(hart_id)?;
                let instruction = self.read_mem32(pc)?;
                let gprs = if capture_regs {
                    Some(self.read_all_regs(hart_id)?)
                } else {
                    None
                };
                Ok(TraceRecord {
                    pc,
                    instruction,
                    gprs,
                })
            })();

            let record = match step_result {
                Ok(r) => r,
                Err(e) => {
                    return if count > 0 { Ok(count) } else { Err(e) };
                }
            };

            count += 1;
            if !callback(&record) {
                return Ok(count);
            }

            if let Err(e) = self.step(hart_id) {
                return if count > 0 { Ok(count) } else { Err(e) };
            }
        }
    }

    pub fn resource_usage(&self) -> ResourceUsage {
        resource::usage()
    }

    fn dm_dap(&self) -> &DapEngine {
        self.dm.dap()
    }

    fn dm_dap_mut(&mut self) -> &mut DapEngine {
        self.dm.dap_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimTarget;

    fn connected_target() -> Target {
        let sim = SimTarget::new();
        let mut target = Target::new(Box::new(sim.pio()), WireConfig::default());
        target.connect(None).unwrap();
        target
    }

    #[test]
    fn byte_endianness_scenario() {
        let mut target = connected_target();
        for (i, byte) in [0x12u8, 0x34, 0x56, 0x78].into_iter().enumerate() {
            target.write_mem8(0x2007_7000 + i as u32, byte).unwrap();
        }
        assert_eq!(target.read_mem32(0x2007_7000).unwrap(), 0x7856_3412);
    }

    #[test]
    fn addition_program_scenario() {
        let mut target = connected_target();
        target.halt(0).unwrap();
        target.write_reg(0, 6, 42).unwrap();
        target.write_reg(0, 7, 58).unwrap();
        target
            .execute_code(0, 0x2007_7000, &[0x007302B3, 0x0000006F])
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        target.halt(0).unwrap();
        assert_eq!(target.read_reg(0, 5).unwrap(), 100);
    }

    #[test]
    fn bitwise_not_via_progbuf_scenario() {
        let mut target = connected_target();
        target.halt(0).unwrap();
        target.write_reg(0, 14, 0x1234_5678).unwrap();
        target
            .execute_progbuf(0, [0xFFF74793, 0x00100073])
            .unwrap();
        assert_eq!(target.read_reg(0, 15).unwrap(), 0xEDCB_A987);
    }

    #[test]
    fn dual_hart_register_isolation_scenario() {
        let mut target = connected_target();
        target.halt(0).unwrap();
        target.halt(1).unwrap();
        target.write_reg(0, 10, 0xAAAA_AAAA).unwrap();
        target.write_reg(1, 10, 0x5555_5555).unwrap();
        assert_eq!(target.read_reg(0, 10).unwrap(), 0xAAAA_AAAA);
        assert_eq!(target.read_reg(1, 10).unwrap(), 0x5555_5555);
    }

    #[test]
    fn count_to_ten_loop_scenario() {
        let mut target = connected_target();
        target
            .execute_code(
                0,
                0x2007_7000,
                &[0x00000813, 0x00A00893, 0x00180813, 0xFF181EE3, 0x0000006F],
            )
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        target.halt(0).unwrap();
        assert_eq!(target.read_reg(0, 16).unwrap(), 10);
    }

    #[test]
    fn halt_resume_stress_scenario() {
        let mut target = connected_target();
        for _ in 0..100 {
            target.halt(0).unwrap();
            target.resume(0).unwrap();
        }
    }

    #[test]
    fn sub_word_memory_round_trips() {
        let mut target = connected_target();
        target.write_mem16(0x2007_8000, 0xBEEF).unwrap();
        assert_eq!(target.read_mem16(0x2007_8000).unwrap(), 0xBEEF);
        assert_eq!(target.read_mem32(0x2007_8000).unwrap() & 0xFFFF, 0xBEEF);

        target.write_mem8(0x2007_8010, 0x42).unwrap();
        assert_eq!(target.read_mem8(0x2007_8010).unwrap(), 0x42);
    }

    #[test]
    fn block_write_then_block_read_round_trips() {
        let mut target = connected_target();
        let words = [1u32, 2, 3, 4, 5, 6, 7, 8];
        target.write_mem_block(0x2007_9000, &words).unwrap();
        let mut out = [0u32; 8];
        target.read_mem_block(0x2007_9000, &mut out).unwrap();
        assert_eq!(out, words);
    }

    #[test]
    fn reset_with_halt_on_reset_lands_at_reset_vector() {
        let mut target = connected_target();
        target.reset(0, true).unwrap();
        assert_eq!(target.is_halted(0), Some(true));
        assert_eq!(target.read_pc(0).unwrap(), 0x1000_0000);
    }

    #[test]
    fn x0_is_hardwired_to_zero() {
        let mut target = connected_target();
        target.halt(0).unwrap();
        target.write_reg(0, 0, 0xFFFF_FFFF).unwrap();
        assert_eq!(target.read_reg(0, 0).unwrap(), 0);
    }

    #[test]
    fn invalidate_cache_does_not_disturb_register_contents() {
        let mut target = connected_target();
        target.halt(0).unwrap();
        target.write_reg(0, 3, 0xCAFE_F00D).unwrap();
        target.invalidate_cache(0);
        assert_eq!(target.read_reg(0, 3).unwrap(), 0xCAFE_F00D);
    }

    #[test]
    fn trace_collects_instruction_words_and_stops_on_false() {
        let mut target = connected_target();
        target.halt(0).unwrap();
        target
            .upload_code(0x2007_A000, &[0x0000_0013, 0x0000_0013, 0x0010_0073])
            .unwrap();
        target.write_pc(0, 0x2007_A000).unwrap();

        let mut seen = Vec::new();
        let count = target
            .trace(0, 0, false, |rec| {
                seen.push(rec.pc);
                seen.len() < 2
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(seen, vec![0x2007_A000, 0x2007_A004]);
    }

    #[test]
    fn resource_usage_reflects_the_held_slot() {
        let target = connected_target();
        let usage = target.resource_usage();
        assert!(usage.active_sessions >= 1);
    }

    #[test]
    fn uninitialized_operations_are_rejected() {
        let sim = SimTarget::new();
        let mut target = Target::new(Box::new(sim.pio()), WireConfig::default());
        assert_eq!(target.halt(0), Err(DebugError::NotConnected));
    }
}
