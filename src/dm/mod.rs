//! L3: RISC-V Debug Module driver.
//!
//! Drives hart halt/resume/step/reset, GPR and CSR access, and the program
//! buffer over the MEM-AP window the DAP engine opens at the Debug Module's
//! base address (spec.md §4.3). Grounded the way `probe-rs`'s
//! `architecture/riscv/communication_interface.rs` layers its `Dmi`
//! abstract-command and program-buffer helpers on top of its DAP access.

pub mod assembly;
pub mod registers;

use std::time::Duration;

use crate::dap::{DapEngine, RISCV_AP};
use crate::error::{DmError, SbaError};
use crate::hart::HartState;
use registers::{Abstractcs, Command, Dmstatus, Sbcs};

/// The target has exactly two Hazard3 harts (spec.md §1).
pub const HART_COUNT: usize = 2;

const AP_CSW: u8 = 0x00;

/// L3 RISC-V Debug Module driver.
#[derive(Debug)]
pub struct DmDriver {
    dap: DapEngine,
    initialized: bool,
    sba_initialized: bool,
    cache_enabled: bool,
    harts: [HartState; HART_COUNT],
}

impl DmDriver {
    pub fn new(dap: DapEngine) -> Self {
        DmDriver {
            dap,
            initialized: false,
            sba_initialized: false,
            cache_enabled: true,
            harts: [HartState::new(); HART_COUNT],
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_sba_available(&self) -> bool {
        self.sba_initialized
    }

    pub fn enable_cache(&mut self, enabled: bool) {
        self.cache_enabled = enabled;
    }

    /// Force the GPR mirror for `hart_id` to be re-read on next access
    /// (spec.md §6).
    pub fn invalidate_cache(&mut self, hart_id: u8) {
        self.harts[hart_id as usize].invalidate_cache();
    }

    /// The undocumented activation handshake (spec.md §4.3): select the
    /// RISC-V AP's bank 0, point `TAR` at `DMCONTROL`, then drive a fixed
    /// three-write sequence through bank 1's `CSW` to unlock the DM window.
    /// On success, zero per-hart state and best-effort initialize SBA — a
    /// target without a system bus master still gets a usable DM.
    pub fn init(&mut self) -> Result<(), DmError> {
        self.dap.ap_write(RISCV_AP, AP_CSW, 0xA200_0002)?;
        self.dap.ap_write(RISCV_AP, 0x04, registers::DMCONTROL)?;

        self.dap.ap_write(RISCV_AP, (1 << 4) | AP_CSW, 0x0000_0000)?;
        std::thread::sleep(Duration::from_millis(50));
        self.dap.ap_write(RISCV_AP, (1 << 4) | AP_CSW, 0x0000_0001)?;
        std::thread::sleep(Duration::from_millis(50));
        self.dap
            .ap_write(RISCV_AP, (1 << 4) | AP_CSW, 0x07FF_FFC1)?;
        std::thread::sleep(Duration::from_millis(50));

        let status = self.dap.ap_read(RISCV_AP, (1 << 4) | AP_CSW)?;
        if status != 0x0401_0001 {
            tracing::warn!(status, "dm: activation handshake produced unexpected CSW status");
            return Err(DmError::InvalidState);
        }

        self.initialized = true;
        self.harts = [HartState::new(); HART_COUNT];
        if self.sba_init().is_err() {
            tracing::debug!("dm: no system bus master, SBA pathway unavailable");
        }
        tracing::debug!("dm: initialized");
        Ok(())
    }

    fn require_initialized(&self) -> Result<(), DmError> {
        if !self.initialized {
            return Err(DmError::InvalidState);
        }
        Ok(())
    }

    fn require_halted(&self, hart_id: u8) -> Result<(), DmError> {
        self.require_initialized()?;
        let hart = &self.harts[hart_id as usize];
        if !(hart.halt_state_known && hart.halted) {
            return Err(DmError::NotHalted);
        }
        Ok(())
    }

    /// Every hart-dependent DM access first writes `DMCONTROL` with
    /// `dmactive=1` and the target hart in `hartsello` (spec.md §4.3).
    fn select_hart(&mut self, hart_id: u8) -> Result<(), DmError> {
        let v = registers::dmcontrol_select_hart(hart_id);
        self.dap.write_mem32(registers::DMCONTROL, v.0)?;
        Ok(())
    }

    fn dmcontrol_write(
        &mut self,
        hart_id: u8,
        haltreq: bool,
        resumereq: bool,
        ndmreset: bool,
    ) -> Result<(), DmError> {
        let mut v = registers::dmcontrol_select_hart(hart_id);
        v.set_haltreq(haltreq);
        v.set_resumereq(resumereq);
        v.set_ndmreset(ndmreset);
        self.dap.write_mem32(registers::DMCONTROL, v.0)?;
        Ok(())
    }

    fn read_dmstatus(&mut self) -> Result<Dmstatus, DmError> {
        Ok(Dmstatus(self.dap.read_mem32(registers::DMSTATUS)?))
    }

    /// `halt(hart_id)`: fast path `AlreadyHalted` if the hart's tracked
    /// state already says so; otherwise request and poll for it (spec.md
    /// §4.3: up to 10 iterations at 10 ms).
    pub fn halt(&mut self, hart_id: u8) -> Result<(), DmError> {
        self.require_initialized()?;
        let idx = hart_id as usize;
        if self.harts[idx].halt_state_known && self.harts[idx].halted {
            return Err(DmError::AlreadyHalted);
        }
        self.dmcontrol_write(hart_id, true, false, false)?;
        for _ in 0..10 {
            if self.read_dmstatus()?.allhalted() {
                self.harts[idx].set_known_state(true);
                tracing::debug!(hart_id, "dm: halted");
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        tracing::warn!(hart_id, "dm: halt request timed out");
        Err(DmError::Timeout)
    }

    /// `resume(hart_id)`: no-op if the hart is already known running,
    /// otherwise request and poll `allrunning` (spec.md §4.3).
    pub fn resume(&mut self, hart_id: u8) -> Result<(), DmError> {
        self.require_initialized()?;
        let idx = hart_id as usize;
        if self.harts[idx].halt_state_known && !self.harts[idx].halted {
            return Ok(());
        }
        self.dmcontrol_write(hart_id, false, true, false)?;
        for _ in 0..10 {
            if self.read_dmstatus()?.allrunning() {
                self.harts[idx].set_known_state(false);
                tracing::debug!(hart_id, "dm: resumed");
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        tracing::warn!(hart_id, "dm: resume request timed out");
        Err(DmError::Timeout)
    }

    pub fn is_halted(&self, hart_id: u8) -> Option<bool> {
        let hart = &self.harts[hart_id as usize];
        hart.halt_state_known.then_some(hart.halted)
    }

    /// `step(hart_id)`: set `DCSR.step`, resume, poll for the automatic
    /// re-halt, then restore the original `DCSR` (spec.md §4.3, §4.8).
    pub fn step(&mut self, hart_id: u8) -> Result<(), DmError> {
        self.require_halted(hart_id)?;
        let saved_dcsr = self.read_csr(hart_id, registers::DCSR)?;
        self.write_csr(hart_id, registers::DCSR, saved_dcsr | (1 << 2))?;

        // spec.md §4.3 step (3): write DMCONTROL with no flags first, to
        // clear the latched haltreq, then again with resumereq=1.
        self.dmcontrol_write(hart_id, false, false, false)?;
        self.dmcontrol_write(hart_id, false, true, false)?;
        let mut settled = false;
        for _ in 0..10 {
            if self.read_dmstatus()?.allhalted() {
                settled = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.write_csr(hart_id, registers::DCSR, saved_dcsr)?;
        if !settled {
            return Err(DmError::Timeout);
        }
        let idx = hart_id as usize;
        self.harts[idx].set_known_state(true);
        Ok(())
    }

    /// `reset(hart_id, halt_on_reset)`: assert then deassert `ndmreset`
    /// (spec.md §4.3); `halt_on_reset` is carried through `haltreq` so the
    /// hart lands halted at the reset vector rather than running. If
    /// `halt_on_reset`, poll `allhalted` after the wait and only mark the
    /// hart's halt state known once that's confirmed.
    pub fn reset(&mut self, hart_id: u8, halt_on_reset: bool) -> Result<(), DmError> {
        self.require_initialized()?;
        tracing::debug!(hart_id, halt_on_reset, "dm: resetting hart");
        self.dmcontrol_write(hart_id, halt_on_reset, false, true)?;
        std::thread::sleep(Duration::from_millis(10));
        self.dmcontrol_write(hart_id, halt_on_reset, false, false)?;
        std::thread::sleep(Duration::from_millis(50));

        let idx = hart_id as usize;
        self.harts[idx] = HartState::new();
        if halt_on_reset {
            let mut settled = false;
            for _ in 0..10 {
                if self.read_dmstatus()?.allhalted() {
                    settled = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            if !settled {
                tracing::warn!(hart_id, "dm: reset did not reach halted in time");
                return Err(DmError::Timeout);
            }
        }
        self.harts[idx].set_known_state(halt_on_reset);
        Ok(())
    }

    fn issue_abstract_command(&mut self, cmd: Command) -> Result<(), DmError> {
        self.dap.write_mem32(registers::COMMAND, cmd.0)?;
        for _ in 0..1000 {
            let acs = Abstractcs(self.dap.read_mem32(registers::ABSTRACTCS)?);
            if !acs.busy() {
                if acs.cmderr() != 0 {
                    tracing::warn!(cmderr = acs.cmderr(), "dm: abstract command faulted");
                    self.dap.write_mem32(registers::ABSTRACTCS, 0x700)?;
                    return Err(DmError::AbstractCmd);
                }
                return Ok(());
            }
        }
        tracing::warn!("dm: abstract command did not clear busy in time");
        Err(DmError::Timeout)
    }

    /// `read_reg`/`write_reg`: abstract command GPR transfer, `regno =
    /// GPR0 + n` (spec.md §4.3). `x0` is hardwired and never transferred.
    pub fn read_reg(&mut self, hart_id: u8, n: u8) -> Result<u32, DmError> {
        self.require_halted(hart_id)?;
        if n == 0 {
            return Ok(0);
        }
        self.select_hart(hart_id)?;
        let mut cmd = Command(0);
        cmd.set_regno(registers::GPR0 + n as u32);
        cmd.set_aarsize(2);
        cmd.set_transfer(true);
        self.issue_abstract_command(cmd)?;
        let v = self.dap.read_mem32(registers::DATA0)?;
        self.harts[hart_id as usize].update_cached_gpr(n, v, self.cache_enabled);
        Ok(v)
    }

    pub fn write_reg(&mut self, hart_id: u8, n: u8, value: u32) -> Result<(), DmError> {
        self.require_halted(hart_id)?;
        if n == 0 {
            return Ok(());
        }
        self.select_hart(hart_id)?;
        self.dap.write_mem32(registers::DATA0, value)?;
        let mut cmd = Command(0);
        cmd.set_regno(registers::GPR0 + n as u32);
        cmd.set_aarsize(2);
        cmd.set_transfer(true);
        cmd.set_write(true);
        self.issue_abstract_command(cmd)?;
        self.harts[hart_id as usize].update_cached_gpr(n, value, self.cache_enabled);
        Ok(())
    }

    pub fn read_all_regs(&mut self, hart_id: u8) -> Result<[u32; 32], DmError> {
        let mut regs = [0u32; 32];
        for (n, slot) in regs.iter_mut().enumerate() {
            *slot = self.read_reg(hart_id, n as u8)?;
        }
        self.harts[hart_id as usize].cache_valid = self.cache_enabled;
        Ok(regs)
    }

    fn program_buffer_call(&mut self, hart_id: u8, insn: u32) -> Result<(), DmError> {
        self.select_hart(hart_id)?;
        self.dap.write_mem32(registers::PROGBUF0, insn)?;
        self.dap
            .write_mem32(registers::PROGBUF1, assembly::EBREAK)?;
        let mut cmd = Command(0);
        cmd.set_postexec(true);
        self.issue_abstract_command(cmd)
    }

    /// `read_csr`/`write_csr`: the program-buffer "RPC" pattern (spec.md
    /// §4.3) — save `s0`, move the CSR through it with a single composed
    /// instruction plus `ebreak`, then restore `s0` unconditionally (even
    /// on a failed transfer) so the scratch register never leaks state.
    pub fn read_csr(&mut self, hart_id: u8, csr: u16) -> Result<u32, DmError> {
        self.require_halted(hart_id)?;
        let saved_s0 = self.read_reg(hart_id, 8)?;
        let call = self.program_buffer_call(hart_id, assembly::csrr(8, csr));
        let value = call.and_then(|_| self.read_reg(hart_id, 8));
        self.write_reg(hart_id, 8, saved_s0)?;
        value
    }

    pub fn write_csr(&mut self, hart_id: u8, csr: u16, value: u32) -> Result<(), DmError> {
        self.require_halted(hart_id)?;
        let saved_s0 = self.read_reg(hart_id, 8)?;
        self.write_reg(hart_id, 8, value)?;
        let call = self.program_buffer_call(hart_id, assembly::csrw(csr, 8));
        self.write_reg(hart_id, 8, saved_s0)?;
        call
    }

    pub fn read_pc(&mut self, hart_id: u8) -> Result<u32, DmError> {
        self.read_csr(hart_id, registers::DPC)
    }

    pub fn write_pc(&mut self, hart_id: u8, value: u32) -> Result<(), DmError> {
        self.write_csr(hart_id, registers::DPC, value)
    }

    /// General memory access through a halted hart's load/store path
    /// (program-buffer `lw`/`sw` via `s0`/`s1`), the intrusive fallback
    /// used when System Bus Access is unavailable (spec.md §4.4, §9).
    pub fn mem_via_progbuf_read32(&mut self, hart_id: u8, addr: u32) -> Result<u32, DmError> {
        self.require_halted(hart_id)?;
        let saved_s0 = self.read_reg(hart_id, 8)?;
        self.write_reg(hart_id, 8, addr)?;
        let call = self.program_buffer_call(hart_id, assembly::lw(0, 8, 2, 8));
        let value = call.and_then(|_| self.read_reg(hart_id, 8));
        self.write_reg(hart_id, 8, saved_s0)?;
        value
    }

    pub fn mem_via_progbuf_write32(
        &mut self,
        hart_id: u8,
        addr: u32,
        data: u32,
    ) -> Result<(), DmError> {
        self.require_halted(hart_id)?;
        let saved_s0 = self.read_reg(hart_id, 8)?;
        let saved_s1 = self.read_reg(hart_id, 9)?;
        self.write_reg(hart_id, 8, addr)?;
        self.write_reg(hart_id, 9, data)?;
        let call = self.program_buffer_call(hart_id, assembly::sw(0, 8, 2, 9));
        self.write_reg(hart_id, 8, saved_s0)?;
        self.write_reg(hart_id, 9, saved_s1)?;
        call
    }

    /// `SBCS.sbasize == 0` means no system bus master is present; leave SBA
    /// unavailable rather than fail the whole `init()`.
    pub fn sba_init(&mut self) -> Result<(), SbaError> {
        let sbcs = Sbcs(self.dap.read_mem32(registers::SBCS)?);
        if sbcs.sbasize() == 0 {
            return Err(SbaError::NoBusMaster);
        }
        let mut v = Sbcs(0);
        v.set_sbaccess(2);
        v.set_sbreadonaddr(true);
        v.set_sberror(0x7); // W1C: clear any stale sticky error.
        self.dap.write_mem32(registers::SBCS, v.0)?;
        self.sba_initialized = true;
        Ok(())
    }

    fn require_sba(&self) -> Result<(), SbaError> {
        if !self.sba_initialized {
            return Err(SbaError::NoBusMaster);
        }
        Ok(())
    }

    /// Non-intrusive 32-bit read via the system bus master, bypassing the
    /// hart entirely (spec.md §4.4): write `SBADDRESS0`, read `SBDATA0`.
    pub fn sba_read32(&mut self, addr: u32) -> Result<u32, SbaError> {
        if !addr.is_multiple_of(4) {
            return Err(SbaError::Alignment);
        }
        self.require_sba()?;
        self.dap.write_mem32(registers::SBADDRESS0, addr)?;
        Ok(self.dap.read_mem32(registers::SBDATA0)?)
    }

    pub fn sba_write32(&mut self, addr: u32, value: u32) -> Result<(), SbaError> {
        if !addr.is_multiple_of(4) {
            return Err(SbaError::Alignment);
        }
        self.require_sba()?;
        self.dap.write_mem32(registers::SBADDRESS0, addr)?;
        self.dap.write_mem32(registers::SBDATA0, value)?;
        Ok(())
    }

    pub fn sba_check_errors(&mut self) -> Result<(), SbaError> {
        let sbcs = Sbcs(self.dap.read_mem32(registers::SBCS)?);
        if sbcs.sberror() != 0 {
            let mut clear = Sbcs(0);
            clear.set_sberror(0x7);
            self.dap.write_mem32(registers::SBCS, clear.0)?;
            return Err(SbaError::BusError);
        }
        Ok(())
    }

    pub fn statistics(&self) -> crate::wire::WireStatistics {
        self.dap.statistics()
    }

    pub fn dap(&self) -> &DapEngine {
        &self.dap
    }

    pub fn dap_mut(&mut self) -> &mut DapEngine {
        &mut self.dap
    }

    /// `execute_progbuf`: run a caller-composed two-word program-buffer
    /// snippet (instruction + `ebreak`) directly, for callers that want the
    /// raw primitive rather than the CSR/memory RPC wrappers above.
    pub fn run_progbuf(&mut self, hart_id: u8, words: [u32; 2]) -> Result<(), DmError> {
        self.require_halted(hart_id)?;
        self.select_hart(hart_id)?;
        self.dap.write_mem32(registers::PROGBUF0, words[0])?;
        self.dap.write_mem32(registers::PROGBUF1, words[1])?;
        let mut cmd = Command(0);
        cmd.set_postexec(true);
        self.issue_abstract_command(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WireConfig;
    use crate::sim::SimTarget;
    use crate::wire::WireEngine;

    fn initialized_dm() -> DmDriver {
        let target = SimTarget::new();
        let wire = WireEngine::new(Box::new(target.pio()), WireConfig::default());
        let mut dap = DapEngine::new(wire);
        dap.connect().unwrap();
        dap.power_up().unwrap();
        let mut dm = DmDriver::new(dap);
        dm.init().unwrap();
        dm
    }

    #[test]
    fn init_unlocks_and_enables_sba() {
        let dm = initialized_dm();
        assert!(dm.is_initialized());
        assert!(dm.is_sba_available());
    }

    #[test]
    fn halt_then_halt_again_is_already_halted() {
        let mut dm = initialized_dm();
        dm.halt(0).unwrap();
        assert_eq!(dm.halt(0), Err(DmError::AlreadyHalted));
    }

    #[test]
    fn gpr_roundtrips_through_abstract_command() {
        let mut dm = initialized_dm();
        dm.halt(0).unwrap();
        dm.write_reg(0, 5, 0xDEAD_BEEF).unwrap();
        assert_eq!(dm.read_reg(0, 5).unwrap(), 0xDEAD_BEEF);
        assert_eq!(dm.write_reg(0, 0, 0xFFFF_FFFF), Ok(()));
        assert_eq!(dm.read_reg(0, 0).unwrap(), 0);
    }

    #[test]
    fn read_all_regs_then_invalidate_cache_still_reads_live_values() {
        let mut dm = initialized_dm();
        dm.halt(0).unwrap();
        dm.write_reg(0, 7, 0x1111_1111).unwrap();
        let regs = dm.read_all_regs(0).unwrap();
        assert_eq!(regs[7], 0x1111_1111);

        dm.invalidate_cache(0);
        dm.write_reg(0, 7, 0x2222_2222).unwrap();
        assert_eq!(dm.read_reg(0, 7).unwrap(), 0x2222_2222);
    }

    #[test]
    fn two_harts_have_independent_registers() {
        let mut dm = initialized_dm();
        dm.halt(0).unwrap();
        dm.halt(1).unwrap();
        dm.write_reg(0, 10, 111).unwrap();
        dm.write_reg(1, 10, 222).unwrap();
        assert_eq!(dm.read_reg(0, 10).unwrap(), 111);
        assert_eq!(dm.read_reg(1, 10).unwrap(), 222);
    }

    #[test]
    fn pc_roundtrips_through_program_buffer() {
        let mut dm = initialized_dm();
        dm.halt(0).unwrap();
        dm.write_pc(0, 0x2000_0100).unwrap();
        assert_eq!(dm.read_pc(0).unwrap(), 0x2000_0100);
    }

    #[test]
    fn addition_program_runs_to_self_jump_then_halts() {
        let mut dm = initialized_dm();
        dm.halt(0).unwrap();
        dm.write_pc(0, 0x2000_0000).unwrap();
        for (i, word) in [0x007302B3u32, 0x0000006F].into_iter().enumerate() {
            dm.mem_via_progbuf_write32(0, 0x2000_0000 + (i as u32) * 4, word)
                .unwrap();
        }
        dm.write_reg(0, 6, 3).unwrap(); // x6
        dm.write_reg(0, 7, 4).unwrap(); // x7
        dm.resume(0).unwrap();
        dm.halt(0).unwrap();
        assert_eq!(dm.read_reg(0, 5).unwrap(), 7); // x5 = x6 + x7
    }

    #[test]
    fn step_advances_pc_by_one_instruction_then_rehalts() {
        let mut dm = initialized_dm();
        dm.halt(0).unwrap();
        dm.write_pc(0, 0x2000_0000).unwrap();
        dm.mem_via_progbuf_write32(0, 0x2000_0000, 0x0000_0013) // nop (addi x0,x0,0)
            .unwrap();
        dm.mem_via_progbuf_write32(0, 0x2000_0004, 0x0010_0073) // ebreak
            .unwrap();
        dm.step(0).unwrap();
        assert_eq!(dm.read_pc(0).unwrap(), 0x2000_0004);
        assert_eq!(dm.is_halted(0), Some(true));
    }

    #[test]
    fn reset_with_halt_on_reset_lands_halted_at_reset_vector() {
        let mut dm = initialized_dm();
        dm.reset(0, true).unwrap();
        assert_eq!(dm.is_halted(0), Some(true));
        assert_eq!(dm.read_pc(0).unwrap(), 0x1000_0000u32);
    }

    #[test]
    fn sba_roundtrips_general_memory() {
        let mut dm = initialized_dm();
        dm.sba_write32(0x2000_2000, 0x1234_5678).unwrap();
        assert_eq!(dm.sba_read32(0x2000_2000).unwrap(), 0x1234_5678);
    }

    #[test]
    fn reading_unhalted_hart_register_is_rejected() {
        let mut dm = initialized_dm();
        assert_eq!(dm.read_reg(0, 1), Err(DmError::NotHalted));
    }
}
