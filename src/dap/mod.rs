//! L2: Debug Access Port engine.
//!
//! Multiplexes the single Debug Port and several Access Ports over the Wire
//! Engine, caching `(APSEL, BANK)` in `SELECT` the way `probe-rs`'s ARM
//! `ArmCommunicationInterface` caches its own AP/bank selection rather than
//! re-issuing `SELECT` on every access (see `architecture/arm/dp/mod.rs`).

use std::time::Duration;

use crate::error::DapError;
use crate::wire::{DpReg, WireEngine};

/// The RISC-V APB Access Port — the only AP this target's debug controller
/// ever selects (spec.md §6: "0xA = RISC-V APB (the one used)").
pub const RISCV_AP: u8 = 0xA;

const AP_CSW: u8 = 0x00;
const AP_TAR: u8 = 0x04;
const AP_DRW: u8 = 0x0C;

/// Fixed low nibble of the non-standard `SELECT` encoding (spec.md §4.2,
/// §6): `(APSEL<<12) | (0xD<<8) | (BANK<<4) | CTRLSEL`.
const CTRLSEL: u32 = 1;

const CDBGPWRUPREQ: u32 = 1 << 28;
const CDBGPWRUPACK: u32 = 1 << 29;
const CSYSPWRUPREQ: u32 = 1 << 30;
const CSYSPWRUPACK: u32 = 1 << 31;

const STICKYORUN: u32 = 1 << 1;
const STICKYCMP: u32 = 1 << 4;
const STICKYERR: u32 = 1 << 5;
const WDATAERR: u32 = 1 << 7;

/// L2 Debug Access Port engine.
#[derive(Debug)]
pub struct DapEngine {
    wire: WireEngine,
    /// Cached `(APSEL, BANK)` last written to `SELECT`; `None` after any
    /// event that bypasses the cache (a raw `SELECT` write, a fresh
    /// connect). The sole source of truth for skipping redundant `SELECT`
    /// writes (spec.md §3, §4.2).
    current_apsel: Option<u8>,
    current_bank: Option<u8>,
    powered: bool,
}

impl DapEngine {
    pub fn new(wire: WireEngine) -> Self {
        DapEngine {
            wire,
            current_apsel: None,
            current_bank: None,
            powered: false,
        }
    }

    pub fn connect(&mut self) -> Result<u32, DapError> {
        let idcode = self.wire.connect()?;
        self.current_apsel = None;
        self.current_bank = None;
        self.powered = false;
        Ok(idcode)
    }

    pub fn disconnect(&mut self) {
        self.wire.disconnect();
        self.current_apsel = None;
        self.current_bank = None;
        self.powered = false;
    }

    pub fn is_connected(&self) -> bool {
        self.wire.is_connected()
    }

    pub fn get_frequency(&self) -> u32 {
        self.wire.get_frequency()
    }

    pub fn set_frequency(&mut self, khz: u32) {
        self.wire.set_frequency(khz)
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Direct (uncached) Debug Port access. Writing `SELECT` through this
    /// path still bypasses the bank cache — spec.md §9 requires the cache
    /// be invalidated whenever `SELECT` is written outside the cache path,
    /// so any direct write here is treated as exactly that.
    pub fn read_dp(&mut self, reg: DpReg) -> Result<u32, DapError> {
        Ok(self.wire.read_dp_raw(reg)?)
    }

    pub fn write_dp(&mut self, reg: DpReg, value: u32) -> Result<(), DapError> {
        if reg == DpReg::Select {
            self.current_apsel = None;
            self.current_bank = None;
        }
        Ok(self.wire.write_dp_raw(reg, value)?)
    }

    /// `ap_read(apsel, reg)`: select the bank, issue the AP read, then read
    /// `RDBUFF` for the actual (pipelined) value (spec.md §4.2 point 3).
    pub fn ap_read(&mut self, apsel: u8, reg: u8) -> Result<u32, DapError> {
        self.select_bank(apsel, reg)?;
        self.wire.read_ap_raw(reg & 0xC)?;
        Ok(self.wire.read_dp_raw(DpReg::RdBuff)?)
    }

    /// `ap_write(apsel, reg, v)`: select the bank, issue the AP write, then
    /// read `RDBUFF` to flush the posted write and surface any latched
    /// `FAULT` (spec.md §4.2 point 4).
    pub fn ap_write(&mut self, apsel: u8, reg: u8, value: u32) -> Result<(), DapError> {
        self.select_bank(apsel, reg)?;
        self.wire.write_ap_raw(reg & 0xC, value)?;
        self.wire.read_dp_raw(DpReg::RdBuff)?;
        Ok(())
    }

    fn select_bank(&mut self, apsel: u8, reg: u8) -> Result<(), DapError> {
        let bank = (reg >> 4) & 0xF;
        if self.current_apsel == Some(apsel) && self.current_bank == Some(bank) {
            return Ok(());
        }
        let value = ((apsel as u32) << 12) | (0xD << 8) | ((bank as u32) << 4) | CTRLSEL;
        tracing::trace!(apsel, bank, "dap: SELECT bank change");
        self.wire.write_dp_raw(DpReg::Select, value)?;
        self.current_apsel = Some(apsel);
        self.current_bank = Some(bank);
        Ok(())
    }

    /// Clear `CTRL/STAT`, request both debug-domain power-ups, then poll for
    /// both acknowledgments (spec.md §4.2: up to 10 iterations at 20 ms).
    pub fn power_up(&mut self) -> Result<(), DapError> {
        tracing::debug!("dap: requesting debug/system power-up");
        self.write_dp(DpReg::CtrlStat, 0)?;
        self.write_dp(DpReg::CtrlStat, CDBGPWRUPREQ | CSYSPWRUPREQ)?;
        for _ in 0..10 {
            let v = self.read_dp(DpReg::CtrlStat)?;
            if v & CDBGPWRUPACK != 0 && v & CSYSPWRUPACK != 0 {
                self.powered = true;
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        tracing::warn!("dap: power-up ack timed out");
        Err(DapError::PowerUpTimeout)
    }

    /// Write-1-to-clear the sticky error bits in `CTRL/STAT` (spec.md §4.2).
    pub fn clear_errors(&mut self) -> Result<(), DapError> {
        self.write_dp(DpReg::CtrlStat, STICKYORUN | STICKYCMP | STICKYERR | WDATAERR)
    }

    /// 32-bit MEM-AP access through the RISC-V AP's `TAR`/`DRW`, used to
    /// reach the Debug Module's register file (spec.md §4.2).
    pub fn read_mem32(&mut self, addr: u32) -> Result<u32, DapError> {
        if !addr.is_multiple_of(4) {
            return Err(DapError::Alignment);
        }
        self.ap_write(RISCV_AP, AP_TAR, addr)?;
        self.ap_read(RISCV_AP, AP_DRW)
    }

    pub fn write_mem32(&mut self, addr: u32, value: u32) -> Result<(), DapError> {
        if !addr.is_multiple_of(4) {
            return Err(DapError::Alignment);
        }
        self.ap_write(RISCV_AP, AP_TAR, addr)?;
        self.ap_write(RISCV_AP, AP_DRW, value)
    }

    /// Direct access to the RISC-V AP's `CSW` register, used only by the DM
    /// activation handshake (spec.md §4.3) — everything else goes through
    /// [`DapEngine::read_mem32`]/[`DapEngine::write_mem32`].
    pub fn write_ap_csw(&mut self, bank: u8, value: u32) -> Result<(), DapError> {
        self.ap_write(RISCV_AP, (bank << 4) | AP_CSW, value)
    }

    pub fn read_ap_csw(&mut self, bank: u8) -> Result<u32, DapError> {
        self.ap_read(RISCV_AP, (bank << 4) | AP_CSW)
    }

    pub fn statistics(&self) -> crate::wire::WireStatistics {
        self.wire.statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WireConfig;
    use crate::sim::SimTarget;

    fn connected_dap() -> DapEngine {
        let target = SimTarget::new();
        let wire = WireEngine::new(Box::new(target.pio()), WireConfig::default());
        let mut dap = DapEngine::new(wire);
        dap.connect().unwrap();
        dap
    }

    #[test]
    fn power_up_observes_both_acks() {
        let mut dap = connected_dap();
        assert!(!dap.is_powered());
        dap.power_up().unwrap();
        assert!(dap.is_powered());
    }

    #[test]
    fn bank_cache_skips_redundant_select_writes() {
        let mut dap = connected_dap();
        dap.ap_write(RISCV_AP, 0x00, 0xA2000002).unwrap();
        let before = dap.statistics().transfers;
        dap.ap_write(RISCV_AP, 0x04, 0x1234).unwrap();
        let after = dap.statistics().transfers;
        // Same (apsel, bank): only the AP write + RDBUFF flush, no SELECT rewrite.
        assert_eq!(after - before, 2);
    }

    #[test]
    fn mem32_roundtrips_through_tar_drw() {
        let mut dap = connected_dap();
        dap.write_ap_csw(1, 0x0000_0000).unwrap();
        dap.write_ap_csw(1, 0x0000_0001).unwrap();
        dap.write_ap_csw(1, 0x07FF_FFC1).unwrap();
        let status = dap.read_ap_csw(1).unwrap();
        assert_eq!(status, 0x0401_0001);
    }
}
