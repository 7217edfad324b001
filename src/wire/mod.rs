//! L1: SWD line-protocol engine.
//!
//! Marshals request/ACK/data phases onto SWCLK/SWDIO through a
//! [`PioBackend`], the hardware-specific programmable I/O block. The
//! backend is an external collaborator (spec.md §6) — this module only
//! knows the bit-exact protocol, the same separation `probe-rs` draws
//! between its architecture layer and a `RawDapAccess`/`DapProbe`
//! implementation (see `architecture/arm/sequences.rs`, which only calls
//! `interface.swj_sequence(..)` and never touches a specific adapter).

use std::time::Duration;

use crate::config::WireConfig;
use crate::error::WireError;

/// Debug Port register addresses (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpReg {
    Idcode = 0x0,
    CtrlStat = 0x4,
    Select = 0x8,
    RdBuff = 0xC,
}

/// Result of an ACK phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Wait,
    Fault,
}

impl Ack {
    fn from_bits(bits: u8) -> Result<Self, WireError> {
        match bits {
            0b001 => Ok(Ack::Ok),
            0b010 => Ok(Ack::Wait),
            0b100 => Ok(Ack::Fault),
            _ => Err(WireError::Protocol),
        }
    }
}

/// The hardware-specific programmable I/O block, reached as a trait so the
/// line-protocol engine stays hardware-agnostic. A real implementation
/// drives an RP2040/RP2350 PIO state machine program; `crate::sim` supplies
/// a software stand-in for tests.
pub trait PioBackend: std::fmt::Debug {
    /// Program the state-machine clock divider computed from [`WireConfig::clock_divider`].
    fn set_divider(&mut self, divider: u16);
    /// Drive `bit_len` bits of `bits` (LSB first) onto SWDIO with SWDIO held
    /// as an output throughout. Used for dormant/activation sequences and
    /// line resets, where no ACK/turnaround framing applies.
    fn raw_sequence(&mut self, bit_len: u32, bits: u128);
    /// Drive `n` additional idle clock cycles with SWDIO low.
    fn idle_clocks(&mut self, n: u32);
    /// Drive the 8-bit request phase (SWDIO output).
    fn write_request(&mut self, byte: u8);
    /// Release SWDIO to input and clock `cycles` turnaround cycles.
    fn turnaround_to_input(&mut self, cycles: u8);
    /// Drive SWDIO as output again and clock `cycles` turnaround cycles.
    fn turnaround_to_output(&mut self, cycles: u8);
    /// Sample the 3-bit ACK phase (LSB first).
    fn read_ack(&mut self) -> u8;
    /// Sample a 32-bit data word plus its trailing parity bit (LSB first).
    fn read_data(&mut self) -> (u32, bool);
    /// Drive a 32-bit data word plus its even-parity bit (LSB first).
    fn write_data(&mut self, word: u32);
}

/// Diagnostic counters, purely observational (spec.md §1A ambient stack),
/// grounded in `probe-rs`'s `probe/jlink/swd.rs::SwdStatistics`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireStatistics {
    pub transfers: u64,
    pub waits: u64,
    pub faults: u64,
    pub line_resets: u64,
}

/// L1 SWD line-protocol engine.
#[derive(Debug)]
pub struct WireEngine {
    backend: Box<dyn PioBackend>,
    config: WireConfig,
    initialized: bool,
    stats: WireStatistics,
}

/// Packs `bytes` into a `u128` so that `bytes[0]`'s bit 0 is the
/// least-significant bit — i.e. the bit order `raw_sequence` sends first.
const fn bytes_to_u128_lsb(bytes: &[u8]) -> u128 {
    let mut v: u128 = 0;
    let mut i = 0;
    while i < bytes.len() {
        v |= (bytes[i] as u128) << (8 * i);
        i += 1;
    }
    v
}

/// (a) "7x0xFF then 0xBC 0xE3 (JTAG->dormant)" (spec.md §6).
const JTAG_TO_DORMANT_BITS: u32 = 9 * 8;
const JTAG_TO_DORMANT: u128 =
    bytes_to_u128_lsb(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xBC, 0xE3]);

/// (b) leading byte of the dormant->SWD sequence: "0xFF then 16 bytes of the
/// selection-alert constant...".
const DORMANT_TO_SWD_LEAD_BITS: u32 = 8;
const DORMANT_TO_SWD_LEAD: u128 = bytes_to_u128_lsb(&[0xFF]);

/// The 128-bit ADIv6 selection-alert constant, sent LSB-first byte-by-byte.
const SELECTION_ALERT_BITS: u32 = 128;
const SELECTION_ALERT: u128 = bytes_to_u128_lsb(&[
    0x92, 0xF3, 0x09, 0x62, 0x95, 0x2D, 0x85, 0x86, 0xE9, 0xAF, 0xDD, 0xE3, 0xA2, 0x0E, 0xBC, 0x19,
]);

/// "...then 0xA0 0xF1 0xFF then 8x0xFF then 0x00" (spec.md §6).
const DORMANT_TO_SWD_TAIL_BITS: u32 = 12 * 8;
const DORMANT_TO_SWD_TAIL: u128 = bytes_to_u128_lsb(&[
    0xA0, 0xF1, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00,
]);

impl WireEngine {
    pub fn new(backend: Box<dyn PioBackend>, config: WireConfig) -> Self {
        WireEngine {
            backend,
            config,
            initialized: false,
            stats: WireStatistics::default(),
        }
    }

    pub fn statistics(&self) -> WireStatistics {
        self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.initialized
    }

    pub fn get_frequency(&self) -> u32 {
        self.config.freq_khz
    }

    pub fn set_frequency(&mut self, khz: u32) {
        self.config.freq_khz = khz;
        self.backend.set_divider(self.config.clock_divider());
    }

    /// Drive a line reset: at least 50 clocks high, followed by a few idle
    /// clocks (spec.md §4.1/§6).
    pub fn line_reset(&mut self) {
        self.backend.raw_sequence(56, (1u128 << 56) - 1);
        self.backend.idle_clocks(4);
        self.stats.line_resets += 1;
    }

    pub fn send_idle_clocks(&mut self, n: u32) {
        self.backend.idle_clocks(n);
    }

    /// Dormant → SWD activation handshake (spec.md §4.1, §6) followed by a
    /// read of `IDCODE` to confirm the link is alive.
    pub fn connect(&mut self) -> Result<u32, WireError> {
        tracing::debug!(freq_khz = self.config.freq_khz, "wire: dormant->SWD activation");
        self.backend.set_divider(self.config.clock_divider());

        // (a) force JTAG side into dormant state; harmless if already dormant/SWD.
        self.backend
            .raw_sequence(JTAG_TO_DORMANT_BITS, JTAG_TO_DORMANT);

        // (b) dormant -> SWD: lead byte, 128-bit selection-alert constant,
        // then the SWD activation tail.
        self.backend
            .raw_sequence(DORMANT_TO_SWD_LEAD_BITS, DORMANT_TO_SWD_LEAD);
        self.backend
            .raw_sequence(SELECTION_ALERT_BITS, SELECTION_ALERT);
        self.backend
            .raw_sequence(DORMANT_TO_SWD_TAIL_BITS, DORMANT_TO_SWD_TAIL);

        // (d) line reset, (e) a few idle clocks.
        self.line_reset();

        let idcode = self.read_dp_raw(DpReg::Idcode)?;
        if (idcode >> 1) & 0x7FF == 0 {
            tracing::warn!("wire: IDCODE designer field is zero, target not responding");
            return Err(WireError::Protocol);
        }

        self.initialized = true;
        tracing::debug!(idcode, "wire: connected");
        Ok(idcode)
    }

    pub fn disconnect(&mut self) {
        tracing::debug!("wire: disconnected");
        self.initialized = false;
    }

    pub fn read_dp_raw(&mut self, reg: DpReg) -> Result<u32, WireError> {
        self.transfer(false, true, reg as u8, 0).map(|v| v.unwrap())
    }

    pub fn write_dp_raw(&mut self, reg: DpReg, value: u32) -> Result<(), WireError> {
        self.transfer(false, false, reg as u8, value).map(|_| ())
    }

    pub fn read_ap_raw(&mut self, addr: u8) -> Result<u32, WireError> {
        self.transfer(true, true, addr, 0).map(|v| v.unwrap())
    }

    pub fn write_ap_raw(&mut self, addr: u8, value: u32) -> Result<(), WireError> {
        self.transfer(true, false, addr, value).map(|_| ())
    }

    /// Single SWD transfer, retried on WAIT up to `retry_count` times with a
    /// ~100us backoff (spec.md §4.1).
    fn transfer(
        &mut self,
        ap_n_dp: bool,
        read: bool,
        addr: u8,
        write_value: u32,
    ) -> Result<Option<u32>, WireError> {
        let a2 = (addr >> 2) & 1 != 0;
        let a3 = (addr >> 3) & 1 != 0;

        for attempt in 0..=self.config.retry_count {
            self.stats.transfers += 1;
            let result = self.transfer_once(ap_n_dp, read, a2, a3, write_value);
            match result {
                Ok(v) => return Ok(v),
                Err(WireError::Timeout) if attempt < self.config.retry_count => {
                    self.stats.waits += 1;
                    tracing::trace!(attempt, "wire: WAIT, retrying");
                    std::thread::sleep(Duration::from_micros(100));
                    continue;
                }
                Err(e) => {
                    if matches!(e, WireError::Fault) {
                        self.stats.faults += 1;
                    }
                    tracing::warn!(?e, "wire: transfer failed");
                    return Err(e);
                }
            }
        }
        Err(WireError::Timeout)
    }

    fn transfer_once(
        &mut self,
        ap_n_dp: bool,
        read: bool,
        a2: bool,
        a3: bool,
        write_value: u32,
    ) -> Result<Option<u32>, WireError> {
        let parity = (ap_n_dp as u8) ^ (read as u8) ^ (a2 as u8) ^ (a3 as u8);
        // Bit 6 (Stop) is always 0, so it's omitted from the pack below.
        let request = 1
            | ((ap_n_dp as u8) << 1)
            | ((read as u8) << 2)
            | ((a2 as u8) << 3)
            | ((a3 as u8) << 4)
            | (parity << 5)
            | (1 << 7); // Park = 1

        self.backend.write_request(request);
        self.backend
            .turnaround_to_input(self.config.turnaround_cycles);

        let ack_bits = self.backend.read_ack();
        let ack = match Ack::from_bits(ack_bits) {
            Ok(ack) => ack,
            Err(e) => {
                self.line_reset();
                return Err(e);
            }
        };

        match ack {
            Ack::Wait => {
                self.backend
                    .turnaround_to_output(self.config.turnaround_cycles);
                return Err(WireError::Timeout);
            }
            Ack::Fault => {
                self.backend
                    .turnaround_to_output(self.config.turnaround_cycles);
                return Err(WireError::Fault);
            }
            Ack::Ok => {}
        }

        if read {
            let (data, parity_bit) = self.backend.read_data();
            self.backend
                .turnaround_to_output(self.config.turnaround_cycles);
            if parity_bit != (data.count_ones() % 2 == 1) {
                return Err(WireError::Parity);
            }
            Ok(Some(data))
        } else {
            self.backend
                .turnaround_to_output(self.config.turnaround_cycles);
            self.backend.write_data(write_value);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimTarget;

    fn connected_engine() -> WireEngine {
        let target = SimTarget::new();
        let mut engine = WireEngine::new(Box::new(target.pio()), WireConfig::default());
        engine.connect().expect("connect should succeed");
        engine
    }

    #[test]
    fn connect_reads_nonzero_designer_idcode() {
        let target = SimTarget::new();
        let mut engine = WireEngine::new(Box::new(target.pio()), WireConfig::default());
        let idcode = engine.connect().unwrap();
        assert_ne!((idcode >> 1) & 0x7FF, 0);
        assert!(engine.is_connected());
    }

    #[test]
    fn dp_select_write_then_readback_via_ctrlstat() {
        let mut engine = connected_engine();
        engine.write_dp_raw(DpReg::Select, 0x0000_0000).unwrap();
        // CTRL/STAT starts at zero before power-up.
        let ctrl = engine.read_dp_raw(DpReg::CtrlStat).unwrap();
        assert_eq!(ctrl, 0);
    }

    #[test]
    fn forced_parity_flip_is_detected() {
        let target = SimTarget::new();
        let mut pio = target.pio();
        pio.force_next_read_parity_error();
        let mut engine = WireEngine::new(Box::new(pio), WireConfig::default());
        let err = engine.connect().unwrap_err();
        assert_eq!(err, WireError::Parity);
    }
}
