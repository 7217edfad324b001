//! Debug Module register layouts.
//!
//! Bitfield-backed register types via the `bitfield` crate, the same tool
//! `probe-rs` wraps with its `memory_mapped_bitfield_register!` macro
//! (`core/memory_mapped_registers.rs`). RISC-V DM addresses are absolute
//! byte offsets reached through [`crate::dap::DapEngine::read_mem32`]/
//! [`crate::dap::DapEngine::write_mem32`] (spec.md §6), so unlike that
//! macro's ARM Cortex-A base-address offsetting this module just pairs each
//! bitfield struct with a plain `BYTE_OFFSET` constant.

use bitfield::bitfield;

pub const DATA0: u32 = 0x10;
pub const DMCONTROL: u32 = 0x40;
pub const DMSTATUS: u32 = 0x44;
pub const ABSTRACTCS: u32 = 0x58;
pub const COMMAND: u32 = 0x5C;
pub const PROGBUF0: u32 = 0x80;
pub const PROGBUF1: u32 = 0x84;
pub const SBCS: u32 = 0xE0;
pub const SBADDRESS0: u32 = 0xE4;
pub const SBDATA0: u32 = 0xF0;

/// DCSR (CSR 0x7b0): single-step bit lives in bit 2 (spec.md GLOSSARY).
pub const DCSR: u16 = 0x7b0;
/// DPC (CSR 0x7b1): saved PC at debug-mode entry (spec.md GLOSSARY).
pub const DPC: u16 = 0x7b1;

bitfield! {
    #[derive(Copy, Clone)]
    pub struct Dmcontrol(u32);
    impl Debug;
    pub haltreq, set_haltreq: 31;
    pub resumereq, set_resumereq: 30;
    pub hartsello, set_hartsello: 25, 16;
    pub ndmreset, set_ndmreset: 1;
    pub dmactive, set_dmactive: 0;
}

bitfield! {
    #[derive(Copy, Clone)]
    pub struct Dmstatus(u32);
    impl Debug;
    pub allrunning, _: 11;
    pub allhalted, _: 9;
}

bitfield! {
    #[derive(Copy, Clone)]
    pub struct Abstractcs(u32);
    impl Debug;
    pub busy, _: 12;
    pub cmderr, set_cmderr: 10, 8;
}

// Abstract Command register (write-only; spec.md §6).
bitfield! {
    #[derive(Copy, Clone)]
    pub struct Command(u32);
    impl Debug;
    pub aarsize, set_aarsize: 22, 20;
    pub postexec, set_postexec: 18;
    pub transfer, set_transfer: 17;
    pub write, set_write: 16;
    pub regno, set_regno: 15, 0;
}

bitfield! {
    #[derive(Copy, Clone)]
    pub struct Sbcs(u32);
    impl Debug;
    pub sbasize, _: 11, 5;
    pub sbreadonaddr, set_sbreadonaddr: 20;
    pub sbaccess, set_sbaccess: 19, 17;
    pub sberror, set_sberror: 14, 12;
}

/// First GPR abstract-command `regno` (x0); `regno = GPR0 + n` for `x_n`.
pub const GPR0: u32 = 0x1000;

pub fn dmcontrol_select_hart(hart_id: u8) -> Dmcontrol {
    let mut v = Dmcontrol(0);
    v.set_dmactive(true);
    v.set_hartsello(hart_id as u32);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dmcontrol_packs_haltreq_and_hartsel() {
        let mut v = dmcontrol_select_hart(1);
        v.set_haltreq(true);
        assert_eq!(v.0, (1 << 31) | (1 << 16) | 1);
    }

    #[test]
    fn abstractcs_cmderr_w1c_mask_matches_spec() {
        // spec.md §6: ABSTRACTCS.cmderr is W1C by writing 0x700 (bits 8..10).
        let mut v = Abstractcs(0);
        v.set_cmderr(0x7);
        assert_eq!(v.0, 0x700);
    }
}
