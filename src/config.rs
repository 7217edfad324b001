//! Session configuration.
//!
//! Ambient plumbing only — no command line parsing (host UI is a spec
//! Non-goal). Loadable from YAML with `serde_yaml`, the way `probe-rs`
//! describes targets and sessions with plain serde structs.

use serde::{Deserialize, Serialize};

/// Which of the eight PIO state-machine slots a session should bind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PioSlot {
    /// Let the resource tracker pick the first free slot.
    #[default]
    Auto,
    /// Bind a specific `(block, state_machine)` pair.
    Fixed { block: u8, sm: u8 },
}

/// Configuration for a [`crate::session::Target`] session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireConfig {
    /// SWCLK/SWDIO frequency in kHz. Default 1000 (1 MHz), per spec.md §6.
    pub freq_khz: u32,
    /// Number of quiescent SWCLK cycles inserted at each bus turnaround.
    pub turnaround_cycles: u8,
    /// Number of times a WAIT response is retried before surfacing `Timeout`.
    pub retry_count: u8,
    /// Which PIO slot this session should acquire.
    pub pio_slot: PioSlot,
    /// System clock frequency of the probe MCU, used to compute the PIO
    /// clock divider (spec.md §6).
    pub sys_khz: u32,
}

impl Default for WireConfig {
    fn default() -> Self {
        WireConfig {
            freq_khz: 1000,
            turnaround_cycles: 1,
            retry_count: 5,
            pio_slot: PioSlot::Auto,
            sys_khz: 125_000,
        }
    }
}

impl WireConfig {
    /// Load a configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Clock divider for the PIO state machine, clamped to `[1, 65535]`.
    ///
    /// `divider = ceil((ceil(sys_khz / freq_khz) + 3) / 4)`, where 4 is the
    /// cycles-per-bit of the state-machine program (spec.md §6).
    pub fn clock_divider(&self) -> u16 {
        let cycles_per_bit = div_ceil(self.sys_khz, self.freq_khz.max(1));
        let divider = div_ceil(cycles_per_bit + 3, 4);
        divider.clamp(1, 65535) as u16
    }
}

fn div_ceil(a: u32, b: u32) -> u32 {
    a.div_ceil(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = WireConfig::default();
        assert_eq!(cfg.freq_khz, 1000);
        assert_eq!(cfg.turnaround_cycles, 1);
        assert_eq!(cfg.retry_count, 5);
    }

    #[test]
    fn clock_divider_is_clamped() {
        let fast = WireConfig {
            sys_khz: 125_000,
            freq_khz: 1_000_000,
            ..WireConfig::default()
        };
        assert_eq!(fast.clock_divider(), 1);

        let slow = WireConfig {
            sys_khz: 300_000,
            freq_khz: 1,
            ..WireConfig::default()
        };
        assert_eq!(slow.clock_divider(), 65535);
    }

    #[test]
    fn roundtrips_through_yaml() {
        let cfg = WireConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back = WireConfig::from_yaml(&yaml).unwrap();
        assert_eq!(back.freq_khz, cfg.freq_khz);
    }
}
