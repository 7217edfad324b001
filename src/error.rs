//! Closed error-kind hierarchy for the debug controller.
//!
//! Mirrors the layering `probe-rs` uses for `RiscvError`/`ArmError` converting
//! into a single top-level `Error`: each layer gets its own small error type,
//! and all of them fold into [`DebugError`] via `#[from]`.

use std::fmt;

/// Error raised by the Wire Engine (L1).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// A malformed ACK was seen; the engine has already re-driven a line reset.
    #[error("malformed ACK phase on the wire")]
    Protocol,
    /// Parity bit of an inbound data phase did not match.
    #[error("data phase parity mismatch")]
    Parity,
    /// WAIT responses exhausted the retry budget.
    #[error("operation timed out after exhausting retries")]
    Timeout,
    /// Target returned FAULT; caller must clear sticky errors before proceeding.
    #[error("target returned FAULT")]
    Fault,
}

/// Error raised by the DAP Engine (L2).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DapError {
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Debug domain power-up did not complete within the retry budget.
    #[error("debug domain power-up timed out")]
    PowerUpTimeout,
    /// A memory access address was not naturally aligned.
    #[error("address is not aligned for this access width")]
    Alignment,
}

/// Error raised by the Debug Module driver (L3).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmError {
    #[error(transparent)]
    Dap(#[from] DapError),
    /// The Debug Module did not come up in the expected state during `dm_init`.
    #[error("debug module failed to enter the expected state during init")]
    InvalidState,
    /// An abstract command completed with a non-zero `cmderr`.
    #[error("abstract command failed (cmderr != 0)")]
    AbstractCmd,
    /// A hart-dependent operation was attempted while the hart was not halted.
    #[error("hart is not halted")]
    NotHalted,
    /// `halt()` was called on a hart already known to be halted.
    #[error("hart is already halted")]
    AlreadyHalted,
    /// Polling a hart state transition exceeded its bounded iteration count.
    #[error("timed out waiting for hart state transition")]
    Timeout,
}

/// Error raised by the System Bus Access pathway.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbaError {
    #[error(transparent)]
    Dap(#[from] DapError),
    /// `SBCS.sbasize == 0`: no system bus master present.
    #[error("no system bus master present")]
    NoBusMaster,
    /// `SBCS.sberror` was set on the last access.
    #[error("system bus access reported an error")]
    BusError,
    /// Address was not naturally aligned for the requested width.
    #[error("address is not aligned for this access width")]
    Alignment,
}

/// Closed set of error kinds a [`crate::session::Target`] can surface,
/// matching spec.md §7 exactly.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugError {
    #[error("operation timed out")]
    Timeout,
    #[error("target returned FAULT")]
    Fault,
    #[error("SWD protocol error")]
    Protocol,
    #[error("data phase parity mismatch")]
    Parity,
    #[error("target responded WAIT past the retry budget")]
    Wait,
    #[error("session is not connected")]
    NotConnected,
    #[error("debug module is not initialized")]
    NotInitialized,
    #[error("hart is not halted")]
    NotHalted,
    #[error("hart is already halted")]
    AlreadyHalted,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("debug module is in an unexpected state")]
    InvalidState,
    #[error("address is not naturally aligned")]
    Alignment,
    #[error("requested resource is already in use")]
    ResourceBusy,
    #[error("abstract command failed")]
    AbstractCmd,
    #[error("post-upload readback did not match")]
    Verify,
}

impl From<WireError> for DebugError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Protocol => DebugError::Protocol,
            WireError::Parity => DebugError::Parity,
            WireError::Timeout => DebugError::Timeout,
            WireError::Fault => DebugError::Fault,
        }
    }
}

impl From<DapError> for DebugError {
    fn from(e: DapError) -> Self {
        match e {
            DapError::Wire(w) => w.into(),
            DapError::PowerUpTimeout => DebugError::Timeout,
            DapError::Alignment => DebugError::Alignment,
        }
    }
}

impl From<DmError> for DebugError {
    fn from(e: DmError) -> Self {
        match e {
            DmError::Dap(d) => d.into(),
            DmError::InvalidState => DebugError::InvalidState,
            DmError::AbstractCmd => DebugError::AbstractCmd,
            DmError::NotHalted => DebugError::NotHalted,
            DmError::AlreadyHalted => DebugError::AlreadyHalted,
            DmError::Timeout => DebugError::Timeout,
        }
    }
}

impl From<SbaError> for DebugError {
    fn from(e: SbaError) -> Self {
        match e {
            SbaError::Dap(d) => d.into(),
            SbaError::NoBusMaster => DebugError::InvalidState,
            SbaError::BusError => DebugError::Fault,
            SbaError::Alignment => DebugError::Alignment,
        }
    }
}

/// Bounded (128 byte) human-readable detail attached to the last error a
/// session observed, per spec.md §7 ("each session carries a formatted
/// error-detail string").
#[derive(Debug, Default, Clone)]
pub struct ErrorDetail(String);

impl ErrorDetail {
    const MAX_LEN: usize = 128;

    pub fn set(&mut self, detail: impl fmt::Display) {
        let mut s = detail.to_string();
        s.truncate(Self::MAX_LEN);
        self.0 = s;
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub type Result<T> = std::result::Result<T, DebugError>;
