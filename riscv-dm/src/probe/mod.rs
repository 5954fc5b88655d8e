//! Probe-side JTAG transport contract.
//!
//! The driver talks to the target exclusively through a [`JtagAccess`]
//! implementation supplied by the host application. The probe queues IR/DR
//! scans and Run-Test/Idle periods; [`JtagAccess::flush`] is the only
//! blocking call.

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;

#[cfg(any(test, feature = "test"))]
pub mod fake_probe;

/// Bits captured from TDO during a DR scan, least significant bit first.
pub type ScanBits = BitVec<u8, Lsb0>;

/// Errors originating in the probe hardware or its driver.
#[derive(thiserror::Error, Debug)]
pub enum DebugProbeError {
    /// Executing the queued scans failed.
    #[error("JTAG scan queue flush failed")]
    FlushFailed,
    /// The probe returned fewer captures than DR scans were queued.
    #[error("missing capture for a queued DR scan")]
    MissingScanResult,
    /// The probe cannot drive the target reset pin.
    #[error("target reset control is not supported by this probe")]
    ResetNotSupported,
    /// An error specific to the probe in use.
    #[error("an error specific to the probe occurred")]
    ProbeSpecific(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Access to a JTAG TAP through a debug probe.
///
/// All queue methods are non-blocking; queued operations execute in order
/// when [`JtagAccess::flush`] runs.
pub trait JtagAccess {
    /// Queue a scan shifting `ir` into the instruction register.
    fn queue_ir_scan(&mut self, ir: u32) -> Result<(), DebugProbeError>;

    /// Queue a DR scan of `bit_len` bits.
    ///
    /// `data` holds the outgoing bits LSB first; bits past `bit_len` are
    /// ignored. The captured TDO bits are returned by the next `flush`.
    fn queue_dr_scan(&mut self, data: &[u8], bit_len: u32) -> Result<(), DebugProbeError>;

    /// Queue `cycles` clock cycles spent in the Run-Test/Idle state.
    fn queue_runtest(&mut self, cycles: u32) -> Result<(), DebugProbeError>;

    /// Execute all queued operations.
    ///
    /// Returns the captured bits of every queued DR scan, in queue order.
    fn flush(&mut self) -> Result<Vec<ScanBits>, DebugProbeError>;

    /// Reset the TAP state machine and leave it in Run-Test/Idle.
    fn tap_reset(&mut self) -> Result<(), DebugProbeError>;

    /// Assert the target reset pin.
    fn target_reset_assert(&mut self) -> Result<(), DebugProbeError>;

    /// Deassert the target reset pin.
    fn target_reset_deassert(&mut self) -> Result<(), DebugProbeError>;
}
