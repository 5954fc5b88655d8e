//! Debug Transport Module (DTM) handling
//!
//! The DTM is responsible for access to the debug module.
//! Currently, only JTAG is supported.
//!
//! A `dmi` access is pipelined in hardware: the request is one DR scan and
//! the result arrives with the following scan, so a read is a READ scan
//! followed by a NOP scan that pulls the data out. A BUSY response means
//! the in-flight request was discarded; the host resynchronizes with a
//! `dmireset` through `dtmcs` and widens its idle delays before retrying.

use bitfield::bitfield;
use bitvec::field::BitField;
use bitvec::order::Lsb0;
use bitvec::slice::BitSlice;

use crate::communication_interface::RiscvError;
use crate::probe::{DebugProbeError, JtagAccess};

/// IR value of the `dtmcs` JTAG register.
const DTMCS_IR: u32 = 0x10;

/// IR value of the `dmi` JTAG register.
const DMI_IR: u32 = 0x11;

/// Width of the `dtmcs` JTAG register.
const DTMCS_WIDTH: u32 = 32;

/// Offset of the `address` field in the `dmi` JTAG register.
const DMI_ADDRESS_BIT_OFFSET: u32 = 34;

/// Offset of the `value` field in the `dmi` JTAG register.
const DMI_VALUE_BIT_OFFSET: u32 = 2;

const DMI_OP_MASK: u128 = 0x3;

/// Address of the abstract `command` register. A write here starts an
/// abstract command, the only scan that takes the abstract-command delay.
const DMI_COMMAND: u32 = 0x17;

/// Scan attempts before a stuck-busy `dmi` access is abandoned.
const DMI_MAX_ATTEMPTS: usize = 256;

bitfield! {
    /// The `dtmcs` register of the debug transport module.
    pub struct Dtmcs(u32);
    impl Debug;

    pub _, set_dmihardreset: 17;
    pub _, set_dmireset: 16;
    pub idle, _: 14, 12;
    pub dmistat, _: 11, 10;
    pub abits, _: 9, 4;
    pub version, _: 3, 0;
}

/// A single operation on the `dmi` register.
#[derive(Copy, Clone, Debug)]
pub enum DmiOperation {
    NoOp,
    Read { address: u32 },
    Write { address: u32, value: u32 },
}

impl DmiOperation {
    fn opcode(&self) -> u8 {
        match self {
            Self::NoOp => 0,
            Self::Read { .. } => 1,
            Self::Write { .. } => 2,
        }
    }

    fn register_value(&self) -> u128 {
        let (opcode, address, value): (u128, u128, u128) = match self {
            Self::NoOp => (self.opcode() as u128, 0, 0),
            Self::Read { address } => (self.opcode() as u128, *address as u128, 0),
            Self::Write { address, value } => {
                (self.opcode() as u128, *address as u128, *value as u128)
            }
        };

        (address << DMI_ADDRESS_BIT_OFFSET) | (value << DMI_VALUE_BIT_OFFSET) | opcode
    }

    /// The scan payload, LSB first: `[op:2][data:32][address:abits]`.
    pub fn to_byte_batch(self) -> [u8; 16] {
        self.register_value().to_le_bytes()
    }
}

/// Possible return values in the op field of the `dmi` register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DmiOperationStatus {
    Ok = 0,
    Reserved = 1,
    OperationFailed = 2,
    RequestInProgress = 3,
}

impl DmiOperationStatus {
    pub(crate) fn parse(value: u8) -> Option<Self> {
        let status = match value {
            0 => Self::Ok,
            1 => Self::Reserved,
            2 => Self::OperationFailed,
            3 => Self::RequestInProgress,
            _ => return None,
        };

        Some(status)
    }
}

/// Access to the Debug Transport Module (DTM),
/// which is used to communicate with the RISC-V debug module.
#[derive(Debug)]
pub struct JtagDtm<P: JtagAccess> {
    probe: P,

    /// Number of address bits in the DMI register
    abits: u32,

    /// Idle cycles the DTM requests between `dmi` scans.
    dtmcontrol_idle: u32,

    /// Extra idle cycles added after every `dmi` scan, grown on BUSY.
    dmi_busy_delay: u32,

    /// Extra idle cycles added after scans that start an abstract command.
    ac_busy_delay: u32,

    selected_ir: Option<u32>,
}

impl<P: JtagAccess> JtagDtm<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            abits: 0,
            dtmcontrol_idle: 0,
            dmi_busy_delay: 0,
            ac_busy_delay: 0,
            selected_ir: None,
        }
    }

    /// Reset the TAP and read `dtmcs` to learn the transport geometry.
    pub fn init(&mut self) -> Result<(), RiscvError> {
        self.probe.tap_reset()?;
        self.selected_ir = None;

        let raw_dtmcs = self.dtmcs_scan(0)?;

        if raw_dtmcs == 0 {
            return Err(RiscvError::NoRiscvTarget);
        }

        let dtmcs = Dtmcs(raw_dtmcs);

        tracing::debug!("{:?}", dtmcs);

        if dtmcs.version() != 1 {
            return Err(RiscvError::UnsupportedDebugTransportModuleVersion(
                dtmcs.version() as u8,
            ));
        }

        let abits = dtmcs.abits();
        if !(7..=32).contains(&abits) {
            return Err(RiscvError::InvalidAddressBits(abits));
        }

        self.abits = abits;
        self.dtmcontrol_idle = dtmcs.idle();

        Ok(())
    }

    pub fn target_reset_assert(&mut self) -> Result<(), DebugProbeError> {
        self.probe.target_reset_assert()
    }

    pub fn target_reset_deassert(&mut self) -> Result<(), DebugProbeError> {
        self.probe.target_reset_deassert()
    }

    pub fn dmi_busy_delay(&self) -> u32 {
        self.dmi_busy_delay
    }

    pub fn ac_busy_delay(&self) -> u32 {
        self.ac_busy_delay
    }

    /// Restore a previously captured delay, used when a reset brings the
    /// target back to full speed.
    pub(crate) fn set_dmi_busy_delay(&mut self, delay: u32) {
        self.dmi_busy_delay = delay;
    }

    pub(crate) fn probe_mut(&mut self) -> &mut P {
        &mut self.probe
    }

    /// Scan `value` through `dtmcs` and return the captured value.
    fn dtmcs_scan(&mut self, value: u32) -> Result<u32, RiscvError> {
        self.probe.queue_ir_scan(DTMCS_IR)?;
        self.probe.queue_dr_scan(&value.to_le_bytes(), DTMCS_WIDTH)?;

        // Always return to dmi.
        self.probe.queue_ir_scan(DMI_IR)?;
        self.selected_ir = Some(DMI_IR);

        let captures = self.probe.flush()?;
        let bits = captures.first().ok_or(DebugProbeError::MissingScanResult)?;

        Ok(bits.load_le::<u32>())
    }

    fn select_dmi(&mut self) -> Result<(), DebugProbeError> {
        if self.selected_ir != Some(DMI_IR) {
            self.probe.queue_ir_scan(DMI_IR)?;
            self.selected_ir = Some(DMI_IR);
        }

        Ok(())
    }

    fn transform_dmi_result(bits: &BitSlice<u8, Lsb0>) -> (DmiOperationStatus, u32) {
        let value = bits.load_le::<u128>();

        // We masked out two bits, parse always succeeds on values 0..=3.
        let status = DmiOperationStatus::parse((value & DMI_OP_MASK) as u8)
            .unwrap_or(DmiOperationStatus::Reserved);

        (status, (value >> DMI_VALUE_BIT_OFFSET) as u32)
    }

    /// Perform a single `dmi` scan with the idle tail the transport state
    /// calls for. The returned value belongs to the *previous* operation.
    ///
    /// `exec` marks scans that start an abstract command, which take the
    /// additional abstract-command delay.
    fn dmi_scan(
        &mut self,
        op: DmiOperation,
        exec: bool,
    ) -> Result<(DmiOperationStatus, u32), RiscvError> {
        if self.abits == 0 {
            return Err(RiscvError::DtmNotInitialized);
        }

        self.select_dmi()?;

        let bytes = op.to_byte_batch();
        let bit_len = self.abits + DMI_ADDRESS_BIT_OFFSET;

        self.probe.queue_dr_scan(&bytes, bit_len)?;

        let mut idle = self.dtmcontrol_idle + self.dmi_busy_delay;
        if exec {
            idle += self.ac_busy_delay;
        }
        if idle > 0 {
            self.probe.queue_runtest(idle)?;
        }

        let captures = self.probe.flush()?;
        let bits = captures.first().ok_or(DebugProbeError::MissingScanResult)?;

        Ok(Self::transform_dmi_result(bits))
    }

    /// Widen the per-scan idle delay and resynchronize the DTM.
    ///
    /// A BUSY response discards the in-flight request, so a `dmireset`
    /// through `dtmcs` is required before retrying.
    pub(crate) fn increase_dmi_busy_delay(&mut self) -> Result<(), RiscvError> {
        self.dmi_busy_delay += self.dmi_busy_delay.div_ceil(10) + 1;

        tracing::debug!(
            "dtmcontrol_idle={}, dmi_busy_delay={}, ac_busy_delay={}",
            self.dtmcontrol_idle,
            self.dmi_busy_delay,
            self.ac_busy_delay
        );

        self.dmi_reset()
    }

    /// Widen the delay added after scans that start an abstract command.
    pub(crate) fn increase_ac_busy_delay(&mut self) {
        self.ac_busy_delay += self.ac_busy_delay.div_ceil(10) + 1;

        tracing::debug!(
            "dtmcontrol_idle={}, dmi_busy_delay={}, ac_busy_delay={}",
            self.dtmcontrol_idle,
            self.dmi_busy_delay,
            self.ac_busy_delay
        );
    }

    /// Clear a sticky BUSY condition in the DTM.
    pub(crate) fn dmi_reset(&mut self) -> Result<(), RiscvError> {
        let mut dtmcs = Dtmcs(0);
        dtmcs.set_dmireset(true);

        self.dtmcs_scan(dtmcs.0)?;

        Ok(())
    }

    /// Read a `dmi` register, absorbing transient BUSY responses.
    pub fn dmi_read(&mut self, address: u32) -> Result<u32, RiscvError> {
        // This first loop ensures that the read request was actually sent
        // to the target. Note that if for some reason this stays busy,
        // it is actually due to the previous dmi_read or dmi_write.
        self.dmi_attempts(DmiOperation::Read { address }, false)?;

        // This second loop ensures that we got the read data back. A NOP
        // can report busy as well, which would surface on the next access.
        let (_, value) = self.dmi_attempts(DmiOperation::NoOp, false)?;

        Ok(value)
    }

    /// Write a `dmi` register, absorbing transient BUSY responses.
    pub fn dmi_write(&mut self, address: u32, value: u32) -> Result<(), RiscvError> {
        let exec = address == DMI_COMMAND;

        self.dmi_attempts(DmiOperation::Write { address, value }, exec)?;

        // Confirm with a NOP so the write is known complete before we
        // return.
        self.dmi_attempts(DmiOperation::NoOp, false)?;

        Ok(())
    }

    /// Repeat one scan until it is accepted, growing the busy delay on
    /// every BUSY response. Bounded by [`DMI_MAX_ATTEMPTS`].
    fn dmi_attempts(
        &mut self,
        op: DmiOperation,
        exec: bool,
    ) -> Result<(DmiOperationStatus, u32), RiscvError> {
        for _ in 0..DMI_MAX_ATTEMPTS {
            let (status, value) = self.dmi_scan(op, exec)?;

            match status {
                DmiOperationStatus::Ok => return Ok((status, value)),
                DmiOperationStatus::RequestInProgress => {
                    self.increase_dmi_busy_delay()?;
                }
                _ => {
                    tracing::error!("dmi access {:x?} failed, status={:?}", op, status);
                    return Err(RiscvError::DtmOperationFailed);
                }
            }
        }

        tracing::error!("dmi access {:x?} still busy after {} attempts", op, DMI_MAX_ATTEMPTS);

        Err(RiscvError::Timeout)
    }

    /// Run a batch as one JTAG flush with back-to-back DR scans.
    ///
    /// No per-operation BUSY handling happens here; the caller measures
    /// progress through the abstract command status afterwards. A trailing
    /// NOP pulls the result of the last queued operation.
    pub fn run_batch(&mut self, batch: &mut DmiBatch) -> Result<(), RiscvError> {
        if batch.ops.is_empty() {
            return Ok(());
        }

        if self.abits == 0 {
            return Err(RiscvError::DtmNotInitialized);
        }

        self.select_dmi()?;

        let bit_len = self.abits + DMI_ADDRESS_BIT_OFFSET;
        let idle = self.dtmcontrol_idle + self.dmi_busy_delay + self.ac_busy_delay;

        for op in batch.ops.iter().copied().chain([DmiOperation::NoOp]) {
            self.probe.queue_dr_scan(&op.to_byte_batch(), bit_len)?;
            if idle > 0 {
                self.probe.queue_runtest(idle)?;
            }
        }

        let captures = self.probe.flush()?;

        if captures.len() != batch.ops.len() + 1 {
            return Err(DebugProbeError::MissingScanResult.into());
        }

        batch.results = captures
            .iter()
            .map(|bits| Self::transform_dmi_result(bits))
            .collect();

        Ok(())
    }
}

/// A bounded sequence of `dmi` operations flushed in one go.
#[derive(Debug)]
pub struct DmiBatch {
    ops: Vec<DmiOperation>,
    max_ops: usize,
    results: Vec<(DmiOperationStatus, u32)>,
}

impl DmiBatch {
    pub fn with_capacity(max_ops: usize) -> Self {
        Self {
            ops: Vec::with_capacity(max_ops),
            max_ops,
            results: Vec::new(),
        }
    }

    /// Queue a read and return its slot index.
    pub fn add_read(&mut self, address: u32) -> usize {
        self.ops.push(DmiOperation::Read { address });
        self.ops.len() - 1
    }

    pub fn add_write(&mut self, address: u32, value: u32) {
        self.ops.push(DmiOperation::Write { address, value });
    }

    pub fn add_nop(&mut self) {
        self.ops.push(DmiOperation::NoOp);
    }

    pub fn is_full(&self) -> bool {
        self.ops.len() >= self.max_ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// The status and data a read slot produced, if the batch ran.
    ///
    /// The result of slot `n` travels with the scan that follows it.
    pub fn get_read(&self, slot: usize) -> Option<(DmiOperationStatus, u32)> {
        self.results.get(slot + 1).copied()
    }
}

#[cfg(test)]
mod test {
    use super::{DmiBatch, DmiOperation, DmiOperationStatus, JtagDtm};
    use crate::probe::fake_probe::{BusyInjection, FakeJtagProbe};

    #[test]
    fn dmi_payload_layout() {
        let op = DmiOperation::Write {
            address: 0x17,
            value: 0xdead_beef,
        };

        let value = u128::from_le_bytes(op.to_byte_batch());

        assert_eq!(value & 0x3, 2);
        assert_eq!((value >> 2) as u32, 0xdead_beef);
        assert_eq!((value >> 34) as u32, 0x17);
    }

    #[test]
    fn dmi_read_after_write_round_trips() {
        let probe = FakeJtagProbe::new_rv32();
        let mut dtm = JtagDtm::new(probe);

        dtm.init().unwrap();

        // data0 is a plain read/write register while autoexec is off.
        dtm.dmi_write(0x04, 0x1234_5678).unwrap();
        assert_eq!(dtm.dmi_read(0x04).unwrap(), 0x1234_5678);
    }

    #[test]
    fn busy_responses_grow_the_delay_monotonically() {
        let mut probe = FakeJtagProbe::new_rv32();
        probe.set_busy_injection(BusyInjection::EveryNth {
            n: 3,
            required_idle: 2,
        });

        let mut dtm = JtagDtm::new(probe);
        dtm.init().unwrap();

        let mut last_delay = dtm.dmi_busy_delay();
        assert_eq!(last_delay, 0);

        for i in 0..16 {
            dtm.dmi_write(0x04, i).unwrap();
            assert_eq!(dtm.dmi_read(0x04).unwrap(), i);

            let delay = dtm.dmi_busy_delay();
            assert!(delay >= last_delay);
            last_delay = delay;
        }

        // At least one scan hit BUSY, so the delay must have grown.
        assert!(last_delay > 0);
    }

    #[test]
    fn batch_results_are_pipelined() {
        let probe = FakeJtagProbe::new_rv32();
        let mut dtm = JtagDtm::new(probe);
        dtm.init().unwrap();

        dtm.dmi_write(0x04, 0xaaaa_5555).unwrap();

        let mut batch = DmiBatch::with_capacity(8);
        let slot = batch.add_read(0x04);
        batch.add_nop();

        dtm.run_batch(&mut batch).unwrap();

        let (status, value) = batch.get_read(slot).unwrap();
        assert_eq!(status, DmiOperationStatus::Ok);
        assert_eq!(value, 0xaaaa_5555);
    }
}
