//! Debug Module Communication
//!
//! This module implements communication with a Debug Module, as described
//! in the RISC-V debug specification v0.13: abstract command execution,
//! the two-tier register access path with program-buffer fallback, hart
//! control primitives, and the one-shot examination that discovers the
//! target's geometry.

use std::time::Instant;

use bitfield::bitfield;

use crate::dtm::jtag_dtm::JtagDtm;
use crate::probe::{DebugProbeError, JtagAccess};
use crate::program::{self, Program};
use crate::registers::{csr, RegisterId};
use crate::{assembly, Abstractcs, Dcsr, Dmcontrol, Dmstatus, HaltReason, Hartinfo, RiscvConfig};

/// Some error occurred when working with the RISC-V core.
#[derive(thiserror::Error, Debug)]
pub enum RiscvError {
    /// An error occurred during transport
    #[error("Error during transport")]
    DtmOperationFailed,
    /// An error with operating the debug probe occurred.
    #[error("Debug Probe Error")]
    DebugProbe(#[from] DebugProbeError),
    /// A timeout occurred during DMI access.
    #[error("Timeout during DMI access.")]
    Timeout,
    /// A DMI access was attempted before the DTM geometry was read.
    #[error("The debug transport module has not been initialized.")]
    DtmNotInitialized,
    /// The DTM reported an address width outside of the supported range.
    #[error("The DMI address width '{0}' is outside of the supported range.")]
    InvalidAddressBits(u32),
    /// An error occurred during the execution of an abstract command.
    #[error("Error occurred during execution of an abstract command: {0:?}")]
    AbstractCommand(AbstractCommandErrorKind),
    /// A program injected into the program buffer failed to execute.
    #[error("Execution of the program buffer failed: {0:?}")]
    ProgramExecution(AbstractCommandErrorKind),
    /// The request for reset, resume or halt was not acknowledged.
    #[error("The core did not acknowledge a request for reset, resume or halt")]
    RequestNotAcknowledged,
    /// This debug transport module (DTM) version is currently not supported.
    #[error("The version '{0}' of the debug transport module (DTM) is currently not supported.")]
    UnsupportedDebugTransportModuleVersion(u8),
    /// This version of the debug module is not supported.
    #[error("The version '{0}' of the debug module is currently not supported.")]
    UnsupportedDebugModuleVersion(u8),
    /// The debug module could not be activated.
    #[error("The debug module did not become active.")]
    DebugModuleNotActive,
    /// The target demands authentication.
    #[error("Authentication is required by the target but not supported.")]
    NotAuthenticated,
    /// The connected target is not a RISC-V device.
    #[error("Connected target is not a RISC-V device.")]
    NoRiscvTarget,
    /// The hart is unavailable.
    #[error("Hart {0} is unavailable.")]
    HartUnavailable(u32),
    /// The hart does not exist.
    #[error("Hart {0} does not exist.")]
    HartNonexistent(u32),
    /// The given register cannot be accessed through the debug module.
    #[error("Register id '{0}' cannot be accessed through the debug module.")]
    UnsupportedRegister(u32),
    /// Memory can only be streamed in units of 1, 2 or 4 bytes.
    #[error("Unsupported memory access size: {0} bytes.")]
    UnsupportedAccessSize(u32),
    /// The caller's buffer does not match the requested element count.
    #[error("Buffer of {actual} bytes does not hold {expected} bytes of elements.")]
    InvalidBufferLength {
        /// Bytes the requested transfer covers.
        expected: usize,
        /// Bytes the caller supplied.
        actual: usize,
    },
    /// The program buffer is too small for the supplied program.
    #[error("Program buffer is too small for supplied program.")]
    ProgramBufferTooSmall,
    /// Injected programs cannot address the debug buffer absolutely.
    #[error("Debug buffer at {0:#x} cannot be addressed by injected programs.")]
    DebugBufferOutOfReach(u64),
    /// `dcsr.cause` held a value the protocol does not define.
    #[error("Unknown halt cause in dcsr: {0}")]
    UnknownHaltCause(u32),
    /// The program counter read back differently than written.
    #[error("PC readback {read_back:#x} does not match the written value {written:#x}.")]
    PcVerificationFailed {
        /// The value written to `dpc`.
        written: u64,
        /// The value `dpc` returned afterwards.
        read_back: u64,
    },
    /// The memory streamer lost track of the target-side address.
    #[error("Memory stream lost track of the target address near {0:#x}.")]
    MemoryStreamDesynchronized(u64),
}

/// Errors which can occur while executing an abstract command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AbstractCommandErrorKind {
    /// No error happened.
    None = 0,
    /// An abstract command was executing while command, `abstractcs`, or
    /// `abstractauto` was written, or when one of the `data` or `progbuf`
    /// registers was read or written.
    Busy = 1,
    /// The requested command is not supported
    NotSupported = 2,
    /// An exception occurred while executing the command (e.g. while executing the Program Buffer).
    Exception = 3,
    /// The abstract command couldn't execute because the hart wasn't in the
    /// required state (running/halted), or unavailable.
    HaltResume = 4,
    /// The abstract command failed due to a bus error (e.g. alignment,
    /// access size, or timeout).
    Bus = 5,
    /// A reserved code. Should not occur.
    _Reserved = 6,
    /// The command failed for another reason.
    Other = 7,
}

impl AbstractCommandErrorKind {
    pub(crate) fn parse(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Busy,
            2 => Self::NotSupported,
            3 => Self::Exception,
            4 => Self::HaltResume,
            5 => Self::Bus,
            6 => Self::_Reserved,
            7 => Self::Other,
            _ => unreachable!("cmderr is a 3 bit value, values higher than 7 should not occur."),
        }
    }
}

/// Native register width of a hart.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Xlen {
    /// 32 bit registers.
    Rv32,
    /// 64 bit registers.
    Rv64,
}

impl Xlen {
    /// Register width in bits.
    pub fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }

    /// The `aarsize` encoding for a full-width register transfer.
    fn aarsize(self) -> u32 {
        match self {
            Xlen::Rv32 => 2,
            Xlen::Rv64 => 3,
        }
    }
}

/// Which register classes still accept abstract commands.
///
/// All flags start out true and latch false the first time the debug
/// module answers NOT_SUPPORTED for the class; they are never re-enabled
/// within a session.
#[derive(Debug)]
struct AbstractCommandCapabilities {
    read_csr: bool,
    write_csr: bool,
    read_fpr: bool,
    write_fpr: bool,
}

impl Default for AbstractCommandCapabilities {
    fn default() -> Self {
        Self {
            read_csr: true,
            write_csr: true,
            read_fpr: true,
            write_fpr: true,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RegisterClass {
    Gpr,
    Fpr,
    Csr,
}

/// Geometry of the debug module, discovered once per examination.
#[derive(Debug, Default)]
pub(crate) struct DmDescriptor {
    /// Number of abstract data registers.
    pub datacount: u8,
    /// Number of instruction words in the program buffer.
    pub progsize: u8,
    /// Memory-mapped address of the data registers, 0 if not mapped.
    pub data_addr: u64,
    /// Number of memory-mapped data words.
    pub data_size: u32,
}

/// State of a single enumerated hart.
#[derive(Debug)]
pub struct HartView {
    /// Whether the hart can be debugged at all.
    pub enabled: bool,
    /// Register width, `None` while unknown or when probing failed.
    pub xlen: Option<Xlen>,
    /// Target address the program buffer is mapped at.
    pub debug_buffer_addr: u64,
    /// Usable debug buffer length in words, including contiguous data words.
    pub debug_buffer_size: u32,
    /// Number of hardware triggers.
    pub trigger_count: u32,
    /// Last observed value of `mstatus`.
    pub mstatus_actual: Option<u64>,
}

impl HartView {
    fn new() -> Self {
        Self {
            enabled: true,
            xlen: None,
            debug_buffer_addr: 0,
            debug_buffer_size: 0,
            trigger_count: 0,
            mstatus_actual: None,
        }
    }
}

/// A DM register with a fixed DMI address.
pub trait DebugRegister: From<u32> + Into<u32> {
    /// The register's DMI address.
    const ADDRESS: u8;
    /// The register's name.
    const NAME: &'static str;
}

bitfield! {
    /// Access Register abstract command encoding (cmdtype 0).
    #[derive(Copy, Clone)]
    pub struct AccessRegisterCommand(u32);
    impl Debug;

    /// This is 0 to indicate Access Register Command.
    pub _, set_cmd_type: 31, 24;
    /// 2: Access the lowest 32 bits of the register.\
    /// 3: Access the lowest 64 bits of the register.
    pub _, set_aarsize: 22, 20;
    pub _, set_aarpostincrement: 19;
    /// Execute the program buffer once after the transfer, if any.
    pub _, set_postexec: 18;
    /// Whether to perform the transfer described by `write` and `regno`.
    pub _, set_transfer: 17;
    pub _, set_write: 16;
    /// Number of the register to access: GPRs at 0x1000, FPRs at 0x1020,
    /// CSRs at their CSR index.
    pub _, set_regno: 15, 0;
}

impl DebugRegister for AccessRegisterCommand {
    const ADDRESS: u8 = 0x17;
    const NAME: &'static str = "command";
}

impl From<AccessRegisterCommand> for u32 {
    fn from(register: AccessRegisterCommand) -> Self {
        register.0
    }
}

impl From<u32> for AccessRegisterCommand {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

bitfield! {
    /// Abstract Command Autoexec register.
    #[derive(Copy, Clone)]
    pub struct Abstractauto(u32);
    impl Debug;

    /// When a bit in this field is 1, accesses to the corresponding
    /// `progbuf` word re-execute the last command.
    pub autoexecprogbuf, set_autoexecprogbuf: 31, 16;
    /// When a bit in this field is 1, accesses to the corresponding data
    /// word re-execute the last command.
    pub autoexecdata, set_autoexecdata: 11, 0;
}

impl DebugRegister for Abstractauto {
    const ADDRESS: u8 = 0x18;
    const NAME: &'static str = "abstractauto";
}

impl From<Abstractauto> for u32 {
    fn from(register: Abstractauto) -> Self {
        register.0
    }
}

impl From<u32> for Abstractauto {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Probes polling `dmstatus` before a halt or resume request is abandoned.
const ACK_PROBE_ATTEMPTS: usize = 256;

/// A interface that implements controls for RISC-V cores.
#[derive(Debug)]
pub struct RiscvCommunicationInterface<P: JtagAccess> {
    dtm: JtagDtm<P>,
    config: RiscvConfig,
    descriptor: DmDescriptor,
    harts: Vec<HartView>,
    current_hart: u32,
    capabilities: AbstractCommandCapabilities,
}

impl<P: JtagAccess> RiscvCommunicationInterface<P> {
    /// Creates a new RISC-V communication interface on top of a JTAG probe.
    pub fn new(probe: P, config: RiscvConfig) -> Self {
        Self {
            dtm: JtagDtm::new(probe),
            config,
            descriptor: DmDescriptor::default(),
            harts: Vec::new(),
            current_hart: 0,
            capabilities: AbstractCommandCapabilities::default(),
        }
    }

    pub(crate) fn dtm(&mut self) -> &mut JtagDtm<P> {
        &mut self.dtm
    }

    pub(crate) fn config(&self) -> &RiscvConfig {
        &self.config
    }

    /// Number of harts found during examination.
    pub fn hart_count(&self) -> u32 {
        self.harts.len() as u32
    }

    /// The state of an enumerated hart.
    pub fn hart(&self, hart: u32) -> Result<&HartView, RiscvError> {
        self.harts
            .get(hart as usize)
            .ok_or(RiscvError::HartNonexistent(hart))
    }

    /// The state of every enumerated hart.
    pub fn harts(&self) -> &[HartView] {
        &self.harts
    }

    /// Check if the given hart is enabled.
    pub fn hart_enabled(&self, hart: u32) -> bool {
        self.harts
            .get(hart as usize)
            .map(|h| h.enabled)
            .unwrap_or(false)
    }

    /// The currently selected hart.
    pub fn current_hart(&self) -> u32 {
        self.current_hart
    }

    pub(crate) fn current_hart_view(&self) -> Result<&HartView, RiscvError> {
        self.hart(self.current_hart)
    }

    fn current_hart_view_mut(&mut self) -> Result<&mut HartView, RiscvError> {
        let hart = self.current_hart;
        self.harts
            .get_mut(hart as usize)
            .ok_or(RiscvError::HartNonexistent(hart))
    }

    /// Register width of the currently selected hart.
    pub fn xlen(&self) -> Result<Xlen, RiscvError> {
        let hart = self.current_hart;
        self.current_hart_view()?
            .xlen
            .ok_or(RiscvError::HartUnavailable(hart))
    }

    /// Select the hart all further operations apply to.
    pub fn select_hart(&mut self, hart: u32) -> Result<(), RiscvError> {
        if hart as usize >= self.harts.len() {
            return Err(RiscvError::HartNonexistent(hart));
        }
        if !self.hart_enabled(hart) {
            return Err(RiscvError::HartUnavailable(hart));
        }
        if self.current_hart == hart {
            return Ok(());
        }

        self.select_hart_raw(hart)
    }

    /// Write `hartsel` without validating against the enumerated harts,
    /// needed while enumeration is still running.
    fn select_hart_raw(&mut self, hart: u32) -> Result<(), RiscvError> {
        let mut control = Dmcontrol(0);
        control.set_dmactive(true);
        control.set_hartsel(hart);
        self.write_dm_register(control)?;
        self.current_hart = hart;

        Ok(())
    }

    pub(crate) fn read_dm_register<R: DebugRegister>(&mut self) -> Result<R, RiscvError> {
        let value = self.dtm.dmi_read(R::ADDRESS as u32)?;

        tracing::trace!("Read DM register '{}' at {:#04x} = {:#010x}", R::NAME, R::ADDRESS, value);

        Ok(R::from(value))
    }

    pub(crate) fn write_dm_register<R: DebugRegister>(&mut self, register: R) -> Result<(), RiscvError> {
        let value: u32 = register.into();

        tracing::trace!("Write DM register '{}' at {:#04x} = {:#010x}", R::NAME, R::ADDRESS, value);

        self.dtm.dmi_write(R::ADDRESS as u32, value)
    }

    /// Write one word of the debug buffer. Words beyond the program buffer
    /// spill into the data registers.
    pub(crate) fn write_debug_buffer(&mut self, index: usize, value: u32) -> Result<(), RiscvError> {
        let progsize = self.descriptor.progsize as usize;

        if index >= progsize {
            self.dtm
                .dmi_write(crate::Data0::ADDRESS as u32 + (index - progsize) as u32, value)
        } else {
            self.dtm
                .dmi_write(crate::Progbuf0::ADDRESS as u32 + index as u32, value)
        }
    }

    /// Read one word of the debug buffer without triggering execution.
    pub(crate) fn read_debug_buffer(&mut self, index: usize) -> Result<u32, RiscvError> {
        let progsize = self.descriptor.progsize as usize;

        if index >= progsize {
            self.dtm
                .dmi_read(crate::Data0::ADDRESS as u32 + (index - progsize) as u32)
        } else {
            self.dtm
                .dmi_read(crate::Progbuf0::ADDRESS as u32 + index as u32)
        }
    }

    /// The DMI register backing the debug buffer word at a target address.
    pub(crate) fn debug_buffer_register(&mut self, address: u64) -> Result<u32, RiscvError> {
        if self.descriptor.data_addr != 0 && address >= self.descriptor.data_addr {
            Ok(crate::Data0::ADDRESS as u32 + ((address - self.descriptor.data_addr) / 4) as u32)
        } else {
            let base = self.current_hart_view()?.debug_buffer_addr;
            Ok(crate::Progbuf0::ADDRESS as u32 + ((address - base) / 4) as u32)
        }
    }

    /// Arm or disarm AUTOEXEC for one debug buffer word.
    pub(crate) fn set_autoexec(&mut self, index: usize, enabled: bool) -> Result<(), RiscvError> {
        let progsize = self.descriptor.progsize as usize;
        let mut auto: Abstractauto = self.read_dm_register()?;

        if index >= progsize {
            let bit = (index - progsize) as u32;
            tracing::debug!("setting bit {} in autoexecdata to {}", bit, enabled);
            let mut field = auto.autoexecdata();
            field &= !(1 << bit);
            field |= (enabled as u32) << bit;
            auto.set_autoexecdata(field);
        } else {
            let bit = index as u32;
            tracing::debug!("setting bit {} in autoexecprogbuf to {}", bit, enabled);
            let mut field = auto.autoexecprogbuf();
            field &= !(1 << bit);
            field |= (enabled as u32) << bit;
            auto.set_autoexecprogbuf(field);
        }

        self.write_dm_register(auto)
    }

    /// Start a program for the currently selected hart's debug buffer.
    pub(crate) fn new_program(&self) -> Result<Program, RiscvError> {
        let view = self.current_hart_view()?;
        let xlen = view.xlen.ok_or(RiscvError::HartUnavailable(self.current_hart))?;

        Ok(Program::new(
            xlen,
            view.debug_buffer_addr,
            view.debug_buffer_size as usize,
        ))
    }

    /// Run a command and wait for completion.
    ///
    /// A non-zero `cmderr` is written back to clear it and surfaced as an
    /// [`RiscvError::AbstractCommand`].
    pub(crate) fn execute_abstract_command(&mut self, command: u32) -> Result<(), RiscvError> {
        tracing::debug!("command={:#010x}", command);

        self.write_dm_register(AccessRegisterCommand(command))?;

        let start = Instant::now();
        let mut abstractcs: Abstractcs;
        loop {
            abstractcs = self.read_dm_register()?;

            if !abstractcs.busy() {
                break;
            }

            if start.elapsed() > self.config.command_timeout {
                let cmderr = AbstractCommandErrorKind::parse(abstractcs.cmderr() as u8);
                tracing::error!(
                    "Timed out waiting for abstract command busy to go low (abstractcs={:#x}, cmderr={:?})",
                    abstractcs.0,
                    cmderr
                );
                return Err(RiscvError::Timeout);
            }
        }

        let cmderr = abstractcs.cmderr();
        if cmderr != 0 {
            tracing::debug!("command {:#010x} failed; abstractcs={:#x}", command, abstractcs.0);

            // Write-1-to-clear the error before reporting it.
            let mut clear = Abstractcs(0);
            clear.set_cmderr(cmderr);
            self.write_dm_register(clear)?;

            return Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::parse(
                cmderr as u8,
            )));
        }

        Ok(())
    }

    /// Wait for the abstract engine to go idle, then clear `cmderr`.
    pub(crate) fn clear_abstract_error(&mut self) -> Result<(), RiscvError> {
        let start = Instant::now();
        let mut abstractcs: Abstractcs = self.read_dm_register()?;

        while abstractcs.busy() {
            abstractcs = self.read_dm_register()?;

            if start.elapsed() > self.config.command_timeout {
                tracing::error!(
                    "abstractcs.busy is not going low (abstractcs={:#x}); the target is either really slow or broken",
                    abstractcs.0
                );
                break;
            }
        }

        let mut clear = Abstractcs(0);
        clear.set_cmderr(abstractcs.cmderr());
        self.write_dm_register(clear)
    }

    /// Trigger one execution of the program buffer through a no-op
    /// register access with `postexec` set.
    pub(crate) fn execute_program_buffer(&mut self) -> Result<(), RiscvError> {
        let mut command = AccessRegisterCommand(0);
        command.set_cmd_type(0);
        command.set_postexec(true);
        command.set_transfer(false);
        command.set_aarsize(2);
        command.set_regno(0x1000);

        self.execute_abstract_command(command.0).map_err(|e| match e {
            RiscvError::AbstractCommand(kind) => RiscvError::ProgramExecution(kind),
            other => other,
        })
    }

    /// Flush the hart's instruction cache, required before any step or
    /// resume after the debugger wrote memory.
    pub(crate) fn issue_fence_i(&mut self) -> Result<(), RiscvError> {
        let mut program = self.new_program()?;
        program.fence_i();
        program.execute(self)
    }

    /// Read an XLEN-sized abstract command argument out of the data
    /// registers: low word first, high word only on RV64.
    pub(crate) fn read_abstract_arg(&mut self, index: u32) -> Result<u64, RiscvError> {
        let xlen = self.xlen()?;
        let offset = index * (xlen.bits() / 32);

        let mut value = 0u64;
        if xlen == Xlen::Rv64 {
            value |= (self.dtm.dmi_read(crate::Data0::ADDRESS as u32 + offset + 1)? as u64) << 32;
        }
        value |= self.dtm.dmi_read(crate::Data0::ADDRESS as u32 + offset)? as u64;

        Ok(value)
    }

    /// Write an XLEN-sized abstract command argument. The high word is
    /// written first so side effects trigger on the final low-word write.
    pub(crate) fn write_abstract_arg(&mut self, index: u32, value: u64) -> Result<(), RiscvError> {
        let xlen = self.xlen()?;
        let offset = index * (xlen.bits() / 32);

        if xlen == Xlen::Rv64 {
            self.dtm
                .dmi_write(crate::Data0::ADDRESS as u32 + offset + 1, (value >> 32) as u32)?;
        }
        self.dtm
            .dmi_write(crate::Data0::ADDRESS as u32 + offset, value as u32)
    }

    fn abstract_regno(&self, regno: RegisterId) -> Result<(u32, RegisterClass), RiscvError> {
        if let Some(n) = regno.gpr_index() {
            Ok((0x1000 + n as u32, RegisterClass::Gpr))
        } else if let Some(n) = regno.fpr_index() {
            Ok((0x1020 + n as u32, RegisterClass::Fpr))
        } else if let Some(index) = regno.csr_index() {
            Ok((index as u32, RegisterClass::Csr))
        } else {
            Err(RiscvError::UnsupportedRegister(regno.0))
        }
    }

    // Read a core register using an abstract command.
    pub(crate) fn register_read_abstract(&mut self, regno: RegisterId) -> Result<u64, RiscvError> {
        let xlen = self.xlen()?;
        let (number, class) = self.abstract_regno(regno)?;

        // Skip the attempt entirely once the class latched unsupported.
        let supported = match class {
            RegisterClass::Gpr => true,
            RegisterClass::Fpr => self.capabilities.read_fpr,
            RegisterClass::Csr => self.capabilities.read_csr,
        };
        if !supported {
            return Err(RiscvError::AbstractCommand(
                AbstractCommandErrorKind::NotSupported,
            ));
        }

        let mut command = AccessRegisterCommand(0);
        command.set_cmd_type(0);
        command.set_transfer(true);
        command.set_write(false);
        command.set_aarsize(xlen.aarsize());
        command.set_regno(number);

        match self.execute_abstract_command(command.0) {
            Ok(()) => {}
            err @ Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::NotSupported)) => {
                match class {
                    RegisterClass::Fpr => {
                        self.capabilities.read_fpr = false;
                        tracing::info!("Disabling abstract command reads from FPRs.");
                    }
                    RegisterClass::Csr => {
                        self.capabilities.read_csr = false;
                        tracing::info!("Disabling abstract command reads from CSRs.");
                    }
                    RegisterClass::Gpr => {}
                }
                return err.map(|_| 0);
            }
            Err(e) => return Err(e),
        }

        self.read_abstract_arg(0)
    }

    // Write a core register using an abstract command.
    pub(crate) fn register_write_abstract(
        &mut self,
        regno: RegisterId,
        value: u64,
    ) -> Result<(), RiscvError> {
        let xlen = self.xlen()?;
        let (number, class) = self.abstract_regno(regno)?;

        // Writes are gated on the write capability of the class.
        let supported = match class {
            RegisterClass::Gpr => true,
            RegisterClass::Fpr => self.capabilities.write_fpr,
            RegisterClass::Csr => self.capabilities.write_csr,
        };
        if !supported {
            return Err(RiscvError::AbstractCommand(
                AbstractCommandErrorKind::NotSupported,
            ));
        }

        let mut command = AccessRegisterCommand(0);
        command.set_cmd_type(0);
        command.set_transfer(true);
        command.set_write(true);
        command.set_aarsize(xlen.aarsize());
        command.set_regno(number);

        self.write_abstract_arg(0, value)?;

        match self.execute_abstract_command(command.0) {
            Ok(()) => Ok(()),
            err @ Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::NotSupported)) => {
                match class {
                    RegisterClass::Fpr => {
                        self.capabilities.write_fpr = false;
                        tracing::info!("Disabling abstract command writes to FPRs.");
                    }
                    RegisterClass::Csr => {
                        self.capabilities.write_csr = false;
                        tracing::info!("Disabling abstract command writes to CSRs.");
                    }
                    RegisterClass::Gpr => {}
                }
                err
            }
            Err(e) => Err(e),
        }
    }

    fn save_s0(&mut self) -> Result<u64, RiscvError> {
        self.register_read_abstract(RegisterId::S0)
    }

    fn restore_s0(&mut self, value: u64) -> Result<(), RiscvError> {
        self.register_write_abstract(RegisterId::S0, value)
    }

    pub(crate) fn save_scratch_registers(&mut self) -> Result<(u64, u64), RiscvError> {
        let s0 = self.register_read_direct(RegisterId::S0)?;
        let s1 = self.register_read_direct(RegisterId::S1)?;
        Ok((s0, s1))
    }

    pub(crate) fn restore_scratch_registers(&mut self, saved: (u64, u64)) -> Result<(), RiscvError> {
        self.register_write_direct(RegisterId::S0, saved.0)?;
        self.register_write_direct(RegisterId::S1, saved.1)
    }

    /// Read a register through the program buffer.
    fn register_read_progbuf(&mut self, regno: RegisterId) -> Result<u64, RiscvError> {
        let mut program = self.new_program()?;
        let output = program.alloc_double()?;
        program.write_ram(output + 4, 0);
        program.write_ram(output, 0);

        let mut saved_s0 = None;
        if let Some(n) = regno.gpr_index() {
            program.sx(n, output);
        } else if let Some(n) = regno.fpr_index() {
            program.fsx(n, output);
        } else if let Some(index) = regno.csr_index() {
            let temp = program.temp_register();
            program.csrr(temp, index);
            program.sx(temp, output);
            saved_s0 = Some(self.save_s0()?);
        } else {
            return Err(RiscvError::UnsupportedRegister(regno.0));
        }
        program.fence();

        let result = program.execute(self);

        let mut value = 0u64;
        if result.is_ok() {
            value |= (program.read_ram(self, output + 4)? as u64) << 32;
            value |= program.read_ram(self, output)? as u64;
        }

        if let Some(s0) = saved_s0 {
            self.restore_s0(s0)?;
        }

        result.map(|_| value)
    }

    /// Write a register through the program buffer.
    fn register_write_progbuf(&mut self, regno: RegisterId, value: u64) -> Result<(), RiscvError> {
        let mut program = self.new_program()?;
        let input = program.alloc_double()?;
        program.write_ram(input + 4, (value >> 32) as u32);
        program.write_ram(input, value as u32);

        let mut saved_s0 = None;
        if let Some(n) = regno.gpr_index() {
            program.lx(n, input);
        } else if let Some(n) = regno.fpr_index() {
            program.flx(n, input);
        } else if let Some(index) = regno.csr_index() {
            let temp = program.temp_register();
            program.lx(temp, input);
            program.csrw(index, temp);
            saved_s0 = Some(self.save_s0()?);
        } else {
            return Err(RiscvError::UnsupportedRegister(regno.0));
        }
        program.fence();

        let result = program.execute(self);

        if let Some(s0) = saved_s0 {
            self.restore_s0(s0)?;
        }

        result
    }

    /// Read a register, trying the abstract command first and falling back
    /// to an injected program on any abstract failure.
    pub(crate) fn register_read_direct(&mut self, regno: RegisterId) -> Result<u64, RiscvError> {
        match self.register_read_abstract(regno) {
            Err(RiscvError::AbstractCommand(kind)) => {
                tracing::debug!(
                    "Could not read register {:?} with abstract command ({:?}), falling back to program buffer",
                    regno,
                    kind
                );
                self.register_read_progbuf(regno)
            }
            other => other,
        }
    }

    /// Write a register, trying the abstract command first and falling
    /// back to an injected program on any abstract failure.
    pub(crate) fn register_write_direct(
        &mut self,
        regno: RegisterId,
        value: u64,
    ) -> Result<(), RiscvError> {
        match self.register_write_abstract(regno, value) {
            Err(RiscvError::AbstractCommand(kind)) => {
                tracing::debug!(
                    "Could not write register {:?} with abstract command ({:?}), falling back to program buffer",
                    regno,
                    kind
                );
                self.register_write_progbuf(regno, value)
            }
            other => other,
        }
    }

    /// Read a register by its debugger-visible id, resolving the PC and
    /// PRIV pseudo registers.
    pub fn get_register(&mut self, regno: RegisterId) -> Result<u64, RiscvError> {
        tracing::debug!("reading register {:?} on hart {}", regno, self.current_hart);

        if regno == RegisterId::PC {
            self.register_read_direct(RegisterId::csr(csr::DPC))
        } else if regno == RegisterId::PRIV {
            let dcsr = Dcsr(self.register_read_direct(RegisterId::csr(csr::DCSR))? as u32);
            Ok(dcsr.prv() as u64)
        } else {
            let value = self.register_read_direct(regno)?;
            if regno == RegisterId::csr(csr::MSTATUS) {
                self.current_hart_view_mut()?.mstatus_actual = Some(value);
            }
            Ok(value)
        }
    }

    /// Write a register by its debugger-visible id. PC writes are verified
    /// with a readback.
    pub fn set_register(&mut self, regno: RegisterId, value: u64) -> Result<(), RiscvError> {
        tracing::debug!(
            "writing {:#x} to register {:?} on hart {}",
            value,
            regno,
            self.current_hart
        );

        if regno == RegisterId::PC {
            self.register_write_direct(RegisterId::csr(csr::DPC), value)?;

            let read_back = self.register_read_direct(RegisterId::csr(csr::DPC))?;
            if read_back != value {
                return Err(RiscvError::PcVerificationFailed {
                    written: value,
                    read_back,
                });
            }
            Ok(())
        } else if regno == RegisterId::PRIV {
            let mut dcsr = Dcsr(self.register_read_direct(RegisterId::csr(csr::DCSR))? as u32);
            dcsr.set_prv(value as u32);
            self.register_write_direct(RegisterId::csr(csr::DCSR), dcsr.0 as u64)
        } else {
            self.register_write_direct(regno, value)?;
            if regno == RegisterId::csr(csr::MSTATUS) {
                self.current_hart_view_mut()?.mstatus_actual = Some(value);
            }
            Ok(())
        }
    }

    /// Whether every selected hart is halted.
    pub(crate) fn is_halted(&mut self) -> Result<bool, RiscvError> {
        let dmstatus: Dmstatus = self.read_dm_register()?;

        if dmstatus.anyunavail() {
            tracing::error!("hart {} is unavailable", self.current_hart);
        }
        if dmstatus.anynonexistent() {
            tracing::error!("hart {} does not exist", self.current_hart);
        }

        Ok(dmstatus.allhalted())
    }

    /// Request a halt and wait for the hart to stop.
    pub(crate) fn halt_current_hart(&mut self) -> Result<(), RiscvError> {
        tracing::debug!("halting hart {}", self.current_hart);

        let mut dmcontrol: Dmcontrol = self.read_dm_register()?;
        dmcontrol.set_dmactive(true);
        dmcontrol.set_haltreq(true);
        self.write_dm_register(dmcontrol)?;

        let mut halted = false;
        for _ in 0..ACK_PROBE_ATTEMPTS {
            if self.is_halted()? {
                halted = true;
                break;
            }
        }

        if !halted {
            let dmstatus: Dmstatus = self.read_dm_register()?;
            let dmcontrol: Dmcontrol = self.read_dm_register()?;
            tracing::error!("unable to halt hart {}", self.current_hart);
            tracing::error!("  dmcontrol={:#010x}", dmcontrol.0);
            tracing::error!("  dmstatus ={:#010x}", dmstatus.0);
            return Err(RiscvError::RequestNotAcknowledged);
        }

        dmcontrol.set_haltreq(false);
        self.write_dm_register(dmcontrol)
    }

    /// Prologue run before every step or resume: flush the instruction
    /// cache and route `ebreak` in every privilege mode to debug mode.
    fn on_step_or_resume(&mut self, step: bool) -> Result<(), RiscvError> {
        self.issue_fence_i()?;

        let mut dcsr = Dcsr(self.register_read_direct(RegisterId::csr(csr::DCSR))? as u32);
        dcsr.set_step(step);
        dcsr.set_ebreakm(true);
        dcsr.set_ebreakh(true);
        dcsr.set_ebreaks(true);
        dcsr.set_ebreaku(true);

        self.register_write_direct(RegisterId::csr(csr::DCSR), dcsr.0 as u64)
    }

    /// Resume the hart, optionally for a single step, and wait for the
    /// acknowledgement.
    pub(crate) fn step_or_resume_current_hart(&mut self, step: bool) -> Result<(), RiscvError> {
        tracing::debug!("resuming hart {} (step={})", self.current_hart, step);

        self.on_step_or_resume(step)?;

        let mut dmcontrol: Dmcontrol = self.read_dm_register()?;
        dmcontrol.set_dmactive(true);
        dmcontrol.set_resumereq(true);
        self.write_dm_register(dmcontrol)?;

        for _ in 0..ACK_PROBE_ATTEMPTS {
            let dmstatus: Dmstatus = self.read_dm_register()?;

            if !dmstatus.allresumeack() {
                continue;
            }
            if step && !dmstatus.allhalted() {
                continue;
            }

            dmcontrol.set_resumereq(false);
            return self.write_dm_register(dmcontrol);
        }

        let dmstatus: Dmstatus = self.read_dm_register()?;
        tracing::error!("unable to resume hart {}", self.current_hart);
        tracing::error!("  dmstatus ={:#010x}", dmstatus.0);

        if step {
            tracing::error!("  was stepping, halting");
            self.halt_current_hart()?;
        }

        Err(RiscvError::RequestNotAcknowledged)
    }

    /// Classify why the hart is halted from `dcsr.cause`.
    pub(crate) fn halt_reason(&mut self) -> Result<HaltReason, RiscvError> {
        let dcsr = Dcsr(self.register_read_direct(RegisterId::csr(csr::DCSR))? as u32);

        match dcsr.cause() {
            // A software breakpoint or a trigger fired.
            1 | 2 => Ok(HaltReason::Breakpoint),
            // The hart finished a single step.
            4 => Ok(HaltReason::SingleStep),
            // A halt request, or halt-on-reset.
            3 | 5 => Ok(HaltReason::Interrupt),
            cause => {
                tracing::error!("Unknown dcsr cause field: {:#x} (dcsr={:#010x})", cause, dcsr.0);
                Err(RiscvError::UnknownHaltCause(cause))
            }
        }
    }

    /// Put the target into reset.
    pub(crate) fn assert_reset(&mut self) -> Result<(), RiscvError> {
        if self.config.rtos_mode {
            // Every hart is a thread to the host, reset them all.
            let mut control = Dmcontrol(0);
            for hart in 0..self.harts.len() as u32 {
                if !self.hart_enabled(hart) {
                    continue;
                }

                control = Dmcontrol(0);
                control.set_dmactive(true);
                control.set_hartsel(hart);
                control.set_haltreq(self.config.reset_halt);
                self.write_dm_register(control)?;
            }

            control.set_ndmreset(true);
            self.write_dm_register(control)
        } else {
            // Reset just the selected hart.
            let mut control = Dmcontrol(0);
            control.set_dmactive(true);
            control.set_hartsel(self.current_hart);
            control.set_haltreq(self.config.reset_halt);
            control.set_hartreset(true);
            self.write_dm_register(control)?;

            // Check whether hart-level reset is actually supported.
            let readback: Dmcontrol = self.read_dm_register()?;
            if !readback.hartreset() {
                tracing::debug!("hartreset not supported, using ndmreset");
                control.set_hartreset(false);
                control.set_ndmreset(true);
                self.write_dm_register(control)?;
            }

            Ok(())
        }
    }

    /// Release the reset and wait for the hart to come back up, halted or
    /// running depending on the configuration.
    pub(crate) fn deassert_reset(&mut self) -> Result<(), RiscvError> {
        // The target runs at full speed again after the reset, so any
        // BUSY adaptation from the reset sequence is discarded.
        let saved_dmi_busy_delay = self.dtm.dmi_busy_delay();

        let mut control = Dmcontrol(0);
        control.set_dmactive(true);
        control.set_hartsel(self.current_hart);
        control.set_haltreq(self.config.reset_halt);
        self.write_dm_register(control)?;

        let start = Instant::now();

        if self.config.reset_halt {
            tracing::debug!("waiting for hart to be halted out of reset");
            loop {
                let dmstatus: Dmstatus = self.read_dm_register()?;
                if dmstatus.allhalted() {
                    break;
                }
                if start.elapsed() > self.config.reset_timeout {
                    tracing::error!(
                        "hart did not halt coming out of reset; dmstatus={:#010x}",
                        dmstatus.0
                    );
                    return Err(RiscvError::Timeout);
                }
            }

            control.set_haltreq(false);
            self.write_dm_register(control)?;
        } else {
            tracing::debug!("waiting for hart to be running out of reset");
            loop {
                let dmstatus: Dmstatus = self.read_dm_register()?;
                if dmstatus.anyhalted() || dmstatus.anyunavail() {
                    tracing::error!(
                        "unexpected hart status during reset; dmstatus={:#010x}",
                        dmstatus.0
                    );
                    return Err(RiscvError::RequestNotAcknowledged);
                }
                if dmstatus.allrunning() {
                    break;
                }
                if start.elapsed() > self.config.reset_timeout {
                    tracing::error!(
                        "hart did not run coming out of reset; dmstatus={:#010x}",
                        dmstatus.0
                    );
                    return Err(RiscvError::Timeout);
                }
            }
        }

        self.dtm.set_dmi_busy_delay(saved_dmi_busy_delay);
        Ok(())
    }

    /// One-shot examination: discover the transport, the debug module and
    /// every hart behind it.
    pub fn examine(&mut self) -> Result<(), RiscvError> {
        tracing::debug!("Building RISC-V interface");

        self.dtm.init()?;

        // Reset error bits from previous connections.
        self.dtm.dmi_reset()?;

        // Reset, then enable the debug module.
        self.write_dm_register(Dmcontrol(0))?;
        let mut control = Dmcontrol(0);
        control.set_dmactive(true);
        self.write_dm_register(control)?;

        let readback: Dmcontrol = self.read_dm_register()?;
        if !readback.dmactive() {
            return Err(RiscvError::DebugModuleNotActive);
        }

        let status: Dmstatus = self.read_dm_register()?;
        tracing::debug!("dmstatus {:?}", status);

        if status.version() != 2 {
            return Err(RiscvError::UnsupportedDebugModuleVersion(status.version() as u8));
        }
        if !status.authenticated() {
            return Err(RiscvError::NotAuthenticated);
        }
        if status.anyunavail() {
            return Err(RiscvError::HartUnavailable(0));
        }
        if status.anynonexistent() {
            return Err(RiscvError::HartNonexistent(0));
        }

        let abstractcs: Abstractcs = self.read_dm_register()?;
        self.descriptor.progsize = abstractcs.progbufsize() as u8;
        self.descriptor.datacount = abstractcs.datacount() as u8;
        tracing::debug!(
            "program buffer size: {}, data registers: {}",
            self.descriptor.progsize,
            self.descriptor.datacount
        );

        let hartinfo: Hartinfo = self.read_dm_register()?;
        self.descriptor.data_size = hartinfo.datasize();
        self.descriptor.data_addr = if hartinfo.dataaccess() {
            hartinfo.dataaddr() as u64
        } else {
            0
        };

        // Enumerate harts by selecting increasing ids until one does not
        // exist.
        self.harts.clear();
        for hart in 0..self.config.max_harts {
            self.select_hart_raw(hart)?;
            let status: Dmstatus = self.read_dm_register()?;

            if status.anynonexistent() {
                break;
            }

            let mut view = HartView::new();
            view.enabled = !status.allunavail();
            self.harts.push(view);
        }

        if self.harts.is_empty() {
            return Err(RiscvError::HartNonexistent(0));
        }

        tracing::debug!("enumerated {} harts", self.harts.len());

        // Halt every hart so it can be probed.
        for hart in 0..self.hart_count() {
            if !self.hart_enabled(hart) {
                continue;
            }
            self.select_hart_raw(hart)?;
            if !self.is_halted()? {
                self.halt_current_hart()?;
            }
        }

        // Find each hart's debug buffer address and register width.
        for hart in 0..self.hart_count() {
            if !self.hart_enabled(hart) {
                continue;
            }
            self.select_hart_raw(hart)?;
            self.probe_debug_buffer()?;
        }

        // Count the triggers available to each hart.
        for hart in 0..self.hart_count() {
            if !self.hart_enabled(hart) {
                continue;
            }
            self.select_hart_raw(hart)?;
            let count = self.enumerate_triggers()?;
            self.current_hart_view_mut()?.trigger_count = count;
        }

        // Resume every hart, the debugger halts them again as needed.
        for hart in 0..self.hart_count() {
            if !self.hart_enabled(hart) {
                continue;
            }
            self.select_hart_raw(hart)?;
            self.step_or_resume_current_hart(false)?;
        }

        self.select_hart_raw(0)?;

        tracing::info!("Examined RISC-V core; found {} harts", self.hart_count());
        for (hart, view) in self.harts.iter().enumerate() {
            if view.enabled {
                tracing::info!(
                    " hart {}: XLEN={}, program buffer at {:#x}, {} triggers",
                    hart,
                    view.xlen.map(Xlen::bits).unwrap_or(0),
                    view.debug_buffer_addr,
                    view.trigger_count
                );
            } else {
                tracing::info!(" hart {}: currently disabled", hart);
            }
        }

        Ok(())
    }

    /// Discover the debug buffer address of the selected hart and whether
    /// it executes 64 bit instructions, knowing nothing about it yet.
    fn probe_debug_buffer(&mut self) -> Result<(), RiscvError> {
        let hart = self.current_hart as usize;

        self.harts[hart].debug_buffer_size = self.descriptor.progsize as u32;
        // Guess a 32-bit system, the probe below corrects this.
        self.harts[hart].xlen = Some(Xlen::Rv32);
        self.harts[hart].debug_buffer_addr = 0;

        // An auipc stores its own address over the program text; reading
        // progbuf0 back reveals where the buffer lives.
        let mut program32 = self.new_program()?;
        let temp = program32.temp_register();
        program32.csrrw(temp, temp, csr::DSCRATCH);
        program32.insert(assembly::auipc(temp));
        program32.insert(assembly::store(2, temp, temp, -4));
        program32.csrrw(temp, temp, csr::DSCRATCH);
        program32.fence();

        match program32.execute(self) {
            Ok(()) => {}
            Err(RiscvError::ProgramExecution(_)) | Err(RiscvError::AbstractCommand(_)) => {
                tracing::warn!(
                    "unable to find the address of the program buffer on hart {}",
                    hart
                );
                self.harts[hart].xlen = None;
                self.harts[hart].enabled = false;
                return Ok(());
            }
            Err(other) => return Err(other),
        }

        let progbuf_addr = (self.read_debug_buffer(0)? as u64).wrapping_sub(4);
        self.harts[hart].debug_buffer_addr = progbuf_addr;

        // Check whether the hart executes 64 bit instructions. The sd
        // faults on RV32 and the dscratch swap never undoes itself there,
        // so s0 is saved by hand. On RV64 the saved value is wrong (it was
        // read 32 bits wide) but the reverse swap restores s0 anyway.
        let offset = if progbuf_addr % 8 == 0 { -4i16 } else { 0 };
        let s0 = self.register_read_direct(RegisterId::S0)?;

        let mut program64 = self.new_program()?;
        program64.csrrw(temp, temp, csr::DSCRATCH);
        program64.insert(assembly::auipc(temp));
        program64.insert(assembly::store(3, temp, temp, offset));
        program64.csrrw(temp, temp, csr::DSCRATCH);
        program64.fence();

        match program64.execute(self) {
            Ok(()) => {
                let high = self.read_debug_buffer(((8 + offset as i32) / 4) as usize)? as u64;
                let low = self.read_debug_buffer(((4 + offset as i32) / 4) as usize)? as u64;
                self.harts[hart].debug_buffer_addr = ((high << 32) + low).wrapping_sub(4);
                self.harts[hart].xlen = Some(Xlen::Rv64);
            }
            Err(RiscvError::ProgramExecution(_)) | Err(RiscvError::AbstractCommand(_)) => {
                self.register_write_direct(RegisterId::S0, s0)?;
            }
            Err(other) => return Err(other),
        }

        tracing::debug!(
            " hart {}: XLEN={:?}, program buffer at {:#x}",
            hart,
            self.harts[hart].xlen,
            self.harts[hart].debug_buffer_addr
        );

        // Treat contiguous data words as an extension of the buffer.
        let addr = self.harts[hart].debug_buffer_addr;
        if addr + 4 * self.descriptor.progsize as u64 == self.descriptor.data_addr
            && self.descriptor.data_addr != 0
        {
            self.harts[hart].debug_buffer_size += self.descriptor.data_size;
            tracing::debug!(
                "extending the debug buffer using data words, total size {}",
                self.harts[hart].debug_buffer_size
            );
        }

        let last_slot = addr + 4 * (self.harts[hart].debug_buffer_size as u64 - 1);
        if !program::address_reachable(addr) || !program::address_reachable(last_slot) {
            tracing::error!(
                "debug buffer of hart {} at {:#x} is beyond the reach of injected programs",
                hart,
                addr
            );
            return Err(RiscvError::DebugBufferOutOfReach(addr));
        }

        Ok(())
    }

    fn is_exception(error: &RiscvError) -> bool {
        matches!(
            error,
            RiscvError::AbstractCommand(AbstractCommandErrorKind::Exception)
                | RiscvError::ProgramExecution(AbstractCommandErrorKind::Exception)
        )
    }

    /// Walk `tselect` until a nonexistent trigger turns up.
    ///
    /// These steps follow the debug specification 0.13, section 5.1
    /// Enumeration.
    fn enumerate_triggers(&mut self) -> Result<u32, RiscvError> {
        let xlen = self.xlen()?;
        let tselect = RegisterId::csr(csr::TSELECT);

        let mut count = 0u32;
        loop {
            tracing::debug!("trying tselect={}", count);

            if let Err(e) = self.register_write_direct(tselect, count as u64) {
                if Self::is_exception(&e) {
                    break;
                }
                return Err(e);
            }

            let readback = self.register_read_direct(tselect)?;
            if readback != count as u64 {
                break;
            }

            match self.register_read_direct(RegisterId::csr(csr::TINFO)) {
                Ok(tinfo) => {
                    if tinfo & 0xffff == 1 {
                        // Trigger doesn't exist.
                        break;
                    }
                    tracing::debug!(
                        "discovered trigger {} supporting types {:#x}",
                        count,
                        tinfo & 0xffff
                    );
                }
                Err(e) if Self::is_exception(&e) => {
                    // No tinfo, the type field of tdata1 has to do.
                    let tdata = self.register_read_direct(RegisterId::csr(csr::TDATA1))?;
                    let trigger_type = tdata >> (xlen.bits() - 4);
                    if trigger_type == 0 {
                        break;
                    }
                    tracing::debug!("discovered trigger {} with type {}", count, trigger_type);
                }
                Err(e) => return Err(e),
            }

            count += 1;
        }

        tracing::debug!("hart {} supports {} triggers", self.current_hart, count);

        Ok(count)
    }
}
