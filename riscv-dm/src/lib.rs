//! Driver for the RISC-V external Debug Module (version 0.13) behind a
//! JTAG Debug Transport Module.
//!
//! The crate is layered the way the wire protocol is: a [`probe::JtagAccess`]
//! implementation supplies raw scans, [`dtm::jtag_dtm::JtagDtm`] turns them
//! into reliable DMI register accesses with adaptive BUSY backoff,
//! [`communication_interface::RiscvCommunicationInterface`] speaks the
//! abstract command and program buffer protocol on top, and [`Riscv013`]
//! exposes the halt/resume/step, memory and register surface the
//! surrounding debugger drives.

#![allow(clippy::inconsistent_digit_grouping)]

use std::time::Duration;

use bitfield::bitfield;

use crate::communication_interface::DebugRegister;
use crate::communication_interface::{RiscvCommunicationInterface, RiscvError};
use crate::probe::JtagAccess;
use crate::registers::{RegisterCache, RegisterId};

#[macro_use]
mod register;

pub mod assembly;
pub mod communication_interface;
pub mod dtm;
mod memory_interface;
pub mod probe;
pub mod program;
pub mod registers;

pub use communication_interface::{HartView, Xlen};

/// Session configuration, owned by the target value. There is no global
/// state; two targets on two probes are fully independent.
#[derive(Debug, Clone)]
pub struct RiscvConfig {
    /// How long to wait for an abstract command to finish.
    pub command_timeout: Duration,
    /// How long to wait for harts to come back out of reset.
    pub reset_timeout: Duration,
    /// Whether harts should halt when a reset is released.
    pub reset_halt: bool,
    /// Treat every hart as a thread and reset them together.
    pub rtos_mode: bool,
    /// Upper bound on the hart enumeration.
    pub max_harts: u32,
}

impl Default for RiscvConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            reset_timeout: Duration::from_secs(30),
            reset_halt: false,
            rtos_mode: false,
            max_harts: 32,
        }
    }
}

/// Why a hart is halted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// A software breakpoint or a hardware trigger fired.
    Breakpoint,
    /// A single step finished.
    SingleStep,
    /// The debugger requested the halt, or the hart halted out of reset.
    Interrupt,
}

/// Observable state of the target.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoreStatus {
    /// Nothing is known yet; `examine` has not run.
    Unknown,
    /// The selected hart is halted.
    Halted(HaltReason),
    /// The selected hart is running.
    Running,
    /// The selected hart exists but cannot be debugged right now.
    Unavailable,
    /// The selected hart does not exist.
    Nonexistent,
    /// A reset is being held.
    Reset,
}

/// Information about the core state after an operation that stops it.
#[derive(Debug, Copy, Clone)]
pub struct CoreInformation {
    /// The program counter the hart halted at.
    pub pc: u64,
}

/// A thread-view front-end consuming the per-hart state after examination.
pub trait RtosAdapter {
    /// Called once examination finished so threads can be mapped to harts.
    fn update_threads(&mut self, harts: &[HartView]);
}

/// Operations the surrounding debugger invokes on a RISC-V target.
pub trait CoreInterface {
    /// Discover the transport, the debug module and all harts.
    fn examine(&mut self) -> Result<(), RiscvError>;

    /// Derive the current target state from the debug module.
    fn poll(&mut self) -> Result<CoreStatus, RiscvError>;

    /// Halt the selected hart.
    fn halt(&mut self) -> Result<CoreInformation, RiscvError>;

    /// Resume the selected hart.
    fn resume(&mut self) -> Result<(), RiscvError>;

    /// Execute a single instruction on the selected hart.
    fn step(&mut self) -> Result<CoreInformation, RiscvError>;

    /// Put the target into reset.
    fn assert_reset(&mut self) -> Result<(), RiscvError>;

    /// Release the reset.
    fn deassert_reset(&mut self) -> Result<(), RiscvError>;

    /// Read `count` elements of `size` bytes from target memory.
    fn read_memory(
        &mut self,
        address: u64,
        size: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError>;

    /// Write `count` elements of `size` bytes to target memory.
    fn write_memory(
        &mut self,
        address: u64,
        size: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<(), RiscvError>;

    /// Read a register, served from the cache when valid.
    fn get_register(&mut self, id: RegisterId) -> Result<u64, RiscvError>;

    /// Write a register through to the hart and the cache.
    fn set_register(&mut self, id: RegisterId, value: u64) -> Result<(), RiscvError>;

    /// Why the selected hart is halted.
    fn halt_reason(&mut self) -> Result<HaltReason, RiscvError>;
}

/// A RISC-V target behind a version 0.13 debug module.
#[derive(Debug)]
pub struct Riscv013<P: JtagAccess> {
    interface: RiscvCommunicationInterface<P>,
    cache: RegisterCache,
    state: CoreStatus,
}

impl<P: JtagAccess> Riscv013<P> {
    /// Create a target on top of a JTAG probe. Nothing touches the wire
    /// until [`CoreInterface::examine`] runs.
    pub fn new(probe: P, config: RiscvConfig) -> Self {
        Self {
            interface: RiscvCommunicationInterface::new(probe, config),
            cache: RegisterCache::new(),
            state: CoreStatus::Unknown,
        }
    }

    /// The protocol engine underneath this target.
    pub fn interface(&mut self) -> &mut RiscvCommunicationInterface<P> {
        &mut self.interface
    }

    /// The last state observed by `poll` or forced by a control operation.
    pub fn status(&self) -> CoreStatus {
        self.state
    }

    /// Select the hart all further operations apply to.
    pub fn select_hart(&mut self, hart: u32) -> Result<(), RiscvError> {
        if hart != self.interface.current_hart() {
            self.interface.select_hart(hart)?;
            self.cache.invalidate_all();
        }
        Ok(())
    }

    /// The stable name of a register.
    pub fn register_name(&self, id: RegisterId) -> &str {
        self.cache.name(id)
    }

    /// The cached value of a register, if it is valid.
    pub fn cached_register(&self, id: RegisterId) -> Option<u64> {
        self.cache.get(id)
    }

    /// Hand the per-hart views to an attached RTOS front-end.
    pub fn update_rtos(&mut self, adapter: &mut dyn RtosAdapter) {
        adapter.update_threads(self.interface.harts());
    }
}

impl<P: JtagAccess> CoreInterface for Riscv013<P> {
    fn examine(&mut self) -> Result<(), RiscvError> {
        self.interface.examine()?;
        self.cache.invalidate_all();
        self.state = CoreStatus::Running;
        Ok(())
    }

    fn poll(&mut self) -> Result<CoreStatus, RiscvError> {
        let dmstatus: Dmstatus = self.interface.read_dm_register()?;

        tracing::trace!("{:?}", dmstatus);

        self.state = if dmstatus.anynonexistent() {
            CoreStatus::Nonexistent
        } else if dmstatus.anyunavail() {
            CoreStatus::Unavailable
        } else if dmstatus.allhalted() {
            CoreStatus::Halted(self.interface.halt_reason()?)
        } else if dmstatus.allrunning() {
            CoreStatus::Running
        } else {
            CoreStatus::Unknown
        };

        Ok(self.state)
    }

    fn halt(&mut self) -> Result<CoreInformation, RiscvError> {
        self.interface.halt_current_hart()?;

        let reason = self.interface.halt_reason()?;
        self.state = CoreStatus::Halted(reason);

        let pc = self.get_register(RegisterId::PC)?;
        Ok(CoreInformation { pc })
    }

    fn resume(&mut self) -> Result<(), RiscvError> {
        self.interface.step_or_resume_current_hart(false)?;
        self.cache.invalidate_all();
        self.state = CoreStatus::Running;
        Ok(())
    }

    fn step(&mut self) -> Result<CoreInformation, RiscvError> {
        self.interface.step_or_resume_current_hart(true)?;
        self.cache.invalidate_all();

        let reason = self.interface.halt_reason()?;
        self.state = CoreStatus::Halted(reason);

        let pc = self.get_register(RegisterId::PC)?;
        Ok(CoreInformation { pc })
    }

    fn assert_reset(&mut self) -> Result<(), RiscvError> {
        self.interface.assert_reset()?;
        self.cache.invalidate_all();
        self.state = CoreStatus::Reset;
        Ok(())
    }

    fn deassert_reset(&mut self) -> Result<(), RiscvError> {
        self.interface.deassert_reset()?;
        self.cache.invalidate_all();
        self.state = if self.interface.config().reset_halt {
            CoreStatus::Halted(HaltReason::Interrupt)
        } else {
            CoreStatus::Running
        };
        Ok(())
    }

    fn read_memory(
        &mut self,
        address: u64,
        size: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        self.interface.read_memory(address, size, count, buffer)
    }

    fn write_memory(
        &mut self,
        address: u64,
        size: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        self.interface.write_memory(address, size, count, buffer)
    }

    fn get_register(&mut self, id: RegisterId) -> Result<u64, RiscvError> {
        if let Some(value) = self.cache.get(id) {
            return Ok(value);
        }

        let value = self.interface.get_register(id)?;
        self.cache.store(id, value);

        Ok(value)
    }

    fn set_register(&mut self, id: RegisterId, value: u64) -> Result<(), RiscvError> {
        self.cache.store_dirty(id, value);

        match self.interface.set_register(id, value) {
            Ok(()) => {
                self.cache.mark_clean(id);
                Ok(())
            }
            Err(e) => {
                self.cache.invalidate(id);
                Err(e)
            }
        }
    }

    fn halt_reason(&mut self) -> Result<HaltReason, RiscvError> {
        self.interface.halt_reason()
    }
}

bitfield! {
    /// `dmcontrol` register, located at address 0x10
    #[derive(Copy, Clone)]
    pub struct Dmcontrol(u32);
    impl Debug;

    pub _, set_haltreq: 31;
    pub _, set_resumereq: 30;
    pub hartreset, set_hartreset: 29;
    pub _, set_ackhavereset: 28;
    pub hasel, set_hasel: 26;
    pub hartsello, set_hartsello: 25, 16;
    pub hartselhi, set_hartselhi: 15, 6;
    pub _, set_resethaltreq: 3;
    pub _, set_clrresethaltreq: 2;
    pub ndmreset, set_ndmreset: 1;
    pub dmactive, set_dmactive: 0;
}

impl Dmcontrol {
    /// Currently selected harts
    ///
    /// Combination of the hartselhi and hartsello registers.
    pub fn hartsel(&self) -> u32 {
        self.hartselhi() << 10 | self.hartsello()
    }

    /// Set the currently selected harts
    ///
    /// This sets the hartselhi and hartsello registers.
    /// This is a 20 bit register, larger values will be truncated.
    pub fn set_hartsel(&mut self, value: u32) {
        self.set_hartsello(value & 0x3ff);
        self.set_hartselhi((value >> 10) & 0x3ff);
    }
}

impl DebugRegister for Dmcontrol {
    const ADDRESS: u8 = 0x10;
    const NAME: &'static str = "dmcontrol";
}

impl From<Dmcontrol> for u32 {
    fn from(register: Dmcontrol) -> Self {
        register.0
    }
}

impl From<u32> for Dmcontrol {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

bitfield! {
    /// Readonly `dmstatus` register.
    ///
    /// Located at address 0x11
    pub struct Dmstatus(u32);
    impl Debug;

    pub impebreak, _: 22;
    pub allhavereset, _: 19;
    pub anyhavereset, _: 18;
    pub allresumeack, _: 17;
    pub anyresumeack, _: 16;
    pub allnonexistent, _: 15;
    pub anynonexistent, _: 14;
    pub allunavail, _: 13;
    pub anyunavail, _: 12;
    pub allrunning, _: 11;
    pub anyrunning, _: 10;
    pub allhalted, _: 9;
    pub anyhalted, _: 8;
    pub authenticated, _: 7;
    pub authbusy, _: 6;
    pub hasresethaltreq, _: 5;
    pub confstrptrvalid, _: 4;
    pub version, _: 3, 0;
}

impl DebugRegister for Dmstatus {
    const ADDRESS: u8 = 0x11;
    const NAME: &'static str = "dmstatus";
}

impl From<u32> for Dmstatus {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dmstatus> for u32 {
    fn from(register: Dmstatus) -> Self {
        register.0
    }
}

bitfield! {
    /// The `dcsr` debug CSR, address 0x7b0.
    pub struct Dcsr(u32);
    impl Debug;

    pub xdebugver, _: 31, 28;
    pub ebreakm, set_ebreakm: 15;
    pub ebreakh, set_ebreakh: 14;
    pub ebreaks, set_ebreaks: 13;
    pub ebreaku, set_ebreaku: 12;
    pub stepie, set_stepie: 11;
    pub stopcount, set_stopcount: 10;
    pub stoptime, set_stoptime: 9;
    pub cause, _: 8, 6;
    pub mprven, set_mprven: 4;
    pub nmip, _: 3;
    pub step, set_step: 2;
    pub prv, set_prv: 1, 0;
}

bitfield! {
    /// Abstract Control and Status register, address 0x16.
    pub struct Abstractcs(u32);
    impl Debug;

    pub progbufsize, _: 28, 24;
    pub busy, _: 12;
    pub cmderr, set_cmderr: 10, 8;
    pub datacount, _: 3, 0;
}

impl DebugRegister for Abstractcs {
    const ADDRESS: u8 = 0x16;
    const NAME: &'static str = "abstractcs";
}

impl From<Abstractcs> for u32 {
    fn from(register: Abstractcs) -> Self {
        register.0
    }
}

impl From<u32> for Abstractcs {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

bitfield! {
    /// Hart Info register, address 0x12.
    pub struct Hartinfo(u32);
    impl Debug;

    pub nscratch, _: 23, 20;
    pub dataaccess, _: 16;
    pub datasize, _: 15, 12;
    pub dataaddr, _: 11, 0;
}

impl DebugRegister for Hartinfo {
    const ADDRESS: u8 = 0x12;
    const NAME: &'static str = "hartinfo";
}

impl From<Hartinfo> for u32 {
    fn from(register: Hartinfo) -> Self {
        register.0
    }
}

impl From<u32> for Hartinfo {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

dm_register! {
    /// First abstract data register; the others follow contiguously.
    pub Data0 @ 0x04, "data0"
}

dm_register! {
    /// First program buffer word; the others follow contiguously.
    pub Progbuf0 @ 0x20, "progbuf0"
}

#[cfg(test)]
mod test {
    use super::{CoreInterface, CoreStatus, HaltReason, Riscv013, RiscvConfig, Xlen};
    use crate::probe::fake_probe::FakeJtagProbe;
    use crate::registers::{csr, RegisterId};

    fn examined(probe: FakeJtagProbe) -> Riscv013<FakeJtagProbe> {
        let mut target = Riscv013::new(probe, RiscvConfig::default());
        target.examine().unwrap();
        target
    }

    #[test]
    fn examine_enumerates_harts_and_geometry() {
        let mut target = examined(FakeJtagProbe::new_rv32_multi(2));

        let interface = target.interface();
        assert_eq!(interface.hart_count(), 2);
        for hart in 0..2 {
            let view = interface.hart(hart).unwrap();
            assert_eq!(view.xlen, Some(Xlen::Rv32));
            assert_ne!(view.debug_buffer_addr, 0);
        }

        // Examination leaves the target running.
        assert_eq!(target.poll().unwrap(), CoreStatus::Running);
    }

    #[test]
    fn examine_discovers_a_64_bit_hart() {
        let mut target = examined(FakeJtagProbe::new_rv64());

        let view = target.interface().hart(0).unwrap();
        assert_eq!(view.xlen, Some(Xlen::Rv64));
        assert_eq!(view.debug_buffer_addr, 0x400);
    }

    #[test]
    fn examine_counts_triggers() {
        let mut probe = FakeJtagProbe::new_rv32();
        probe.dm.trigger_count = 4;

        let mut target = examined(probe);
        assert_eq!(target.interface().hart(0).unwrap().trigger_count, 4);
    }

    #[test]
    fn gpr_write_read_round_trips() {
        let mut target = examined(FakeJtagProbe::new_rv32());
        target.halt().unwrap();

        let x5 = RegisterId(5);
        target.set_register(x5, 0xdead_beef).unwrap();
        assert_eq!(target.get_register(x5).unwrap(), 0xdead_beef);

        // The write actually reached the hart.
        assert_eq!(target.interface().dtm().probe_mut().dm.harts[0].gprs[5], 0xdead_beef);
    }

    #[test]
    fn register_reads_are_cached_until_the_hart_runs() {
        let mut target = examined(FakeJtagProbe::new_rv32());
        target.halt().unwrap();

        let x6 = RegisterId(6);
        target.interface().dtm().probe_mut().dm.harts[0].gprs[6] = 17;
        assert_eq!(target.get_register(x6).unwrap(), 17);
        assert_eq!(target.cached_register(x6), Some(17));

        // A change behind the cache's back is not observed...
        target.interface().dtm().probe_mut().dm.harts[0].gprs[6] = 99;
        assert_eq!(target.get_register(x6).unwrap(), 17);

        // ...until a resume invalidates the cache.
        target.resume().unwrap();
        target.halt().unwrap();
        assert_eq!(target.cached_register(x6), None);
        assert_eq!(target.get_register(x6).unwrap(), 99);
    }

    #[test]
    fn fpr_access_falls_back_to_the_program_buffer_once() {
        let mut probe = FakeJtagProbe::new_rv64();
        probe.dm.abstract_fpr_supported = false;

        let mut target = examined(probe);
        target.halt().unwrap();

        let f3 = RegisterId(RegisterId::F0.0 + 3);
        target.set_register(f3, 0x4010_0000_0000_0000).unwrap();
        assert_eq!(
            target.interface().dtm().probe_mut().dm.harts[0].fprs[3],
            0x4010_0000_0000_0000
        );

        target.cache.invalidate(f3);
        assert_eq!(target.get_register(f3).unwrap(), 0x4010_0000_0000_0000);

        let dm = &target.interface().dtm().probe_mut().dm;
        assert_eq!(dm.fpr_write_attempts, 1);
        assert_eq!(dm.fpr_read_attempts, 1);

        // The capability latched; no further abstract attempts are made.
        let f4 = RegisterId(RegisterId::F0.0 + 4);
        target.set_register(f4, 0x1234).unwrap();
        target.cache.invalidate(f3);
        target.get_register(f3).unwrap();

        let dm = &target.interface().dtm().probe_mut().dm;
        assert_eq!(dm.fpr_write_attempts, 1);
        assert_eq!(dm.fpr_read_attempts, 1);
    }

    #[test]
    fn csr_access_falls_back_to_the_program_buffer_once() {
        let mut probe = FakeJtagProbe::new_rv32();
        probe.dm.abstract_csr_supported = false;

        // Examination itself touches CSRs, so the capability latches there.
        let mut target = examined(probe);
        target.halt().unwrap();

        let mscratch = RegisterId::csr(0x340);
        target.set_register(mscratch, 0xc0de).unwrap();
        target.cache.invalidate(mscratch);
        assert_eq!(target.get_register(mscratch).unwrap(), 0xc0de);

        let dm = &target.interface().dtm().probe_mut().dm;
        assert_eq!(dm.csr_write_attempts, 1);
        assert_eq!(dm.csr_read_attempts, 1);
    }

    #[test]
    fn pc_writes_are_verified() {
        let mut target = examined(FakeJtagProbe::new_rv32());
        target.halt().unwrap();

        target.set_register(RegisterId::PC, 0x8000_0040).unwrap();
        assert_eq!(target.get_register(RegisterId::PC).unwrap(), 0x8000_0040);
    }

    #[test]
    fn priv_register_is_backed_by_dcsr() {
        let mut target = examined(FakeJtagProbe::new_rv32());
        target.halt().unwrap();

        assert_eq!(target.get_register(RegisterId::PRIV).unwrap(), 3);

        target.set_register(RegisterId::PRIV, 1).unwrap();
        target.cache.invalidate(RegisterId::PRIV);
        assert_eq!(target.get_register(RegisterId::PRIV).unwrap(), 1);
    }

    #[test]
    fn mstatus_writes_update_the_shadow() {
        let mut target = examined(FakeJtagProbe::new_rv32());
        target.halt().unwrap();

        target.set_register(RegisterId::csr(csr::MSTATUS), 0x88).unwrap();
        assert_eq!(
            target.interface().hart(0).unwrap().mstatus_actual,
            Some(0x88)
        );
    }

    #[test]
    fn halt_step_resume_cycle() {
        let mut target = examined(FakeJtagProbe::new_rv32());

        assert_eq!(target.poll().unwrap(), CoreStatus::Running);

        let info = target.halt().unwrap();
        assert_eq!(info.pc, 0x8000_0000);
        assert_eq!(target.halt_reason().unwrap(), HaltReason::Interrupt);
        assert!(matches!(target.poll().unwrap(), CoreStatus::Halted(_)));

        // A 4-byte instruction at the halt point, then a compressed one.
        {
            let memory = &mut target.interface().dtm().probe_mut().dm.memory;
            for (offset, byte) in 0x13u32.to_le_bytes().iter().enumerate() {
                memory.insert(0x8000_0000 + offset as u64, *byte);
            }
            memory.insert(0x8000_0004, 0x01);
            memory.insert(0x8000_0005, 0x00);
        }

        let stepped = target.step().unwrap();
        assert_eq!(stepped.pc, 0x8000_0004);
        assert_eq!(target.halt_reason().unwrap(), HaltReason::SingleStep);

        let stepped = target.step().unwrap();
        assert_eq!(stepped.pc, 0x8000_0006);

        target.resume().unwrap();
        assert_eq!(target.poll().unwrap(), CoreStatus::Running);
    }

    #[test]
    fn reset_with_halt_leaves_the_hart_halted() {
        let mut probe_config = RiscvConfig::default();
        probe_config.reset_halt = true;

        let mut target = Riscv013::new(FakeJtagProbe::new_rv32(), probe_config);
        target.examine().unwrap();

        target.assert_reset().unwrap();
        target.deassert_reset().unwrap();

        assert_eq!(
            target.poll().unwrap(),
            CoreStatus::Halted(HaltReason::Interrupt)
        );
    }

    #[test]
    fn reset_without_halt_leaves_the_hart_running() {
        let mut target = examined(FakeJtagProbe::new_rv32());
        target.halt().unwrap();

        target.assert_reset().unwrap();
        target.deassert_reset().unwrap();

        assert_eq!(target.poll().unwrap(), CoreStatus::Running);
    }

    #[test]
    fn register_names_resolve() {
        let target = Riscv013::new(FakeJtagProbe::new_rv32(), RiscvConfig::default());

        assert_eq!(target.register_name(RegisterId(5)), "x5");
        assert_eq!(target.register_name(RegisterId::PC), "pc");
        assert_eq!(target.register_name(RegisterId::PRIV), "priv");
    }
}
