//! A fake JTAG probe with a small Debug Module model behind it.
//!
//! The model is just deep enough to run every program this crate injects:
//! it implements the pipelined `dmi` register with sticky BUSY, abstract
//! register commands, AUTOEXEC and an interpreter for the instructions the
//! assembler emits. Tests use it to drive the full stack end to end.

use std::collections::HashMap;

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;

use super::{DebugProbeError, JtagAccess, ScanBits};

const IR_IDCODE: u32 = 0x01;
const IR_DTMCS: u32 = 0x10;
const IR_DMI: u32 = 0x11;

const DMI_DMCONTROL: u32 = 0x10;
const DMI_DMSTATUS: u32 = 0x11;
const DMI_HARTINFO: u32 = 0x12;
const DMI_ABSTRACTCS: u32 = 0x16;
const DMI_COMMAND: u32 = 0x17;
const DMI_ABSTRACTAUTO: u32 = 0x18;
const DMI_DATA0: u32 = 0x04;
const DMI_PROGBUF0: u32 = 0x20;

const CSR_DCSR: u16 = 0x7b0;
const CSR_DPC: u16 = 0x7b1;
const CSR_TSELECT: u16 = 0x7a0;
const CSR_TINFO: u16 = 0x7a4;

const EBREAK: u32 = 0x0010_0073;

/// Address harts restart from after a reset.
const RESET_VECTOR: u64 = 0x8000_0000;

/// How the probe injects transport-level BUSY responses.
#[derive(Debug, Copy, Clone)]
pub enum BusyInjection {
    /// Never report BUSY.
    None,
    /// Report BUSY on every `n`th `dmi` scan, unless the host parked for
    /// at least `required_idle` run-test cycles beforehand. BUSY is sticky
    /// until a `dmireset`, like the real DTM.
    EveryNth { n: u64, required_idle: u32 },
}

#[derive(Debug)]
enum Queued {
    Ir(u32),
    Dr(Vec<u8>, u32),
    RunTest(u32),
}

/// One modeled hart.
#[derive(Debug)]
pub struct FakeHart {
    pub xlen64: bool,
    pub gprs: [u64; 32],
    pub fprs: [u64; 32],
    pub csrs: HashMap<u16, u64>,
    pub pc: u64,
    pub halted: bool,
    pub resume_ack: bool,
    pub have_reset: bool,
}

impl FakeHart {
    fn new(xlen64: bool) -> Self {
        let mut csrs = HashMap::new();
        // Machine mode out of reset.
        csrs.insert(CSR_DCSR, 3);

        Self {
            xlen64,
            gprs: [0; 32],
            fprs: [0; 32],
            csrs,
            pc: RESET_VECTOR,
            halted: false,
            resume_ack: false,
            have_reset: false,
        }
    }

    fn set_cause(&mut self, cause: u64) {
        let dcsr = self.csrs.entry(CSR_DCSR).or_insert(0);
        *dcsr = (*dcsr & !(7 << 6)) | (cause << 6);
    }

    fn dcsr_step(&self) -> bool {
        self.csrs.get(&CSR_DCSR).copied().unwrap_or(0) & (1 << 2) != 0
    }
}

/// The Debug Module and everything behind it.
#[derive(Debug)]
pub struct DebugModuleModel {
    pub harts: Vec<FakeHart>,
    pub memory: HashMap<u64, u8>,

    /// Number of hardware triggers each hart reports through `tinfo`.
    pub trigger_count: u32,

    pub abstract_csr_supported: bool,
    pub abstract_fpr_supported: bool,
    pub hartreset_supported: bool,

    /// Drop every nth AUTOEXEC trigger with a BUSY abstract error.
    pub abstract_busy_every: Option<u64>,
    /// Fault exactly the nth AUTOEXEC trigger with an exception.
    pub fail_autoexec_after: Option<u64>,

    pub csr_read_attempts: u32,
    pub csr_write_attempts: u32,
    pub fpr_read_attempts: u32,
    pub fpr_write_attempts: u32,

    progbuf_size: usize,
    datacount: usize,
    progbuf_addr: u64,
    data_addr: u64,

    dmcontrol: u32,
    selected_hart: u32,
    ndmreset: bool,
    abstractauto: u32,
    cmderr: u32,
    data: [u32; 12],
    progbuf: [u32; 16],

    autoexec_triggers: u64,
}

impl DebugModuleModel {
    fn new(hart_count: usize, xlen64: bool) -> Self {
        Self {
            harts: (0..hart_count).map(|_| FakeHart::new(xlen64)).collect(),
            memory: HashMap::new(),
            trigger_count: 0,
            abstract_csr_supported: true,
            abstract_fpr_supported: true,
            hartreset_supported: false,
            abstract_busy_every: None,
            fail_autoexec_after: None,
            csr_read_attempts: 0,
            csr_write_attempts: 0,
            fpr_read_attempts: 0,
            fpr_write_attempts: 0,
            progbuf_size: 16,
            datacount: 4,
            progbuf_addr: 0x400,
            data_addr: 0x440,
            dmcontrol: 0,
            selected_hart: 0,
            ndmreset: false,
            abstractauto: 0,
            cmderr: 0,
            data: [0; 12],
            progbuf: [0; 16],
            autoexec_triggers: 0,
        }
    }

    fn selected_hart_mut(&mut self) -> Option<&mut FakeHart> {
        self.harts.get_mut(self.selected_hart as usize)
    }

    fn read_register(&mut self, address: u32) -> u32 {
        match address {
            DMI_DMCONTROL => {
                let mut value = self.dmcontrol;
                if !self.hartreset_supported {
                    value &= !(1 << 29);
                }
                value
            }
            DMI_DMSTATUS => self.dmstatus(),
            DMI_HARTINFO => {
                // dataaccess=1, datasize, dataaddr
                (1 << 16) | ((self.datacount as u32) << 12) | (self.data_addr as u32 & 0xfff)
            }
            DMI_ABSTRACTCS => {
                ((self.progbuf_size as u32) << 24) | (self.cmderr << 8) | self.datacount as u32
            }
            DMI_ABSTRACTAUTO => self.abstractauto,
            addr if (DMI_DATA0..DMI_DATA0 + 12).contains(&addr) => {
                let index = (addr - DMI_DATA0) as usize;
                let value = self.data[index];
                if self.abstractauto & (1 << index) != 0 {
                    self.trigger_autoexec();
                }
                value
            }
            addr if (DMI_PROGBUF0..DMI_PROGBUF0 + 16).contains(&addr) => {
                let index = (addr - DMI_PROGBUF0) as usize;
                let value = self.progbuf[index];
                if self.abstractauto & (1 << (16 + index)) != 0 {
                    self.trigger_autoexec();
                }
                value
            }
            _ => 0,
        }
    }

    fn write_register(&mut self, address: u32, value: u32) {
        match address {
            DMI_DMCONTROL => self.write_dmcontrol(value),
            DMI_ABSTRACTCS => {
                // cmderr is W1C.
                self.cmderr &= !((value >> 8) & 0x7);
            }
            DMI_COMMAND => self.execute_command(value),
            DMI_ABSTRACTAUTO => self.abstractauto = value,
            addr if (DMI_DATA0..DMI_DATA0 + 12).contains(&addr) => {
                let index = (addr - DMI_DATA0) as usize;
                self.data[index] = value;
                if self.abstractauto & (1 << index) != 0 {
                    self.trigger_autoexec();
                }
            }
            addr if (DMI_PROGBUF0..DMI_PROGBUF0 + 16).contains(&addr) => {
                let index = (addr - DMI_PROGBUF0) as usize;
                self.progbuf[index] = value;
                if self.abstractauto & (1 << (16 + index)) != 0 {
                    self.trigger_autoexec();
                }
            }
            _ => {}
        }
    }

    fn dmstatus(&self) -> u32 {
        // version 2, authenticated
        let mut status = 2 | (1 << 7);

        match self.harts.get(self.selected_hart as usize) {
            None => {
                // allnonexistent | anynonexistent
                status |= (1 << 15) | (1 << 14);
            }
            Some(hart) => {
                if hart.halted {
                    status |= (1 << 9) | (1 << 8);
                } else {
                    status |= (1 << 11) | (1 << 10);
                }
                if hart.resume_ack {
                    status |= (1 << 17) | (1 << 16);
                }
                if hart.have_reset {
                    status |= (1 << 19) | (1 << 18);
                }
            }
        }

        status
    }

    fn write_dmcontrol(&mut self, value: u32) {
        let dmactive = value & 1 != 0;
        if !dmactive {
            self.dmcontrol = 0;
            self.abstractauto = 0;
            self.cmderr = 0;
            self.data = [0; 12];
            self.progbuf = [0; 16];
            return;
        }

        let hartsello = (value >> 16) & 0x3ff;
        let hartselhi = (value >> 6) & 0x3ff;
        self.selected_hart = (hartselhi << 10) | hartsello;
        self.dmcontrol = value;

        let haltreq = value & (1 << 31) != 0;
        let resumereq = value & (1 << 30) != 0;
        let ackhavereset = value & (1 << 28) != 0;
        let ndmreset = value & (1 << 1) != 0;

        if let Some(hart) = self.selected_hart_mut() {
            if ackhavereset {
                hart.have_reset = false;
            }
        }

        if haltreq {
            self.halt_selected_hart(3);
        }

        if resumereq {
            self.resume_selected_hart();
        }

        if ndmreset {
            self.ndmreset = true;
        } else if self.ndmreset {
            // Falling edge resets every hart.
            self.ndmreset = false;
            for index in 0..self.harts.len() {
                self.reset_hart(index, haltreq);
            }
        }
    }

    fn halt_selected_hart(&mut self, cause: u64) {
        if let Some(hart) = self.selected_hart_mut() {
            if !hart.halted {
                hart.halted = true;
                let pc = hart.pc;
                hart.csrs.insert(CSR_DPC, pc);
                hart.set_cause(cause);
            }
        }
    }

    fn resume_selected_hart(&mut self) {
        let index = self.selected_hart as usize;
        let Some(hart) = self.harts.get(index) else {
            return;
        };
        if !hart.halted {
            return;
        }

        let step = hart.dcsr_step();
        let dpc = hart.csrs.get(&CSR_DPC).copied().unwrap_or(RESET_VECTOR);

        if step {
            let length = self.instruction_length(dpc);
            let hart = &mut self.harts[index];
            hart.pc = dpc + length;
            let pc = hart.pc;
            hart.csrs.insert(CSR_DPC, pc);
            hart.set_cause(4);
            hart.halted = true;
            hart.resume_ack = true;
        } else {
            let hart = &mut self.harts[index];
            hart.pc = dpc;
            hart.halted = false;
            hart.resume_ack = true;
        }
    }

    fn reset_hart(&mut self, index: usize, halt: bool) {
        let hart = &mut self.harts[index];
        hart.pc = RESET_VECTOR;
        hart.have_reset = true;
        hart.halted = halt;
        if halt {
            hart.csrs.insert(CSR_DPC, RESET_VECTOR);
            hart.set_cause(5);
        }
    }

    /// Length in bytes of the instruction at `address`, per the
    /// compressed-instruction encoding of its low bits.
    fn instruction_length(&self, address: u64) -> u64 {
        match self.memory.get(&address) {
            Some(low) if low & 0x3 != 0x3 => 2,
            Some(_) => 4,
            None => 4,
        }
    }

    fn execute_command(&mut self, command: u32) {
        // Writes to command while an error is latched are ignored.
        if self.cmderr != 0 {
            return;
        }

        let cmd_type = command >> 24;
        if cmd_type != 0 {
            self.cmderr = 2;
            return;
        }

        let transfer = command & (1 << 17) != 0;
        let write = command & (1 << 16) != 0;
        let postexec = command & (1 << 18) != 0;
        let aarsize = (command >> 20) & 0x7;
        let regno = command & 0xffff;

        let (halted, xlen64) = match self.harts.get(self.selected_hart as usize) {
            Some(hart) => (hart.halted, hart.xlen64),
            None => {
                self.cmderr = 4;
                return;
            }
        };
        if !halted {
            self.cmderr = 4;
            return;
        }

        if transfer {
            let supported = match regno {
                0x1020..=0x103f => {
                    if write {
                        self.fpr_write_attempts += 1;
                    } else {
                        self.fpr_read_attempts += 1;
                    }
                    self.abstract_fpr_supported
                }
                0..=0xfff => {
                    if write {
                        self.csr_write_attempts += 1;
                    } else {
                        self.csr_read_attempts += 1;
                    }
                    self.abstract_csr_supported
                }
                0x1000..=0x101f => true,
                _ => false,
            };
            if !supported {
                self.cmderr = 2;
                return;
            }

            let wide = match aarsize {
                2 => false,
                3 if xlen64 => true,
                _ => {
                    self.cmderr = 2;
                    return;
                }
            };

            if write {
                let mut value = self.data[0] as u64;
                if wide {
                    value |= (self.data[1] as u64) << 32;
                }
                self.write_hart_register(regno, value);
            } else {
                let value = self.read_hart_register(regno);
                self.data[0] = value as u32;
                if wide {
                    self.data[1] = (value >> 32) as u32;
                }
            }
        }

        if self.cmderr == 0 && postexec {
            self.run_progbuf();
        }
    }

    fn read_hart_register(&mut self, regno: u32) -> u64 {
        match regno {
            0x1000..=0x101f => {
                let hart = &self.harts[self.selected_hart as usize];
                hart.gprs[(regno - 0x1000) as usize]
            }
            0x1020..=0x103f => {
                let hart = &self.harts[self.selected_hart as usize];
                hart.fprs[(regno - 0x1020) as usize]
            }
            _ => self.read_csr(regno as u16),
        }
    }

    fn write_hart_register(&mut self, regno: u32, value: u64) {
        match regno {
            0x1000 => {}
            0x1001..=0x101f => {
                let hart = &mut self.harts[self.selected_hart as usize];
                hart.gprs[(regno - 0x1000) as usize] = value;
            }
            0x1020..=0x103f => {
                let hart = &mut self.harts[self.selected_hart as usize];
                hart.fprs[(regno - 0x1020) as usize] = value;
            }
            _ => self.write_csr(regno as u16, value),
        }
    }

    fn read_csr(&mut self, index: u16) -> u64 {
        let hart = &self.harts[self.selected_hart as usize];

        if index == CSR_TINFO {
            let tselect = hart.csrs.get(&CSR_TSELECT).copied().unwrap_or(0);
            return if tselect < self.trigger_count as u64 {
                // An address match trigger.
                0b100
            } else {
                // Trigger does not exist.
                1
            };
        }

        hart.csrs.get(&index).copied().unwrap_or(0)
    }

    fn write_csr(&mut self, index: u16, value: u64) {
        let hart = &mut self.harts[self.selected_hart as usize];
        hart.csrs.insert(index, value);
    }

    fn trigger_autoexec(&mut self) {
        // While an error is latched, triggers do not run.
        if self.cmderr != 0 {
            return;
        }

        self.autoexec_triggers += 1;

        if let Some(n) = self.abstract_busy_every {
            if self.autoexec_triggers % n == 0 {
                self.cmderr = 1;
                return;
            }
        }
        if let Some(n) = self.fail_autoexec_after {
            if self.autoexec_triggers == n {
                self.cmderr = 3;
                return;
            }
        }

        self.run_progbuf();
    }

    fn buffer_word(&self, index: usize) -> u32 {
        if index < self.progbuf_size {
            self.progbuf[index]
        } else {
            self.data[index - self.progbuf_size]
        }
    }

    fn buffer_word_set(&mut self, index: usize, value: u32) {
        if index < self.progbuf_size {
            self.progbuf[index] = value;
        } else {
            self.data[index - self.progbuf_size] = value;
        }
    }

    fn buffer_contains(&self, address: u64) -> bool {
        let words = (self.progbuf_size + self.datacount) as u64;
        address >= self.progbuf_addr && address < self.progbuf_addr + 4 * words
    }

    fn load(&self, address: u64, bytes: u64) -> Result<u64, ()> {
        if self.buffer_contains(address) {
            if bytes < 4 || address % 4 != 0 {
                return Err(());
            }
            let index = ((address - self.progbuf_addr) / 4) as usize;
            let mut value = self.buffer_word(index) as u64;
            if bytes == 8 {
                value |= (self.buffer_word(index + 1) as u64) << 32;
            }
            return Ok(value);
        }

        let mut value = 0u64;
        for byte in 0..bytes {
            let part = self.memory.get(&(address + byte)).copied().unwrap_or(0);
            value |= (part as u64) << (8 * byte);
        }
        Ok(value)
    }

    fn store(&mut self, address: u64, value: u64, bytes: u64) -> Result<(), ()> {
        if self.buffer_contains(address) {
            if bytes < 4 || address % 4 != 0 {
                return Err(());
            }
            let index = ((address - self.progbuf_addr) / 4) as usize;
            self.buffer_word_set(index, value as u32);
            if bytes == 8 {
                self.buffer_word_set(index + 1, (value >> 32) as u32);
            }
            return Ok(());
        }

        for byte in 0..bytes {
            self.memory.insert(address + byte, (value >> (8 * byte)) as u8);
        }
        Ok(())
    }

    fn run_progbuf(&mut self) {
        if self.step_progbuf().is_err() {
            self.cmderr = 3;
        }
    }

    fn step_progbuf(&mut self) -> Result<(), ()> {
        let hart_index = self.selected_hart as usize;
        if hart_index >= self.harts.len() || !self.harts[hart_index].halted {
            return Err(());
        }

        let xlen64 = self.harts[hart_index].xlen64;
        let total_words = self.progbuf_size + self.datacount;

        let mut pc_index = 0usize;
        for _ in 0..64 {
            if pc_index >= total_words {
                return Err(());
            }

            let insn = self.buffer_word(pc_index);
            let exec_pc = self.progbuf_addr + 4 * pc_index as u64;
            pc_index += 1;

            if insn == EBREAK {
                return Ok(());
            }

            let opcode = insn & 0x7f;
            let rd = ((insn >> 7) & 0x1f) as usize;
            let rs1 = ((insn >> 15) & 0x1f) as usize;
            let rs2 = ((insn >> 20) & 0x1f) as usize;
            let funct3 = (insn >> 12) & 0x7;
            let i_imm = ((insn as i32) >> 20) as i64;
            let s_imm = ((((insn >> 25) << 5) | ((insn >> 7) & 0x1f)) as i32) << 20 >> 20;

            let gpr = |h: &FakeHart, n: usize| if n == 0 { 0 } else { h.gprs[n] };

            match opcode {
                // Integer loads.
                0x03 => {
                    let bytes = 1u64 << funct3;
                    if bytes > 8 || (bytes == 8 && !xlen64) {
                        return Err(());
                    }
                    let base = gpr(&self.harts[hart_index], rs1);
                    let address = base.wrapping_add(i_imm as u64);
                    let raw = self.load(address, bytes)?;
                    let shift = 64 - 8 * bytes;
                    let value = (((raw << shift) as i64) >> shift) as u64;
                    if rd != 0 {
                        self.harts[hart_index].gprs[rd] = value;
                    }
                }
                // Integer stores.
                0x23 => {
                    let bytes = 1u64 << funct3;
                    if bytes > 8 || (bytes == 8 && !xlen64) {
                        return Err(());
                    }
                    let base = gpr(&self.harts[hart_index], rs1);
                    let value = gpr(&self.harts[hart_index], rs2);
                    let address = base.wrapping_add(s_imm as u64);
                    self.store(address, value, bytes)?;
                }
                // Floating point loads.
                0x07 => {
                    let bytes = 1u64 << funct3;
                    if !(bytes == 4 || (bytes == 8 && xlen64)) {
                        return Err(());
                    }
                    let base = gpr(&self.harts[hart_index], rs1);
                    let address = base.wrapping_add(i_imm as u64);
                    let value = self.load(address, bytes)?;
                    self.harts[hart_index].fprs[rd] = value;
                }
                // Floating point stores.
                0x27 => {
                    let bytes = 1u64 << funct3;
                    if !(bytes == 4 || (bytes == 8 && xlen64)) {
                        return Err(());
                    }
                    let base = gpr(&self.harts[hart_index], rs1);
                    let value = self.harts[hart_index].fprs[rs2];
                    let address = base.wrapping_add(s_imm as u64);
                    self.store(address, value, bytes)?;
                }
                // addi only.
                0x13 => {
                    if funct3 != 0 {
                        return Err(());
                    }
                    let value = gpr(&self.harts[hart_index], rs1).wrapping_add(i_imm as u64);
                    if rd != 0 {
                        self.harts[hart_index].gprs[rd] = value;
                    }
                }
                // auipc with a zero immediate.
                0x17 => {
                    let offset = (insn & 0xffff_f000) as u64;
                    if rd != 0 {
                        self.harts[hart_index].gprs[rd] = exec_pc.wrapping_add(offset);
                    }
                }
                // fence / fence.i
                0x0f => {}
                // csrrw / csrrs
                0x73 => {
                    let csr = (insn >> 20) as u16;
                    match funct3 {
                        1 => {
                            let old = self.read_csr(csr);
                            let new = gpr(&self.harts[hart_index], rs1);
                            self.write_csr(csr, new);
                            if rd != 0 {
                                self.harts[hart_index].gprs[rd] = old;
                            }
                        }
                        2 => {
                            let old = self.read_csr(csr);
                            if rs1 != 0 {
                                let set = gpr(&self.harts[hart_index], rs1);
                                self.write_csr(csr, old | set);
                            }
                            if rd != 0 {
                                self.harts[hart_index].gprs[rd] = old;
                            }
                        }
                        _ => return Err(()),
                    }
                }
                _ => return Err(()),
            }
        }

        // Runaway program.
        Err(())
    }
}

/// A [`JtagAccess`] implementation backed by [`DebugModuleModel`].
#[derive(Debug)]
pub struct FakeJtagProbe {
    pub dm: DebugModuleModel,

    ir: u32,
    queue: Vec<Queued>,
    abits: u32,
    idle_hint: u32,

    busy_injection: BusyInjection,
    sticky_busy: bool,
    dmi_scan_count: u64,
    pending_idle: u32,

    last_status: u8,
    last_data: u32,
}

impl FakeJtagProbe {
    fn new(hart_count: usize, xlen64: bool) -> Self {
        Self {
            dm: DebugModuleModel::new(hart_count, xlen64),
            ir: IR_IDCODE,
            queue: Vec::new(),
            abits: 7,
            idle_hint: 1,
            busy_injection: BusyInjection::None,
            sticky_busy: false,
            dmi_scan_count: 0,
            pending_idle: 0,
            last_status: 0,
            last_data: 0,
        }
    }

    /// A single-hart RV32 target.
    pub fn new_rv32() -> Self {
        Self::new(1, false)
    }

    /// A single-hart RV64 target.
    pub fn new_rv64() -> Self {
        Self::new(1, true)
    }

    /// A multi-hart RV32 target.
    pub fn new_rv32_multi(hart_count: usize) -> Self {
        Self::new(hart_count, false)
    }

    pub fn set_busy_injection(&mut self, injection: BusyInjection) {
        self.busy_injection = injection;
    }

    fn dtmcs_value(&self) -> u32 {
        // idle | abits | version 1
        (self.idle_hint << 12) | (self.abits << 4) | 1
    }

    fn bits(value: u128, bit_len: u32) -> ScanBits {
        let mut bits = BitVec::<u8, Lsb0>::from_slice(&value.to_le_bytes());
        bits.truncate(bit_len as usize);
        bits
    }

    fn process_dmi_scan(&mut self, data: &[u8], bit_len: u32) -> ScanBits {
        let mut raw = [0u8; 16];
        let take = data.len().min(16);
        raw[..take].copy_from_slice(&data[..take]);
        let value = u128::from_le_bytes(raw);

        let op = (value & 0x3) as u8;
        let payload = (value >> 2) as u32;
        let address = ((value >> 34) as u64 & ((1 << self.abits) - 1)) as u32;

        self.dmi_scan_count += 1;
        let idle = self.pending_idle;
        self.pending_idle = 0;

        // A scan that arrives while the previous operation is still in
        // flight captures BUSY and its own request is dropped. The result
        // of the in-flight operation stays latched for after a dmireset.
        let mut busy = self.sticky_busy;
        if let BusyInjection::EveryNth { n, required_idle } = self.busy_injection {
            if self.dmi_scan_count % n == 0 && idle < required_idle {
                busy = true;
            }
        }
        if busy {
            self.sticky_busy = true;
            return Self::bits(3, bit_len);
        }

        // The captured bits carry the result of the previous operation.
        let capture = Self::bits(
            (self.last_status as u128) | ((self.last_data as u128) << 2),
            bit_len,
        );

        match op {
            0 => {
                self.last_status = 0;
            }
            1 => {
                self.last_status = 0;
                self.last_data = self.dm.read_register(address);
            }
            2 => {
                self.dm.write_register(address, payload);
                self.last_status = 0;
                self.last_data = 0;
            }
            _ => {
                self.last_status = 2;
            }
        }

        capture
    }

    fn process_dtmcs_scan(&mut self, data: &[u8]) -> ScanBits {
        let mut raw = [0u8; 4];
        let take = data.len().min(4);
        raw[..take].copy_from_slice(&data[..take]);
        let value = u32::from_le_bytes(raw);

        let capture = Self::bits(self.dtmcs_value() as u128, 32);

        // dmireset clears the sticky BUSY; the latched result of the last
        // completed operation survives.
        if value & (1 << 16) != 0 {
            self.sticky_busy = false;
        }

        capture
    }
}

impl JtagAccess for FakeJtagProbe {
    fn queue_ir_scan(&mut self, ir: u32) -> Result<(), DebugProbeError> {
        self.queue.push(Queued::Ir(ir));
        Ok(())
    }

    fn queue_dr_scan(&mut self, data: &[u8], bit_len: u32) -> Result<(), DebugProbeError> {
        self.queue.push(Queued::Dr(data.to_vec(), bit_len));
        Ok(())
    }

    fn queue_runtest(&mut self, cycles: u32) -> Result<(), DebugProbeError> {
        self.queue.push(Queued::RunTest(cycles));
        Ok(())
    }

    fn flush(&mut self) -> Result<Vec<ScanBits>, DebugProbeError> {
        let queue = std::mem::take(&mut self.queue);
        let mut captures = Vec::new();

        for entry in queue {
            match entry {
                Queued::Ir(ir) => self.ir = ir,
                Queued::RunTest(cycles) => self.pending_idle += cycles,
                Queued::Dr(data, bit_len) => {
                    let capture = match self.ir {
                        IR_DTMCS => self.process_dtmcs_scan(&data),
                        IR_DMI => self.process_dmi_scan(&data, bit_len),
                        _ => Self::bits(0, bit_len),
                    };
                    captures.push(capture);
                }
            }
        }

        Ok(captures)
    }

    fn tap_reset(&mut self) -> Result<(), DebugProbeError> {
        self.ir = IR_IDCODE;
        self.queue.clear();
        Ok(())
    }

    fn target_reset_assert(&mut self) -> Result<(), DebugProbeError> {
        Ok(())
    }

    fn target_reset_deassert(&mut self) -> Result<(), DebugProbeError> {
        Ok(())
    }
}
