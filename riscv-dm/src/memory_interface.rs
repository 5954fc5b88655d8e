//! Word-stream memory access through the program buffer.
//!
//! A two-slot program (element + address) runs once per element; AUTOEXEC
//! on the data slot keeps it running while the host pulls or pushes words
//! with batched DMI accesses. Progress is measured solely through the
//! target-side address slot, which makes BUSY recovery lossless: a burst
//! that only partially ran is simply resumed from wherever the target
//! stopped.

use std::time::Instant;

use crate::assembly;
use crate::communication_interface::{
    AbstractCommandErrorKind, RiscvCommunicationInterface, RiscvError, Xlen,
};
use crate::dtm::jtag_dtm::{DmiBatch, DmiOperationStatus};
use crate::probe::JtagAccess;
use crate::Abstractcs;

/// DMI operations per JTAG flush while streaming.
const DMI_BATCH_OPS: usize = 32;

/// Scratch registers the streaming program runs on.
const S0: u8 = 8;
const S1: u8 = 9;

fn size_to_width(size: u32) -> Result<u8, RiscvError> {
    match size {
        1 => Ok(0),
        2 => Ok(1),
        4 => Ok(2),
        other => Err(RiscvError::UnsupportedAccessSize(other)),
    }
}

fn write_to_buf(buffer: &mut [u8], value: u32, size: usize) {
    buffer[..size].copy_from_slice(&value.to_le_bytes()[..size]);
}

fn read_from_buf(buffer: &[u8], size: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes[..size].copy_from_slice(&buffer[..size]);
    u32::from_le_bytes(bytes)
}

impl<P: JtagAccess> RiscvCommunicationInterface<P> {
    /// Read `count` elements of `size` bytes starting at `address`.
    ///
    /// The scratch registers `s0`/`s1` are saved on entry and restored on
    /// every exit path, including failures.
    pub fn read_memory(
        &mut self,
        address: u64,
        size: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        size_to_width(size)?;

        let expected = count as usize * size as usize;
        if buffer.len() != expected {
            return Err(RiscvError::InvalidBufferLength {
                expected,
                actual: buffer.len(),
            });
        }
        if count == 0 {
            return Ok(());
        }

        tracing::debug!("reading {} words of {} bytes from {:#010x}", count, size, address);

        let saved = self.save_scratch_registers()?;
        let result = self.stream_read(address, size, count, buffer);
        let restored = self.restore_scratch_registers(saved);

        result.and(restored)
    }

    /// Write `count` elements of `size` bytes starting at `address`.
    ///
    /// The scratch registers `s0`/`s1` are saved on entry and restored on
    /// every exit path, including failures.
    pub fn write_memory(
        &mut self,
        address: u64,
        size: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        size_to_width(size)?;

        let expected = count as usize * size as usize;
        if buffer.len() != expected {
            return Err(RiscvError::InvalidBufferLength {
                expected,
                actual: buffer.len(),
            });
        }
        if count == 0 {
            return Ok(());
        }

        tracing::debug!("writing {} words of {} bytes to {:#010x}", count, size, address);

        let saved = self.save_scratch_registers()?;
        let result = self.stream_write(address, size, count, buffer);
        let restored = self.restore_scratch_registers(saved);

        result.and(restored)
    }

    /// Read the XLEN-wide address slot of the streaming program.
    fn read_stream_address(&mut self, d_addr: usize) -> Result<u64, RiscvError> {
        let xlen = self.xlen()?;

        let mut value = self.read_debug_buffer(d_addr)? as u64;
        if xlen == Xlen::Rv64 {
            value |= (self.read_debug_buffer(d_addr + 1)? as u64) << 32;
        }

        Ok(value)
    }

    /// Wait until the abstract engine goes idle, then report `cmderr`.
    fn wait_abstract_idle(&mut self) -> Result<AbstractCommandErrorKind, RiscvError> {
        let start = Instant::now();

        let mut abstractcs: Abstractcs = self.read_dm_register()?;
        while abstractcs.busy() {
            if start.elapsed() > self.config().command_timeout {
                return Err(RiscvError::Timeout);
            }
            abstractcs = self.read_dm_register()?;
        }

        Ok(AbstractCommandErrorKind::parse(abstractcs.cmderr() as u8))
    }

    fn stream_read(
        &mut self,
        address: u64,
        size: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        let width = size_to_width(size)?;
        let xlen = self.xlen()?;

        // One word of data and the address it came from live in two data
        // slots. Every execution loads one element, stages it, and
        // advances the address.
        let mut program = self.new_program()?;
        let r_data = program.alloc_word()?;
        let r_addr = program.alloc_xlen()?;

        program.lx(S0, r_addr);
        program.insert(assembly::load(width, S1, S0, 0));
        program.sw(S1, r_data);
        program.addi(S0, S0, size as i16);
        program.sx(S0, r_addr);
        program.fence();

        if xlen == Xlen::Rv64 {
            program.write_ram(r_addr + 4, (address >> 32) as u32);
        }
        program.write_ram(r_addr, address as u32);

        // The first element goes through the regular execution path.
        program.execute(self)?;

        let d_data = program.word_index(r_data);
        let d_addr = program.word_index(r_addr);
        let data_reg = self.debug_buffer_register(r_data)?;

        // From here on every pull of the data slot re-runs the program.
        self.set_autoexec(d_data, true)?;

        let result = self.stream_read_loop(address, size, count, buffer, data_reg, d_addr);
        let disarm = self.set_autoexec(d_data, false);

        let cur_addr = result?;
        disarm?;

        // The final AUTOEXEC already queued the out-of-range element; it
        // is discarded. This plain read retrieves the last committed word.
        let value = self.read_debug_buffer(d_data)?;
        let last = cur_addr - size as u64;
        write_to_buf(&mut buffer[(last - address) as usize..], value, size as usize);

        Ok(())
    }

    fn stream_read_loop(
        &mut self,
        address: u64,
        size: u32,
        count: u32,
        buffer: &mut [u8],
        data_reg: u32,
        d_addr: usize,
    ) -> Result<u64, RiscvError> {
        let size = size as u64;
        let fin_addr = address + count as u64 * size;

        let mut cur_addr = self.read_stream_address(d_addr)?;
        tracing::debug!("reading until final address {:#010x}", fin_addr);

        while cur_addr < fin_addr {
            if cur_addr < address {
                return Err(RiscvError::MemoryStreamDesynchronized(cur_addr));
            }

            tracing::debug!("creating burst to read from {:#010x} up to {:#010x}", cur_addr, fin_addr);

            // Each pull both collects a word and triggers the next
            // element on the target.
            let mut batch = DmiBatch::with_capacity(DMI_BATCH_OPS);
            let mut addr = cur_addr;
            while addr < fin_addr && !batch.is_full() {
                batch.add_read(data_reg);
                addr += size;
            }

            self.dtm().run_batch(&mut batch)?;

            match self.wait_abstract_idle()? {
                AbstractCommandErrorKind::None => {
                    tracing::debug!("successful (partial?) memory read");
                }
                AbstractCommandErrorKind::Busy => {
                    tracing::debug!("memory read resulted in busy response");
                    self.dtm().increase_ac_busy_delay();
                    self.clear_abstract_error()?;
                }
                other => {
                    tracing::error!("error when reading memory: {:?}", other);
                    self.clear_abstract_error()?;
                    return Err(RiscvError::AbstractCommand(other));
                }
            }

            // The target-side address says how far the burst actually
            // got. BUSY cuts off a suffix of the batch, never the middle,
            // so exactly that many leading responses are valid.
            let next_addr = self.read_stream_address(d_addr)?;
            if next_addr < address || next_addr > fin_addr {
                return Err(RiscvError::MemoryStreamDesynchronized(next_addr));
            }

            let words = ((next_addr - cur_addr) / size) as usize;
            let mut committed = 0u64;
            for slot in 0..words {
                let (status, value) = batch
                    .get_read(slot)
                    .ok_or(RiscvError::MemoryStreamDesynchronized(cur_addr))?;
                if status != DmiOperationStatus::Ok {
                    break;
                }

                // The first pull of a burst sees the word staged by the
                // previous execution, one element behind the address.
                let waddr = cur_addr - size + slot as u64 * size;
                write_to_buf(&mut buffer[(waddr - address) as usize..], value, size as usize);
                committed += 1;
            }

            if committed == words as u64 {
                cur_addr = next_addr;
            } else {
                // A BUSY capture swallowed the response of an element that
                // did execute on the target. Rewind the address slot to
                // the first uncommitted element and restage it with a
                // plain execution, then pick the stream back up.
                let resume_addr = cur_addr + committed * size - size;
                tracing::debug!(
                    "burst lost a response, restaging element at {:#010x}",
                    resume_addr
                );

                self.write_debug_buffer(d_addr, resume_addr as u32)?;
                if self.xlen()? == Xlen::Rv64 {
                    self.write_debug_buffer(d_addr + 1, (resume_addr >> 32) as u32)?;
                }
                self.execute_program_buffer()?;

                cur_addr = self.read_stream_address(d_addr)?;
            }
        }

        Ok(cur_addr)
    }

    fn stream_write(
        &mut self,
        address: u64,
        size: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        let width = size_to_width(size)?;
        let xlen = self.xlen()?;

        let mut program = self.new_program()?;
        let r_data = program.alloc_word()?;
        let r_addr = program.alloc_xlen()?;

        program.lx(S0, r_addr);
        program.lw(S1, r_data);
        program.insert(assembly::store(width, S1, S0, 0));
        program.addi(S0, S0, size as i16);
        program.sx(S0, r_addr);
        program.fence();

        if xlen == Xlen::Rv64 {
            program.write_ram(r_addr + 4, (address >> 32) as u32);
        }
        program.write_ram(r_addr, address as u32);
        program.write_ram(r_data, read_from_buf(buffer, size as usize));

        // The first element goes through the regular execution path.
        program.execute(self)?;

        let d_data = program.word_index(r_data);
        let d_addr = program.word_index(r_addr);
        let data_reg = self.debug_buffer_register(r_data)?;

        // From here on every push into the data slot re-runs the program.
        self.set_autoexec(d_data, true)?;

        let result = self.stream_write_loop(address, size, count, buffer, data_reg, d_addr);
        let disarm = self.set_autoexec(d_data, false);

        result.and(disarm)
    }

    fn stream_write_loop(
        &mut self,
        address: u64,
        size: u32,
        count: u32,
        buffer: &[u8],
        data_reg: u32,
        d_addr: usize,
    ) -> Result<(), RiscvError> {
        let element_size = size as usize;
        let fin_addr = address + count as u64 * size as u64;

        tracing::debug!("writing until final address {:#010x}", fin_addr);

        loop {
            // The loop condition doubles as the progress probe: a burst
            // that went through busy responses simply resumes from the
            // address the target reports.
            let cur_addr = self.read_stream_address(d_addr)?;
            if cur_addr >= fin_addr {
                break;
            }
            if cur_addr <= address {
                return Err(RiscvError::MemoryStreamDesynchronized(cur_addr));
            }

            tracing::debug!("transferring burst starting at address {:#010x}", cur_addr);

            let start = ((cur_addr - address) / size as u64) as usize;
            let mut batch = DmiBatch::with_capacity(DMI_BATCH_OPS);
            for element in start..count as usize {
                if batch.is_full() {
                    break;
                }
                let value = read_from_buf(&buffer[element * element_size..], element_size);
                batch.add_write(data_reg, value);
            }

            self.dtm().run_batch(&mut batch)?;

            match self.wait_abstract_idle()? {
                AbstractCommandErrorKind::None => {
                    tracing::debug!("successful (partial?) memory write");
                }
                AbstractCommandErrorKind::Busy => {
                    tracing::debug!("memory write resulted in busy response");
                    self.dtm().increase_ac_busy_delay();
                    self.clear_abstract_error()?;
                }
                other => {
                    tracing::error!("error when writing memory: {:?}", other);
                    self.clear_abstract_error()?;
                    return Err(RiscvError::AbstractCommand(other));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::communication_interface::{RiscvCommunicationInterface, RiscvError};
    use crate::probe::fake_probe::{BusyInjection, FakeJtagProbe};
    use crate::registers::RegisterId;
    use crate::RiscvConfig;

    fn examined(probe: FakeJtagProbe) -> RiscvCommunicationInterface<FakeJtagProbe> {
        let mut interface = RiscvCommunicationInterface::new(probe, RiscvConfig::default());
        interface.examine().unwrap();
        interface.halt_current_hart().unwrap();
        interface
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(7)).collect()
    }

    #[test]
    fn write_then_read_words_round_trips() {
        let mut interface = examined(FakeJtagProbe::new_rv32());

        let data: Vec<u8> = vec![
            0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
            0xff, 0x00,
        ];

        interface.write_memory(0x8000_0000, 4, 4, &data).unwrap();

        let mut read_back = vec![0u8; 16];
        interface
            .read_memory(0x8000_0000, 4, 4, &mut read_back)
            .unwrap();

        assert_eq!(read_back, data);
    }

    #[test]
    fn memory_round_trips_for_every_size() {
        for size in [1u32, 2, 4] {
            for probe in [FakeJtagProbe::new_rv32(), FakeJtagProbe::new_rv64()] {
                let mut interface = examined(probe);

                let count = 64u32;
                let data = pattern((count * size) as usize);

                interface.write_memory(0x8000_1000, size, count, &data).unwrap();

                let mut read_back = vec![0u8; data.len()];
                interface
                    .read_memory(0x8000_1000, size, count, &mut read_back)
                    .unwrap();

                assert_eq!(read_back, data, "size {size}");
            }
        }
    }

    #[test]
    fn stream_survives_dmi_busy_responses() {
        let mut probe = FakeJtagProbe::new_rv32();
        probe.set_busy_injection(BusyInjection::EveryNth {
            n: 3,
            required_idle: 6,
        });

        let mut interface = examined(probe);

        let count = 1024u32;
        let data = pattern((count * 4) as usize);
        interface.write_memory(0x8000_4000, 4, count, &data).unwrap();

        let mut read_back = vec![0u8; data.len()];
        interface
            .read_memory(0x8000_4000, 4, count, &mut read_back)
            .unwrap();

        assert_eq!(read_back, data);

        // The transport adapted to the slow target. Together with the
        // DTM's own idle hint the per-scan delay covers the required idle.
        assert!(interface.dtm().dmi_busy_delay() >= 5);
    }

    #[test]
    fn stream_survives_dropped_autoexec_triggers() {
        let mut probe = FakeJtagProbe::new_rv32();
        probe.dm.abstract_busy_every = Some(7);

        let mut interface = examined(probe);

        let count = 256u32;
        let data = pattern((count * 4) as usize);
        interface.write_memory(0x8000_2000, 4, count, &data).unwrap();

        let mut read_back = vec![0u8; data.len()];
        interface
            .read_memory(0x8000_2000, 4, count, &mut read_back)
            .unwrap();

        assert_eq!(read_back, data);
        assert!(interface.dtm().ac_busy_delay() > 0);
    }

    #[test]
    fn scratch_registers_survive_memory_access() {
        let mut interface = examined(FakeJtagProbe::new_rv32());

        interface.set_register(RegisterId::S0, 0x1111_2222).unwrap();
        interface.set_register(RegisterId::S1, 0x3333_4444).unwrap();

        let data = pattern(64);
        interface.write_memory(0x8000_3000, 4, 16, &data).unwrap();
        let mut read_back = vec![0u8; 64];
        interface.read_memory(0x8000_3000, 4, 16, &mut read_back).unwrap();

        assert_eq!(interface.get_register(RegisterId::S0).unwrap(), 0x1111_2222);
        assert_eq!(interface.get_register(RegisterId::S1).unwrap(), 0x3333_4444);
    }

    #[test]
    fn scratch_registers_survive_a_failing_stream() {
        let mut probe = FakeJtagProbe::new_rv32();
        // Fault the 20th autoexec trigger with an exception.
        probe.dm.fail_autoexec_after = Some(20);

        let mut interface = examined(probe);

        interface.set_register(RegisterId::S0, 0xaaaa_0001).unwrap();
        interface.set_register(RegisterId::S1, 0xbbbb_0002).unwrap();

        let mut sink = vec![0u8; 4 * 256];
        let result = interface.read_memory(0x8000_5000, 4, 256, &mut sink);
        assert!(result.is_err());

        assert_eq!(interface.get_register(RegisterId::S0).unwrap(), 0xaaaa_0001);
        assert_eq!(interface.get_register(RegisterId::S1).unwrap(), 0xbbbb_0002);
    }

    #[test]
    fn rejects_unsupported_sizes_and_short_buffers() {
        let mut interface = examined(FakeJtagProbe::new_rv32());

        let mut buffer = [0u8; 8];
        assert!(matches!(
            interface.read_memory(0x8000_0000, 8, 1, &mut buffer),
            Err(RiscvError::UnsupportedAccessSize(8))
        ));
        assert!(matches!(
            interface.read_memory(0x8000_0000, 4, 4, &mut buffer),
            Err(RiscvError::InvalidBufferLength {
                expected: 16,
                actual: 8
            })
        ));
    }
}
