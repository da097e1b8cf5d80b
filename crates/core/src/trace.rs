//! Trace intake.
//!
//! One [`TraceReader`] per CPU turns a pre-recorded binary trace into a
//! stream of decoded architectural instructions. Two fixed-size record
//! layouts exist:
//! 1. **Standard:** two source and two destination registers.
//! 2. **Cloudsuite:** four of each (SPARC-style), plus an address-space id
//!    pair.
//!
//! Branch targets are not stored in the trace; a taken branch's target is the
//! ip of the record that follows it, so the reader keeps one record of
//! lookahead. Traces repeat: at end of file the reader rewinds.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};

use crate::error::TraceError;
use crate::instr::{Instruction, MemOperand};

/// Register and memory operand counts of the standard record layout.
const STD_REGS: usize = 2;
const STD_MEMS: usize = 2;
/// Operand counts of the cloudsuite record layout.
const CS_REGS: usize = 4;
const CS_MEMS: usize = 4;

/// Record layout selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceFormat {
    /// Two register and two memory operands per direction.
    Standard,
    /// Four register and four memory operands per direction, with asid.
    Cloudsuite,
}

impl TraceFormat {
    /// On-disk record size in bytes.
    pub fn record_len(self) -> usize {
        match self {
            // ip + flags + 2x2 regs + 2x2 mem addresses
            TraceFormat::Standard => 8 + 2 + 2 * STD_REGS + 8 * 2 * STD_MEMS,
            // ip + flags + 2x4 regs + 2x4 mem addresses + asid pair
            TraceFormat::Cloudsuite => 8 + 2 + 2 * CS_REGS + 8 * 2 * CS_MEMS + 2,
        }
    }
}

/// Streaming reader for one CPU's trace file.
pub struct TraceReader {
    path: String,
    file: BufReader<File>,
    format: TraceFormat,
    cpu: usize,
    /// Lookahead record, needed to resolve taken-branch targets.
    pending: Option<Instruction>,
}

impl TraceReader {
    /// Opens `path` for the given CPU.
    pub fn open(path: &str, cpu: usize, format: TraceFormat) -> Result<Self, TraceError> {
        let file = File::open(path).map_err(|source| TraceError::Io {
            path: path.to_string(),
            source,
        })?;
        Ok(Self {
            path: path.to_string(),
            file: BufReader::new(file),
            format,
            cpu,
            pending: None,
        })
    }

    /// Returns the next architectural instruction.
    ///
    /// The returned instruction's `branch_target` has already been resolved
    /// against its successor. Rewinds transparently at end of file.
    pub fn next_instruction(&mut self) -> Result<Instruction, TraceError> {
        loop {
            let next = self.read_record()?;
            match self.pending.take() {
                Some(mut prev) => {
                    if prev.is_branch && prev.branch_taken {
                        prev.branch_target = next.ip;
                    }
                    self.pending = Some(next);
                    return Ok(prev);
                }
                None => self.pending = Some(next),
            }
        }
    }

    /// Reads one raw record, rewinding at EOF.
    fn read_record(&mut self) -> Result<Instruction, TraceError> {
        let len = self.format.record_len();
        let mut buf = vec![0u8; len];
        match self.file.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.rewind()?;
                self.file.read_exact(&mut buf).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        TraceError::Empty(self.path.clone())
                    } else {
                        TraceError::Io {
                            path: self.path.clone(),
                            source: e,
                        }
                    }
                })?;
            }
            Err(source) => {
                return Err(TraceError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        }
        Ok(self.decode(&buf))
    }

    fn rewind(&mut self) -> Result<(), TraceError> {
        self.file
            .seek(SeekFrom::Start(0))
            .map(|_| ())
            .map_err(|source| TraceError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Decodes one little-endian record into an [`Instruction`].
    ///
    /// Zero register numbers and zero memory addresses mean "operand slot
    /// unused" and are dropped.
    fn decode(&self, buf: &[u8]) -> Instruction {
        let (nregs, nmems) = match self.format {
            TraceFormat::Standard => (STD_REGS, STD_MEMS),
            TraceFormat::Cloudsuite => (CS_REGS, CS_MEMS),
        };

        let mut at = 0usize;
        let mut u64_at = |buf: &[u8], at: &mut usize| {
            let v = u64::from_le_bytes(buf[*at..*at + 8].try_into().unwrap());
            *at += 8;
            v
        };

        let ip = u64_at(buf, &mut at);
        let is_branch = buf[at] != 0;
        let branch_taken = buf[at + 1] != 0;
        at += 2;

        let mut destination_registers = Vec::new();
        for _ in 0..nregs {
            if buf[at] != 0 {
                destination_registers.push(buf[at]);
            }
            at += 1;
        }
        let mut source_registers = Vec::new();
        for _ in 0..nregs {
            if buf[at] != 0 {
                source_registers.push(buf[at]);
            }
            at += 1;
        }

        let mut destination_memory = Vec::new();
        for _ in 0..nmems {
            let addr = u64_at(buf, &mut at);
            if addr != 0 {
                destination_memory.push(MemOperand::new(addr));
            }
        }
        let mut source_memory = Vec::new();
        for _ in 0..nmems {
            let addr = u64_at(buf, &mut at);
            if addr != 0 {
                source_memory.push(MemOperand::new(addr));
            }
        }

        let asid = match self.format {
            TraceFormat::Standard => [self.cpu as u8, self.cpu as u8],
            TraceFormat::Cloudsuite => [buf[at], buf[at + 1]],
        };

        Instruction {
            ip,
            is_branch,
            branch_taken,
            source_registers,
            destination_registers,
            source_memory,
            destination_memory,
            asid,
            ..Instruction::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Serializes a standard-format record.
    fn std_record(
        ip: u64,
        is_branch: bool,
        taken: bool,
        dregs: [u8; 2],
        sregs: [u8; 2],
        dmem: [u64; 2],
        smem: [u64; 2],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&ip.to_le_bytes());
        out.push(is_branch as u8);
        out.push(taken as u8);
        out.extend_from_slice(&dregs);
        out.extend_from_slice(&sregs);
        for a in dmem {
            out.extend_from_slice(&a.to_le_bytes());
        }
        for a in smem {
            out.extend_from_slice(&a.to_le_bytes());
        }
        out
    }

    fn write_trace(records: &[Vec<u8>]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        for r in records {
            f.write_all(r).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_reads_operands_and_drops_zero_slots() {
        let f = write_trace(&[
            std_record(0x1000, false, false, [3, 0], [4, 5], [0xabc0, 0], [0, 0]),
            std_record(0x1004, false, false, [0, 0], [0, 0], [0, 0], [0, 0]),
        ]);
        let mut rd =
            TraceReader::open(f.path().to_str().unwrap(), 0, TraceFormat::Standard).unwrap();
        let i = rd.next_instruction().unwrap();
        assert_eq!(i.ip, 0x1000);
        assert_eq!(i.destination_registers, vec![3]);
        assert_eq!(i.source_registers, vec![4, 5]);
        assert_eq!(i.destination_memory.len(), 1);
        assert_eq!(i.destination_memory[0].address, 0xabc0);
        assert!(i.source_memory.is_empty());
    }

    #[test]
    fn test_taken_branch_target_is_next_ip() {
        let f = write_trace(&[
            std_record(0x1000, true, true, [26, 0], [0, 0], [0, 0], [0, 0]),
            std_record(0x2000, false, false, [0, 0], [0, 0], [0, 0], [0, 0]),
            std_record(0x2004, false, false, [0, 0], [0, 0], [0, 0], [0, 0]),
        ]);
        let mut rd =
            TraceReader::open(f.path().to_str().unwrap(), 0, TraceFormat::Standard).unwrap();
        let b = rd.next_instruction().unwrap();
        assert!(b.is_branch && b.branch_taken);
        assert_eq!(b.branch_target, 0x2000);
        let n = rd.next_instruction().unwrap();
        assert_eq!(n.ip, 0x2000);
        assert_eq!(n.branch_target, 0);
    }

    #[test]
    fn test_rewinds_at_eof() {
        let f = write_trace(&[
            std_record(0x10, false, false, [0, 0], [0, 0], [0, 0], [0, 0]),
            std_record(0x14, false, false, [0, 0], [0, 0], [0, 0], [0, 0]),
        ]);
        let mut rd =
            TraceReader::open(f.path().to_str().unwrap(), 0, TraceFormat::Standard).unwrap();
        let ips: Vec<u64> = (0..5).map(|_| rd.next_instruction().unwrap().ip).collect();
        assert_eq!(ips, vec![0x10, 0x14, 0x10, 0x14, 0x10]);
    }

    #[test]
    fn test_empty_trace_is_an_error() {
        let f = write_trace(&[]);
        let mut rd =
            TraceReader::open(f.path().to_str().unwrap(), 0, TraceFormat::Standard).unwrap();
        assert!(matches!(
            rd.next_instruction(),
            Err(TraceError::Empty(_))
        ));
    }

    #[test]
    fn test_cloudsuite_record_len() {
        assert_eq!(TraceFormat::Standard.record_len(), 46);
        assert_eq!(TraceFormat::Cloudsuite.record_len(), 84);
    }
}
