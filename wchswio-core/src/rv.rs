// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! RV32EC Program Buffer Programs
//!
//! The abstract command engine does all memory and CSR access by uploading
//! a short RISC-V program into the 8-word program buffer and executing it
//! with POSTEXEC.  This module contains a minimal instruction encoder and
//! the fixed set of programs the driver uses.
//!
//! Programs exchange data with the host through DATA0/DATA1, which QingKe V2
//! maps into the hart's address space at [`DATA0_MMIO`]/[`DATA1_MMIO`], and
//! through argument registers the host sets with abstract register
//! transfers before running them.

use core::fmt;
use static_assertions::const_assert;

use crate::ch32::{FlashCtlr, FlashStatr};
use crate::dm::{DATA0_MMIO, DATA1_MMIO, PROGBUF_WORDS};

/// Number of 16-bit parcels in a program (fills the program buffer)
pub const PROGRAM_HALFWORDS: usize = PROGBUF_WORDS * 2;

/// General purpose register index
///
/// Indices 0-31 address GPRs.  [`Gpr::DPC`] (16) is reserved as a sentinel
/// for the DPC CSR: QingKe V2 is RV32E, so x16 does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gpr(pub u8);

impl Gpr {
    pub const ZERO: Gpr = Gpr(0);
    pub const RA: Gpr = Gpr(1);
    pub const SP: Gpr = Gpr(2);
    pub const T0: Gpr = Gpr(5);
    pub const S0: Gpr = Gpr(8);
    pub const S1: Gpr = Gpr(9);
    pub const A0: Gpr = Gpr(10);
    pub const A1: Gpr = Gpr(11);
    pub const A2: Gpr = Gpr(12);
    pub const A3: Gpr = Gpr(13);
    pub const A4: Gpr = Gpr(14);
    pub const A5: Gpr = Gpr(15);

    /// Sentinel index for the DPC CSR
    pub const DPC: Gpr = Gpr(16);

    /// Number of GPR slots tracked by the register cache
    pub const COUNT: usize = 32;

    pub const fn index(&self) -> u8 {
        self.0
    }

    pub const fn mask(&self) -> u32 {
        1 << (self.0 & 0x1F)
    }

    pub const fn is_dpc(&self) -> bool {
        self.0 == Self::DPC.0
    }

    pub const fn is_valid(&self) -> bool {
        (self.0 as usize) < Self::COUNT
    }

    /// Register number in the 3-bit compressed register field (x8-x15)
    const fn creg(&self) -> u16 {
        (self.0 as u16).wrapping_sub(8) & 0x7
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dpc() {
            write!(f, "dpc")
        } else {
            write!(f, "x{}", self.0)
        }
    }
}

/// Minimal RV32I/RV32C instruction encoder
///
/// Only the instructions the fixed programs need are provided.  Register
/// arguments to compressed instructions must be in x8-x15.
pub mod asm {
    use super::Gpr;

    const OP_LUI: u32 = 0b011_0111;
    const OP_IMM: u32 = 0b001_0011;
    const OP_LOAD: u32 = 0b000_0011;
    const OP_STORE: u32 = 0b010_0011;
    const OP_SYSTEM: u32 = 0b111_0011;

    const fn r(reg: Gpr) -> u32 {
        reg.0 as u32 & 0x1F
    }

    pub const fn lui(rd: Gpr, imm: u32) -> u32 {
        (imm & 0xFFFF_F000) | (r(rd) << 7) | OP_LUI
    }

    pub const fn addi(rd: Gpr, rs1: Gpr, imm: i32) -> u32 {
        (((imm as u32) & 0xFFF) << 20) | (r(rs1) << 15) | (r(rd) << 7) | OP_IMM
    }

    pub const fn andi(rd: Gpr, rs1: Gpr, imm: i32) -> u32 {
        (((imm as u32) & 0xFFF) << 20) | (r(rs1) << 15) | (0b111 << 12) | (r(rd) << 7) | OP_IMM
    }

    pub const fn lw(rd: Gpr, rs1: Gpr, offset: i32) -> u32 {
        (((offset as u32) & 0xFFF) << 20) | (r(rs1) << 15) | (0b010 << 12) | (r(rd) << 7) | OP_LOAD
    }

    pub const fn sw(rs2: Gpr, rs1: Gpr, offset: i32) -> u32 {
        let imm = offset as u32;
        (((imm >> 5) & 0x7F) << 25)
            | (r(rs2) << 20)
            | (r(rs1) << 15)
            | (0b010 << 12)
            | ((imm & 0x1F) << 7)
            | OP_STORE
    }

    /// `csrrs rd, csr, x0`
    pub const fn csrr(rd: Gpr, csr: u16) -> u32 {
        ((csr as u32) << 20) | (0b010 << 12) | (r(rd) << 7) | OP_SYSTEM
    }

    /// `c.lw rd', offset(rs1')`
    pub const fn c_lw(rd: Gpr, rs1: Gpr, offset: u16) -> u16 {
        (0b010 << 13)
            | (((offset >> 3) & 0x7) << 10)
            | (rs1.creg() << 7)
            | (((offset >> 2) & 1) << 6)
            | (((offset >> 6) & 1) << 5)
            | (rd.creg() << 2)
    }

    /// `c.sw rs2', offset(rs1')`
    pub const fn c_sw(rs2: Gpr, rs1: Gpr, offset: u16) -> u16 {
        (0b110 << 13)
            | (((offset >> 3) & 0x7) << 10)
            | (rs1.creg() << 7)
            | (((offset >> 2) & 1) << 6)
            | (((offset >> 6) & 1) << 5)
            | (rs2.creg() << 2)
    }

    /// `c.addi rd, imm` (imm in -32..=31)
    pub const fn c_addi(rd: Gpr, imm: i16) -> u16 {
        let imm = imm as u16;
        (((imm >> 5) & 1) << 12) | ((rd.0 as u16 & 0x1F) << 7) | ((imm & 0x1F) << 2) | 0b01
    }

    /// `c.andi rd', imm` (imm in -32..=31)
    pub const fn c_andi(rd: Gpr, imm: i16) -> u16 {
        let imm = imm as u16;
        (0b100 << 13)
            | (((imm >> 5) & 1) << 12)
            | (0b10 << 10)
            | (rd.creg() << 7)
            | ((imm & 0x1F) << 2)
            | 0b01
    }

    const fn cb_offset(offset: i16) -> u16 {
        let o = offset as u16;
        (((o >> 8) & 1) << 12)
            | (((o >> 3) & 0x3) << 10)
            | (((o >> 6) & 0x3) << 5)
            | (((o >> 1) & 0x3) << 3)
            | (((o >> 5) & 1) << 2)
    }

    /// `c.bnez rs1', offset` (offset relative to this instruction)
    pub const fn c_bnez(rs1: Gpr, offset: i16) -> u16 {
        (0b111 << 13) | cb_offset(offset) | (rs1.creg() << 7) | 0b01
    }

    /// `c.beqz rs1', offset`
    pub const fn c_beqz(rs1: Gpr, offset: i16) -> u16 {
        (0b110 << 13) | cb_offset(offset) | (rs1.creg() << 7) | 0b01
    }

    const fn cj_offset(offset: i16) -> u16 {
        let o = offset as u16;
        (((o >> 11) & 1) << 12)
            | (((o >> 4) & 1) << 11)
            | (((o >> 8) & 0x3) << 9)
            | (((o >> 10) & 1) << 8)
            | (((o >> 6) & 1) << 7)
            | (((o >> 7) & 1) << 6)
            | (((o >> 1) & 0x7) << 3)
            | (((o >> 5) & 1) << 2)
    }

    /// `c.jal offset` (RV32 only, links to ra)
    pub const fn c_jal(offset: i16) -> u16 {
        (0b001 << 13) | cj_offset(offset) | 0b01
    }

    /// `c.j offset`
    pub const fn c_j(offset: i16) -> u16 {
        (0b101 << 13) | cj_offset(offset) | 0b01
    }

    /// `c.jr rs1`
    pub const fn c_jr(rs1: Gpr) -> u16 {
        (0b100 << 13) | ((rs1.0 as u16 & 0x1F) << 7) | 0b10
    }

    /// `c.mv rd, rs2`
    pub const fn c_mv(rd: Gpr, rs2: Gpr) -> u16 {
        (0b100 << 13) | ((rd.0 as u16 & 0x1F) << 7) | ((rs2.0 as u16 & 0x1F) << 2) | 0b10
    }

    pub const C_EBREAK: u16 = 0x9002;
}

/// Assembles 16- and 32-bit instructions into a fixed size program image,
/// padding the tail with `c.ebreak`.
struct Assembler {
    code: [u16; PROGRAM_HALFWORDS],
    len: usize,
}

impl Assembler {
    const fn new() -> Self {
        Self {
            code: [asm::C_EBREAK; PROGRAM_HALFWORDS],
            len: 0,
        }
    }

    const fn c(mut self, inst: u16) -> Self {
        assert!(self.len < PROGRAM_HALFWORDS, "program too long");
        self.code[self.len] = inst;
        self.len += 1;
        self
    }

    const fn w(self, inst: u32) -> Self {
        self.c(inst as u16).c((inst >> 16) as u16)
    }

    const fn finish(self) -> [u16; PROGRAM_HALFWORDS] {
        self.code
    }
}

/// Immutable program descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    /// Name, used in logs
    pub name: &'static str,

    /// Registers the program may overwrite (including the argument
    /// registers the host loads before running it)
    pub clobber: u32,

    /// If set, every execution first transfers DATA0 into this register
    /// (TRANSFER|WRITE alongside POSTEXEC)
    pub data0_arg: Option<Gpr>,

    /// Instruction parcels, little-endian order
    pub code: [u16; PROGRAM_HALFWORDS],
}

impl Program {
    /// The program buffer word at `index`
    pub const fn word(&self, index: usize) -> u32 {
        self.code[index * 2] as u32 | ((self.code[index * 2 + 1] as u32) << 16)
    }

    /// All program buffer words
    pub fn words(&self) -> [u32; PROGBUF_WORDS] {
        let mut words = [0u32; PROGBUF_WORDS];
        for (ii, word) in words.iter_mut().enumerate() {
            *word = self.word(ii);
        }
        words
    }

    pub const fn clobbers(&self, reg: Gpr) -> bool {
        self.clobber & reg.mask() != 0
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (clobber 0x{:08X})", self.name, self.clobber)
    }
}

const fn mask(regs: &[Gpr]) -> u32 {
    let mut mask = 0;
    let mut ii = 0;
    while ii < regs.len() {
        mask |= regs[ii].mask();
        ii += 1;
    }
    mask
}

const DATA0_LUI: u32 = DATA0_MMIO & 0xFFFF_F000;
const DATA0_LO: i32 = (DATA0_MMIO & 0xFFF) as i32;
const DATA1_OFFSET: u16 = (DATA1_MMIO - DATA0_MMIO) as u16;

// lui/addi pair needs no sign correction.
const_assert!(DATA0_LO < 0x800);

/// Read the word at the address in DATA1 into DATA0.
pub const GET_U32: Program = Program {
    name: "get_u32",
    clobber: mask(&[Gpr::A0, Gpr::S0]),
    data0_arg: None,
    code: Assembler::new()
        .w(asm::lui(Gpr::A0, DATA0_LUI))
        .w(asm::addi(Gpr::A0, Gpr::A0, DATA0_LO))
        .c(asm::c_lw(Gpr::S0, Gpr::A0, DATA1_OFFSET))
        .c(asm::c_lw(Gpr::S0, Gpr::S0, 0))
        .c(asm::c_sw(Gpr::S0, Gpr::A0, 0))
        .c(asm::C_EBREAK)
        .finish(),
};

/// Write DATA0 to the address in DATA1.
///
/// Shares its first two words with [`GET_U32`] so switching between them
/// only uploads the words that differ.
pub const SET_U32: Program = Program {
    name: "set_u32",
    clobber: mask(&[Gpr::A0, Gpr::S0, Gpr::S1]),
    data0_arg: None,
    code: Assembler::new()
        .w(asm::lui(Gpr::A0, DATA0_LUI))
        .w(asm::addi(Gpr::A0, Gpr::A0, DATA0_LO))
        .c(asm::c_lw(Gpr::S0, Gpr::A0, DATA1_OFFSET))
        .c(asm::c_lw(Gpr::S1, Gpr::A0, 0))
        .c(asm::c_sw(Gpr::S1, Gpr::S0, 0))
        .c(asm::C_EBREAK)
        .finish(),
};

/// Read the word at s0 into DATA0 and advance s0 by 4.
///
/// The host sets s0 before the first run, then streams DATA0 with
/// ABSTRACTAUTO re-running the program on each read.
pub const GET_BLOCK_ALIGNED: Program = Program {
    name: "get_block_aligned",
    clobber: mask(&[Gpr::A0, Gpr::S0, Gpr::S1]),
    data0_arg: None,
    code: Assembler::new()
        .w(asm::lui(Gpr::A0, DATA0_LUI))
        .w(asm::addi(Gpr::A0, Gpr::A0, DATA0_LO))
        .c(asm::c_lw(Gpr::S1, Gpr::S0, 0))
        .c(asm::c_sw(Gpr::S1, Gpr::A0, 0))
        .c(asm::c_addi(Gpr::S0, 4))
        .c(asm::C_EBREAK)
        .finish(),
};

/// CSR number of misa
pub const CSR_MISA: u16 = 0x301;

/// Read misa into DATA0.
pub const GET_MACHINE_ISA: Program = Program {
    name: "get_machine_isa",
    clobber: mask(&[Gpr::A0, Gpr::S0]),
    data0_arg: None,
    code: Assembler::new()
        .w(asm::lui(Gpr::A0, DATA0_LUI))
        .w(asm::addi(Gpr::A0, Gpr::A0, DATA0_LO))
        .w(asm::csrr(Gpr::S0, CSR_MISA))
        .c(asm::c_sw(Gpr::S0, Gpr::A0, 0))
        .c(asm::C_EBREAK)
        .finish(),
};

// Offset from STATR to CTLR, used as a compressed store offset
const CTLR_FROM_STATR: u16 = (FlashCtlr::ADDRESS - FlashStatr::ADDRESS) as u16;

/// Trigger a flash command and wait for it to complete.
///
/// Arguments:
/// - a2: STATR address
/// - a3: CTLR operation bits
/// - a4: CTLR operation bits | STRT
pub const PROGRAM_FLASH_COMMAND: Program = Program {
    name: "program_flash_command",
    clobber: mask(&[Gpr::S1, Gpr::A2, Gpr::A3, Gpr::A4]),
    data0_arg: None,
    code: Assembler::new()
        .c(asm::c_sw(Gpr::A3, Gpr::A2, CTLR_FROM_STATR)) // 0
        .c(asm::c_lw(Gpr::S1, Gpr::A2, 0)) // 2
        .c(asm::c_andi(Gpr::S1, FlashStatr::BUSY as i16)) // 4
        .c(asm::c_bnez(Gpr::S1, -4)) // 6
        .c(asm::c_sw(Gpr::A4, Gpr::A2, CTLR_FROM_STATR)) // 8
        .c(asm::c_lw(Gpr::S1, Gpr::A2, 0)) // 10
        .c(asm::c_andi(Gpr::S1, FlashStatr::BUSY as i16)) // 12
        .c(asm::c_bnez(Gpr::S1, -4)) // 14
        .c(asm::C_EBREAK) // 16
        .finish(),
};

/// Stage one word into the flash page buffer, committing the page when the
/// destination pointer crosses a page boundary.
///
/// Arguments:
/// - s0: the word, transferred from DATA0 by the command itself
/// - a1: destination pointer, advanced by 4
/// - a2: STATR address
/// - a3: FTPG | BUFLOAD
/// - a4: FTPG | STRT
/// - a5: FTPG | BUFRST
pub const WRITE_FLASH: Program = Program {
    name: "write_flash",
    clobber: mask(&[
        Gpr::RA,
        Gpr::S0,
        Gpr::S1,
        Gpr::A1,
        Gpr::A2,
        Gpr::A3,
        Gpr::A4,
        Gpr::A5,
    ]),
    data0_arg: Some(Gpr::S0),
    code: Assembler::new()
        .c(asm::c_sw(Gpr::S0, Gpr::A1, 0)) // 0: stage
        .c(asm::c_addi(Gpr::A1, 4)) // 2
        .c(asm::c_sw(Gpr::A3, Gpr::A2, CTLR_FROM_STATR)) // 4: BUFLOAD
        .c(asm::c_jal(18)) // 6: -> wait
        .w(asm::andi(Gpr::S0, Gpr::A1, FLASH_PAGE_MASK)) // 8
        .c(asm::c_bnez(Gpr::S0, 10)) // 12: -> done
        .c(asm::c_sw(Gpr::A4, Gpr::A2, CTLR_FROM_STATR)) // 14: STRT
        .c(asm::c_jal(8)) // 16: -> wait
        .c(asm::c_sw(Gpr::A5, Gpr::A2, CTLR_FROM_STATR)) // 18: BUFRST
        .c(asm::c_jal(4)) // 20: -> wait
        .c(asm::C_EBREAK) // 22: done
        .c(asm::c_lw(Gpr::S1, Gpr::A2, 0)) // 24: wait
        .c(asm::c_andi(Gpr::S1, FlashStatr::BUSY as i16)) // 26
        .c(asm::c_bnez(Gpr::S1, -4)) // 28
        .c(asm::c_jr(Gpr::RA)) // 30
        .finish(),
};

const FLASH_PAGE_MASK: i32 = crate::ch32::FLASH_PAGE_SIZE as i32 - 1;
