// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Simulated SWIO target, for tests.
//!
//! [`SimPin`] stands in for the GPIO.  It measures the low phases the
//! protocol drives, decodes them into frames, and answers reads bit by bit.
//! Decoded frames are applied to a [`SimTarget`]: a QingKe V2 debug module
//! model with an RV32EC interpreter for the program buffer, a CH32V flash
//! controller and an ESIG block.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use wchswio_core::ch32::{
    CH32_FLASH_BASE, CH32_RAM_BASE, Esig, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE, FlashActlr,
    FlashAddr, FlashCtlr, FlashKeyr, FlashMkeyr, FlashStatr,
};
use wchswio_core::command::{AccessRegister, CSR_DCSR, CSR_DPC, GPR_BASE};
use wchswio_core::dm::{
    Abstractauto, Abstractcs, DATA0_MMIO, DATA1_MMIO, Dmcontrol, Dmstatus, PROGBUF_WORDS,
    PROGBUF0_ADDRESS,
};
use wchswio_core::rv::CSR_MISA;

use crate::protocol::{ResetPin, SwioPin, Timing, calculate_parity};

pub const FLASH_SIZE: usize = 16 * 1024;
pub const RAM_SIZE: usize = 2 * 1024;
pub const DEFAULT_CPBR: u32 = 0x0001_0403;
pub const DEFAULT_FLASH_KB: u16 = 0x0080;
pub const DEFAULT_UID: [u32; 3] = [0xCDAB_1234, 0x5678_9ABC, 0xFFFF_0001];
pub const DEFAULT_MISA: u32 = 0x4080_0014;

const ERASED: u8 = 0xFF;
const MAX_STEPS: usize = 100_000;
const ZERO_POLLS: u32 = 3;

const CMDERR_NOT_SUPPORTED: u8 = 2;
const CMDERR_EXCEPTION: u8 = 3;
const CMDERR_HALT_RESUME: u8 = 4;

/// One-shot faults injected by [`SimPin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Invert the parity bit of the next read response
    FlipParity,

    /// Hold the line low for the whole of the next read response
    StuckLow,
}

#[derive(Debug)]
struct Hart {
    x: [u32; 16],
    dpc: u32,
    dcsr: u32,
}

impl Hart {
    fn new() -> Self {
        Self {
            x: [0; 16],
            dpc: CH32_FLASH_BASE,
            dcsr: 0x4000_0003,
        }
    }
}

#[derive(Debug)]
struct FlashController {
    ctlr: u32,
    statr: u32,
    addr: u32,
    actlr: u32,
    key_stage: bool,
    mkey_stage: bool,
    page_buf: [u32; (FLASH_PAGE_SIZE / 4) as usize],
    staged: Option<(u32, u32)>,
    last_loaded: Option<u32>,
}

impl FlashController {
    fn new() -> Self {
        Self {
            ctlr: FlashCtlr::LOCK | FlashCtlr::FLOCK,
            statr: 0,
            addr: 0,
            actlr: 0,
            key_stage: false,
            mkey_stage: false,
            page_buf: [u32::MAX; (FLASH_PAGE_SIZE / 4) as usize],
            staged: None,
            last_loaded: None,
        }
    }
}

/// Misbehaviours of a slow or faulty chip.  These survive NRST.
#[derive(Debug, Default, Clone, Copy)]
struct Hooks {
    // ABSTRACTCS reads still to report BUSY
    busy_reads: u32,
    // DMSTATUS never reports havereset
    hide_havereset: bool,
    // haltreq on a running hart is ignored
    ignore_haltreq: bool,
    // Hart stores to this word fault
    failing_store: Option<u32>,
}

#[derive(Debug)]
struct State {
    // Debug module
    dmactive: bool,
    haltreq: bool,
    hartreset: bool,
    halted: bool,
    havereset: bool,
    resumeack: bool,
    data: [u32; 2],
    progbuf: [u32; PROGBUF_WORDS],
    cmderr: u8,
    last_command: u32,
    abstractauto: u32,
    cpbr: u32,
    cfgr: Vec<(u8, u32)>,

    hart: Hart,
    misa: u32,

    flash: Vec<u8>,
    ram: Vec<u8>,
    flash_kb: u16,
    uid: [u32; 3],
    fctl: FlashController,
    protected: Option<(u32, u32)>,
    hooks: Hooks,

    // Instrumentation
    progbuf_writes: usize,
    commands: usize,
    nrst_pulses: usize,
    dmcontrol_log: Vec<u32>,
}

impl State {
    fn new() -> Self {
        Self {
            dmactive: false,
            haltreq: false,
            hartreset: false,
            halted: false,
            havereset: true,
            resumeack: false,
            data: [0; 2],
            progbuf: [0; PROGBUF_WORDS],
            cmderr: 0,
            last_command: 0,
            abstractauto: 0,
            cpbr: DEFAULT_CPBR,
            cfgr: Vec::new(),
            hart: Hart::new(),
            misa: DEFAULT_MISA,
            flash: vec![ERASED; FLASH_SIZE],
            ram: vec![0; RAM_SIZE],
            flash_kb: DEFAULT_FLASH_KB,
            uid: DEFAULT_UID,
            fctl: FlashController::new(),
            protected: None,
            hooks: Hooks::default(),
            progbuf_writes: 0,
            commands: 0,
            nrst_pulses: 0,
            dmcontrol_log: Vec::new(),
        }
    }

    fn read(&mut self, addr: u8) -> u32 {
        match addr {
            0x04 => {
                let value = self.data[0];
                if self.abstractauto & Abstractauto::AUTOEXECDATA0 != 0 {
                    self.execute(self.last_command);
                }
                value
            }
            0x05 => self.data[1],
            0x10 => self.dmcontrol(),
            0x11 => self.dmstatus(),
            0x12 => 0,
            0x16 => {
                let busy = if self.hooks.busy_reads > 0 {
                    self.hooks.busy_reads -= 1;
                    Abstractcs::BUSY
                } else {
                    0
                };
                (PROGBUF_WORDS as u32) << Abstractcs::PROGBUFSIZE_SHIFT
                    | busy
                    | (self.cmderr as u32) << Abstractcs::CMDERR_SHIFT
                    | 2
            }
            0x18 => self.abstractauto,
            a if (PROGBUF0_ADDRESS..PROGBUF0_ADDRESS + PROGBUF_WORDS as u8).contains(&a) => {
                self.progbuf[(a - PROGBUF0_ADDRESS) as usize]
            }
            0x7C => self.cpbr,
            _ => 0,
        }
    }

    fn write(&mut self, addr: u8, value: u32) {
        match addr {
            0x04 => {
                self.data[0] = value;
                if self.abstractauto & Abstractauto::AUTOEXECDATA0 != 0 {
                    self.execute(self.last_command);
                }
            }
            0x05 => self.data[1] = value,
            0x10 => self.write_dmcontrol(value),
            0x16 => {
                let clear = ((value >> Abstractcs::CMDERR_SHIFT) & Abstractcs::CMDERR_MASK) as u8;
                self.cmderr &= !clear;
            }
            0x17 => {
                self.last_command = value;
                self.execute(value);
            }
            0x18 => self.abstractauto = value & Abstractauto::AUTOEXECDATA0,
            a if (PROGBUF0_ADDRESS..PROGBUF0_ADDRESS + PROGBUF_WORDS as u8).contains(&a) => {
                self.progbuf[(a - PROGBUF0_ADDRESS) as usize] = value;
                self.progbuf_writes += 1;
            }
            0x7D | 0x7E => {
                if value >> 16 == 0x5AA5 {
                    self.cfgr.push((addr, value));
                }
            }
            _ => (),
        }
    }

    fn dmcontrol(&self) -> u32 {
        let mut value = 0;
        if self.haltreq {
            value |= Dmcontrol::HALTREQ;
        }
        if self.hartreset {
            value |= Dmcontrol::HARTRESET;
        }
        if self.dmactive {
            value |= Dmcontrol::DMACTIVE;
        }
        value
    }

    fn write_dmcontrol(&mut self, value: u32) {
        self.dmcontrol_log.push(value);
        let dm = Dmcontrol(value);

        if !dm.dmactive() {
            self.dmactive = false;
            self.abstractauto = 0;
            self.cmderr = 0;
            return;
        }
        self.dmactive = true;

        if dm.ackhavereset() {
            self.havereset = false;
        }

        if dm.hartreset() {
            self.hartreset = true;
            self.havereset = true;
            self.halted = false;
        } else if self.hartreset {
            // Leaving reset
            self.hartreset = false;
            self.hart = Hart::new();
            self.halted = dm.haltreq();
        } else if dm.haltreq() && (self.halted || !self.hooks.ignore_haltreq) {
            self.halted = true;
        } else if dm.resumereq() && self.halted {
            self.halted = false;
            self.resumeack = true;
        }
        self.haltreq = dm.haltreq();
    }

    fn dmstatus(&self) -> u32 {
        let mut value = 2 | Dmstatus::AUTHENTICATED;
        if self.halted {
            value |= Dmstatus::ALLHALTED | Dmstatus::ANYHALTED;
        } else if !self.hartreset {
            value |= Dmstatus::ALLRUNNING | Dmstatus::ANYRUNNING;
        }
        if self.havereset && !self.hooks.hide_havereset {
            value |= Dmstatus::ALLHAVERESET | Dmstatus::ANYHAVERESET;
        }
        if self.resumeack {
            value |= Dmstatus::ALLRESUMEACK | Dmstatus::ANYRESUMEACK;
        }
        value
    }

    fn nrst(&mut self) {
        let cpbr = self.cpbr;
        let flash = core::mem::take(&mut self.flash);
        let (flash_kb, uid, protected, misa) = (self.flash_kb, self.uid, self.protected, self.misa);
        let hooks = self.hooks;
        let (writes, commands, pulses) = (self.progbuf_writes, self.commands, self.nrst_pulses);
        let log = core::mem::take(&mut self.dmcontrol_log);

        *self = State::new();
        self.cpbr = cpbr;
        self.flash = flash;
        self.flash_kb = flash_kb;
        self.uid = uid;
        self.protected = protected;
        self.hooks = hooks;
        self.misa = misa;
        self.progbuf_writes = writes;
        self.commands = commands;
        self.nrst_pulses = pulses + 1;
        self.dmcontrol_log = log;
    }

    fn execute(&mut self, raw: u32) {
        self.commands += 1;
        if self.cmderr != 0 {
            return;
        }

        let cmd = AccessRegister::from_raw(raw);
        if cmd.cmdtype() != 0 {
            self.cmderr = CMDERR_NOT_SUPPORTED;
            return;
        }
        if !self.halted {
            self.cmderr = CMDERR_HALT_RESUME;
            return;
        }

        if cmd.is_transfer() {
            if cmd.aarsize() != 2 {
                self.cmderr = CMDERR_NOT_SUPPORTED;
                return;
            }
            if let Err(err) = self.transfer(cmd.regno(), cmd.write()) {
                self.cmderr = err;
                return;
            }
        }

        if cmd.is_postexec() && self.run_progbuf().is_err() {
            self.cmderr = CMDERR_EXCEPTION;
        }
    }

    fn transfer(&mut self, regno: u16, write: bool) -> Result<(), u8> {
        let data = self.data[0];
        match regno {
            r if (GPR_BASE..GPR_BASE + 16).contains(&r) => {
                let index = (r - GPR_BASE) as usize;
                if write {
                    if index != 0 {
                        self.hart.x[index] = data;
                    }
                } else {
                    self.data[0] = self.hart.x[index];
                }
            }
            CSR_DPC => {
                if write {
                    self.hart.dpc = data;
                } else {
                    self.data[0] = self.hart.dpc;
                }
            }
            CSR_DCSR => {
                if write {
                    self.hart.dcsr = data;
                } else {
                    self.data[0] = self.hart.dcsr;
                }
            }
            r if r == CSR_MISA && !write => self.data[0] = self.misa,
            _ => return Err(CMDERR_EXCEPTION),
        }
        Ok(())
    }

    // Memory as seen from the hart

    fn load(&mut self, addr: u32) -> Result<u32, ()> {
        if addr % 4 != 0 {
            return Err(());
        }
        if let Some(offset) = region(addr, CH32_FLASH_BASE, FLASH_SIZE) {
            return Ok(le32(&self.flash[offset..offset + 4]));
        }
        if let Some(offset) = region(addr, CH32_RAM_BASE, RAM_SIZE) {
            return Ok(le32(&self.ram[offset..offset + 4]));
        }
        match addr {
            DATA0_MMIO => Ok(self.data[0]),
            DATA1_MMIO => Ok(self.data[1]),
            Esig::FLACAP_ADDRESS => Ok(0xFFFF_0000 | self.flash_kb as u32),
            Esig::UNIID1_ADDRESS => Ok(self.uid[0]),
            Esig::UNIID2_ADDRESS => Ok(self.uid[1]),
            Esig::UNIID3_ADDRESS => Ok(self.uid[2]),
            FlashActlr::ADDRESS => Ok(self.fctl.actlr),
            FlashStatr::ADDRESS => Ok(self.fctl.statr),
            FlashCtlr::ADDRESS => Ok(self.fctl.ctlr),
            FlashAddr::ADDRESS => Ok(self.fctl.addr),
            a if (0x4002_2000..0x4002_2030).contains(&a) => Ok(0),
            _ => Err(()),
        }
    }

    fn store(&mut self, addr: u32, value: u32) -> Result<(), ()> {
        if addr % 4 != 0 || self.hooks.failing_store == Some(addr) {
            return Err(());
        }
        if region(addr, CH32_FLASH_BASE, FLASH_SIZE).is_some() {
            let fast = FlashCtlr::FTPG;
            if self.fctl.ctlr & fast != 0 && self.fctl.ctlr & FlashCtlr::FLOCK == 0 {
                self.fctl.staged = Some((addr, value));
            }
            return Ok(());
        }
        if let Some(offset) = region(addr, CH32_RAM_BASE, RAM_SIZE) {
            self.ram[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            return Ok(());
        }
        match addr {
            DATA0_MMIO => self.data[0] = value,
            DATA1_MMIO => self.data[1] = value,
            FlashActlr::ADDRESS => self.fctl.actlr = value,
            FlashKeyr::ADDRESS => {
                if value == FlashKeyr::KEY1 {
                    self.fctl.key_stage = true;
                } else {
                    if self.fctl.key_stage && value == FlashKeyr::KEY2 {
                        self.fctl.ctlr &= !FlashCtlr::LOCK;
                    }
                    self.fctl.key_stage = false;
                }
            }
            FlashMkeyr::ADDRESS => {
                if value == FlashKeyr::KEY1 {
                    self.fctl.mkey_stage = true;
                } else {
                    if self.fctl.mkey_stage
                        && value == FlashKeyr::KEY2
                        && self.fctl.ctlr & FlashCtlr::LOCK == 0
                    {
                        self.fctl.ctlr &= !FlashCtlr::FLOCK;
                    }
                    self.fctl.mkey_stage = false;
                }
            }
            FlashStatr::ADDRESS => {
                self.fctl.statr &= !(value & (FlashStatr::EOP | FlashStatr::WRPRTERR));
            }
            FlashCtlr::ADDRESS => self.write_ctlr(value),
            FlashAddr::ADDRESS => self.fctl.addr = value,
            a if (0x4002_2000..0x4002_2030).contains(&a) => (),
            _ => return Err(()),
        }
        Ok(())
    }

    fn write_ctlr(&mut self, value: u32) {
        let locks = FlashCtlr::LOCK | FlashCtlr::FLOCK;
        let old = self.fctl.ctlr;
        if old & FlashCtlr::LOCK != 0 {
            self.fctl.ctlr = old | (value & locks);
            return;
        }
        let ctlr = (value & !locks) | (old & locks) | (value & locks);
        let fast_ok = ctlr & FlashCtlr::FLOCK == 0;
        self.fctl.ctlr = ctlr;

        if ctlr & FlashCtlr::FTPG != 0 && fast_ok {
            if ctlr & FlashCtlr::BUFRST != 0 {
                self.fctl.page_buf = [u32::MAX; (FLASH_PAGE_SIZE / 4) as usize];
                self.fctl.staged = None;
                self.fctl.ctlr &= !FlashCtlr::BUFRST;
                self.fctl.statr |= FlashStatr::EOP;
            }
            if ctlr & FlashCtlr::BUFLOAD != 0 {
                if let Some((addr, word)) = self.fctl.staged.take() {
                    let index = ((addr % FLASH_PAGE_SIZE) / 4) as usize;
                    self.fctl.page_buf[index] = word;
                    self.fctl.last_loaded = Some(addr);
                }
                self.fctl.ctlr &= !FlashCtlr::BUFLOAD;
                self.fctl.statr |= FlashStatr::EOP;
            }
        }

        if ctlr & FlashCtlr::STRT == 0 {
            return;
        }
        self.fctl.ctlr &= !FlashCtlr::STRT;

        if ctlr & FlashCtlr::MER != 0 {
            if self.protected.is_some() {
                self.fctl.statr |= FlashStatr::WRPRTERR;
            } else {
                self.flash.fill(ERASED);
            }
        } else if ctlr & FlashCtlr::PER != 0 {
            self.erase(self.fctl.addr, FLASH_SECTOR_SIZE);
        } else if ctlr & FlashCtlr::FTER != 0 && fast_ok {
            self.erase(self.fctl.addr, FLASH_PAGE_SIZE);
        } else if ctlr & FlashCtlr::FTPG != 0 && fast_ok {
            let addr = self.fctl.last_loaded.take().unwrap_or(self.fctl.addr);
            let base = addr & !(FLASH_PAGE_SIZE - 1);
            if self.is_protected(base) {
                self.fctl.statr |= FlashStatr::WRPRTERR;
            } else if let Some(offset) = region(base, CH32_FLASH_BASE, FLASH_SIZE) {
                for (ii, word) in self.fctl.page_buf.iter().enumerate() {
                    let cell = &mut self.flash[offset + ii * 4..offset + ii * 4 + 4];
                    let programmed = le32(cell) & word;
                    cell.copy_from_slice(&programmed.to_le_bytes());
                }
            }
        }
        self.fctl.statr |= FlashStatr::EOP;
    }

    fn is_protected(&self, addr: u32) -> bool {
        self.protected
            .is_some_and(|(start, end)| addr >= start && addr < end)
    }

    fn erase(&mut self, addr: u32, size: u32) {
        let base = addr & !(size - 1);
        if self.is_protected(base) {
            self.fctl.statr |= FlashStatr::WRPRTERR;
            return;
        }
        if let Some(offset) = region(base, CH32_FLASH_BASE, FLASH_SIZE) {
            let end = (offset + size as usize).min(FLASH_SIZE);
            self.flash[offset..end].fill(ERASED);
        }
    }

    // RV32EC interpreter

    fn run_progbuf(&mut self) -> Result<(), ()> {
        let mut pc: u32 = 0;
        for _ in 0..MAX_STEPS {
            if pc as usize >= PROGBUF_WORDS * 4 {
                // Falling off the end is an implicit ebreak
                return Ok(());
            }
            match self.step(pc)? {
                Some(next) => pc = next,
                None => return Ok(()),
            }
        }
        Err(())
    }

    fn fetch16(&self, pc: u32) -> Result<u16, ()> {
        if pc % 2 != 0 || pc as usize >= PROGBUF_WORDS * 4 {
            return Err(());
        }
        let word = self.progbuf[(pc / 4) as usize];
        Ok(if pc % 4 == 0 { word as u16 } else { (word >> 16) as u16 })
    }

    fn x(&self, reg: u32) -> Result<u32, ()> {
        self.hart.x.get(reg as usize).copied().ok_or(())
    }

    fn set_x(&mut self, reg: u32, value: u32) -> Result<(), ()> {
        if reg >= 16 {
            return Err(());
        }
        if reg != 0 {
            self.hart.x[reg as usize] = value;
        }
        Ok(())
    }

    // Returns the next pc, or None on ebreak
    fn step(&mut self, pc: u32) -> Result<Option<u32>, ()> {
        let half = self.fetch16(pc)?;
        if half & 0x3 != 0x3 {
            return self.step_compressed(pc, half);
        }
        let inst = half as u32 | (self.fetch16(pc + 2)? as u32) << 16;
        self.step_full(pc, inst)
    }

    fn step_full(&mut self, pc: u32, inst: u32) -> Result<Option<u32>, ()> {
        let opcode = inst & 0x7F;
        let rd = (inst >> 7) & 0x1F;
        let funct3 = (inst >> 12) & 0x7;
        let rs1 = (inst >> 15) & 0x1F;
        let rs2 = (inst >> 20) & 0x1F;
        let funct7 = inst >> 25;
        let imm_i = (inst as i32) >> 20;
        let next = pc.wrapping_add(4);

        match opcode {
            0x37 => self.set_x(rd, inst & 0xFFFF_F000)?,
            0x17 => self.set_x(rd, pc.wrapping_add(inst & 0xFFFF_F000))?,
            0x13 => {
                let a = self.x(rs1)?;
                let shamt = rs2;
                let value = match funct3 {
                    0 => a.wrapping_add(imm_i as u32),
                    1 => a << shamt,
                    2 => ((a as i32) < imm_i) as u32,
                    3 => (a < imm_i as u32) as u32,
                    4 => a ^ imm_i as u32,
                    5 if funct7 == 0x20 => ((a as i32) >> shamt) as u32,
                    5 => a >> shamt,
                    6 => a | imm_i as u32,
                    _ => a & imm_i as u32,
                };
                self.set_x(rd, value)?;
            }
            0x33 => {
                let (a, b) = (self.x(rs1)?, self.x(rs2)?);
                let value = match (funct3, funct7) {
                    (0, 0x20) => a.wrapping_sub(b),
                    (0, _) => a.wrapping_add(b),
                    (1, _) => a << (b & 0x1F),
                    (2, _) => ((a as i32) < (b as i32)) as u32,
                    (3, _) => (a < b) as u32,
                    (4, _) => a ^ b,
                    (5, 0x20) => ((a as i32) >> (b & 0x1F)) as u32,
                    (5, _) => a >> (b & 0x1F),
                    (6, _) => a | b,
                    _ => a & b,
                };
                self.set_x(rd, value)?;
            }
            0x03 => {
                let addr = self.x(rs1)?.wrapping_add(imm_i as u32);
                let value = match funct3 {
                    2 => self.load(addr)?,
                    0 | 4 | 1 | 5 => {
                        let word = self.load(addr & !3)? >> ((addr & 3) * 8);
                        match funct3 {
                            0 => word as u8 as i8 as i32 as u32,
                            4 => word & 0xFF,
                            1 => word as u16 as i16 as i32 as u32,
                            _ => word & 0xFFFF,
                        }
                    }
                    _ => return Err(()),
                };
                self.set_x(rd, value)?;
            }
            0x23 => {
                let imm = ((inst as i32) >> 25) << 5 | ((inst >> 7) & 0x1F) as i32;
                let addr = self.x(rs1)?.wrapping_add(imm as u32);
                let value = self.x(rs2)?;
                match funct3 {
                    2 => self.store(addr, value)?,
                    0 | 1 => {
                        let mask = if funct3 == 0 { 0xFF } else { 0xFFFF };
                        let shift = (addr & 3) * 8;
                        let word = self.load(addr & !3)?;
                        let word = (word & !(mask << shift)) | ((value & mask) << shift);
                        self.store(addr & !3, word)?;
                    }
                    _ => return Err(()),
                }
            }
            0x63 => {
                let (a, b) = (self.x(rs1)?, self.x(rs2)?);
                let imm = ((inst >> 31) & 1) << 12
                    | ((inst >> 7) & 1) << 11
                    | ((inst >> 25) & 0x3F) << 5
                    | ((inst >> 8) & 0xF) << 1;
                let taken = match funct3 {
                    0 => a == b,
                    1 => a != b,
                    4 => (a as i32) < (b as i32),
                    5 => (a as i32) >= (b as i32),
                    6 => a < b,
                    7 => a >= b,
                    _ => return Err(()),
                };
                if taken {
                    return Ok(Some(pc.wrapping_add(sext(imm, 13) as u32)));
                }
            }
            0x6F => {
                let imm = ((inst >> 31) & 1) << 20
                    | ((inst >> 12) & 0xFF) << 12
                    | ((inst >> 20) & 1) << 11
                    | ((inst >> 21) & 0x3FF) << 1;
                self.set_x(rd, next)?;
                return Ok(Some(pc.wrapping_add(sext(imm, 21) as u32)));
            }
            0x67 => {
                let target = self.x(rs1)?.wrapping_add(imm_i as u32) & !1;
                self.set_x(rd, next)?;
                return Ok(Some(target));
            }
            0x73 => {
                if inst == 0x0010_0073 {
                    return Ok(None);
                }
                let csr = (inst >> 20) as u16;
                let old = match csr {
                    CSR_MISA => self.misa,
                    CSR_DPC => self.hart.dpc,
                    CSR_DCSR => self.hart.dcsr,
                    _ => return Err(()),
                };
                let src = if funct3 & 0x4 != 0 { rs1 } else { self.x(rs1)? };
                let new = match funct3 & 0x3 {
                    1 => src,
                    2 => old | src,
                    3 => old & !src,
                    _ => return Err(()),
                };
                let writes = funct3 & 0x3 == 1 || rs1 != 0;
                if writes {
                    match csr {
                        CSR_DPC => self.hart.dpc = new,
                        CSR_DCSR => self.hart.dcsr = new,
                        _ => return Err(()),
                    }
                }
                self.set_x(rd, old)?;
            }
            _ => return Err(()),
        }
        Ok(Some(next))
    }

    fn step_compressed(&mut self, pc: u32, h: u16) -> Result<Option<u32>, ()> {
        let h = h as u32;
        let funct3 = h >> 13;
        let next = pc.wrapping_add(2);
        let rd_full = (h >> 7) & 0x1F;
        let rs2_full = (h >> 2) & 0x1F;
        let rd_c = 8 + ((h >> 7) & 0x7);
        let rs2_c = 8 + ((h >> 2) & 0x7);
        let imm6 = sext(((h >> 12) & 1) << 5 | (h >> 2) & 0x1F, 6);

        match (h & 0x3, funct3) {
            (0, 2) | (0, 6) => {
                let offset = ((h >> 10) & 0x7) << 3 | ((h >> 6) & 1) << 2 | ((h >> 5) & 1) << 6;
                let addr = self.x(rd_c)?.wrapping_add(offset);
                if funct3 == 2 {
                    let value = self.load(addr)?;
                    self.set_x(rs2_c, value)?;
                } else {
                    let value = self.x(rs2_c)?;
                    self.store(addr, value)?;
                }
            }
            (1, 0) => {
                let value = self.x(rd_full)?.wrapping_add(imm6 as u32);
                self.set_x(rd_full, value)?;
            }
            (1, 1) | (1, 5) => {
                let offset = ((h >> 12) & 1) << 11
                    | ((h >> 11) & 1) << 4
                    | ((h >> 9) & 0x3) << 8
                    | ((h >> 8) & 1) << 10
                    | ((h >> 7) & 1) << 6
                    | ((h >> 6) & 1) << 7
                    | ((h >> 3) & 0x7) << 1
                    | ((h >> 2) & 1) << 5;
                if funct3 == 1 {
                    self.set_x(1, next)?;
                }
                return Ok(Some(pc.wrapping_add(sext(offset, 12) as u32)));
            }
            (1, 2) => self.set_x(rd_full, imm6 as u32)?,
            (1, 3) => {
                if rd_full == 2 {
                    let imm = ((h >> 12) & 1) << 9
                        | ((h >> 6) & 1) << 4
                        | ((h >> 5) & 1) << 6
                        | ((h >> 3) & 0x3) << 7
                        | ((h >> 2) & 1) << 5;
                    let value = self.x(2)?.wrapping_add(sext(imm, 10) as u32);
                    self.set_x(2, value)?;
                } else {
                    self.set_x(rd_full, (imm6 << 12) as u32)?;
                }
            }
            (1, 4) => {
                let a = self.x(rd_c)?;
                let shamt = rs2_full;
                let value = match (h >> 10) & 0x3 {
                    0 => a >> shamt,
                    1 => ((a as i32) >> shamt) as u32,
                    2 => a & imm6 as u32,
                    _ => {
                        let b = self.x(rs2_c)?;
                        match (h >> 5) & 0x3 {
                            0 => a.wrapping_sub(b),
                            1 => a ^ b,
                            2 => a | b,
                            _ => a & b,
                        }
                    }
                };
                self.set_x(rd_c, value)?;
            }
            (1, 6) | (1, 7) => {
                let offset = ((h >> 12) & 1) << 8
                    | ((h >> 10) & 0x3) << 3
                    | ((h >> 5) & 0x3) << 6
                    | ((h >> 3) & 0x3) << 1
                    | ((h >> 2) & 1) << 5;
                let zero = self.x(rd_c)? == 0;
                if zero == (funct3 == 6) {
                    return Ok(Some(pc.wrapping_add(sext(offset, 9) as u32)));
                }
            }
            (2, 0) => {
                let value = self.x(rd_full)? << rs2_full;
                self.set_x(rd_full, value)?;
            }
            (2, 2) => {
                let offset = ((h >> 12) & 1) << 5 | ((h >> 4) & 0x7) << 2 | ((h >> 2) & 0x3) << 6;
                let addr = self.x(2)?.wrapping_add(offset);
                let value = self.load(addr)?;
                self.set_x(rd_full, value)?;
            }
            (2, 6) => {
                let offset = ((h >> 9) & 0xF) << 2 | ((h >> 7) & 0x3) << 6;
                let addr = self.x(2)?.wrapping_add(offset);
                let value = self.x(rs2_full)?;
                self.store(addr, value)?;
            }
            (2, 4) => {
                let bit12 = (h >> 12) & 1;
                match (bit12, rd_full, rs2_full) {
                    (0, 0, _) => return Err(()),
                    (0, rs1, 0) => return Ok(Some(self.x(rs1)? & !1)),
                    (0, rd, rs2) => {
                        let value = self.x(rs2)?;
                        self.set_x(rd, value)?;
                    }
                    (_, 0, 0) => return Ok(None),
                    (_, rs1, 0) => {
                        let target = self.x(rs1)? & !1;
                        self.set_x(1, next)?;
                        return Ok(Some(target));
                    }
                    (_, rd, rs2) => {
                        let value = self.x(rd)?.wrapping_add(self.x(rs2)?);
                        self.set_x(rd, value)?;
                    }
                }
            }
            _ => return Err(()),
        }
        Ok(Some(next))
    }
}

fn sext(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

fn le32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn region(addr: u32, base: u32, size: usize) -> Option<usize> {
    let offset = addr.checked_sub(base)? as usize;
    (offset + 4 <= size).then_some(offset)
}

/// Shared handle to the simulated chip
#[derive(Debug, Clone)]
pub struct SimTarget(Rc<RefCell<State>>);

impl SimTarget {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(State::new())))
    }

    pub fn read(&self, addr: u8) -> u32 {
        self.0.borrow_mut().read(addr)
    }

    pub fn write(&self, addr: u8, value: u32) {
        self.0.borrow_mut().write(addr, value)
    }

    pub fn data0(&self) -> u32 {
        self.0.borrow().data[0]
    }

    pub fn set_data0(&self, value: u32) {
        self.0.borrow_mut().data[0] = value;
    }

    pub fn set_cpbr(&self, cpbr: u32) {
        self.0.borrow_mut().cpbr = cpbr;
    }

    pub fn set_flash_kb(&self, kb: u16) {
        self.0.borrow_mut().flash_kb = kb;
    }

    pub fn set_uid(&self, uid: [u32; 3]) {
        self.0.borrow_mut().uid = uid;
    }

    /// Write protect `[start, end)`
    pub fn protect(&self, start: u32, end: u32) {
        self.0.borrow_mut().protected = Some((start, end));
    }

    /// Report ABSTRACTCS BUSY for the next `reads` reads
    pub fn hold_busy(&self, reads: u32) {
        self.0.borrow_mut().hooks.busy_reads = reads;
    }

    /// Never report havereset in DMSTATUS
    pub fn hide_havereset(&self) {
        self.0.borrow_mut().hooks.hide_havereset = true;
    }

    /// Ignore haltreq while the hart is running
    pub fn ignore_haltreq(&self) {
        self.0.borrow_mut().hooks.ignore_haltreq = true;
    }

    /// Make hart stores to the word at `addr` fault
    pub fn fail_stores_to(&self, addr: u32) {
        self.0.borrow_mut().hooks.failing_store = Some(addr);
    }

    pub fn is_halted(&self) -> bool {
        self.0.borrow().halted
    }

    pub fn gpr(&self, index: usize) -> u32 {
        self.0.borrow().hart.x[index]
    }

    pub fn set_gpr(&self, index: usize, value: u32) {
        self.0.borrow_mut().hart.x[index] = value;
    }

    pub fn dpc(&self) -> u32 {
        self.0.borrow().hart.dpc
    }

    pub fn flash(&self, addr: u32, len: usize) -> Vec<u8> {
        let offset = (addr - CH32_FLASH_BASE) as usize;
        self.0.borrow().flash[offset..offset + len].to_vec()
    }

    pub fn fill_flash(&self, addr: u32, bytes: &[u8]) {
        let offset = (addr - CH32_FLASH_BASE) as usize;
        self.0.borrow_mut().flash[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn ram(&self, addr: u32, len: usize) -> Vec<u8> {
        let offset = (addr - CH32_RAM_BASE) as usize;
        self.0.borrow().ram[offset..offset + len].to_vec()
    }

    pub fn fill_ram(&self, addr: u32, bytes: &[u8]) {
        let offset = (addr - CH32_RAM_BASE) as usize;
        self.0.borrow_mut().ram[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn flash_ctlr(&self) -> u32 {
        self.0.borrow().fctl.ctlr
    }

    pub fn flash_statr(&self) -> u32 {
        self.0.borrow().fctl.statr
    }

    pub fn abstractauto(&self) -> u32 {
        self.0.borrow().abstractauto
    }

    pub fn cmderr(&self) -> u8 {
        self.0.borrow().cmderr
    }

    pub fn progbuf_writes(&self) -> usize {
        self.0.borrow().progbuf_writes
    }

    pub fn commands(&self) -> usize {
        self.0.borrow().commands
    }

    pub fn nrst_pulses(&self) -> usize {
        self.0.borrow().nrst_pulses
    }

    pub fn cfgr_writes(&self) -> Vec<(u8, u32)> {
        self.0.borrow().cfgr.clone()
    }

    /// DMCONTROL values written since the last call
    pub fn take_dmcontrol_log(&self) -> Vec<u32> {
        core::mem::take(&mut self.0.borrow_mut().dmcontrol_log)
    }

    pub fn nrst(&self) {
        self.0.borrow_mut().nrst();
    }
}

/// GPIO double decoding SWIO frames for a [`SimTarget`]
#[derive(Debug)]
pub struct SimPin {
    target: SimTarget,
    timing: Timing,
    output: bool,
    level: bool,
    low_cycles: u32,
    in_frame: bool,
    bits: u64,
    count: usize,
    response: VecDeque<bool>,
    current: Option<bool>,
    zero_polls: u32,
    fault: Option<Fault>,
    stuck_low: bool,
    frames: usize,
    write_parity_errors: usize,
}

impl SimPin {
    pub fn new(target: SimTarget, timing: Timing) -> Self {
        Self {
            target,
            timing,
            output: false,
            level: true,
            low_cycles: 0,
            in_frame: false,
            bits: 0,
            count: 0,
            response: VecDeque::new(),
            current: None,
            zero_polls: 0,
            fault: None,
            stuck_low: false,
            frames: 0,
            write_parity_errors: 0,
        }
    }

    pub fn inject(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    /// Completed frames
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn write_parity_errors(&self) -> usize {
        self.write_parity_errors
    }

    fn pulse(&mut self, width: u32) {
        if width >= self.timing.start_low {
            self.in_frame = true;
            self.bits = 0;
            self.count = 0;
            self.response.clear();
            self.stuck_low = false;
            return;
        }
        if !self.in_frame {
            return;
        }

        let bit = width < self.timing.zero_low;
        self.bits = (self.bits << 1) | bit as u64;
        self.count += 1;

        if self.count == 8 && self.bits & 1 == 0 {
            let header = self.bits as u8;
            let value = self.target.read(header >> 1);
            let mut parity = calculate_parity(header as u64 | (value as u64) << 8);
            match self.fault.take() {
                Some(Fault::FlipParity) => parity = !parity,
                Some(Fault::StuckLow) => self.stuck_low = true,
                None => (),
            }
            for ii in (0..32).rev() {
                self.response.push_back((value >> ii) & 1 == 1);
            }
            self.response.push_back(parity);
            self.in_frame = false;
            self.frames += 1;
        } else if self.count == 41 {
            let header = (self.bits >> 33) as u8;
            let data = (self.bits >> 1) as u32;
            let parity = self.bits & 1 == 1;
            if calculate_parity(header as u64 | (data as u64) << 8) == parity {
                self.target.write(header >> 1, data);
            } else {
                self.write_parity_errors += 1;
            }
            self.in_frame = false;
            self.frames += 1;
        }
    }
}

impl SwioPin for SimPin {
    fn set_high(&mut self) {
        if self.output && !self.level {
            self.pulse(self.low_cycles);
        }
        self.level = true;
    }

    fn set_low(&mut self) {
        if self.level {
            self.low_cycles = 0;
        }
        self.level = false;
    }

    fn set_output(&mut self) {
        self.output = true;
    }

    fn set_input(&mut self) {
        if self.output && !self.level {
            // Sample strobe: the target presents its next bit
            self.current = self.response.pop_front();
            self.zero_polls = if self.current == Some(false) {
                ZERO_POLLS
            } else {
                0
            };
        }
        self.output = false;
    }

    fn is_high(&mut self) -> bool {
        if self.output {
            return self.level;
        }
        if self.stuck_low {
            return false;
        }
        match self.current {
            Some(false) if self.zero_polls > 0 => {
                self.zero_polls -= 1;
                false
            }
            _ => true,
        }
    }

    fn delay_cycles(&mut self, cycles: u32) {
        if self.output && !self.level {
            self.low_cycles = self.low_cycles.saturating_add(cycles);
        }
    }
}

/// NRST double
#[derive(Debug)]
pub struct SimReset {
    target: SimTarget,
    asserted: bool,
}

impl SimReset {
    pub fn new(target: SimTarget) -> Self {
        Self {
            target,
            asserted: false,
        }
    }
}

impl ResetPin for SimReset {
    fn set_reset(&mut self, asserted: bool) {
        if self.asserted && !asserted {
            self.target.nrst();
        }
        self.asserted = asserted;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use wchswio_core::rv::{GET_U32, PROGRAM_FLASH_COMMAND, Program};

    fn load(target: &SimTarget, program: &Program) {
        for (ii, word) in program.words().iter().enumerate() {
            target.write(PROGBUF0_ADDRESS + ii as u8, *word);
        }
    }

    fn halted() -> SimTarget {
        let target = SimTarget::new();
        target.write(0x10, 0x8000_0001);
        assert!(target.is_halted());
        target
    }

    #[test]
    fn test_get_u32_program() {
        let target = halted();
        load(&target, &GET_U32);
        target.write(0x05, Esig::FLACAP_ADDRESS);
        target.write(0x17, AccessRegister::postexec().raw());
        assert_eq!(target.cmderr(), 0);
        assert_eq!(target.data0(), 0xFFFF_0080);
    }

    #[test]
    fn test_running_hart_rejects_commands() {
        let target = SimTarget::new();
        target.write(0x10, 0x0000_0001);
        target.write(0x17, AccessRegister::postexec().raw());
        assert_eq!(target.cmderr(), CMDERR_HALT_RESUME);
    }

    #[test]
    fn test_flash_command_erases_page() {
        let target = halted();
        target.fill_flash(CH32_FLASH_BASE + 0x40, &[0u8; 64]);
        let mut state = target.0.borrow_mut();
        for (addr, value) in [
            (FlashKeyr::ADDRESS, FlashKeyr::KEY1),
            (FlashKeyr::ADDRESS, FlashKeyr::KEY2),
            (FlashMkeyr::ADDRESS, FlashKeyr::KEY1),
            (FlashMkeyr::ADDRESS, FlashKeyr::KEY2),
            (FlashAddr::ADDRESS, CH32_FLASH_BASE + 0x40),
        ] {
            assert_eq!(state.store(addr, value), Ok(()));
        }
        state.hart.x[12] = FlashStatr::ADDRESS;
        state.hart.x[13] = FlashCtlr::FTER;
        state.hart.x[14] = FlashCtlr::FTER | FlashCtlr::STRT;
        drop(state);

        load(&target, &PROGRAM_FLASH_COMMAND);
        target.write(0x17, AccessRegister::postexec().raw());
        assert_eq!(target.cmderr(), 0);
        assert_eq!(target.flash(CH32_FLASH_BASE + 0x40, 64), vec![0xFF; 64]);
        assert_eq!(target.flash(CH32_FLASH_BASE + 0x80, 4), vec![0xFF; 4]);
    }

    #[test]
    fn test_illegal_instruction_is_exception() {
        let target = halted();
        target.write(PROGBUF0_ADDRESS, 0);
        target.write(0x17, AccessRegister::postexec().raw());
        assert_eq!(target.cmderr(), CMDERR_EXCEPTION);

        // Further commands ignored until cleared
        target.write(0x16, 0x700);
        assert_eq!(target.cmderr(), 0);
    }
}
