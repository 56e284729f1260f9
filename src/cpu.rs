use crate::bus::Bus;
use crate::error::CoreError;
use crate::interrupts;
use crate::registers::{Condition, Reg16, Reg16Stack, Reg8, Registers};
use crate::utils::*;

/// High-level CPU state (spec §4.2's "State machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Running,
    Halted,
    /// STOP is treated as HALT per spec §9's open question; this variant
    /// exists only so `mode()` can still report that a STOP was executed.
    Stopped,
}

/// The LR35902 instruction decoder/executor (spec §4.2). One call to
/// [`Cpu::step`] services a pending interrupt if one is due, otherwise
/// fetches, decodes, and executes exactly one instruction, returning its
/// cost in M-cycles.
#[derive(Debug)]
pub struct Cpu {
    pub regs: Registers,
    ime: bool,
    /// Counts down 2, 1, 0 after `EI`; IME actually flips to 1 when this
    /// reaches 0, giving the documented one-instruction delay.
    ime_enable_delay: u8,
    mode: CpuMode,
}

impl Cpu {
    pub fn new() -> Cpu {
        let mut regs = Registers::new();
        regs.power_on();
        Cpu {
            regs,
            ime: false,
            ime_enable_delay: 0,
            mode: CpuMode::Running,
        }
    }

    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    pub fn ime(&self) -> bool {
        self.ime
    }

    /// Service a pending interrupt or execute one instruction, returning the
    /// number of M-cycles consumed.
    pub fn step(&mut self, bus: &mut Bus) -> Result<u8, CoreError> {
        if matches!(self.mode, CpuMode::Halted | CpuMode::Stopped) {
            if interrupts::has_pending_interrupt(bus) {
                self.mode = CpuMode::Running;
            } else {
                return Ok(1);
            }
        }

        if self.ime {
            if let Some(interrupt) = interrupts::highest_priority_interrupt(bus) {
                interrupts::clear_request(bus, interrupt);
                self.ime = false;
                let pc = self.regs.pc;
                self.push(bus, pc);
                self.regs.pc = interrupt.vector();
                return Ok(5);
            }
        }

        let opcode = self.fetch_byte(bus);
        let cycles = self.execute(opcode, bus)?;

        // EI's enable takes effect only once the instruction following it has
        // fully executed (spec §4.2/§5's one-instruction delay): the step that
        // runs EI itself leaves IME false; the step that runs the next
        // instruction flips it to true right here, after that instruction is
        // done, so the earliest a pending interrupt can preempt fetch is the
        // step after that.
        if self.ime_enable_delay > 0 {
            self.ime_enable_delay -= 1;
            if self.ime_enable_delay == 0 {
                self.ime = true;
            }
        }

        Ok(cycles)
    }

    fn fetch_byte(&mut self, bus: &Bus) -> Byte {
        let byte = bus.read_byte(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        byte
    }

    fn fetch_word(&mut self, bus: &Bus) -> Word {
        let word = bus.read_word(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(2);
        word
    }

    fn push(&mut self, bus: &mut Bus, value: Word) {
        self.regs.sp = self.regs.sp.wrapping_sub(2);
        bus.write_word(self.regs.sp, value);
    }

    fn pop(&mut self, bus: &mut Bus) -> Word {
        let value = bus.read_word(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(2);
        value
    }

    fn read_r8(&self, bus: &Bus, r: Reg8) -> Byte {
        match r {
            Reg8::B => self.regs.b,
            Reg8::C => self.regs.c,
            Reg8::D => self.regs.d,
            Reg8::E => self.regs.e,
            Reg8::H => self.regs.h,
            Reg8::L => self.regs.l,
            Reg8::A => self.regs.a,
            Reg8::HlInd => bus.read_byte(self.regs.hl()),
        }
    }

    fn write_r8(&mut self, bus: &mut Bus, r: Reg8, val: Byte) {
        match r {
            Reg8::B => self.regs.b = val,
            Reg8::C => self.regs.c = val,
            Reg8::D => self.regs.d = val,
            Reg8::E => self.regs.e = val,
            Reg8::H => self.regs.h = val,
            Reg8::L => self.regs.l = val,
            Reg8::A => self.regs.a = val,
            Reg8::HlInd => bus.write_byte(self.regs.hl(), val),
        }
    }

    fn read_r16(&self, rp: Reg16) -> Word {
        match rp {
            Reg16::Bc => self.regs.bc(),
            Reg16::De => self.regs.de(),
            Reg16::Hl => self.regs.hl(),
            Reg16::Sp => self.regs.sp,
        }
    }

    fn write_r16(&mut self, rp: Reg16, val: Word) {
        match rp {
            Reg16::Bc => self.regs.set_bc(val),
            Reg16::De => self.regs.set_de(val),
            Reg16::Hl => self.regs.set_hl(val),
            Reg16::Sp => self.regs.sp = val,
        }
    }

    fn read_r16_stack(&self, rp: Reg16Stack) -> Word {
        match rp {
            Reg16Stack::Bc => self.regs.bc(),
            Reg16Stack::De => self.regs.de(),
            Reg16Stack::Hl => self.regs.hl(),
            Reg16Stack::Af => self.regs.af(),
        }
    }

    fn write_r16_stack(&mut self, rp: Reg16Stack, val: Word) {
        match rp {
            Reg16Stack::Bc => self.regs.set_bc(val),
            Reg16Stack::De => self.regs.set_de(val),
            Reg16Stack::Hl => self.regs.set_hl(val),
            // set_af masks F's low nibble to zero, satisfying POP AF (spec §4.2).
            Reg16Stack::Af => self.regs.set_af(val),
        }
    }

    fn alu_op(&mut self, op: u8, operand: Byte) {
        match op {
            0 => {
                let (result, h, c) = add8_carry(self.regs.a, operand, false);
                self.regs.a = result;
                self.regs.set_flags(result == 0, false, h, c);
            }
            1 => {
                let (result, h, c) = add8_carry(self.regs.a, operand, self.regs.carry());
                self.regs.a = result;
                self.regs.set_flags(result == 0, false, h, c);
            }
            2 => {
                let (result, h, c) = sub8_carry(self.regs.a, operand, false);
                self.regs.a = result;
                self.regs.set_flags(result == 0, true, h, c);
            }
            3 => {
                let (result, h, c) = sub8_carry(self.regs.a, operand, self.regs.carry());
                self.regs.a = result;
                self.regs.set_flags(result == 0, true, h, c);
            }
            4 => {
                self.regs.a &= operand;
                self.regs.set_flags(self.regs.a == 0, false, true, false);
            }
            5 => {
                self.regs.a ^= operand;
                self.regs.set_flags(self.regs.a == 0, false, false, false);
            }
            6 => {
                self.regs.a |= operand;
                self.regs.set_flags(self.regs.a == 0, false, false, false);
            }
            _ => {
                let (result, h, c) = sub8_carry(self.regs.a, operand, false);
                self.regs.set_flags(result == 0, true, h, c);
            }
        }
    }

    fn execute(&mut self, opcode: Byte, bus: &mut Bus) -> Result<u8, CoreError> {
        match opcode {
            0x00 => Ok(1),
            0x10 => {
                self.fetch_byte(bus); // STOP is followed by a mandatory 0x00
                self.mode = CpuMode::Stopped;
                Ok(1)
            }
            0x76 => {
                self.mode = CpuMode::Halted;
                Ok(1)
            }

            0x01 | 0x11 | 0x21 | 0x31 => {
                let rp = Reg16::from_bits(opcode >> 4);
                let nn = self.fetch_word(bus);
                self.write_r16(rp, nn);
                Ok(3)
            }
            0x08 => {
                let addr = self.fetch_word(bus);
                bus.write_word(addr, self.regs.sp);
                Ok(5)
            }
            0x02 => {
                bus.write_byte(self.regs.bc(), self.regs.a);
                Ok(2)
            }
            0x12 => {
                bus.write_byte(self.regs.de(), self.regs.a);
                Ok(2)
            }
            0x0A => {
                self.regs.a = bus.read_byte(self.regs.bc());
                Ok(2)
            }
            0x1A => {
                self.regs.a = bus.read_byte(self.regs.de());
                Ok(2)
            }
            0x22 => {
                let hl = self.regs.hl();
                bus.write_byte(hl, self.regs.a);
                self.regs.set_hl(hl.wrapping_add(1));
                Ok(2)
            }
            0x2A => {
                let hl = self.regs.hl();
                self.regs.a = bus.read_byte(hl);
                self.regs.set_hl(hl.wrapping_add(1));
                Ok(2)
            }
            0x32 => {
                let hl = self.regs.hl();
                bus.write_byte(hl, self.regs.a);
                self.regs.set_hl(hl.wrapping_sub(1));
                Ok(2)
            }
            0x3A => {
                let hl = self.regs.hl();
                self.regs.a = bus.read_byte(hl);
                self.regs.set_hl(hl.wrapping_sub(1));
                Ok(2)
            }
            0xE0 => {
                let n = self.fetch_byte(bus) as Word;
                bus.write_byte(0xFF00 + n, self.regs.a);
                Ok(3)
            }
            0xF0 => {
                let n = self.fetch_byte(bus) as Word;
                self.regs.a = bus.read_byte(0xFF00 + n);
                Ok(3)
            }
            0xE2 => {
                bus.write_byte(0xFF00 + self.regs.c as Word, self.regs.a);
                Ok(2)
            }
            0xF2 => {
                self.regs.a = bus.read_byte(0xFF00 + self.regs.c as Word);
                Ok(2)
            }
            0xEA => {
                let addr = self.fetch_word(bus);
                bus.write_byte(addr, self.regs.a);
                Ok(4)
            }
            0xFA => {
                let addr = self.fetch_word(bus);
                self.regs.a = bus.read_byte(addr);
                Ok(4)
            }
            0xF8 => {
                let e = self.fetch_byte(bus) as SignedByte;
                let (result, h, c) = add_sp_signed(self.regs.sp, e);
                self.regs.set_hl(result);
                self.regs.set_flags(false, false, h, c);
                Ok(3)
            }
            0xF9 => {
                self.regs.sp = self.regs.hl();
                Ok(2)
            }
            0xE8 => {
                let e = self.fetch_byte(bus) as SignedByte;
                let (result, h, c) = add_sp_signed(self.regs.sp, e);
                self.regs.sp = result;
                self.regs.set_flags(false, false, h, c);
                Ok(4)
            }

            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let r = Reg8::from_bits(opcode >> 3);
                let val = self.read_r8(bus, r);
                let (result, z, h) = inc8(val);
                self.write_r8(bus, r, result);
                self.regs.set_zero(z);
                self.regs.set_subtract(false);
                self.regs.set_half_carry(h);
                Ok(if r == Reg8::HlInd { 3 } else { 1 })
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let r = Reg8::from_bits(opcode >> 3);
                let val = self.read_r8(bus, r);
                let (result, z, h) = dec8(val);
                self.write_r8(bus, r, result);
                self.regs.set_zero(z);
                self.regs.set_subtract(true);
                self.regs.set_half_carry(h);
                Ok(if r == Reg8::HlInd { 3 } else { 1 })
            }
            0x03 | 0x13 | 0x23 | 0x33 => {
                let rp = Reg16::from_bits(opcode >> 4);
                let val = self.read_r16(rp);
                self.write_r16(rp, val.wrapping_add(1));
                Ok(2)
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let rp = Reg16::from_bits(opcode >> 4);
                let val = self.read_r16(rp);
                self.write_r16(rp, val.wrapping_sub(1));
                Ok(2)
            }
            0x09 | 0x19 | 0x29 | 0x39 => {
                let rp = Reg16::from_bits(opcode >> 4);
                let val = self.read_r16(rp);
                let (result, h, c) = add16(self.regs.hl(), val);
                self.regs.set_hl(result);
                self.regs.set_subtract(false);
                self.regs.set_half_carry(h);
                self.regs.set_carry(c);
                Ok(2)
            }

            0x80..=0xBF => {
                let r = Reg8::from_bits(opcode);
                let op = (opcode >> 3) & 0x7;
                let val = self.read_r8(bus, r);
                self.alu_op(op, val);
                Ok(if r == Reg8::HlInd { 2 } else { 1 })
            }
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let op = (opcode >> 3) & 0x7;
                let n = self.fetch_byte(bus);
                self.alu_op(op, n);
                Ok(2)
            }

            0x07 => {
                let (result, c) = rlc(self.regs.a);
                self.regs.a = result;
                self.regs.set_flags(false, false, false, c);
                Ok(1)
            }
            0x0F => {
                let (result, c) = rrc(self.regs.a);
                self.regs.a = result;
                self.regs.set_flags(false, false, false, c);
                Ok(1)
            }
            0x17 => {
                let (result, c) = rl(self.regs.a, self.regs.carry());
                self.regs.a = result;
                self.regs.set_flags(false, false, false, c);
                Ok(1)
            }
            0x1F => {
                let (result, c) = rr(self.regs.a, self.regs.carry());
                self.regs.a = result;
                self.regs.set_flags(false, false, false, c);
                Ok(1)
            }
            0x2F => {
                self.regs.a = !self.regs.a;
                self.regs.set_subtract(true);
                self.regs.set_half_carry(true);
                Ok(1)
            }
            0x37 => {
                self.regs.set_carry(true);
                self.regs.set_subtract(false);
                self.regs.set_half_carry(false);
                Ok(1)
            }
            0x3F => {
                let c = self.regs.carry();
                self.regs.set_carry(!c);
                self.regs.set_subtract(false);
                self.regs.set_half_carry(false);
                Ok(1)
            }
            0x27 => {
                let (result, z, h, c) = daa(self.regs.a, self.regs.subtract(), self.regs.half_carry(), self.regs.carry());
                self.regs.a = result;
                let n = self.regs.subtract();
                self.regs.set_flags(z, n, h, c);
                Ok(1)
            }

            0x18 => {
                let e = self.fetch_byte(bus) as SignedByte;
                self.regs.pc = self.regs.pc.wrapping_add(e as i16 as u16);
                Ok(3)
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let cc = Condition::from_bits(opcode >> 3);
                let e = self.fetch_byte(bus) as SignedByte;
                if cc.is_satisfied(&self.regs) {
                    self.regs.pc = self.regs.pc.wrapping_add(e as i16 as u16);
                    Ok(3)
                } else {
                    Ok(2)
                }
            }
            0xC3 => {
                self.regs.pc = self.fetch_word(bus);
                Ok(4)
            }
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let cc = Condition::from_bits(opcode >> 3);
                let addr = self.fetch_word(bus);
                if cc.is_satisfied(&self.regs) {
                    self.regs.pc = addr;
                    Ok(4)
                } else {
                    Ok(3)
                }
            }
            0xE9 => {
                self.regs.pc = self.regs.hl();
                Ok(1)
            }
            0xCD => {
                let addr = self.fetch_word(bus);
                let pc = self.regs.pc;
                self.push(bus, pc);
                self.regs.pc = addr;
                Ok(6)
            }
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let cc = Condition::from_bits(opcode >> 3);
                let addr = self.fetch_word(bus);
                if cc.is_satisfied(&self.regs) {
                    let pc = self.regs.pc;
                    self.push(bus, pc);
                    self.regs.pc = addr;
                    Ok(6)
                } else {
                    Ok(3)
                }
            }
            0xC9 => {
                self.regs.pc = self.pop(bus);
                Ok(4)
            }
            0xD9 => {
                self.regs.pc = self.pop(bus);
                self.ime = true;
                self.ime_enable_delay = 0;
                Ok(4)
            }
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                let cc = Condition::from_bits(opcode >> 3);
                if cc.is_satisfied(&self.regs) {
                    self.regs.pc = self.pop(bus);
                    Ok(5)
                } else {
                    Ok(2)
                }
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                let target = (opcode & 0x38) as Word;
                let pc = self.regs.pc;
                self.push(bus, pc);
                self.regs.pc = target;
                Ok(4)
            }
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let rp = Reg16Stack::from_bits(opcode >> 4);
                let val = self.pop(bus);
                self.write_r16_stack(rp, val);
                Ok(3)
            }
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let rp = Reg16Stack::from_bits(opcode >> 4);
                let val = self.read_r16_stack(rp);
                self.push(bus, val);
                Ok(4)
            }

            0xF3 => {
                self.ime = false;
                self.ime_enable_delay = 0;
                Ok(1)
            }
            0xFB => {
                self.ime_enable_delay = 2;
                Ok(1)
            }

            0xCB => self.execute_cb(bus),

            0xD3 | 0xDB | 0xDD | 0xE3 | 0xE4 | 0xEB | 0xEC | 0xED | 0xF4 | 0xFC | 0xFD => Err(CoreError::FatalCpu {
                pc: self.regs.pc.wrapping_sub(1),
                opcode,
            }),

            // 0x40-0x7F minus 0x76 (HALT, matched above): LD r,r'
            0x40..=0x7F => {
                let dst = Reg8::from_bits(opcode >> 3);
                let src = Reg8::from_bits(opcode);
                let val = self.read_r8(bus, src);
                self.write_r8(bus, dst, val);
                Ok(if dst == Reg8::HlInd || src == Reg8::HlInd { 2 } else { 1 })
            }
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let dst = Reg8::from_bits(opcode >> 3);
                let n = self.fetch_byte(bus);
                self.write_r8(bus, dst, n);
                Ok(if dst == Reg8::HlInd { 3 } else { 2 })
            }

            _ => Err(CoreError::FatalCpu {
                pc: self.regs.pc.wrapping_sub(1),
                opcode,
            }),
        }
    }

    fn execute_cb(&mut self, bus: &mut Bus) -> Result<u8, CoreError> {
        let opcode = self.fetch_byte(bus);
        let r = Reg8::from_bits(opcode);
        let bit = ((opcode >> 3) & 0x7) as usize;
        let value = self.read_r8(bus, r);

        match opcode >> 6 {
            0 => {
                let family = (opcode >> 3) & 0x7;
                let (result, carry) = match family {
                    0 => rlc(value),
                    1 => rrc(value),
                    2 => rl(value, self.regs.carry()),
                    3 => rr(value, self.regs.carry()),
                    4 => sla(value),
                    5 => sra(value),
                    6 => (swap(value), false),
                    _ => srl(value),
                };
                self.write_r8(bus, r, result);
                self.regs.set_flags(result == 0, false, false, carry);
                Ok(if r == Reg8::HlInd { 4 } else { 2 })
            }
            1 => {
                let z = !is_bit_set(value, bit);
                self.regs.set_zero(z);
                self.regs.set_subtract(false);
                self.regs.set_half_carry(true);
                Ok(if r == Reg8::HlInd { 3 } else { 2 })
            }
            2 => {
                let mut v = value;
                reset_bit(&mut v, bit);
                self.write_r8(bus, r, v);
                Ok(if r == Reg8::HlInd { 4 } else { 2 })
            }
            _ => {
                let mut v = value;
                set_bit(&mut v, bit);
                self.write_r8(bus, r, v);
                Ok(if r == Reg8::HlInd { 4 } else { 2 })
            }
        }
    }
}

impl Default for Cpu {
    fn default() -> Cpu {
        Cpu::new()
    }
}

/// `A + operand (+ carry)`, returning `(result, half_carry, carry)` (spec §4.2's ADD/ADC contract).
fn add8_carry(a: Byte, b: Byte, carry_in: bool) -> (Byte, bool, bool) {
    let carry = carry_in as u16;
    let full = a as u16 + b as u16 + carry;
    let half = (a & 0xF) + (b & 0xF) + carry as u8 > 0xF;
    (full as Byte, half, full > 0xFF)
}

/// `A - operand (- carry)`, returning `(result, half_carry, carry)` (spec §4.2's SUB/SBC/CP contract).
fn sub8_carry(a: Byte, b: Byte, carry_in: bool) -> (Byte, bool, bool) {
    let carry = carry_in as u16;
    let half = (a & 0xF) < (b & 0xF) + carry as u8;
    let c = (a as u16) < (b as u16 + carry);
    let result = a.wrapping_sub(b).wrapping_sub(carry as u8);
    (result, half, c)
}

fn inc8(a: Byte) -> (Byte, bool, bool) {
    let result = a.wrapping_add(1);
    (result, result == 0, (a & 0xF) == 0xF)
}

fn dec8(a: Byte) -> (Byte, bool, bool) {
    let result = a.wrapping_sub(1);
    (result, result == 0, (a & 0xF) == 0x0)
}

/// 16-bit add, returning `(result, half_carry, carry)` for `ADD HL,rp` (spec §4.2).
fn add16(a: Word, b: Word) -> (Word, bool, bool) {
    let half = (a & 0x0FFF) + (b & 0x0FFF) > 0x0FFF;
    let full = a as u32 + b as u32;
    (full as Word, half, full > 0xFFFF)
}

/// `SP + signed(e)`, with H/C computed on the 8-bit unsigned addition of SP's
/// low byte and `e`'s raw byte (spec §4.2's LD HL,SP+e / ADD SP,e contract).
fn add_sp_signed(sp: Word, e: SignedByte) -> (Word, bool, bool) {
    let sp_low = sp & 0xFF;
    let e_unsigned = e as Byte as Word;
    let half = (sp_low & 0xF) + (e_unsigned & 0xF) > 0xF;
    let carry = sp_low + e_unsigned > 0xFF;
    let result = sp.wrapping_add(e as i16 as u16);
    (result, half, carry)
}

/// BCD adjustment after an 8-bit add/subtract (spec §4.2's DAA algorithm).
fn daa(a: Byte, n: bool, h: bool, c: bool) -> (Byte, bool, bool, bool) {
    let mut adjustment = 0u8;
    let mut carry = c;
    let result = if !n {
        if c || a > 0x99 {
            adjustment |= 0x60;
            carry = true;
        }
        if h || (a & 0xF) > 9 {
            adjustment |= 0x06;
        }
        a.wrapping_add(adjustment)
    } else {
        if c {
            adjustment |= 0x60;
        }
        if h {
            adjustment |= 0x06;
        }
        a.wrapping_sub(adjustment)
    };
    (result, result == 0, false, carry)
}

fn rlc(v: Byte) -> (Byte, bool) {
    let carry = is_bit_set(v, 7);
    ((v << 1) | (carry as Byte), carry)
}

fn rrc(v: Byte) -> (Byte, bool) {
    let carry = is_bit_set(v, 0);
    ((v >> 1) | ((carry as Byte) << 7), carry)
}

fn rl(v: Byte, carry_in: bool) -> (Byte, bool) {
    let carry_out = is_bit_set(v, 7);
    ((v << 1) | (carry_in as Byte), carry_out)
}

fn rr(v: Byte, carry_in: bool) -> (Byte, bool) {
    let carry_out = is_bit_set(v, 0);
    ((v >> 1) | ((carry_in as Byte) << 7), carry_out)
}

fn sla(v: Byte) -> (Byte, bool) {
    (v << 1, is_bit_set(v, 7))
}

fn sra(v: Byte) -> (Byte, bool) {
    let carry = is_bit_set(v, 0);
    ((v >> 1) | (v & 0x80), carry)
}

fn swap(v: Byte) -> Byte {
    (v << 4) | (v >> 4)
}

fn srl(v: Byte) -> (Byte, bool) {
    (v >> 1, is_bit_set(v, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::Cartridge;
    use crate::joypad::Joypad;

    fn test_bus() -> Bus {
        Bus::new(Cartridge::blank(), Joypad::new())
    }

    fn run_at(bus: &mut Bus, code: &[Byte]) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x0100;
        for (i, &byte) in code.iter().enumerate() {
            bus.write_byte(0x0100 + i as Word, byte);
        }
        cpu
    }

    #[test]
    fn ld_a_n_loads_immediate() {
        let mut bus = test_bus();
        let mut cpu = run_at(&mut bus, &[0x3E, 0x42]);
        let cycles = cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.a, 0x42);
        assert_eq!(cpu.regs.pc, 0x0102);
        assert_eq!(cycles, 2);
    }

    #[test]
    fn dec_b_from_zero_sets_zero_and_half_carry() {
        let mut bus = test_bus();
        let mut cpu = run_at(&mut bus, &[0x06, 0xFF, 0x04]);
        cpu.step(&mut bus).unwrap(); // LD B,0xFF
        cpu.step(&mut bus).unwrap(); // INC B
        assert_eq!(cpu.regs.b, 0x00);
        assert!(cpu.regs.zero());
        assert!(!cpu.regs.subtract());
        assert!(cpu.regs.half_carry());
        assert_eq!(cpu.regs.pc, 0x0103);
    }

    #[test]
    fn xor_a_a_zeroes_accumulator_and_flags() {
        let mut bus = test_bus();
        let mut cpu = run_at(&mut bus, &[0xAF]);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.a, 0);
        assert_eq!(cpu.regs.f, 0x80);
    }

    #[test]
    fn call_then_ret_round_trips_through_the_stack() {
        let mut bus = test_bus();
        bus.write_byte(0x0110, 0xC9); // RET
        let mut cpu = run_at(&mut bus, &[0x31, 0xFE, 0xFF, 0xCD, 0x10, 0x01, 0x00]);
        cpu.step(&mut bus).unwrap(); // LD SP,0xFFFE
        cpu.step(&mut bus).unwrap(); // CALL 0x0110
        assert_eq!(cpu.regs.pc, 0x0110);
        assert_eq!(cpu.regs.sp, 0xFFFC);
        cpu.step(&mut bus).unwrap(); // RET
        assert_eq!(cpu.regs.pc, 0x0107);
        assert_eq!(cpu.regs.sp, 0xFFFE);
    }

    #[test]
    fn cb_bit_7_h_tests_the_correct_bit() {
        let mut bus = test_bus();
        let mut cpu = run_at(&mut bus, &[0xCB, 0x7C]);
        cpu.regs.h = 0x80;
        cpu.step(&mut bus).unwrap();
        assert!(!cpu.regs.zero());
        assert!(!cpu.regs.subtract());
        assert!(cpu.regs.half_carry());
        assert_eq!(cpu.regs.pc, 0x0102);
    }

    #[test]
    fn daa_after_bcd_add_wraps_99_plus_1_to_00_with_carry() {
        let mut bus = test_bus();
        let mut cpu = run_at(&mut bus, &[0x3E, 0x99, 0xC6, 0x01, 0x27]);
        cpu.step(&mut bus).unwrap(); // LD A,0x99
        cpu.step(&mut bus).unwrap(); // ADD A,0x01
        cpu.step(&mut bus).unwrap(); // DAA
        assert_eq!(cpu.regs.a, 0x00);
        assert!(cpu.regs.zero());
        assert!(cpu.regs.carry());
    }

    #[test]
    fn push_af_then_pop_af_masks_low_nibble() {
        let mut bus = test_bus();
        let mut cpu = run_at(&mut bus, &[]);
        cpu.regs.sp = 0xFFFE;
        cpu.regs.set_af(0x1234);
        let af = cpu.read_r16_stack(Reg16Stack::Af);
        cpu.push(&mut bus, af);
        cpu.regs.set_af(0);
        let popped = cpu.pop(&mut bus);
        cpu.write_r16_stack(Reg16Stack::Af, popped);
        assert_eq!(cpu.regs.af(), 0x1230);
    }

    #[test]
    fn ei_takes_effect_after_one_full_instruction() {
        let mut bus = test_bus();
        bus.write_byte(crate::utils::INTERRUPT_ENABLE_ADDR, 0x1F);
        let mut cpu = run_at(&mut bus, &[0xFB, 0x00, 0x00]); // EI, NOP, NOP
        interrupts::request_interrupt(&mut bus, interrupts::Interrupt::VBlank);

        cpu.step(&mut bus).unwrap(); // EI: IME still false
        assert!(!cpu.ime());
        cpu.step(&mut bus).unwrap(); // the instruction right after EI finishes: IME flips true here
        assert!(cpu.ime());
        // next step should now service the pending interrupt instead of running the second NOP
        let pc_before = cpu.regs.pc;
        let cycles = cpu.step(&mut bus).unwrap();
        assert_eq!(cycles, 5);
        assert_eq!(cpu.regs.pc, interrupts::Interrupt::VBlank.vector());
        assert_ne!(cpu.regs.pc, pc_before);
    }

    #[test]
    fn illegal_opcode_is_a_fatal_error() {
        let mut bus = test_bus();
        let mut cpu = run_at(&mut bus, &[0xD3]);
        let err = cpu.step(&mut bus).unwrap_err();
        assert!(matches!(err, CoreError::FatalCpu { opcode: 0xD3, .. }));
    }

    #[test]
    fn halt_suspends_until_an_interrupt_is_pending() {
        let mut bus = test_bus();
        let mut cpu = run_at(&mut bus, &[0x76]);
        cpu.step(&mut bus).unwrap(); // enter HALT
        assert_eq!(cpu.mode(), CpuMode::Halted);
        assert_eq!(cpu.step(&mut bus).unwrap(), 1); // still halted, no pending interrupt
        assert_eq!(cpu.mode(), CpuMode::Halted);

        bus.write_byte(crate::utils::INTERRUPT_ENABLE_ADDR, 0x01);
        interrupts::request_interrupt(&mut bus, interrupts::Interrupt::VBlank);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.mode(), CpuMode::Running);
    }

    proptest::proptest! {
        /// For any pair of valid two-digit BCD operands, `ADD A,r` followed
        /// by `DAA` lands on the BCD digits of the ordinary decimal sum
        /// (spec §4.2's DAA algorithm, mod 100 with carry out past 99).
        #[test]
        fn daa_recovers_decimal_sum_of_any_two_bcd_digit_pairs(lhs in 0u8..100, rhs in 0u8..100) {
            let a = ((lhs / 10) << 4) | (lhs % 10);
            let b = ((rhs / 10) << 4) | (rhs % 10);

            let mut bus = test_bus();
            let mut cpu = run_at(&mut bus, &[0x3E, a, 0xC6, b, 0x27]);
            cpu.step(&mut bus).unwrap(); // LD A,a
            cpu.step(&mut bus).unwrap(); // ADD A,b
            cpu.step(&mut bus).unwrap(); // DAA

            let sum = lhs as u16 + rhs as u16;
            let expected_digits = (sum % 100) as u8;
            let expected_bcd = ((expected_digits / 10) << 4) | (expected_digits % 10);
            prop_assert_eq!(cpu.regs.a, expected_bcd);
            prop_assert_eq!(cpu.regs.carry(), sum >= 100);
            prop_assert_eq!(cpu.regs.zero(), expected_bcd == 0);
        }
    }
}
