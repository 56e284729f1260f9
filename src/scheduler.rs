use crate::bus::Bus;
use crate::cartridge::Cartridge;
use crate::cpu::Cpu;
use crate::error::CoreError;
use crate::interrupts::{request_interrupt, Interrupt};
use crate::joypad::{JoyButton, Joypad};
use crate::ppu::Ppu;
use crate::timer::Timer;
use crate::utils::*;
use log::warn;

/// Owns the `Cpu`, `Bus`, `Timer`, and `Ppu` and drives them through one
/// emulated frame or a caller-specified wall-clock slice (spec §4.7). The
/// scheduler owns the cycle-budget bookkeeping; it owns no memory of its own
/// beyond that (the `Bus` is the sole owner of the 64 KiB address space, per
/// spec §3's ownership note).
pub struct Scheduler {
    cpu: Cpu,
    bus: Bus,
    timer: Timer,
    ppu: Ppu,
}

impl Scheduler {
    pub fn new(cartridge: Cartridge) -> Scheduler {
        Scheduler::with_sprite_limit(cartridge, 10)
    }

    /// As `new`, but with the spec's 10-sprite-per-scanline cap overridden
    /// (`EmulatorConfig::max_sprites_per_scanline`, see `lib.rs`).
    pub fn with_sprite_limit(cartridge: Cartridge, max_sprites_per_scanline: u8) -> Scheduler {
        let joypad = Joypad::new();
        Scheduler {
            cpu: Cpu::new(),
            bus: Bus::new(cartridge, joypad),
            timer: Timer::new(),
            ppu: Ppu::with_sprite_limit(max_sprites_per_scanline as usize),
        }
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn framebuffer(&self) -> &[Shade] {
        self.ppu.framebuffer()
    }

    pub fn background_view(&self) -> &[Shade] {
        self.ppu.background_view()
    }

    pub fn press(&mut self, button: JoyButton) {
        if self.bus.joypad_mut().press(button) {
            request_interrupt(&mut self.bus, Interrupt::Joypad);
        }
    }

    pub fn release(&mut self, button: JoyButton) {
        self.bus.joypad_mut().release(button);
    }

    /// Advance `dt_seconds` worth of wall-clock time, converted to CPU
    /// clocks at the nominal 4.194304 MHz rate (spec §4.7's literal `dt`
    /// framing). Returns `Some(framebuffer)` the instant a frame completes
    /// (LY crosses 143 -> 144) during this call, else `None`.
    pub fn tick(&mut self, dt_seconds: f64) -> Result<Option<&[Shade]>, CoreError> {
        let mut budget = (dt_seconds * CLOCK_SPEED as f64) as i64;
        let mut frame_completed = false;

        while budget > 0 {
            let cycles = self.step_one()?;
            budget -= (cycles as i64) * 4;
            if self.ppu.take_frame_ready() {
                frame_completed = true;
            }
        }

        Ok(if frame_completed { Some(self.ppu.framebuffer()) } else { None })
    }

    /// Advance exactly one emulated frame (one full 154-scanline sweep),
    /// matching spec §4.7's "per-frame ... driver" framing. Returns the
    /// completed framebuffer.
    pub fn run_frame(&mut self) -> Result<&[Shade], CoreError> {
        let mut budget: i64 = CYCLES_PER_FRAME as i64;
        loop {
            let cycles = self.step_one()?;
            budget -= cycles as i64;
            if self.ppu.take_frame_ready() || budget <= 0 {
                break;
            }
        }
        Ok(self.ppu.framebuffer())
    }

    /// Service a pending interrupt if due, fetch-decode-execute one
    /// instruction (or one HALT tick), then charge the elapsed M-cycles to
    /// the timer and PPU (spec §5: "Timer and PPU state advance AFTER the
    /// instruction that caused the elapsed cycles, not during it").
    fn step_one(&mut self) -> Result<u8, CoreError> {
        let cycles = self.cpu.step(&mut self.bus)?;
        self.timer.update(&mut self.bus, cycles);
        self.ppu.step(&mut self.bus, cycles);
        if let Some(warning) = self.bus.take_pending_warning() {
            warn!("{warning}");
        }
        Ok(cycles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::Cartridge;

    #[test]
    fn run_frame_advances_ly_through_a_full_sweep_and_fires_vblank() {
        let mut scheduler = Scheduler::new(Cartridge::blank());
        scheduler.run_frame().unwrap();
        assert!(is_bit_set(
            scheduler.bus().read_byte(INTERRUPT_FLAG_ADDR),
            Interrupt::VBlank.bit()
        ));
    }

    #[test]
    fn pressing_a_button_raises_the_joypad_interrupt() {
        let mut scheduler = Scheduler::new(Cartridge::blank());
        // With neither row selected (the power-on state: 0xFF00 reads 0xFF),
        // no button's read bit can fall, so select the action-button row
        // (bit 5 = 0) before pressing Start, matching how a game would poll it.
        scheduler.bus.write_byte(JOYPAD_REGISTER_ADDR, 0xDF);
        scheduler.press(JoyButton::Start);
        assert!(is_bit_set(
            scheduler.bus().read_byte(INTERRUPT_FLAG_ADDR),
            Interrupt::Joypad.bit()
        ));
    }

    fn rom_with_opcode_at_0x100(opcode: Byte) -> Vec<Byte> {
        use crate::cartridge::*;
        let mut bytes = vec![0u8; 0x8000];
        bytes[HEADER_NINTENDO_LOGO as usize..=HEADER_LOGO_END as usize].copy_from_slice(&NINTENDO_LOGO);
        bytes[0x0100] = opcode;
        let mut checksum: Byte = 0;
        for &b in &bytes[HEADER_CHECKSUM_START as usize..=HEADER_CHECKSUM_END as usize] {
            checksum = checksum.wrapping_sub(b).wrapping_sub(1);
        }
        bytes[HEADER_CHECKSUM_ADDR as usize] = checksum;
        bytes
    }

    #[test]
    fn illegal_opcode_surfaces_as_a_fatal_error_and_preserves_cpu_state() {
        let rom = rom_with_opcode_at_0x100(0xD3); // one of the eleven illegal primary opcodes
        let cartridge = Cartridge::load(&rom).unwrap();
        let mut scheduler = Scheduler::new(cartridge);
        let pc_before = scheduler.cpu().regs.pc;

        let err = scheduler.run_frame().unwrap_err();
        assert!(matches!(err, CoreError::FatalCpu { opcode: 0xD3, .. }));
        // CPU state is preserved for diagnostics rather than reset (spec §7):
        // PC sits right after the fetched illegal byte, not rewound or cleared.
        assert_eq!(scheduler.cpu().regs.pc, pc_before.wrapping_add(1));
    }
}
