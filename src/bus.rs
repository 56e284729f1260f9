use log::warn;

use crate::cartridge::Cartridge;
use crate::error::CoreError;
use crate::joypad::Joypad;
use crate::mbc;
use crate::utils::*;

/// The 64 KiB memory-mapped address space (spec §4.1):
///
/// ```text
///   0000 - 7FFF   32 KiB ROM (flat; no banking)
///   8000 - 9FFF   8 KiB Video RAM (VRAM)
///   A000 - BFFF   8 KiB External RAM (present only if the cartridge has any)
///   C000 - DFFF   8 KiB Work RAM (WRAM)
///   E000 - FDFF   Mirror of C000~DDFF (ECHO RAM)
///   FE00 - FE9F   Sprite attribute table (OAM)
///   FEA0 - FEFF   Not usable, reads as 0xFF
///   FF00 - FF7F   I/O registers
///   FF80 - FFFE   High RAM (HRAM)
///   FFFF - FFFF   Interrupt Enable register (IE)
/// ```
#[derive(Debug)]
pub struct Bus {
    memory: [Byte; MEMORY_SIZE],
    cartridge: Cartridge,
    joypad: Joypad,
    /// The most recent `Unsupported` banking-control write, if any (spec §7:
    /// "a host may choose to log and continue"). Cleared by `take_pending_warning`.
    pending_warning: Option<CoreError>,
}

impl Bus {
    pub fn new(cartridge: Cartridge, joypad: Joypad) -> Bus {
        let mut bus = Bus {
            memory: [0; MEMORY_SIZE],
            cartridge,
            joypad,
            pending_warning: None,
        };
        bus.reset();
        bus
    }

    /// Restore the documented power-on I/O register state (spec §6).
    pub fn reset(&mut self) {
        self.memory[TIMER_ADDR as usize] = 0x00;
        self.memory[TIMER_MODULATOR_ADDR as usize] = 0x00;
        self.memory[TIMER_CONTROL_ADDR as usize] = 0x00;
        self.memory[LCD_CONTROL_ADDR as usize] = 0x91;
        self.memory[BACKGROUND_SCROLL_Y as usize] = 0x00;
        self.memory[BACKGROUND_SCROLL_X as usize] = 0x00;
        self.memory[CURRENT_SCANLINE_COMPARE_ADDR as usize] = 0x00;
        self.memory[BG_PALETTE_ADDR as usize] = 0xFC;
        self.memory[OBJ_PALETTE_0_ADDR as usize] = 0xFF;
        self.memory[OBJ_PALETTE_1_ADDR as usize] = 0xFF;
        self.memory[WINDOW_POS_Y as usize] = 0x00;
        self.memory[WINDOW_POS_X as usize] = 0x00;
        self.memory[INTERRUPT_FLAG_ADDR as usize] = 0x00;
        self.memory[INTERRUPT_ENABLE_ADDR as usize] = 0x00;
    }

    pub fn read_byte(&self, addr: Word) -> Byte {
        match addr {
            0x0000..=0x7FFF => self.cartridge.get_byte(addr as usize),
            0xA000..=0xBFFF => {
                if self.cartridge.ram_size_kb > 0 {
                    self.memory[addr as usize]
                } else {
                    0xFF
                }
            }
            0xE000..=0xFDFF => self.memory[(addr - 0x2000) as usize],
            0xFEA0..=0xFEFF => 0xFF,
            JOYPAD_REGISTER_ADDR => self.joypad.read(),
            _ => self.memory[addr as usize],
        }
    }

    pub fn write_byte(&mut self, addr: Word, data: Byte) {
        match addr {
            0x0000..=0x7FFF => {
                if let Err(err) = mbc::handle_banking_write(self.cartridge.cartridge_type, addr, data) {
                    warn!("{err}");
                    self.pending_warning = Some(err);
                }
            }
            0xA000..=0xBFFF => {
                if self.cartridge.ram_size_kb > 0 {
                    self.memory[addr as usize] = data;
                }
            }
            0xE000..=0xFDFF => {
                self.memory[(addr - 0x2000) as usize] = data;
            }
            0xFEA0..=0xFEFF => {}
            JOYPAD_REGISTER_ADDR => self.joypad.select(data),
            DIVIDER_REGISTER_ADDR | CURRENT_SCANLINE_ADDR => self.memory[addr as usize] = 0,
            DMA_TRANSFER_ADDR => self.do_dma_transfer(data),
            _ => self.memory[addr as usize] = data,
        }
    }

    pub fn read_word(&self, addr: Word) -> Word {
        let lo = self.read_byte(addr) as Word;
        let hi = self.read_byte(addr.wrapping_add(1)) as Word;
        (hi << 8) | lo
    }

    pub fn write_word(&mut self, addr: Word, data: Word) {
        self.write_byte(addr, (data & 0xFF) as Byte);
        self.write_byte(addr.wrapping_add(1), (data >> 8) as Byte);
    }

    /// Advance LY by one scanline, wrapping past the last of 154 (spec §4.6).
    pub fn advance_scanline(&mut self) -> Byte {
        let next = if self.memory[CURRENT_SCANLINE_ADDR as usize] >= MAX_SCANLINE_VALUE {
            0
        } else {
            self.memory[CURRENT_SCANLINE_ADDR as usize] + 1
        };
        self.memory[CURRENT_SCANLINE_ADDR as usize] = next;
        next
    }

    /// Direct LY write bypassing the "writes clear to zero" rule above, for
    /// the PPU's own scanline bookkeeping.
    pub fn set_scanline(&mut self, value: Byte) {
        self.memory[CURRENT_SCANLINE_ADDR as usize] = value;
    }

    /// Bump DIV by one without triggering the "any write clears it" rule
    /// `write_byte` enforces — only the `Timer` component calls this.
    pub fn bump_divider(&mut self) {
        self.memory[DIVIDER_REGISTER_ADDR as usize] = self.memory[DIVIDER_REGISTER_ADDR as usize].wrapping_add(1);
    }

    pub fn tima(&self) -> Byte {
        self.memory[TIMER_ADDR as usize]
    }

    pub fn set_tima(&mut self, val: Byte) {
        self.memory[TIMER_ADDR as usize] = val;
    }

    pub fn tma(&self) -> Byte {
        self.memory[TIMER_MODULATOR_ADDR as usize]
    }

    pub fn tac(&self) -> Byte {
        self.memory[TIMER_CONTROL_ADDR as usize]
    }

    pub fn joypad_mut(&mut self) -> &mut Joypad {
        &mut self.joypad
    }

    pub fn joypad(&self) -> &Joypad {
        &self.joypad
    }

    pub fn cartridge(&self) -> &Cartridge {
        &self.cartridge
    }

    /// Take and clear the most recent unsupported banking-control write, if any.
    pub fn take_pending_warning(&mut self) -> Option<CoreError> {
        self.pending_warning.take()
    }

    /// Instantaneous OAM DMA transfer (spec §4.1): a write to 0xFF46 with
    /// value `XX` copies 160 bytes from `0xXX00..0xXX9F` into OAM in a single
    /// step, rather than over 160 M-cycles as real hardware does.
    fn do_dma_transfer(&mut self, data: Byte) {
        let start_addr = (data as Word) * 0x100;
        for i in 0..0xA0u16 {
            let byte = self.read_byte(start_addr + i);
            self.memory[0xFE00 + i as usize] = byte;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::Cartridge;

    fn test_bus() -> Bus {
        Bus::new(Cartridge::blank(), Joypad::new())
    }

    #[test]
    fn rom_reads_come_from_the_cartridge() {
        let bus = test_bus();
        assert_eq!(bus.read_byte(0x0104), 0xCE); // start of the Nintendo logo
    }

    #[test]
    fn echo_ram_mirrors_work_ram() {
        let mut bus = test_bus();
        bus.write_byte(0xC010, 0x42);
        assert_eq!(bus.read_byte(0xE010), 0x42);
        bus.write_byte(0xE020, 0x99);
        assert_eq!(bus.read_byte(0xC020), 0x99);
    }

    #[test]
    fn unusable_region_reads_as_ff() {
        let bus = test_bus();
        assert_eq!(bus.read_byte(0xFEA5), 0xFF);
    }

    #[test]
    fn div_write_clears_to_zero() {
        let mut bus = test_bus();
        bus.memory[DIVIDER_REGISTER_ADDR as usize] = 0x55;
        bus.write_byte(DIVIDER_REGISTER_ADDR, 0xFF);
        assert_eq!(bus.read_byte(DIVIDER_REGISTER_ADDR), 0);
    }

    #[test]
    fn ly_write_clears_to_zero() {
        let mut bus = test_bus();
        bus.set_scanline(90);
        bus.write_byte(CURRENT_SCANLINE_ADDR, 12);
        assert_eq!(bus.read_byte(CURRENT_SCANLINE_ADDR), 0);
    }

    #[test]
    fn dma_transfer_copies_160_bytes_into_oam() {
        let mut bus = test_bus();
        for i in 0..0xA0u16 {
            bus.write_byte(0xC100 + i, i as Byte);
        }
        bus.write_byte(DMA_TRANSFER_ADDR, 0xC1);
        for i in 0..0xA0u16 {
            assert_eq!(bus.read_byte(0xFE00 + i), i as Byte);
        }
    }

    #[test]
    fn ram_less_cartridge_treats_external_ram_as_open_bus() {
        let mut bus = test_bus();
        bus.write_byte(0xA000, 0x42);
        assert_eq!(bus.read_byte(0xA000), 0xFF);
    }

    #[test]
    fn rom_write_on_flat_cartridge_is_silently_ignored() {
        let mut bus = test_bus();
        bus.write_byte(0x2000, 0x01);
        assert!(bus.take_pending_warning().is_none());
    }

    #[test]
    fn advance_scanline_wraps_after_153() {
        let mut bus = test_bus();
        bus.set_scanline(MAX_SCANLINE_VALUE);
        assert_eq!(bus.advance_scanline(), 0);
    }
}
