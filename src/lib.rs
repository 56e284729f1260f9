//! `dotmatrix-core`: a CPU interpreter, memory/timing subsystem, and PPU
//! tile/sprite renderer for a handheld 8-bit console with an LR35902-family
//! CPU. The host (window/audio/input backend, ROM file I/O, debugger,
//! save-states) is explicitly out of scope; this crate is the part that
//! loads a cartridge image, executes it, and produces a framebuffer.

#[macro_use]
extern crate lazy_static;

pub mod bus;
pub mod cartridge;
pub mod cpu;
pub mod error;
pub mod interrupts;
pub mod joypad;
pub mod mbc;
pub mod ppu;
pub mod registers;
pub mod scheduler;
pub mod timer;
pub mod utils;

pub use bus::Bus;
pub use cartridge::{Cartridge, CartridgeType};
pub use cpu::{Cpu, CpuMode};
pub use error::{CoreError, RomLoadError};
pub use interrupts::Interrupt;
pub use joypad::{JoyButton, Joypad};
pub use ppu::Ppu;
pub use registers::Registers;
pub use scheduler::Scheduler;
pub use timer::Timer;
pub use utils::Shade;

/// Tunables an embedding host/test may want to override without
/// recompiling (spec §8.9's ambient configuration surface; deliberately
/// minimal since CLI/file parsing is out of scope, spec §1).
#[derive(Debug, Clone, Copy)]
pub struct EmulatorConfig {
    /// When `false`, `Cartridge::load` skips the header checksum check
    /// (the Nintendo logo check and minimum-length check still apply).
    /// Useful for homebrew/test ROMs with a deliberately wrong checksum.
    pub strict_header_checksum: bool,
    /// Overrides the spec's 10-sprite-per-scanline cap (spec §4.6).
    pub max_sprites_per_scanline: u8,
}

impl Default for EmulatorConfig {
    fn default() -> EmulatorConfig {
        EmulatorConfig {
            strict_header_checksum: true,
            max_sprites_per_scanline: 10,
        }
    }
}

/// Load a cartridge and build a ready-to-run `Scheduler`, honoring
/// `config`'s tunables. This is the crate's single entry point for a host
/// that just wants to hand over ROM bytes and start pumping frames.
pub fn load(bytes: &[u8], config: EmulatorConfig) -> Result<Scheduler, CoreError> {
    let cartridge = if config.strict_header_checksum {
        Cartridge::load(bytes)?
    } else {
        Cartridge::load_permissive(bytes)?
    };
    Ok(Scheduler::with_sprite_limit(cartridge, config.max_sprites_per_scanline))
}
