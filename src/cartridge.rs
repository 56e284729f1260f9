use log::{debug, warn};

use crate::error::{CoreError, RomLoadError};
use crate::utils::*;

pub const HEADER_NINTENDO_LOGO: Word = 0x0104;
pub const HEADER_LOGO_END: Word = 0x0133;
pub const HEADER_TITLE_START: Word = 0x0134;
pub const HEADER_TITLE_END: Word = 0x0143;
pub const HEADER_CARTRIDGE_TYPE: Word = 0x0147;
pub const HEADER_ROM_SIZE: Word = 0x0148;
pub const HEADER_RAM_SIZE: Word = 0x0149;
pub const HEADER_CHECKSUM_START: Word = 0x0134;
pub const HEADER_CHECKSUM_END: Word = 0x014C;
pub const HEADER_CHECKSUM_ADDR: Word = 0x014D;
pub const MINIMUM_ROM_LENGTH: usize = 0x0150;

/// The 48-byte Nintendo logo bitmap every valid cartridge header embeds at
/// 0x0104..0x0133 (spec §3's Cartridge image invariant).
pub const NINTENDO_LOGO: [Byte; 48] = [
    0xCE, 0xED, 0x66, 0x66, 0xCC, 0x0D, 0x00, 0x0B, 0x03, 0x73, 0x00, 0x83, 0x00, 0x0C, 0x00, 0x0D,
    0x00, 0x08, 0x11, 0x1F, 0x88, 0x89, 0x00, 0x0E, 0xDC, 0xCC, 0x6E, 0xE6, 0xDD, 0xDD, 0xD9, 0x99,
    0xBB, 0xBB, 0x67, 0x63, 0x6E, 0x0E, 0xEC, 0xCC, 0xDD, 0xDC, 0x99, 0x9F, 0xBB, 0xB9, 0x33, 0x3E,
];

/// Only the flat 32 KiB case (spec §1's "out of scope: Memory bank
/// controllers beyond the flat 32 KiB case") is fully supported; other
/// header-valid types load but trap on any banking-control write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartridgeType {
    RomOnly,
    Other(Byte),
}

/// `-1 - sum(bytes) mod 256`, computed by the equivalent running
/// subtraction the hardware boot ROM uses (spec §3/§6).
fn header_checksum(bytes: &[Byte]) -> Byte {
    let mut checksum: Byte = 0;
    for &b in bytes {
        checksum = checksum.wrapping_sub(b).wrapping_sub(1);
    }
    checksum
}

impl CartridgeType {
    fn from_header_byte(byte: Byte) -> CartridgeType {
        match byte {
            0x00 => CartridgeType::RomOnly,
            other => CartridgeType::Other(other),
        }
    }

    pub fn is_flat_rom(self) -> bool {
        matches!(self, CartridgeType::RomOnly)
    }
}

/// A loaded cartridge image plus its parsed header metadata (spec §3, §6).
#[derive(Debug, Clone)]
pub struct Cartridge {
    data: Vec<Byte>,
    pub title: String,
    pub cartridge_type: CartridgeType,
    pub rom_size_banks: u16,
    pub ram_size_kb: u32,
}

impl Cartridge {
    /// Parse and validate a raw cartridge image (spec §6's header checks).
    pub fn load(bytes: &[Byte]) -> Result<Cartridge, CoreError> {
        Cartridge::load_with_checksum_policy(bytes, true)
    }

    /// As [`Cartridge::load`], but skips the header checksum gate (still
    /// enforces the minimum length and Nintendo logo checks). For
    /// `EmulatorConfig::strict_header_checksum = false` (homebrew/test ROMs
    /// with a deliberately wrong checksum byte).
    pub fn load_permissive(bytes: &[Byte]) -> Result<Cartridge, CoreError> {
        Cartridge::load_with_checksum_policy(bytes, false)
    }

    fn load_with_checksum_policy(bytes: &[Byte], enforce_checksum: bool) -> Result<Cartridge, CoreError> {
        if bytes.len() < MINIMUM_ROM_LENGTH {
            return Err(RomLoadError::TooSmall { len: bytes.len() }.into());
        }

        let logo = &bytes[HEADER_NINTENDO_LOGO as usize..=HEADER_LOGO_END as usize];
        if logo != NINTENDO_LOGO {
            return Err(RomLoadError::LogoMismatch.into());
        }

        if enforce_checksum {
            let checksum_region = &bytes[HEADER_CHECKSUM_START as usize..=HEADER_CHECKSUM_END as usize];
            let computed = header_checksum(checksum_region);
            let expected = bytes[HEADER_CHECKSUM_ADDR as usize];
            if computed != expected {
                return Err(RomLoadError::HeaderChecksumMismatch { expected, computed }.into());
            }
        }

        let cartridge_type = CartridgeType::from_header_byte(bytes[HEADER_CARTRIDGE_TYPE as usize]);
        let title_bytes = &bytes[HEADER_TITLE_START as usize..=HEADER_TITLE_END as usize];
        let title = String::from_utf8_lossy(title_bytes)
            .trim_end_matches('\0')
            .to_string();

        let rom_size_banks = match bytes[HEADER_ROM_SIZE as usize] {
            code @ 0x00..=0x08 => 2u16 << code,
            other => {
                warn!("unrecognized ROM size code 0x{:02X}, assuming 2 banks", other);
                2
            }
        };
        let ram_size_kb = match bytes[HEADER_RAM_SIZE as usize] {
            0x02 => 8,
            0x03 => 32,
            0x04 => 128,
            0x05 => 64,
            _ => 0,
        };

        debug!(
            "loaded cartridge '{}' type={:?} rom_banks={} ram_kb={}",
            title, cartridge_type, rom_size_banks, ram_size_kb
        );

        Ok(Cartridge {
            data: bytes.to_vec(),
            title,
            cartridge_type,
            rom_size_banks,
            ram_size_kb,
        })
    }

    /// A zeroed 32 KiB cartridge with a valid header, for tests that need a
    /// `Bus`/`Cpu` but don't care about ROM-loading semantics.
    pub fn blank() -> Cartridge {
        let mut bytes = vec![0u8; 0x8000];
        bytes[HEADER_NINTENDO_LOGO as usize..=HEADER_LOGO_END as usize].copy_from_slice(&NINTENDO_LOGO);
        let region = &bytes[HEADER_CHECKSUM_START as usize..=HEADER_CHECKSUM_END as usize];
        bytes[HEADER_CHECKSUM_ADDR as usize] = header_checksum(region);
        Cartridge::load(&bytes).expect("synthetic blank cartridge header must validate")
    }

    pub fn get_byte(&self, addr: usize) -> Byte {
        self.data.get(addr).copied().unwrap_or(0xFF)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
