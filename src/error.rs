use thiserror::Error;

use crate::utils::Word;

/// Failure reasons for a rejected cartridge image (spec §7 `RomLoad`).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RomLoadError {
    #[error("ROM is only {len} bytes, need at least 0x150")]
    TooSmall { len: usize },

    #[error("Nintendo logo bytes at 0x0104..0x0133 do not match the fixed constant")]
    LogoMismatch,

    #[error("header checksum mismatch: expected 0x{expected:02X}, computed 0x{computed:02X}")]
    HeaderChecksumMismatch { expected: u8, computed: u8 },
}

/// Unified error type threaded through cartridge loading, bus writes, and
/// instruction execution (spec §7).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CoreError {
    #[error("ROM load failed: {0}")]
    RomLoad(#[from] RomLoadError),

    #[error("illegal opcode 0x{opcode:02X} at pc=0x{pc:04X}")]
    FatalCpu { pc: Word, opcode: u8 },

    #[error("unsupported: {0}")]
    Unsupported(String),
}
