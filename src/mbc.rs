use crate::cartridge::CartridgeType;
use crate::error::CoreError;
use crate::utils::*;

/// Banking-control writes land in 0x0000..0x7FFF. For a ROM-only cartridge
/// they are simply mapper control with nothing behind it, so they no-op
/// (spec §4.1: "treat as no-op in core spec"). Any other cartridge type
/// implies a mapper (MBC1/3/5) this spec explicitly does not implement
/// (spec §1's out-of-scope list), so the write is surfaced as `Unsupported`
/// rather than silently swallowed (spec §7).
pub fn handle_banking_write(cartridge_type: CartridgeType, addr: Word, data: Byte) -> Result<(), CoreError> {
    match cartridge_type {
        CartridgeType::RomOnly => Ok(()),
        CartridgeType::Other(code) => Err(CoreError::Unsupported(format!(
            "cartridge type 0x{code:02X} has no flat-ROM mapping; bank-control write 0x{data:02X} at 0x{addr:04X} ignored"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rom_only_banking_write_is_a_no_op() {
        assert!(handle_banking_write(CartridgeType::RomOnly, 0x2000, 0x01).is_ok());
    }

    #[test]
    fn mapper_cartridge_banking_write_is_unsupported() {
        let err = handle_banking_write(CartridgeType::Other(0x01), 0x2000, 0x01).unwrap_err();
        assert!(matches!(err, CoreError::Unsupported(_)));
    }
}
