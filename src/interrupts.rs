use crate::bus::Bus;
use crate::utils::*;

/// The five interrupt sources, ordered by priority (lowest bit wins ties),
/// per spec §4.4/§4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    VBlank,
    LcdStat,
    Timer,
    Serial,
    Joypad,
}

pub const AVAILABLE_INTERRUPTS: [Interrupt; 5] = [
    Interrupt::VBlank,
    Interrupt::LcdStat,
    Interrupt::Timer,
    Interrupt::Serial,
    Interrupt::Joypad,
];

impl Interrupt {
    pub fn bit(self) -> usize {
        match self {
            Interrupt::VBlank => 0,
            Interrupt::LcdStat => 1,
            Interrupt::Timer => 2,
            Interrupt::Serial => 3,
            Interrupt::Joypad => 4,
        }
    }

    /// The fixed service vector this interrupt jumps to (spec §4.2).
    pub fn vector(self) -> Word {
        match self {
            Interrupt::VBlank => 0x0040,
            Interrupt::LcdStat => 0x0048,
            Interrupt::Timer => 0x0050,
            Interrupt::Serial => 0x0058,
            Interrupt::Joypad => 0x0060,
        }
    }
}

/// Set the corresponding bit in IF, regardless of IE (spec §4.4: "a source is
/// raised by setting the corresponding bit in IF, regardless of IE").
pub fn request_interrupt(bus: &mut Bus, interrupt: Interrupt) {
    let mut flags = bus.read_byte(INTERRUPT_FLAG_ADDR);
    set_bit(&mut flags, interrupt.bit());
    bus.write_byte(INTERRUPT_FLAG_ADDR, flags);
}

/// Any source that is both requested (IF) and enabled (IE), regardless of
/// IME — used by the HALT wake-up check (spec §4.2).
pub fn has_pending_interrupt(bus: &Bus) -> bool {
    pending_mask(bus) != 0
}

/// The lowest-numbered pending, enabled interrupt, if any (spec §4.4's
/// dispatch priority: "pick the lowest-numbered bit set").
pub fn highest_priority_interrupt(bus: &Bus) -> Option<Interrupt> {
    let mask = pending_mask(bus);
    AVAILABLE_INTERRUPTS
        .iter()
        .copied()
        .find(|i| is_bit_set(mask, i.bit()))
}

fn pending_mask(bus: &Bus) -> Byte {
    let flags = bus.read_byte(INTERRUPT_FLAG_ADDR);
    let enabled = bus.read_byte(INTERRUPT_ENABLE_ADDR);
    flags & enabled & 0x1F
}

/// Clear the bit for `interrupt` in IF (done once dispatch begins).
pub fn clear_request(bus: &mut Bus, interrupt: Interrupt) {
    let mut flags = bus.read_byte(INTERRUPT_FLAG_ADDR);
    reset_bit(&mut flags, interrupt.bit());
    bus.write_byte(INTERRUPT_FLAG_ADDR, flags);
}
