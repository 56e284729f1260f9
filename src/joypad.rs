use crate::utils::*;

/// The eight physical buttons (spec §4.5, §6 "Input surface").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoyButton {
    Right,
    Left,
    Up,
    Down,
    A,
    B,
    Select,
    Start,
}

const DIRECTION_BUTTONS: [JoyButton; 4] = [
    JoyButton::Right,
    JoyButton::Left,
    JoyButton::Up,
    JoyButton::Down,
];

const ACTION_BUTTONS: [JoyButton; 4] = [JoyButton::A, JoyButton::B, JoyButton::Select, JoyButton::Start];

/// Tracks which of the eight buttons are currently pressed and produces the
/// nibble the CPU reads back through register 0xFF00, selected by whichever
/// row (direction/action) the game last asked for.
#[derive(Debug, Clone)]
pub struct Joypad {
    pressed: [bool; 8],
    select_directions: bool,
    select_actions: bool,
}

fn button_index(button: JoyButton) -> usize {
    match button {
        JoyButton::Right => 0,
        JoyButton::Left => 1,
        JoyButton::Up => 2,
        JoyButton::Down => 3,
        JoyButton::A => 4,
        JoyButton::B => 5,
        JoyButton::Select => 6,
        JoyButton::Start => 7,
    }
}

impl Joypad {
    pub fn new() -> Joypad {
        Joypad {
            pressed: [false; 8],
            select_directions: false,
            select_actions: false,
        }
    }

    /// Write the selector bits (bits 4-5 of 0xFF00, active low).
    pub fn select(&mut self, value: Byte) {
        self.select_directions = !is_bit_set(value, 4);
        self.select_actions = !is_bit_set(value, 5);
    }

    /// Compute the full byte read back from 0xFF00: bits 6-7 read as 1, bits
    /// 4-5 echo the selector state, bits 0-3 are the selected row (0 = pressed).
    pub fn read(&self) -> Byte {
        let mut row = 0x0Fu8;
        if self.select_directions {
            row &= self.row_bits(&DIRECTION_BUTTONS);
        }
        if self.select_actions {
            row &= self.row_bits(&ACTION_BUTTONS);
        }

        let mut value = 0xC0u8;
        if !self.select_directions {
            set_bit(&mut value, 4);
        }
        if !self.select_actions {
            set_bit(&mut value, 5);
        }
        value | (row & 0x0F)
    }

    fn row_bits(&self, buttons: &[JoyButton; 4]) -> Byte {
        let mut bits = 0x0Fu8;
        for (i, button) in buttons.iter().enumerate() {
            if self.pressed[button_index(*button)] {
                reset_bit(&mut bits, i);
            }
        }
        bits
    }

    /// Press a button. Returns `true` if this is a 1->0 transition on a
    /// currently-selected row bit, which the caller should surface as a
    /// Joypad interrupt request (spec §4.5).
    pub fn press(&mut self, button: JoyButton) -> bool {
        let before = self.read();
        self.pressed[button_index(button)] = true;
        let after = self.read();
        Self::has_falling_edge(before, after)
    }

    pub fn release(&mut self, button: JoyButton) {
        self.pressed[button_index(button)] = false;
    }

    fn has_falling_edge(before: Byte, after: Byte) -> bool {
        for bit in 0..4 {
            if is_bit_set(before, bit) && !is_bit_set(after, bit) {
                return true;
            }
        }
        false
    }
}

impl Default for Joypad {
    fn default() -> Joypad {
        Joypad::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unselected_row_reads_as_unpressed() {
        let pad = Joypad::new();
        assert_eq!(pad.read(), 0xFF);
    }

    #[test]
    fn direction_row_reflects_pressed_button() {
        let mut pad = Joypad::new();
        pad.select(0b1110_1111); // select directions (bit 4 = 0, bit 5 = 1)
        pad.press(JoyButton::Up);
        let value = pad.read();
        assert!(!is_bit_set(value, 2)); // up bit cleared
        assert!(is_bit_set(value, 0)); // right remains unpressed
    }

    #[test]
    fn press_reports_falling_edge_only_on_selected_row() {
        let mut pad = Joypad::new();
        pad.select(0b1110_1111); // directions selected, actions not
        assert!(!pad.press(JoyButton::A)); // action row not selected: no edge visible
        assert!(pad.press(JoyButton::Right));
        // Already pressed; no new transition.
        assert!(!pad.press(JoyButton::Right));
    }
}
