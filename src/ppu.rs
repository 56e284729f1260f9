use bitflags::bitflags;

use crate::bus::Bus;
use crate::interrupts::{request_interrupt, Interrupt};
use crate::utils::*;

bitflags! {
    /// LCDC (0xFF40), decoded bit-for-bit per spec §4.6's "Relevant LCDC bits" table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Lcdc: u8 {
        const LCD_ENABLE          = 0b1000_0000;
        const WINDOW_TILEMAP      = 0b0100_0000;
        const WINDOW_ENABLE       = 0b0010_0000;
        const BG_WINDOW_TILE_DATA = 0b0001_0000;
        const BG_TILEMAP          = 0b0000_1000;
        const OBJ_SIZE            = 0b0000_0100;
        const OBJ_ENABLE          = 0b0000_0010;
        const BG_ENABLE           = 0b0000_0001;
    }
}

bitflags! {
    /// The STAT (0xFF41) interrupt-source enable bits (spec §4.6: "STAT
    /// interrupt sources ... writable via STAT bits 3..6").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct StatSources: u8 {
        const HBLANK      = 0b0000_1000;
        const VBLANK      = 0b0001_0000;
        const OAM         = 0b0010_0000;
        const LYC_EQ_LY   = 0b0100_0000;
    }
}

/// The four STAT mode values a scanline cycles through while the LCD is on
/// (spec §4.6's note that "some mode value" must exist for the STAT
/// interrupt sources to be meaningful, even though the spec only requires
/// per-frame correctness).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LcdMode {
    HBlank = 0,
    VBlank = 1,
    OamScan = 2,
    Transfer = 3,
}

const OAM_SCAN_DOTS: isize = 80;
const TRANSFER_DOTS: isize = 172;

/// One OAM entry, decoded from its 4 raw bytes (spec §3's OAM row, §4.6's
/// sprite composition rules).
#[derive(Debug, Clone, Copy)]
struct SpriteAttr {
    oam_index: usize,
    y: i16,
    x: i16,
    tile_index: Byte,
    priority_behind_bg: bool,
    y_flip: bool,
    x_flip: bool,
    palette_1: bool,
}

/// Reads VRAM tile data, the BG/window tilemaps, and OAM to produce a
/// 256x256 background bitmap and a 160x144 visible framebuffer (spec §4.6).
/// Renders at per-frame granularity: each scanline is composited in full the
/// instant the scheduler's elapsed-cycle budget crosses into it, which
/// satisfies the spec's stated minimum ("this spec requires at minimum
/// per-frame correctness") without claiming pixel-exact mid-scanline FIFO
/// behavior (an explicit non-goal).
#[derive(Debug)]
pub struct Ppu {
    scanline_dots: isize,
    framebuffer: [Shade; (SCREEN_WIDTH * SCREEN_HEIGHT) as usize],
    background: [Shade; (BACKGROUND_WIDTH * BACKGROUND_HEIGHT) as usize],
    frame_ready: bool,
    max_sprites_per_scanline: usize,
}

impl Ppu {
    pub fn new() -> Ppu {
        Ppu::with_sprite_limit(10)
    }

    pub fn with_sprite_limit(max_sprites_per_scanline: usize) -> Ppu {
        Ppu {
            scanline_dots: CYCLES_PER_SCANLINE,
            framebuffer: [Shade::White; (SCREEN_WIDTH * SCREEN_HEIGHT) as usize],
            background: [Shade::White; (BACKGROUND_WIDTH * BACKGROUND_HEIGHT) as usize],
            frame_ready: false,
            max_sprites_per_scanline,
        }
    }

    pub fn framebuffer(&self) -> &[Shade] {
        &self.framebuffer
    }

    /// The full 256x256 background bitmap, independent of SCX/SCY windowing
    /// (spec §6's "optionally a 256x256 background view" debug accessor).
    pub fn background_view(&self) -> &[Shade] {
        &self.background
    }

    /// `true` exactly on the call where LY just crossed 143 -> 144 (the
    /// instant the scheduler should hand the framebuffer to its caller).
    pub fn take_frame_ready(&mut self) -> bool {
        std::mem::replace(&mut self.frame_ready, false)
    }

    /// Advance the PPU by `cycles` M-cycles worth of dots, mirroring STAT
    /// mode and firing VBlank/STAT/LYC interrupts as scanlines complete
    /// (spec §4.6/§4.7).
    pub fn step(&mut self, bus: &mut Bus, cycles: u8) {
        self.update_lcd_status(bus);

        if !self.is_lcd_enabled(bus) {
            return;
        }

        self.scanline_dots -= (cycles as isize) * 4;
        if self.scanline_dots > 0 {
            return;
        }
        self.scanline_dots += CYCLES_PER_SCANLINE;

        let finished_line = bus.read_byte(CURRENT_SCANLINE_ADDR);
        if finished_line < VISIBLE_SCANLINES {
            self.draw_scanline(bus, finished_line);
        }

        let next_line = bus.advance_scanline();
        if next_line == VISIBLE_SCANLINES {
            request_interrupt(bus, Interrupt::VBlank);
            self.frame_ready = true;
        }
    }

    fn lcdc(&self, bus: &Bus) -> Lcdc {
        Lcdc::from_bits_truncate(bus.read_byte(LCD_CONTROL_ADDR))
    }

    fn is_lcd_enabled(&self, bus: &Bus) -> bool {
        self.lcdc(bus).contains(Lcdc::LCD_ENABLE)
    }

    /// Mirror the current scanline into STAT's mode bits and fire the
    /// enabled STAT interrupt sources (spec §4.6: "STAT interrupt sources
    /// ... writable via STAT bits 3..6; any enabled source that becomes true
    /// sets IF bit 1").
    fn update_lcd_status(&mut self, bus: &mut Bus) {
        if !self.is_lcd_enabled(bus) {
            self.scanline_dots = CYCLES_PER_SCANLINE;
            bus.set_scanline(0);
            self.set_mode(bus, LcdMode::HBlank);
            return;
        }

        let scanline = bus.read_byte(CURRENT_SCANLINE_ADDR);
        let previous_mode = self.mode(bus);
        let stat_sources = StatSources::from_bits_truncate(bus.read_byte(LCD_STATUS_ADDR));

        let (mode, stat_enabled) = if scanline >= VISIBLE_SCANLINES {
            (LcdMode::VBlank, stat_sources.contains(StatSources::VBLANK))
        } else if self.scanline_dots > CYCLES_PER_SCANLINE - OAM_SCAN_DOTS {
            (LcdMode::OamScan, stat_sources.contains(StatSources::OAM))
        } else if self.scanline_dots > CYCLES_PER_SCANLINE - OAM_SCAN_DOTS - TRANSFER_DOTS {
            (LcdMode::Transfer, false)
        } else {
            (LcdMode::HBlank, stat_sources.contains(StatSources::HBLANK))
        };

        self.set_mode(bus, mode);
        if mode != previous_mode && stat_enabled {
            request_interrupt(bus, Interrupt::LcdStat);
        }

        let lyc = bus.read_byte(CURRENT_SCANLINE_COMPARE_ADDR);
        let coincidence = scanline == lyc;
        self.set_coincidence_flag(bus, coincidence);
        if coincidence && stat_sources.contains(StatSources::LYC_EQ_LY) {
            request_interrupt(bus, Interrupt::LcdStat);
        }
    }

    fn mode(&self, bus: &Bus) -> LcdMode {
        match bus.read_byte(LCD_STATUS_ADDR) & 0x3 {
            0 => LcdMode::HBlank,
            1 => LcdMode::VBlank,
            2 => LcdMode::OamScan,
            _ => LcdMode::Transfer,
        }
    }

    fn set_mode(&self, bus: &mut Bus, mode: LcdMode) {
        let mut stat = bus.read_byte(LCD_STATUS_ADDR);
        stat = (stat & 0b1111_1100) | (mode as Byte);
        bus.write_byte(LCD_STATUS_ADDR, stat);
    }

    fn set_coincidence_flag(&self, bus: &mut Bus, val: bool) {
        let mut stat = bus.read_byte(LCD_STATUS_ADDR);
        assign_bit(&mut stat, 2, val);
        bus.write_byte(LCD_STATUS_ADDR, stat);
    }

    fn draw_scanline(&mut self, bus: &Bus, line: Byte) {
        let lcdc = self.lcdc(bus);
        if lcdc.contains(Lcdc::BG_ENABLE) {
            self.render_background_line(bus, line, lcdc);
        } else {
            let row = line as usize * SCREEN_WIDTH as usize;
            self.framebuffer[row..row + SCREEN_WIDTH as usize].fill(Shade::White);
        }
        if lcdc.contains(Lcdc::OBJ_ENABLE) {
            self.render_sprites_line(bus, line, lcdc);
        }
    }

    /// Render one row of the 256x256 background bitmap and copy the visible
    /// 160-pixel window of it (SCX, SCY, wrapping mod 256) into the
    /// framebuffer (spec §4.6's background composition + SCX/SCY wrap).
    fn render_background_line(&mut self, bus: &Bus, line: Byte, lcdc: Lcdc) {
        let scy = bus.read_byte(BACKGROUND_SCROLL_Y);
        let scx = bus.read_byte(BACKGROUND_SCROLL_X);
        let bg_y = line.wrapping_add(scy);

        let window_enabled = lcdc.contains(Lcdc::WINDOW_ENABLE);
        let wy = bus.read_byte(WINDOW_POS_Y);
        let wx = bus.read_byte(WINDOW_POS_X) as i16 - 7;
        let drawing_window_this_line = window_enabled && wy <= line;

        let bg_tilemap = if lcdc.contains(Lcdc::BG_TILEMAP) { 0x9C00 } else { 0x9800 };
        let window_tilemap = if lcdc.contains(Lcdc::WINDOW_TILEMAP) { 0x9C00 } else { 0x9800 };
        let tile_data_unsigned = lcdc.contains(Lcdc::BG_WINDOW_TILE_DATA);

        for screen_x in 0..SCREEN_WIDTH as i16 {
            let (tilemap_base, tile_y, tile_x) = if drawing_window_this_line && screen_x >= wx {
                let wy_rel = line.wrapping_sub(wy);
                let wx_rel = (screen_x - wx) as u8;
                (window_tilemap, wy_rel, wx_rel)
            } else {
                let bg_x = (screen_x as u8).wrapping_add(scx);
                (bg_tilemap, bg_y, bg_x)
            };

            let shade = self.tile_pixel(bus, tilemap_base, tile_y, tile_x, tile_data_unsigned, BG_PALETTE_ADDR);
            self.framebuffer[line as usize * SCREEN_WIDTH as usize + screen_x as usize] = shade;
        }

        // Also populate the full 256x256 background view (SCX/SCY-independent) for
        // the debug accessor, using the background tilemap regardless of window state.
        for x in 0..256u16 {
            let shade = self.tile_pixel(bus, bg_tilemap, bg_y, x as u8, tile_data_unsigned, BG_PALETTE_ADDR);
            self.background[bg_y as usize * 256 + x as usize] = shade;
        }
    }

    /// Fetch the tile-data-relative color index for one pixel of one tile
    /// row, then map it through `palette_addr` (spec §4.6 tile format).
    fn tile_pixel(
        &self,
        bus: &Bus,
        tilemap_base: Word,
        row: Byte,
        col: Byte,
        tile_data_unsigned: bool,
        palette_addr: Word,
    ) -> Shade {
        let tile_col = (col / 8) as u16;
        let tile_row = (row / 8) as u16;
        let tile_index = bus.read_byte(tilemap_base + tile_row * 32 + tile_col);

        let tile_addr = if tile_data_unsigned {
            0x8000 + (tile_index as Word) * 16
        } else {
            let signed = tile_index as SignedByte;
            (0x9000i32 + (signed as i32) * 16) as Word
        };

        let line_addr = tile_addr + ((row % 8) as Word) * 2;
        let lo = bus.read_byte(line_addr);
        let hi = bus.read_byte(line_addr + 1);
        let bit = 7 - (col % 8);
        let color_index = color_index(lo, hi, bit);
        shade_from_palette(bus.read_byte(palette_addr), color_index)
    }

    /// Select, sort, and draw up to `max_sprites_per_scanline` sprites that
    /// intersect `line` (spec §4.6's 10-sprite cap, X/OAM-index tie-break,
    /// 8x16 tile pairing, and priority-behind-BG rule).
    fn render_sprites_line(&mut self, bus: &Bus, line: Byte, lcdc: Lcdc) {
        let tall = lcdc.contains(Lcdc::OBJ_SIZE);
        let sprite_height: i16 = if tall { 16 } else { 8 };

        let mut candidates: Vec<SpriteAttr> = Vec::with_capacity(40);
        for i in 0..40usize {
            let base = 0xFE00 + (i as Word) * 4;
            let y_raw = bus.read_byte(base) as i16 - 16;
            let x_raw = bus.read_byte(base + 1) as i16 - 8;
            let tile_index = bus.read_byte(base + 2);
            let attrs = bus.read_byte(base + 3);

            if (line as i16) < y_raw || (line as i16) >= y_raw + sprite_height {
                continue;
            }

            candidates.push(SpriteAttr {
                oam_index: i,
                y: y_raw,
                x: x_raw,
                tile_index,
                priority_behind_bg: is_bit_set(attrs, 7),
                y_flip: is_bit_set(attrs, 6),
                x_flip: is_bit_set(attrs, 5),
                palette_1: is_bit_set(attrs, 4),
            });
        }

        // "if more have overlapping Y, keep the first 10 in OAM order" (spec §4.6).
        candidates.truncate(self.max_sprites_per_scanline);
        // "smaller X wins; on equal X, the earlier OAM index wins" -- draw
        // lowest-priority (largest X / later index) first so higher-priority
        // sprites overwrite them.
        candidates.sort_by(|a, b| b.x.cmp(&a.x).then(b.oam_index.cmp(&a.oam_index)));

        for sprite in candidates {
            self.draw_sprite_row(bus, line, sprite, tall);
        }
    }

    fn draw_sprite_row(&mut self, bus: &Bus, line: Byte, sprite: SpriteAttr, tall: bool) {
        let mut row_in_sprite = (line as i16) - sprite.y;
        if sprite.y_flip {
            let height = if tall { 16 } else { 8 };
            row_in_sprite = height - 1 - row_in_sprite;
        }

        let tile_index = if tall {
            if row_in_sprite < 8 {
                sprite.tile_index & 0xFE
            } else {
                sprite.tile_index | 0x01
            }
        } else {
            sprite.tile_index
        };
        let row_in_tile = (row_in_sprite % 8) as Word;

        let tile_addr = 0x8000 + (tile_index as Word) * 16;
        let line_addr = tile_addr + row_in_tile * 2;
        let lo = bus.read_byte(line_addr);
        let hi = bus.read_byte(line_addr + 1);

        let palette_addr = if sprite.palette_1 { OBJ_PALETTE_1_ADDR } else { OBJ_PALETTE_0_ADDR };
        let palette = bus.read_byte(palette_addr);

        for col in 0..8i16 {
            let bit = if sprite.x_flip { col as u8 } else { 7 - col as u8 };
            let color_index = color_index(lo, hi, bit);
            if color_index == 0 {
                // Transparent, independent of the shade that palette entry would produce (spec §4.6).
                continue;
            }

            let screen_x = sprite.x + col;
            if screen_x < 0 || screen_x >= SCREEN_WIDTH as i16 {
                continue;
            }

            let fb_index = line as usize * SCREEN_WIDTH as usize + screen_x as usize;
            if sprite.priority_behind_bg {
                let bg_color_is_zero = self.background_color_index_zero_at(bus, line, screen_x as u8);
                if !bg_color_is_zero {
                    continue;
                }
            }

            self.framebuffer[fb_index] = shade_from_palette(palette, color_index);
        }
    }

    /// Re-derive whether the BG/window color index (not the post-palette
    /// shade) at this screen pixel is 0, for the sprite priority-behind-BG
    /// rule (spec §4.6: "sprite pixels draw only where the BG color index is
    /// 0" -- this is the raw 2-bit index, not the resolved shade).
    fn background_color_index_zero_at(&self, bus: &Bus, line: Byte, screen_x: Byte) -> bool {
        let lcdc = self.lcdc(bus);
        if !lcdc.contains(Lcdc::BG_ENABLE) {
            return true;
        }

        let scy = bus.read_byte(BACKGROUND_SCROLL_Y);
        let scx = bus.read_byte(BACKGROUND_SCROLL_X);
        let bg_y = line.wrapping_add(scy);

        let window_enabled = lcdc.contains(Lcdc::WINDOW_ENABLE);
        let wy = bus.read_byte(WINDOW_POS_Y);
        let wx = bus.read_byte(WINDOW_POS_X) as i16 - 7;
        let drawing_window = window_enabled && wy <= line && (screen_x as i16) >= wx;

        let (tilemap_base, tile_y, tile_x) = if drawing_window {
            (
                if lcdc.contains(Lcdc::WINDOW_TILEMAP) { 0x9C00 } else { 0x9800 },
                line.wrapping_sub(wy),
                (screen_x as i16 - wx) as u8,
            )
        } else {
            (
                if lcdc.contains(Lcdc::BG_TILEMAP) { 0x9C00 } else { 0x9800 },
                bg_y,
                screen_x.wrapping_add(scx),
            )
        };

        let tile_data_unsigned = lcdc.contains(Lcdc::BG_WINDOW_TILE_DATA);
        let tile_col = (tile_x / 8) as u16;
        let tile_row = (tile_y / 8) as u16;
        let tile_index = bus.read_byte(tilemap_base + tile_row * 32 + tile_col);
        let tile_addr = if tile_data_unsigned {
            0x8000 + (tile_index as Word) * 16
        } else {
            let signed = tile_index as SignedByte;
            (0x9000i32 + (signed as i32) * 16) as Word
        };
        let line_addr = tile_addr + ((tile_y % 8) as Word) * 2;
        let lo = bus.read_byte(line_addr);
        let hi = bus.read_byte(line_addr + 1);
        let bit = 7 - (tile_x % 8);
        color_index(lo, hi, bit) == 0
    }
}

impl Default for Ppu {
    fn default() -> Ppu {
        Ppu::new()
    }
}

/// Two-bitplane tile decoding: bit-0 plane in `lo`, bit-1 plane in `hi`,
/// MSB = leftmost pixel (spec §4.6 "Tile format").
fn color_index(lo: Byte, hi: Byte, bit: Byte) -> u8 {
    let lsb = get_bit_val(lo, bit as usize);
    let msb = get_bit_val(hi, bit as usize);
    (msb << 1) | lsb
}

/// `shade = (palette >> (2*index)) & 3` (spec §4.6).
fn shade_from_palette(palette: Byte, color_index: u8) -> Shade {
    Shade::from_index((palette >> (2 * color_index)) & 0x3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::Cartridge;
    use crate::joypad::Joypad;

    fn test_bus() -> Bus {
        let mut bus = Bus::new(Cartridge::blank(), Joypad::new());
        bus.write_byte(LCD_CONTROL_ADDR, 0b1001_0001); // LCD on, BG on, tile data unsigned
        bus.write_byte(BG_PALETTE_ADDR, 0b11_10_01_00); // identity-ish palette
        bus
    }

    fn write_tile(bus: &mut Bus, tile_index: u8, bytes: [Byte; 16]) {
        let addr = 0x8000 + (tile_index as Word) * 16;
        for (i, b) in bytes.iter().enumerate() {
            bus.write_byte(addr + i as Word, *b);
        }
    }

    #[test]
    fn all_zero_tile_renders_shade_zero() {
        let mut bus = test_bus();
        write_tile(&mut bus, 0, [0; 16]);
        // tilemap at 0x9800 defaults to tile 0 everywhere.
        let mut ppu = Ppu::new();
        ppu.draw_scanline(&bus, 0);
        for x in 0..8 {
            assert_eq!(ppu.framebuffer[x], Shade::White);
        }
    }

    #[test]
    fn all_ff_tile_renders_shade_three() {
        let mut bus = test_bus();
        write_tile(&mut bus, 0, [0xFF; 16]);
        let mut ppu = Ppu::new();
        ppu.draw_scanline(&bus, 0);
        for x in 0..8 {
            assert_eq!(ppu.framebuffer[x], Shade::Black);
        }
    }

    #[test]
    fn scx_scy_scroll_wraps_modulo_256() {
        let mut bus = test_bus();
        // Put a distinctive tile at the far edge of the tilemap (col 31, row 31)
        // and scroll so pixel (0,0) of the viewport lands exactly there.
        write_tile(&mut bus, 1, [0xFF; 16]);
        bus.write_byte(0x9800 + 31 * 32 + 31, 1);
        bus.write_byte(BACKGROUND_SCROLL_X, 248); // 31*8
        bus.write_byte(BACKGROUND_SCROLL_Y, 248);
        let mut ppu = Ppu::new();
        ppu.draw_scanline(&bus, 0);
        assert_eq!(ppu.framebuffer[0], Shade::Black);
    }

    #[test]
    fn vblank_interrupt_fires_on_144th_line() {
        let mut bus = test_bus();
        bus.write_byte(INTERRUPT_ENABLE_ADDR, 0x00);
        let mut ppu = Ppu::new();
        for _ in 0..144 {
            ppu.step(&mut bus, CYCLES_PER_SCANLINE as u8 / 4);
        }
        assert!(is_bit_set(bus.read_byte(INTERRUPT_FLAG_ADDR), Interrupt::VBlank.bit()));
        assert!(ppu.take_frame_ready());
    }

    #[test]
    fn sprite_cap_keeps_only_first_ten_in_oam_order() {
        let mut bus = test_bus();
        write_tile(&mut bus, 2, [0xFF; 16]);
        // Each sprite is a full opaque 8-pixel-wide tile; space them 8 pixels
        // apart (non-overlapping columns) so the cap's effect is visible per-sprite.
        for i in 0..12u16 {
            let base = 0xFE00 + i * 4;
            bus.write_byte(base, 16); // y=0 on-screen
            bus.write_byte(base + 1, (8 + i * 8) as Byte); // on-screen x == i*8, one sprite per 8-wide column
            bus.write_byte(base + 2, 2);
            bus.write_byte(base + 3, 0);
        }
        let mut ppu = Ppu::new();
        ppu.draw_scanline(&bus, 0);
        // Sprites 0..10 (OAM order) are within the 10-sprite cap and drawn, covering columns 0..80.
        for x in 0..80 {
            assert_eq!(ppu.framebuffer[x], Shade::Black, "column {x} should be drawn by an in-cap sprite");
        }
        // Sprites 10 and 11 exceed the cap and are never drawn; background shows through at columns 80..96.
        assert_eq!(ppu.framebuffer[80], Shade::White);
        assert_eq!(ppu.framebuffer[88], Shade::White);
    }

    #[test]
    fn sprite_color_zero_is_transparent() {
        let mut bus = test_bus();
        write_tile(&mut bus, 3, [0x00; 16]); // color index 0 everywhere
        bus.write_byte(0xFE00, 16);
        bus.write_byte(0xFE01, 8);
        bus.write_byte(0xFE02, 3);
        bus.write_byte(0xFE03, 0);
        write_tile(&mut bus, 0, [0xFF; 16]); // BG tile is all color-3
        let mut ppu = Ppu::new();
        ppu.draw_scanline(&bus, 0);
        // BG shows through since the sprite pixel is transparent.
        assert_eq!(ppu.framebuffer[0], Shade::Black);
    }

    #[test]
    fn tall_sprite_pairs_tiles_with_low_bit_forced() {
        let mut bus = test_bus();
        bus.write_byte(LCD_CONTROL_ADDR, 0b1001_0111); // LCD+BG+sprites on, tall sprites
        write_tile(&mut bus, 4, [0x00; 16]); // top tile: transparent
        write_tile(&mut bus, 5, [0xFF; 16]); // bottom tile: opaque black
        bus.write_byte(0xFE00, 16); // y on-screen = 0
        bus.write_byte(0xFE01, 8);
        bus.write_byte(0xFE02, 5); // odd index; low bit forced off/on per row half
        bus.write_byte(0xFE03, 0);
        let mut ppu = Ppu::new();
        ppu.draw_scanline(&bus, 9); // second row of the bottom (odd) tile
        assert_eq!(ppu.framebuffer[0], Shade::Black);
    }
}
