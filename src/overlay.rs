//! Synthetic telemetry overlay: a wall-clock stamp, optionally followed by
//! the latest operator control state, burnt into the frame.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::capture::TargetEncoding;
use crate::control::ControlState;

const GLYPH_W: usize = 5;
const GLYPH_H: usize = 7;
const GLYPH_GAP: usize = 1;
const LINE_GAP: usize = 2;
const MARGIN: usize = 16;

const LUMA_WHITE: u8 = 235;
const CHROMA_NEUTRAL: u8 = 128;

/// 5x7 bitmaps, one byte per row, bit 4 is the leftmost column.
const DIGITS: [[u8; GLYPH_H]; 10] = [
    [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
    [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
    [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
    [0x1E, 0x01, 0x01, 0x06, 0x01, 0x01, 0x1E],
    [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
    [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
    [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
    [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
    [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
    [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
];
const LETTERS: [[u8; GLYPH_H]; 26] = [
    [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
    [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
    [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
    [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
    [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
    [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
    [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
    [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
    [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
    [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
    [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
    [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
    [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
    [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
    [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
    [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
    [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
    [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
    [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
    [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
    [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
    [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
    [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
    [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
    [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
    [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
];
const COLON: [u8; GLYPH_H] = [0x00, 0x04, 0x04, 0x00, 0x04, 0x04, 0x00];
const DOT: [u8; GLYPH_H] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00];
const MINUS: [u8; GLYPH_H] = [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00];

/// Letters render upper case
fn glyph(ch: char) -> Option<&'static [u8; GLYPH_H]> {
    match ch.to_ascii_uppercase() {
        c @ '0'..='9' => Some(&DIGITS[c as usize - '0' as usize]),
        c @ 'A'..='Z' => Some(&LETTERS[c as usize - 'A' as usize]),
        ':' => Some(&COLON),
        '.' => Some(&DOT),
        '-' => Some(&MINUS),
        _ => None,
    }
}

/// Gear, throttle, brake and control latency as overlay lines.
///
/// Latency is `now_ms` minus the console timestamp; it reads `LAT -` until a
/// timestamped message arrived.
pub fn control_lines(state: &ControlState, now_ms: i64) -> [String; 4] {
    let latency = if state.timestamp > 0 {
        format!("LAT {}MS", now_ms - state.timestamp)
    } else {
        "LAT -".to_string()
    };
    [
        format!("GEAR {}", state.gear),
        format!("THR {:.2}", state.throttle),
        format!("BRK {:.2}", state.brake),
        latency,
    ]
}

/// Corner the stamp is anchored to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Corner {
    #[default]
    Tl,
    Tr,
    Bl,
    Br,
}

impl std::str::FromStr for Corner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tl" => Ok(Corner::Tl),
            "tr" => Ok(Corner::Tr),
            "bl" => Ok(Corner::Bl),
            "br" => Ok(Corner::Br),
            other => Err(format!("unknown corner {other:?}, expected tl|tr|bl|br")),
        }
    }
}

/// Pixel rectangle covered by the stamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextBox {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone)]
pub struct TelemetryOverlay {
    pub corner: Corner,
    pub scale: usize,
}

impl TelemetryOverlay {
    pub fn new(corner: Corner, scale: usize) -> Self {
        Self {
            corner,
            scale: scale.max(1),
        }
    }

    /// `HH:MM:SS.mmm` in local time
    pub fn stamp_text(now: DateTime<Local>) -> String {
        now.format("%H:%M:%S%.3f").to_string()
    }

    pub fn text_box(&self, text: &str, width: usize, height: usize) -> TextBox {
        self.block_box(&[text], width, height)
    }

    /// Rectangle covered by `lines` stacked top to bottom.
    pub fn block_box<S: AsRef<str>>(&self, lines: &[S], width: usize, height: usize) -> TextBox {
        let longest = lines
            .iter()
            .map(|line| line.as_ref().chars().count())
            .max()
            .unwrap_or(0);
        let tw = (GLYPH_W + GLYPH_GAP) * self.scale * longest;
        let th = (lines.len() * (GLYPH_H + LINE_GAP)).saturating_sub(LINE_GAP) * self.scale;
        let right = width.saturating_sub(tw + MARGIN);
        let bottom = height.saturating_sub(th + MARGIN);
        let (x, y) = match self.corner {
            Corner::Tl => (MARGIN, MARGIN),
            Corner::Tr => (right, MARGIN),
            Corner::Bl => (MARGIN, bottom),
            Corner::Br => (right, bottom),
        };
        TextBox {
            x,
            y,
            width: tw,
            height: th,
        }
    }

    /// Draw `text` into a tightly packed buffer of the given encoding.
    pub fn draw(
        &self,
        buf: &mut [u8],
        encoding: TargetEncoding,
        width: u32,
        height: u32,
        text: &str,
    ) {
        self.draw_lines(buf, encoding, width, height, &[text]);
    }

    /// Draw `lines` stacked in the configured corner.
    pub fn draw_lines<S: AsRef<str>>(
        &self,
        buf: &mut [u8],
        encoding: TargetEncoding,
        width: u32,
        height: u32,
        lines: &[S],
    ) {
        let (w, h) = (width as usize, height as usize);
        let block = self.block_box(lines, w, h);
        for (i, line) in lines.iter().enumerate() {
            let y = block.y + i * (GLYPH_H + LINE_GAP) * self.scale;
            self.draw_line(buf, encoding, w, h, block.x, y, line.as_ref());
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_line(
        &self,
        buf: &mut [u8],
        encoding: TargetEncoding,
        w: usize,
        h: usize,
        x: usize,
        y: usize,
        text: &str,
    ) {
        let mut cx = x;
        for ch in text.chars() {
            if cx >= w {
                break;
            }
            // Unknown characters still take up a cell
            if let Some(rows) = glyph(ch) {
                for (gy, &bits) in rows.iter().enumerate() {
                    for gx in 0..GLYPH_W {
                        if bits >> (GLYPH_W - 1 - gx) & 1 == 0 {
                            continue;
                        }
                        for sy in 0..self.scale {
                            for sx in 0..self.scale {
                                let px = cx + gx * self.scale + sx;
                                let py = y + gy * self.scale + sy;
                                if px < w && py < h {
                                    paint(buf, encoding, w, h, px, py);
                                }
                            }
                        }
                    }
                }
            }
            cx += (GLYPH_W + GLYPH_GAP) * self.scale;
        }
    }
}

fn paint(buf: &mut [u8], encoding: TargetEncoding, w: usize, h: usize, x: usize, y: usize) {
    match encoding {
        TargetEncoding::I420 => {
            let cw = w.div_ceil(2);
            let plane = cw * h.div_ceil(2);
            let ci = (y / 2) * cw + x / 2;
            buf[y * w + x] = LUMA_WHITE;
            if let Some(u) = buf.get_mut(w * h + ci) {
                *u = CHROMA_NEUTRAL;
            }
            if let Some(v) = buf.get_mut(w * h + plane + ci) {
                *v = CHROMA_NEUTRAL;
            }
        }
        TargetEncoding::Rgb8 | TargetEncoding::Bgr8 => {
            let i = (y * w + x) * 3;
            buf[i..i + 3].fill(255);
        }
        TargetEncoding::Rgba8 => {
            let i = (y * w + x) * 4;
            buf[i..i + 4].fill(255);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stamp_has_millisecond_precision() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 7, 8, 9).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(TelemetryOverlay::stamp_text(at), "07:08:09.042");
    }

    #[test]
    fn corners_respect_margin() {
        let overlay = TelemetryOverlay::new(Corner::Br, 2);
        let tb = overlay.text_box("12:34", 200, 100);
        assert_eq!(tb.width, 6 * 2 * 5);
        assert_eq!(tb.height, 14);
        assert_eq!(tb.x, 200 - 60 - 16);
        assert_eq!(tb.y, 100 - 14 - 16);

        let tl = TelemetryOverlay::new(Corner::Tl, 2).text_box("12:34", 200, 100);
        assert_eq!((tl.x, tl.y), (16, 16));
    }

    #[test]
    fn only_touches_pixels_inside_the_text_box() {
        let (w, h) = (128usize, 64usize);
        let mut buf = vec![0u8; w * h * 3];
        let overlay = TelemetryOverlay::new(Corner::Tr, 1);
        overlay.draw(&mut buf, TargetEncoding::Rgb8, w as u32, h as u32, "88:88");

        let tb = overlay.text_box("88:88", w, h);
        let mut lit = 0;
        for y in 0..h {
            for x in 0..w {
                if buf[(y * w + x) * 3] != 0 {
                    lit += 1;
                    assert!(x >= tb.x && x < tb.x + tb.width, "x {x} outside box");
                    assert!(y >= tb.y && y < tb.y + tb.height, "y {y} outside box");
                }
            }
        }
        assert!(lit > 0);
    }

    #[test]
    fn i420_stamp_writes_white_luma_and_neutral_chroma() {
        let (w, h) = (64u32, 48u32);
        let len = TargetEncoding::I420.frame_len(w, h);
        let mut buf = vec![16u8; len];
        TelemetryOverlay::new(Corner::Tl, 1).draw(&mut buf, TargetEncoding::I420, w, h, "1");

        let luma = &buf[..(w * h) as usize];
        assert!(luma.contains(&LUMA_WHITE));
        assert!(buf[(w * h) as usize..].contains(&CHROMA_NEUTRAL));
        assert_eq!(buf.len(), len);
    }

    #[test]
    fn control_lines_show_gear_axes_and_latency() {
        let state = ControlState {
            gear: "d".into(),
            throttle: 0.5,
            brake: 0.25,
            timestamp: 1_000,
            ..Default::default()
        };
        assert_eq!(
            control_lines(&state, 1_042),
            ["GEAR d", "THR 0.50", "BRK 0.25", "LAT 42MS"]
        );
        assert_eq!(control_lines(&ControlState::default(), 1_042)[3], "LAT -");
    }

    #[test]
    fn telemetry_text_has_glyphs() {
        for line in control_lines(&ControlState::default(), 0) {
            assert!(line.chars().filter(|c| *c != ' ').all(|c| glyph(c).is_some()), "{line}");
        }
        assert_eq!(glyph('r'), glyph('R'));
        assert!(glyph('-').is_some());
    }

    #[test]
    fn lines_stack_inside_the_block() {
        let (w, h) = (200usize, 120usize);
        let lines = ["12:00:00.000", "GEAR N", "THR 0.00"];
        let overlay = TelemetryOverlay::new(Corner::Bl, 1);
        let block = overlay.block_box(&lines, w, h);
        assert_eq!(block.height, 3 * GLYPH_H + 2 * LINE_GAP);
        assert_eq!(block.width, 12 * (GLYPH_W + GLYPH_GAP));
        assert_eq!(block.y, h - block.height - MARGIN);

        let mut buf = vec![0u8; w * h * 3];
        overlay.draw_lines(&mut buf, TargetEncoding::Rgb8, w as u32, h as u32, &lines);
        // Last line starts below the first two
        let last_row = block.y + 2 * (GLYPH_H + LINE_GAP);
        let lit_low = (last_row..block.y + block.height)
            .any(|y| (0..w).any(|x| buf[(y * w + x) * 3] != 0));
        assert!(lit_low);
        for y in (0..h).filter(|&y| y < block.y || y >= block.y + block.height) {
            assert!((0..w).all(|x| buf[(y * w + x) * 3] == 0));
        }
    }

    #[test]
    fn tiny_frames_do_not_panic() {
        let mut buf = vec![0u8; 4 * 4 * 4];
        TelemetryOverlay::new(Corner::Br, 3).draw(&mut buf, TargetEncoding::Rgba8, 4, 4, "00:00:00.000");
    }
}
