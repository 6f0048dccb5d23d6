//! Burns the camera label and capture timestamp into frames.

use chrono::{DateTime, TimeZone};
use font8x8::{UnicodeFonts, BASIC_FONTS};

use crate::capture::Frame;

const GLYPH: u32 = 8;
const MARGIN: u32 = 10;
const INK: [u8; 3] = [255, 255, 255];
const SHADOW: [u8; 3] = [0, 0, 0];

/// Label bottom left; date (`YYMMDD`) above time (`HH:MM:SS.mmm`) bottom right.
/// Glyphs scale with the frame width so the text stays legible at high resolutions.
#[inline]
pub fn stamp<Tz: TimeZone>(frame: &mut Frame, label: &str, at: &DateTime<Tz>)
where
    Tz::Offset: std::fmt::Display,
{
    let scale = text_scale(frame.width);
    let line = GLYPH * scale;
    let bottom = frame.height.saturating_sub(MARGIN * scale.min(2) + line);

    draw_text(frame, MARGIN, bottom, label, scale);

    let date = at.format("%y%m%d").to_string();
    let time = at.format("%H:%M:%S%.3f").to_string();
    let width = frame.width;
    let right = |text: &str| width.saturating_sub(text_width(text, scale).saturating_add(MARGIN));
    draw_text(frame, right(&date), bottom.saturating_sub(line + scale * 2), &date, scale);
    draw_text(frame, right(&time), bottom, &time, scale);
}

/// Draws `text` in the middle of the frame at twice the usual glyph size.
#[inline]
pub fn centered(frame: &mut Frame, text: &str) {
    let scale = text_scale(frame.width) * 2;
    let x = (frame.width.saturating_sub(text_width(text, scale))) / 2;
    let y = (frame.height.saturating_sub(GLYPH * scale)) / 2;
    draw_text(frame, x, y, text, scale);
}

#[inline]
pub fn text_scale(width: u32) -> u32 {
    (width / 640).max(1)
}

fn text_width(text: &str, scale: u32) -> u32 {
    u32::try_from(text.chars().count()).unwrap_or(u32::MAX).saturating_mul(GLYPH * scale)
}

fn draw_text(frame: &mut Frame, x: u32, y: u32, text: &str, scale: u32) {
    let mut cursor = x;
    for ch in text.chars() {
        let glyph = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')).unwrap_or([0; 8]);
        // shadow first so the ink sits on top of it
        draw_glyph(frame, cursor.saturating_add(scale), y + scale, &glyph, scale, SHADOW);
        draw_glyph(frame, cursor, y, &glyph, scale, INK);
        cursor = cursor.saturating_add(GLYPH * scale);
    }
}

fn draw_glyph(frame: &mut Frame, x: u32, y: u32, glyph: &[u8; 8], scale: u32, colour: [u8; 3]) {
    for (row, bits) in (0u32..).zip(glyph.iter()) {
        for column in 0..GLYPH {
            if bits & (1 << column) == 0 {
                continue;
            }
            fill_block(frame, x.saturating_add(column * scale), y + row * scale, scale, colour);
        }
    }
}

fn fill_block(frame: &mut Frame, x: u32, y: u32, size: u32, colour: [u8; 3]) {
    let width = frame.width as usize;
    for py in y..y.saturating_add(size).min(frame.height) {
        for px in x..x.saturating_add(size).min(frame.width) {
            let offset = (py as usize * width + px as usize) * 3;
            if let Some(pixel) = frame.data.get_mut(offset..offset + 3) {
                pixel.copy_from_slice(&colour);
            }
        }
    }
}
