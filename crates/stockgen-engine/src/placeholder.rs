//! Deterministic stand-in image used when every provider failed or the
//! caller forced demo mode.
//!
//! The primary path paints a two-colour vertical gradient derived from the
//! SHA-256 of the label and stamps the label in a 5x7 bitmap face. When the
//! label cannot be laid out on the canvas the synthesizer drops to a flat
//! fill of the same base colour.

use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};
use stockgen_contracts::generation::NormalizedImage;

use crate::error::PlaceholderError;
use crate::normalize::image_from_bytes;

pub const MAX_LABEL_CHARS: usize = 48;
const DEFAULT_LABEL: &str = "STOCKGEN";
const LINE_COLUMNS: usize = 16;
const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const CELL_WIDTH: u32 = GLYPH_WIDTH + 1;
const CELL_HEIGHT: u32 = GLYPH_HEIGHT + 2;

#[derive(Debug, Clone)]
pub struct PlaceholderSynthesizer {
    size: u32,
}

impl PlaceholderSynthesizer {
    pub fn new(size: u32) -> Self {
        Self { size }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Same seed text, same bytes.
    pub fn synthesize(&self, seed_text: &str) -> Result<NormalizedImage, PlaceholderError> {
        let label = derive_label(seed_text);
        match self.render_labelled(&label) {
            Ok(image) => Ok(image),
            Err(primary) => {
                tracing::warn!(error = %primary, "placeholder label render failed; using flat fill");
                self.render_flat(&label)
                    .map_err(|fallback| PlaceholderError { primary, fallback })
            }
        }
    }

    fn render_labelled(&self, label: &str) -> Result<NormalizedImage, String> {
        if self.size == 0 {
            return Err("placeholder size must be positive".to_string());
        }
        let lines = wrap_label(label, LINE_COLUMNS);
        let columns = lines.iter().map(|line| line.chars().count()).max().unwrap_or(1) as u32;
        let rows = lines.len().max(1) as u32;
        let usable_width = self.size * 4 / 5;
        let usable_height = self.size * 3 / 5;
        let scale = (usable_width / (columns * CELL_WIDTH)).min(usable_height / (rows * CELL_HEIGHT));
        if scale == 0 {
            return Err(format!(
                "{}px canvas too small for a {columns}x{rows} label",
                self.size
            ));
        }

        let (top, bottom) = gradient_colors(label);
        let mut canvas = RgbImage::new(self.size, self.size);
        let span = (self.size - 1).max(1) as f32;
        for (_, y, pixel) in canvas.enumerate_pixels_mut() {
            let t = y as f32 / span;
            *pixel = Rgb([
                lerp(top[0], bottom[0], t),
                lerp(top[1], bottom[1], t),
                lerp(top[2], bottom[2], t),
            ]);
        }

        let block_height = rows * CELL_HEIGHT * scale;
        let origin_y = (self.size - block_height) / 2;
        for (row, line) in lines.iter().enumerate() {
            let line_width = line.chars().count() as u32 * CELL_WIDTH * scale;
            let x = (self.size - line_width.min(self.size)) / 2;
            let y = origin_y + row as u32 * CELL_HEIGHT * scale;
            draw_text(&mut canvas, line, x + scale, y + scale, scale, Rgb([0, 0, 0]));
            draw_text(&mut canvas, line, x, y, scale, Rgb([255, 255, 255]));
        }

        encode_png(&canvas)
    }

    fn render_flat(&self, label: &str) -> Result<NormalizedImage, String> {
        if self.size == 0 {
            return Err("placeholder size must be positive".to_string());
        }
        let (top, _) = gradient_colors(label);
        let canvas = RgbImage::from_pixel(self.size, self.size, Rgb(top));
        encode_png(&canvas)
    }
}

/// Whitespace-collapsed prompt, cut at [`MAX_LABEL_CHARS`].
pub fn derive_label(prompt: &str) -> String {
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return DEFAULT_LABEL.to_string();
    }
    collapsed.chars().take(MAX_LABEL_CHARS).collect::<String>().trim_end().to_string()
}

fn gradient_colors(label: &str) -> ([u8; 3], [u8; 3]) {
    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();
    // Keep both ends mid-dark so white text stays legible.
    let tone = |value: u8| 40 + value / 2;
    (
        [tone(digest[0]), tone(digest[1]), tone(digest[2])],
        [tone(digest[3]), tone(digest[4]), tone(digest[5])],
    )
}

fn lerp(from: u8, to: u8, t: f32) -> u8 {
    (from as f32 + (to as f32 - from as f32) * t).round().clamp(0.0, 255.0) as u8
}

fn wrap_label(label: &str, columns: usize) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    for word in label.to_uppercase().split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > columns {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            lines.push(word.drain(..columns).collect());
        }
        let word: String = word.into_iter().collect();
        if word.is_empty() {
            continue;
        }
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > columns && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn draw_text(canvas: &mut RgbImage, text: &str, x: u32, y: u32, scale: u32, color: Rgb<u8>) {
    for (index, ch) in text.chars().enumerate() {
        let glyph_x = x + index as u32 * CELL_WIDTH * scale;
        for (row, bits) in glyph(ch).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                let px = glyph_x + col * scale;
                let py = y + row as u32 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        if px + dx < canvas.width() && py + dy < canvas.height() {
                            canvas.put_pixel(px + dx, py + dy, color);
                        }
                    }
                }
            }
        }
    }
}

fn encode_png(canvas: &RgbImage) -> Result<NormalizedImage, String> {
    let mut out = Cursor::new(Vec::new());
    canvas
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|err| format!("png encode failed: {err}"))?;
    image_from_bytes(out.into_inner()).map_err(|err| err.to_string())
}

fn glyph(ch: char) -> [u8; 7] {
    match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ' ' => [0; 7],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '.' => [0, 0, 0, 0, 0, 0b01100, 0b01100],
        ',' => [0, 0, 0, 0, 0b01100, 0b00100, 0b01000],
        '!' => [0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0, 0b00100],
        '\'' => [0b01100, 0b00100, 0b01000, 0, 0, 0, 0],
        _ => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0, 0b00100],
    }
}
