//! Freehand signature capture.
//!
//! Pointer input is fed to a [`SignaturePad`] one stroke at a time; the
//! [`BitmapSignaturePad`] joins consecutive points with straight segments on
//! a monochrome canvas and exports it as a `data:image/bmp;base64,…` URL.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::errors::{OriginationError, Result};

pub const DEFAULT_WIDTH: u32 = 400;
pub const DEFAULT_HEIGHT: u32 = 150;
const DEFAULT_PEN_WIDTH: u32 = 2;

/// A pointer position in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Anything that can record strokes and render them to an image.
pub trait SignaturePad: Send {
    /// Pointer down.
    fn start_stroke(&mut self, at: Point);
    /// Pointer move. Ignored unless a stroke is in progress.
    fn continue_stroke(&mut self, to: Point);
    /// Pointer up / leave.
    fn end_stroke(&mut self);
    /// `data:` URL of the current drawing. Fails when nothing was drawn.
    fn export_image(&self) -> Result<String>;
    fn is_empty(&self) -> bool;
    fn clear(&mut self);
}

/// Reject strokes with NaN or infinite coordinates.
pub fn validate_strokes(strokes: &[Vec<Point>]) -> Result<()> {
    match strokes.iter().flatten().find(|p| !p.is_finite()) {
        Some(p) => Err(OriginationError::Validation(format!(
            "signature point ({}, {}) is not a finite coordinate",
            p.x, p.y
        ))),
        None => Ok(()),
    }
}

/// Feed recorded strokes through `pad`.
pub fn replay(pad: &mut dyn SignaturePad, strokes: &[Vec<Point>]) {
    for stroke in strokes {
        let mut points = stroke.iter();
        if let Some(first) = points.next() {
            pad.start_stroke(*first);
            for p in points {
                pad.continue_stroke(*p);
            }
            pad.end_stroke();
        }
    }
}

/// One-bit raster signature pad.
#[derive(Debug, Clone)]
pub struct BitmapSignaturePad {
    width: u32,
    height: u32,
    pen_width: u32,
    pixels: Vec<bool>,
    last: Option<(i64, i64)>,
    inked: bool,
}

impl Default for BitmapSignaturePad {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }
}

impl BitmapSignaturePad {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            pen_width: DEFAULT_PEN_WIDTH,
            pixels: vec![false; (width.max(1) * height.max(1)) as usize],
            last: None,
            inked: false,
        }
    }

    pub fn with_pen_width(mut self, pen_width: u32) -> Self {
        self.pen_width = pen_width.max(1);
        self
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_set(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.pixels[(y * self.width + x) as usize]
    }

    fn stamp(&mut self, x: i64, y: i64) {
        let lo = -((self.pen_width as i64 - 1) / 2);
        let hi = self.pen_width as i64 / 2;
        for dy in lo..=hi {
            for dx in lo..=hi {
                let (px, py) = (x + dx, y + dy);
                if px >= 0 && py >= 0 && px < self.width as i64 && py < self.height as i64 {
                    self.pixels[(py as u32 * self.width + px as u32) as usize] = true;
                    self.inked = true;
                }
            }
        }
    }

    /// Round `p` to a pixel, clamped to one pen width beyond the canvas so
    /// segment length stays bounded by the canvas size.
    fn to_pixel(&self, p: Point) -> (i64, i64) {
        let margin = self.pen_width as f64;
        let x = p.x.clamp(-margin, self.width as f64 + margin);
        let y = p.y.clamp(-margin, self.height as f64 + margin);
        (x.round() as i64, y.round() as i64)
    }

    /// Bresenham segment from `a` to `b`, both ends inclusive.
    fn line(&mut self, a: (i64, i64), b: (i64, i64)) {
        let (mut x, mut y) = a;
        let dx = (b.0 - x).abs();
        let dy = -(b.1 - y).abs();
        let sx = if x < b.0 { 1 } else { -1 };
        let sy = if y < b.1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.stamp(x, y);
            if x == b.0 && y == b.1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    /// Encode the canvas as a bottom-up 1bpp BMP (white background, black ink).
    pub fn to_bmp(&self) -> Vec<u8> {
        const HEADER_LEN: u32 = 14 + 40 + 8;
        let row_len = self.width.div_ceil(32) * 4;
        let image_len = row_len * self.height;
        let file_len = HEADER_LEN + image_len;

        let mut out = Vec::with_capacity(file_len as usize);
        out.extend_from_slice(b"BM");
        out.extend_from_slice(&file_len.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&HEADER_LEN.to_le_bytes());

        out.extend_from_slice(&40u32.to_le_bytes());
        out.extend_from_slice(&(self.width as i32).to_le_bytes());
        out.extend_from_slice(&(self.height as i32).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&image_len.to_le_bytes());
        out.extend_from_slice(&2835i32.to_le_bytes());
        out.extend_from_slice(&2835i32.to_le_bytes());
        out.extend_from_slice(&2u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        // Palette: 0 = white, 1 = black.
        out.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00]);

        for y in (0..self.height).rev() {
            let mut row = vec![0u8; row_len as usize];
            for x in 0..self.width {
                if self.pixels[(y * self.width + x) as usize] {
                    row[(x / 8) as usize] |= 0x80 >> (x % 8);
                }
            }
            out.extend_from_slice(&row);
        }
        out
    }
}

impl SignaturePad for BitmapSignaturePad {
    fn start_stroke(&mut self, at: Point) {
        if !at.is_finite() {
            return;
        }
        let p = self.to_pixel(at);
        self.stamp(p.0, p.1);
        self.last = Some(p);
    }

    fn continue_stroke(&mut self, to: Point) {
        if !to.is_finite() {
            return;
        }
        if let Some(last) = self.last {
            let p = self.to_pixel(to);
            self.line(last, p);
            self.last = Some(p);
        }
    }

    fn end_stroke(&mut self) {
        self.last = None;
    }

    fn export_image(&self) -> Result<String> {
        if self.is_empty() {
            return Err(OriginationError::Validation(
                "signature is empty".to_string(),
            ));
        }
        Ok(format!("data:image/bmp;base64,{}", STANDARD.encode(self.to_bmp())))
    }

    fn is_empty(&self) -> bool {
        !self.inked
    }

    fn clear(&mut self) {
        self.pixels.iter_mut().for_each(|p| *p = false);
        self.last = None;
        self.inked = false;
    }
}
