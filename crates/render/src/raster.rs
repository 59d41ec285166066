//! Software page rasterizer
//!
//! Paints a [`PageSnapshot`] into an RGBA bitmap. Every element kind paints
//! itself through the [`Paint`] trait; [`RasterRenderer`] draws the page
//! background and ruling, then the elements in document order.

use crate::artifact::Bitmap;
use crate::page::{
    Color, Element, ImageBox, PageSnapshot, PageStyle, Point, Stroke, StrokeTool, TextBox,
    VoiceMemo,
};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

/// Largest accepted render scale
pub const MAX_SCALE: f32 = 16.0;

/// Largest accepted bitmap edge in device pixels
pub const MAX_DIMENSION: u32 = 16_384;

const HIGHLIGHTER_OPACITY: f32 = 0.35;
const VOICE_MEMO_BADGE: f32 = 40.0;
const VOICE_MEMO_COLOR: Color = Color::rgb(0x4A, 0x90, 0xD9);

/// Reasons a snapshot cannot be rendered
///
/// These are properties of the snapshot itself, so rendering the same
/// snapshot again would fail the same way.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderFault {
    #[error("invalid render scale {0}")]
    InvalidScale(f32),

    #[error("page has zero size")]
    EmptyPage,

    #[error("bitmap of {width}x{height} px exceeds the {MAX_DIMENSION} px limit")]
    TooLarge { width: u64, height: u64 },

    #[error("{kind} element #{index} cannot be drawn: {reason}")]
    Element { index: usize, kind: &'static str, reason: String },
}

/// Failure while painting a single element
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct PaintError(pub String);

/// Converts a page snapshot into a bitmap
///
/// Implementations must be deterministic for a given snapshot and scale and
/// free of side effects. They run inside worker processes, never in the
/// coordinating process (except as an explicit degraded-mode fallback).
pub trait Renderer: Send + Sync {
    fn render(&self, page: &PageSnapshot, scale: f32) -> Result<Bitmap, RenderFault>;
}

/// Uniform "paint into the canvas" capability of page elements
pub trait Paint {
    fn paint(&self, canvas: &mut Canvas) -> Result<(), PaintError>;
}

/// Drawing surface in logical page coordinates
///
/// Coordinates passed to the drawing methods are multiplied by the canvas
/// scale to get device pixels.
pub struct Canvas {
    image: RgbaImage,
    scale: f32,
    background: Color,
}

impl Canvas {
    /// Create a canvas of `width` x `height` device pixels filled with `background`
    pub fn new(width: u32, height: u32, scale: f32, background: Color) -> Self {
        let fill = Rgba([background.r, background.g, background.b, background.a]);
        Self { image: RgbaImage::from_pixel(width, height, fill), scale, background }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn background(&self) -> Color {
        self.background
    }

    /// Fill an axis-aligned rectangle
    pub fn fill_rect(&mut self, x: f32, y: f32, width: f32, height: f32, color: Color) {
        let (x0, x1) = self.device_span(x, x + width, self.image.width());
        let (y0, y1) = self.device_span(y, y + height, self.image.height());

        for py in y0..y1 {
            for px in x0..x1 {
                self.blend(px, py, color, 1.0);
            }
        }
    }

    /// Draw a segment with round caps; the width varies linearly from
    /// `width_a` at `a` to `width_b` at `b`
    pub fn draw_segment(&mut self, a: Point, b: Point, width_a: f32, width_b: f32, color: Color) {
        let s = self.scale;
        let (ax, ay, bx, by) = (a.x * s, a.y * s, b.x * s, b.y * s);
        let ra = (width_a * s / 2.0).max(0.5);
        let rb = (width_b * s / 2.0).max(0.5);
        let reach = ra.max(rb) + 1.0;

        let x0 = (ax.min(bx) - reach).max(0.0) as u32;
        let y0 = (ay.min(by) - reach).max(0.0) as u32;
        let x1 = ((ax.max(bx) + reach).ceil().max(0.0) as u32).min(self.image.width());
        let y1 = ((ay.max(by) + reach).ceil().max(0.0) as u32).min(self.image.height());

        let (dx, dy) = (bx - ax, by - ay);
        let len2 = dx * dx + dy * dy;

        for py in y0..y1 {
            for px in x0..x1 {
                let (cx, cy) = (px as f32 + 0.5, py as f32 + 0.5);
                let t = if len2 > f32::EPSILON {
                    (((cx - ax) * dx + (cy - ay) * dy) / len2).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let (nx, ny) = (ax + t * dx - cx, ay + t * dy - cy);
                let distance = (nx * nx + ny * ny).sqrt();
                let radius = ra + (rb - ra) * t;

                let coverage = (radius - distance + 0.5).clamp(0.0, 1.0);
                if coverage > 0.0 {
                    self.blend(px, py, color, coverage);
                }
            }
        }
    }

    /// Scale `picture` into the given logical box and composite it
    pub fn draw_image(
        &mut self,
        picture: &RgbaImage,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    ) -> Result<(), PaintError> {
        let device_w = (width * self.scale).round();
        let device_h = (height * self.scale).round();
        if !(device_w.is_finite() && device_h.is_finite()) {
            return Err(PaintError("non-finite image box".to_string()));
        }
        if device_w < 1.0 || device_h < 1.0 {
            return Ok(());
        }
        if device_w > MAX_DIMENSION as f32 || device_h > MAX_DIMENSION as f32 {
            return Err(PaintError(format!("image box {device_w}x{device_h} px is too large")));
        }

        let resized = imageops::resize(picture, device_w as u32, device_h as u32, FilterType::Triangle);
        let left = (x * self.scale).round() as i64;
        let top = (y * self.scale).round() as i64;
        imageops::overlay(&mut self.image, &resized, left, top);
        Ok(())
    }

    /// Finish drawing and hand out the pixels
    pub fn into_bitmap(self) -> Bitmap {
        let (width, height) = self.image.dimensions();
        Bitmap { width, height, pixels: self.image.into_raw() }
    }

    fn device_span(&self, start: f32, end: f32, limit: u32) -> (u32, u32) {
        let lo = (start * self.scale).floor().max(0.0) as u32;
        let hi = (end * self.scale).ceil().max(0.0) as u32;
        (lo.min(limit), hi.min(limit))
    }

    fn blend(&mut self, x: u32, y: u32, color: Color, coverage: f32) {
        let alpha = (color.a as f32 / 255.0) * coverage;
        let dst = self.image.get_pixel_mut(x, y);
        let mix = |src: u8, dst: u8| -> u8 {
            (src as f32 * alpha + dst as f32 * (1.0 - alpha)).round() as u8
        };
        dst.0[0] = mix(color.r, dst.0[0]);
        dst.0[1] = mix(color.g, dst.0[1]);
        dst.0[2] = mix(color.b, dst.0[2]);
        dst.0[3] = (alpha * 255.0 + dst.0[3] as f32 * (1.0 - alpha)).round() as u8;
    }
}

impl Paint for Stroke {
    fn paint(&self, canvas: &mut Canvas) -> Result<(), PaintError> {
        if !self.thickness.is_finite() || self.thickness < 0.0 {
            return Err(PaintError(format!("invalid thickness {}", self.thickness)));
        }

        let color = match self.tool {
            StrokeTool::Pen => self.color,
            StrokeTool::Highlighter => self.color.with_opacity(HIGHLIGHTER_OPACITY),
            StrokeTool::Eraser => canvas.background(),
        };
        let width_at = |p: &Point| self.thickness * p.pressure.clamp(0.1, 4.0);

        match self.points.as_slice() {
            [] => {}
            [only] => canvas.draw_segment(*only, *only, width_at(only), width_at(only), color),
            points => {
                for pair in points.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);
                    canvas.draw_segment(*a, *b, width_at(a), width_at(b), color);
                }
            }
        }
        Ok(())
    }
}

impl Paint for TextBox {
    /// Text is drawn as one block per visible character; glyph shaping
    /// belongs to the interactive editor, not to page thumbnails.
    fn paint(&self, canvas: &mut Canvas) -> Result<(), PaintError> {
        if !self.size_px.is_finite() || self.size_px <= 0.0 {
            return Err(PaintError(format!("invalid text size {}", self.size_px)));
        }

        let advance = self.size_px * 0.6;
        let line_height = self.size_px * 1.2;
        let (mut x, mut y) = (self.position.x, self.position.y);

        for ch in self.text.chars() {
            if ch == '\n' {
                x = self.position.x;
                y += line_height;
                continue;
            }
            if !ch.is_whitespace() {
                canvas.fill_rect(
                    x + advance * 0.125,
                    y + self.size_px * 0.2,
                    advance * 0.75,
                    self.size_px * 0.7,
                    self.color,
                );
            }
            x += advance;
        }
        Ok(())
    }
}

impl Paint for ImageBox {
    fn paint(&self, canvas: &mut Canvas) -> Result<(), PaintError> {
        let picture = image::load_from_memory(&self.data)
            .map_err(|err| PaintError(err.to_string()))?
            .to_rgba8();
        canvas.draw_image(&picture, self.position.x, self.position.y, self.width, self.height)
    }
}

impl Paint for VoiceMemo {
    fn paint(&self, canvas: &mut Canvas) -> Result<(), PaintError> {
        let Point { x, y, .. } = self.position;
        canvas.fill_rect(x, y, VOICE_MEMO_BADGE, VOICE_MEMO_BADGE, VOICE_MEMO_COLOR);

        let inset = VOICE_MEMO_BADGE * 0.3;
        let inner = VOICE_MEMO_BADGE - 2.0 * inset;
        canvas.fill_rect(x + inset, y + inset, inner, inner, Color::WHITE);
        Ok(())
    }
}

impl Paint for Element {
    fn paint(&self, canvas: &mut Canvas) -> Result<(), PaintError> {
        match self {
            Element::Stroke(stroke) => stroke.paint(canvas),
            Element::Text(text) => text.paint(canvas),
            Element::Image(image) => image.paint(canvas),
            Element::VoiceMemo(memo) => memo.paint(canvas),
        }
    }
}

/// The built-in software renderer
#[derive(Debug, Clone, Default)]
pub struct RasterRenderer {
    style: PageStyle,
}

impl RasterRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_style(style: PageStyle) -> Self {
        Self { style }
    }

    fn draw_ruling(&self, canvas: &mut Canvas, page: &PageSnapshot) {
        let spacing = self.style.line_spacing.max(1) as usize;
        let margin = self.style.line_margin as f32;
        let length = page.width as f32 - 2.0 * margin;
        if length <= 0.0 {
            return;
        }

        for y in (0..page.height).step_by(spacing) {
            canvas.fill_rect(margin, y as f32 - 0.5, length, 1.0, self.style.line_color);
        }
    }
}

impl Renderer for RasterRenderer {
    fn render(&self, page: &PageSnapshot, scale: f32) -> Result<Bitmap, RenderFault> {
        if !scale.is_finite() || scale <= 0.0 || scale > MAX_SCALE {
            return Err(RenderFault::InvalidScale(scale));
        }
        if page.width == 0 || page.height == 0 {
            return Err(RenderFault::EmptyPage);
        }

        let width = (page.width as f64 * scale as f64).round() as u64;
        let height = (page.height as f64 * scale as f64).round() as u64;
        if width == 0 || height == 0 {
            return Err(RenderFault::EmptyPage);
        }
        if width > MAX_DIMENSION as u64 || height > MAX_DIMENSION as u64 {
            return Err(RenderFault::TooLarge { width, height });
        }

        let mut canvas = Canvas::new(width as u32, height as u32, scale, self.style.background);
        self.draw_ruling(&mut canvas, page);

        for (index, element) in page.elements.iter().enumerate() {
            element.paint(&mut canvas).map_err(|err| RenderFault::Element {
                index,
                kind: element.kind(),
                reason: err.0,
            })?;
        }

        Ok(canvas.into_bitmap())
    }
}
