//! Page data model
//!
//! Immutable page snapshots as handed to render workers. A snapshot owns all
//! of its element data so it can be serialized across the process boundary
//! without sharing anything with the coordinating process.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default logical page width in pixels
pub const PAGE_WIDTH: u32 = 800;

/// Default logical page height in pixels
pub const PAGE_HEIGHT: u32 = 1100;

/// Stable identifier of a page within a notebook
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{}", self.0)
    }
}

/// Per-page content version
///
/// Bumped on every mutation of the page. Generations only ever increase, so
/// comparing two generations of the same page tells which one is newer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    /// Generation of a page that has never been mutated
    pub const INITIAL: Generation = Generation(0);

    /// The generation following this one
    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// A point in logical page coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    #[serde(default = "default_pressure")]
    pub pressure: f32,
}

fn default_pressure() -> f32 {
    1.0
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, pressure: 1.0 }
    }

    pub fn with_pressure(x: f32, y: f32, pressure: f32) -> Self {
        Self { x, y, pressure }
    }
}

/// RGBA color, 8 bits per channel
///
/// Serialized as a hex string (`#rrggbb` or `#rrggbbaa`) or one of a few
/// named colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(0xFF, 0xFF, 0xFF);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 0xFF }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Same color with its alpha scaled by `opacity` (0.0 to 1.0)
    pub fn with_opacity(self, opacity: f32) -> Self {
        let a = (self.a as f32 * opacity.clamp(0.0, 1.0)).round() as u8;
        Self { a, ..self }
    }

    /// Parse `#rrggbb`, `#rrggbbaa` or a named color
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "black" => return Some(Color::BLACK),
            "white" => return Some(Color::WHITE),
            "red" => return Some(Color::rgb(0xFF, 0, 0)),
            "green" => return Some(Color::rgb(0, 0x80, 0)),
            "blue" => return Some(Color::rgb(0, 0, 0xFF)),
            "gray" | "grey" => return Some(Color::rgb(0x80, 0x80, 0x80)),
            _ => {}
        }

        let hex = value.strip_prefix('#')?;
        let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
        match hex.len() {
            6 => Some(Color::rgb(channel(0)?, channel(2)?, channel(4)?)),
            8 => Some(Color::rgba(channel(0)?, channel(2)?, channel(4)?, channel(6)?)),
            _ => None,
        }
    }
}

impl TryFrom<String> for Color {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Color::parse(&value).ok_or_else(|| format!("invalid color: {value:?}"))
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        if color.a == 0xFF {
            format!("#{:02x}{:02x}{:02x}", color.r, color.g, color.b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", color.r, color.g, color.b, color.a)
        }
    }
}

/// Drawing tool a stroke was made with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrokeTool {
    #[default]
    Pen,
    Highlighter,
    Eraser,
}

/// A continuous stroke of ink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub points: Vec<Point>,
    pub color: Color,
    pub thickness: f32,
    #[serde(default)]
    pub tool: StrokeTool,
}

/// A string of text placed on the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBox {
    pub text: String,
    /// Top-left corner of the first line
    pub position: Point,
    pub color: Color,
    pub size_px: f32,
}

/// An embedded picture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBox {
    pub position: Point,
    pub width: f32,
    pub height: f32,
    /// Encoded image bytes (PNG)
    pub data: Vec<u8>,
}

/// A recorded voice memo, shown as a badge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceMemo {
    pub position: Point,
    pub duration_secs: f32,
}

/// A drawable page element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Element {
    Stroke(Stroke),
    Text(TextBox),
    Image(ImageBox),
    VoiceMemo(VoiceMemo),
}

impl Element {
    /// Short name of the element kind, for logs and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Element::Stroke(_) => "stroke",
            Element::Text(_) => "text",
            Element::Image(_) => "image",
            Element::VoiceMemo(_) => "voice_memo",
        }
    }
}

/// Immutable content of one page at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub page_id: PageId,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub elements: Vec<Element>,
}

fn default_width() -> u32 {
    PAGE_WIDTH
}

fn default_height() -> u32 {
    PAGE_HEIGHT
}

impl PageSnapshot {
    /// Create an empty page with the default dimensions
    pub fn new(page_id: PageId) -> Self {
        Self { page_id, width: PAGE_WIDTH, height: PAGE_HEIGHT, elements: Vec::new() }
    }

    /// Add an element (builder style)
    pub fn with_element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }
}

/// Visual style shared by all pages of a notebook
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageStyle {
    pub background: Color,
    pub line_color: Color,
    pub line_spacing: u32,
    pub line_margin: u32,
}

impl Default for PageStyle {
    fn default() -> Self {
        Self {
            background: Color::rgb(0xE0, 0xE0, 0xE0),
            line_color: Color::rgb(0xDD, 0xCD, 0xC4).with_opacity(0.9),
            line_spacing: 35,
            line_margin: 5,
        }
    }
}
