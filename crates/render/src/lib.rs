//! Diary page rendering
//!
//! Page data model, the software rasterizer and the wire protocol spoken by
//! isolated render worker processes.

pub mod artifact;
pub mod page;
pub mod raster;
pub mod wire;
pub mod worker;

pub use artifact::{Artifact, Bitmap};
pub use page::{
    Color, Element, Generation, ImageBox, PageId, PageSnapshot, PageStyle, Point, Stroke,
    StrokeTool, TextBox, VoiceMemo, PAGE_HEIGHT, PAGE_WIDTH,
};
pub use raster::{Canvas, Paint, PaintError, RasterRenderer, RenderFault, Renderer};
pub use wire::{RenderReply, RenderRequest, WireError};
pub use worker::{serve, ServeOptions, ServeSummary};

/// Default rendering scale (logical page pixels to bitmap pixels)
pub const DEFAULT_SCALE: f32 = 4.0;

/// Render a snapshot in the calling process
///
/// Used as the degraded-mode fallback when worker processes keep failing.
pub fn render_in_process(
    snapshot: &PageSnapshot,
    generation: Generation,
    scale: f32,
) -> Result<Artifact, RenderFault> {
    let bitmap = RasterRenderer::new().render(snapshot, scale)?;
    Ok(Artifact::from_bitmap(snapshot.page_id, generation, scale, bitmap))
}
