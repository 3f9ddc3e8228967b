// ============================================================================
// STROKE CANVAS — off-screen ink buffer + visible segment list
// ============================================================================

use eframe::egui;
use egui::{Color32, Painter, Pos2, Rect, Stroke};
use image::{GrayImage, Luma};

/// Side length of the drawing surface in pixels.
pub const CANVAS_SIZE: u32 = 280;
/// Width of every stroke in pixels.
pub const STROKE_WIDTH: f32 = 20.0;
/// Intensity written by the pen (black).
pub const INK: u8 = 0;
/// Intensity of an empty canvas (white).
pub const PAPER: u8 = 255;

/// A fresh all-white stroke buffer.
pub fn blank_buffer() -> GrayImage {
    GrayImage::from_pixel(CANVAS_SIZE, CANVAS_SIZE, Luma([PAPER]))
}

/// One drawn line between two consecutive pointer positions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub from: (f32, f32),
    pub to: (f32, f32),
    pub width: f32,
    pub value: u8,
}

impl Segment {
    pub fn new(from: (f32, f32), to: (f32, f32)) -> Self {
        Self {
            from,
            to,
            width: STROKE_WIDTH,
            value: INK,
        }
    }

    /// Stamp this segment into a grayscale raster.
    ///
    /// Every pixel whose centre lies within `width / 2` of the segment is set
    /// to `value`, which gives round caps at both ends. Out-of-bounds parts are
    /// clipped.
    pub fn rasterize(&self, target: &mut GrayImage) {
        let (w, h) = target.dimensions();
        if w == 0 || h == 0 {
            return;
        }
        let radius = self.width / 2.0;
        let radius_sq = radius * radius;

        let (x0, y0) = self.from;
        let (x1, y1) = self.to;
        let min_x = (x0.min(x1) - radius).floor().max(0.0);
        let min_y = (y0.min(y1) - radius).floor().max(0.0);
        let max_x = (x0.max(x1) + radius).ceil().min((w - 1) as f32);
        let max_y = (y0.max(y1) + radius).ceil().min((h - 1) as f32);
        if min_x > max_x || min_y > max_y {
            return;
        }

        let dx = x1 - x0;
        let dy = y1 - y0;
        let len_sq = dx * dx + dy * dy;

        for py in min_y as u32..=max_y as u32 {
            for px in min_x as u32..=max_x as u32 {
                let cx = px as f32 + 0.5;
                let cy = py as f32 + 0.5;
                // Project the pixel centre onto the segment, clamped to its ends.
                let t = if len_sq > f32::EPSILON {
                    (((cx - x0) * dx + (cy - y0) * dy) / len_sq).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let nx = x0 + t * dx - cx;
                let ny = y0 + t * dy - cy;
                if nx * nx + ny * ny <= radius_sq {
                    target.put_pixel(px, py, Luma([self.value]));
                }
            }
        }
    }

    /// Draw this segment on the visible surface with the same geometry as
    /// [`Segment::rasterize`]: a line plus a filled disc at each end.
    pub fn paint(&self, painter: &Painter, origin: Pos2) {
        let color = Color32::from_gray(self.value);
        let a = origin + egui::vec2(self.from.0, self.from.1);
        let b = origin + egui::vec2(self.to.0, self.to.1);
        let radius = self.width / 2.0;
        painter.line_segment([a, b], Stroke::new(self.width, color));
        painter.circle_filled(a, radius, color);
        painter.circle_filled(b, radius, color);
    }
}

/// Pen state, the persistent ink buffer and the display list mirroring it.
pub struct StrokeCanvas {
    buffer: GrayImage,
    segments: Vec<Segment>,
    last_pos: Option<(f32, f32)>,
    drawing: bool,
}

impl Default for StrokeCanvas {
    fn default() -> Self {
        Self::new()
    }
}

impl StrokeCanvas {
    pub fn new() -> Self {
        Self {
            buffer: blank_buffer(),
            segments: Vec::new(),
            last_pos: None,
            drawing: false,
        }
    }

    /// Pointer pressed: remember the pen position and enter drawing mode.
    pub fn start_stroke(&mut self, x: f32, y: f32) {
        self.drawing = true;
        self.last_pos = Some((x, y));
    }

    /// Pointer dragged: draw from the previous pen position to `(x, y)`.
    ///
    /// Returns the segment that was drawn, or `None` when not drawing (stray
    /// drag without a press), in which case nothing changes.
    pub fn extend_stroke(&mut self, x: f32, y: f32) -> Option<Segment> {
        if !self.drawing {
            return None;
        }
        let from = self.last_pos?;
        let segment = Segment::new(from, (x, y));
        segment.rasterize(&mut self.buffer);
        self.segments.push(segment);
        self.last_pos = Some((x, y));
        Some(segment)
    }

    /// Pointer released.
    pub fn end_stroke(&mut self) {
        self.drawing = false;
        self.last_pos = None;
    }

    /// Wipe both surfaces. Pen state is left alone so a reset mid-drag keeps
    /// the current stroke going from the pen's position.
    pub fn clear(&mut self) {
        self.buffer = blank_buffer();
        self.segments.clear();
    }

    pub fn is_drawing(&self) -> bool {
        self.drawing
    }

    pub fn buffer(&self) -> &GrayImage {
        &self.buffer
    }

    /// Deep copy of the ink buffer for handing to another thread.
    pub fn snapshot(&self) -> GrayImage {
        self.buffer.clone()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Render the display list into `rect` (white paper, black ink).
    pub fn paint(&self, painter: &Painter, rect: Rect) {
        painter.rect_filled(rect, 0.0, Color32::from_gray(PAPER));
        for segment in &self.segments {
            segment.paint(painter, rect.min);
        }
    }
}
