use serde::{Deserialize, Serialize};

/// One detected object.
///
/// `bbox` is `[y1, x1, y2, x2]` (top, left, bottom, right), each normalised to
/// `0..1` relative to the frame that was sent for detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(alias = "class")]
    pub label: String,
    #[serde(alias = "score")]
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
}

/// All detections produced for one frame. May be empty.
pub type DetectionBatch = Vec<DetectionResult>;

/// Axis-aligned rectangle in pixel space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PixelRect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl PixelRect {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

impl DetectionResult {
    pub fn top(&self) -> f32 {
        self.bbox[0]
    }

    pub fn left(&self) -> f32 {
        self.bbox[1]
    }

    pub fn bottom(&self) -> f32 {
        self.bbox[2]
    }

    pub fn right(&self) -> f32 {
        self.bbox[3]
    }

    /// Box in pixels of a `width` x `height` image.
    pub fn pixel_rect(&self, width: u32, height: u32) -> PixelRect {
        let (w, h) = (width as f32, height as f32);
        PixelRect {
            x1: self.left() * w,
            y1: self.top() * h,
            x2: self.right() * w,
            y2: self.bottom() * h,
        }
    }

    /// Overlay caption, e.g. `person 87%`.
    pub fn caption(&self) -> String {
        format!("{} {:.0}%", self.label, self.confidence * 100.0)
    }
}

/// Aspect-preserving "contain" fit of an image into a canvas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OverlayTransform {
    pub scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
    image_width: u32,
    image_height: u32,
}

impl OverlayTransform {
    /// Largest uniform scale that fits the image inside the canvas, centred.
    pub fn fit(canvas_width: f32, canvas_height: f32, image_width: u32, image_height: u32) -> Self {
        let (iw, ih) = (image_width as f32, image_height as f32);
        let scale = if iw > 0.0 && ih > 0.0 {
            (canvas_width / iw).min(canvas_height / ih)
        } else {
            0.0
        };
        Self {
            scale,
            offset_x: (canvas_width - iw * scale) / 2.0,
            offset_y: (canvas_height - ih * scale) / 2.0,
            image_width,
            image_height,
        }
    }

    /// Map a detection into canvas coordinates.
    pub fn map(&self, detection: &DetectionResult) -> PixelRect {
        let rect = detection.pixel_rect(self.image_width, self.image_height);
        PixelRect {
            x1: rect.x1 * self.scale + self.offset_x,
            y1: rect.y1 * self.scale + self.offset_y,
            x2: rect.x2 * self.scale + self.offset_x,
            y2: rect.y2 * self.scale + self.offset_y,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    fn person() -> DetectionResult {
        DetectionResult {
            label: "person".into(),
            confidence: 0.87,
            bbox: [0.1, 0.2, 0.3, 0.4],
        }
    }

    #[test]
    fn pixel_rect_keeps_axes() {
        let rect = person().pixel_rect(640, 480);
        assert!(close(rect.x1, 128.0));
        assert!(close(rect.y1, 48.0));
        assert!(close(rect.x2, 256.0));
        assert!(close(rect.y2, 144.0));
        assert!(close(rect.width(), 128.0));
    }

    #[test]
    fn caption_rounds_percentage() {
        assert_eq!(person().caption(), "person 87%");
    }

    #[test]
    fn fit_letterboxes_wide_canvas() {
        let fit = OverlayTransform::fit(1280.0, 480.0, 640, 480);
        assert!(close(fit.scale, 1.0));
        assert!(close(fit.offset_x, 320.0));
        assert!(close(fit.offset_y, 0.0));

        let rect = fit.map(&person());
        assert!(close(rect.x1, 448.0));
        assert!(close(rect.y1, 48.0));
    }

    #[test]
    fn fit_scales_down_tall_canvas() {
        let fit = OverlayTransform::fit(320.0, 1000.0, 640, 640);
        assert!(close(fit.scale, 0.5));
        assert!(close(fit.offset_x, 0.0));
        assert!(close(fit.offset_y, 340.0));
    }
}
