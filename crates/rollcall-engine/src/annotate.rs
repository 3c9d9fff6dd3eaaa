//! Drawing detections onto the output image.

use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rollcall_core::BoundingBox;

static LABEL_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// Padding between the label text and its background, in pixels.
const LABEL_PAD: u32 = 2;

/// Marks one detection and its label on an image.
pub trait Annotator: Send + Sync {
    fn annotate(&self, image: &mut RgbImage, bbox: &BoundingBox, label: &str);
}

/// Outlines each face and writes its label on a filled strip under the box
/// (above it, or inside the top edge, when there is no room below).
pub struct BoxAnnotator {
    pub color: Rgb<u8>,
    pub text_color: Rgb<u8>,
    pub thickness: u32,
    pub label_scale: f32,
    font: Option<FontRef<'static>>,
}

impl BoxAnnotator {
    pub fn new(color: Rgb<u8>, thickness: u32) -> Self {
        let font = match FontRef::try_from_slice(LABEL_FONT) {
            Ok(font) => Some(font),
            Err(e) => {
                tracing::warn!(error = %e, "label font unusable; drawing boxes only");
                None
            }
        };
        Self {
            color,
            text_color: Rgb([0, 0, 0]),
            thickness,
            label_scale: 16.0,
            font,
        }
    }

    fn draw_label(&self, image: &mut RgbImage, edges: (u32, u32, u32, u32), label: &str) {
        let Some(font) = &self.font else {
            return;
        };
        if label.is_empty() {
            return;
        }
        let (top, _, bottom, left) = edges;
        let scale = PxScale::from(self.label_scale);
        let (text_w, text_h) = text_size(scale, font, label);
        let (strip_w, strip_h) = (text_w + 2 * LABEL_PAD, text_h + 2 * LABEL_PAD);

        let y = if bottom + 1 + strip_h <= image.height() {
            bottom + 1
        } else if top >= strip_h {
            top - strip_h
        } else {
            top
        };

        draw_filled_rect_mut(
            image,
            Rect::at(left as i32, y as i32).of_size(strip_w, strip_h),
            self.color,
        );
        draw_text_mut(
            image,
            self.text_color,
            (left + LABEL_PAD) as i32,
            (y + LABEL_PAD) as i32,
            scale,
            font,
            label,
        );
    }
}

impl Default for BoxAnnotator {
    fn default() -> Self {
        Self::new(Rgb([0, 255, 0]), 2)
    }
}

impl Annotator for BoxAnnotator {
    fn annotate(&self, image: &mut RgbImage, bbox: &BoundingBox, label: &str) {
        let Some(edges) = bbox.edges_within(image.width(), image.height()) else {
            tracing::debug!(label, "detection outside image, not drawn");
            return;
        };
        let (top, right, bottom, left) = edges;
        let (width, height) = (right - left + 1, bottom - top + 1);

        for t in 0..self.thickness {
            if 2 * t >= width || 2 * t >= height {
                break;
            }
            let rect = Rect::at((left + t) as i32, (top + t) as i32)
                .of_size(width - 2 * t, height - 2 * t);
            draw_hollow_rect_mut(image, rect, self.color);
        }

        self.draw_label(image, edges, label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    fn label_size(label: &str) -> (u32, u32) {
        let annotator = BoxAnnotator::default();
        let font = annotator.font.as_ref().unwrap();
        text_size(PxScale::from(annotator.label_scale), font, label)
    }

    #[test]
    fn test_box_outline_drawn_inside_is_untouched() {
        let mut image = RgbImage::new(100, 100);
        let bbox = BoundingBox::from_edges(10, 40, 40, 10);
        BoxAnnotator::default().annotate(&mut image, &bbox, "Alice");

        assert_eq!(*image.get_pixel(10, 10), GREEN);
        assert_eq!(*image.get_pixel(40, 40), GREEN);
        assert_eq!(*image.get_pixel(11, 25), GREEN); // second pixel of left edge
        assert_eq!(*image.get_pixel(25, 25), BLACK);
        assert_eq!(*image.get_pixel(90, 20), BLACK);
    }

    #[test]
    fn test_label_drawn_below_box() {
        let mut image = RgbImage::new(100, 100);
        let bbox = BoundingBox::from_edges(10, 40, 40, 10);
        BoxAnnotator::default().annotate(&mut image, &bbox, "Alice");

        let (w, h) = label_size("Alice");
        assert!(w > 0 && h > 0);
        // Strip background starts right under the box.
        assert_eq!(*image.get_pixel(10, 41), GREEN);
        // Glyphs change some pixels inside the strip.
        let strip_top = 41 + LABEL_PAD;
        let inked = (10 + LABEL_PAD..10 + LABEL_PAD + w)
            .flat_map(|x| (strip_top..strip_top + h).map(move |y| (x, y)))
            .any(|(x, y)| *image.get_pixel(x, y) != GREEN);
        assert!(inked, "label text not rendered");
    }

    #[test]
    fn test_label_moves_above_box_near_bottom() {
        let mut image = RgbImage::new(100, 100);
        let bbox = BoundingBox::from_edges(50, 40, 98, 10);
        BoxAnnotator::default().annotate(&mut image, &bbox, "Bob");

        let (_, h) = label_size("Bob");
        let strip_h = h + 2 * LABEL_PAD;
        assert_eq!(*image.get_pixel(10, 50 - strip_h), GREEN);
        assert_eq!(*image.get_pixel(10, 99), BLACK);
    }

    #[test]
    fn test_empty_label_draws_box_only() {
        let mut image = RgbImage::new(100, 100);
        let bbox = BoundingBox::from_edges(10, 40, 40, 10);
        BoxAnnotator::default().annotate(&mut image, &bbox, "");
        assert_eq!(*image.get_pixel(10, 41), BLACK);
    }

    #[test]
    fn test_box_clamped_to_image() {
        let mut image = RgbImage::new(10, 10);
        let bbox = BoundingBox {
            x: -5.0,
            y: -5.0,
            width: 30.0,
            height: 30.0,
            confidence: 1.0,
            landmarks: None,
        };
        BoxAnnotator::default().annotate(&mut image, &bbox, "Bob");
        // Label has no room outside, so it overlays the top edge; its text
        // starts past the padding.
        assert_eq!(*image.get_pixel(0, 0), GREEN);
        assert_eq!(*image.get_pixel(9, 0), GREEN);
        assert_eq!(*image.get_pixel(0, 9), GREEN);
    }

    #[test]
    fn test_box_outside_image_is_ignored() {
        let mut image = RgbImage::new(10, 10);
        let bbox = BoundingBox::from_edges(50, 60, 60, 50);
        BoxAnnotator::default().annotate(&mut image, &bbox, "Nobody");
        assert!(image.pixels().all(|p| *p == BLACK));
    }
}
