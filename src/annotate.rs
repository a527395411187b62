//! Turns a detector's output into what the session displays: the annotated
//! image in canonical RGB order plus the caption summarizing the detections.

use std::fmt::Write as _;

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::vision::Detection;

/// Base caption; detections append to it, an empty run leaves it bare.
pub const CAPTION_PREFIX: &str = "DETECTED:";

/// Nested hollow rectangles, so effectively line width in pixels.
const BOX_THICKNESS: u32 = 3;

/// Per-class box colors, picked by a stable hash of the class name.
const PALETTE: [Rgb<u8>; 8] = [
    Rgb([230, 57, 70]),
    Rgb([46, 134, 171]),
    Rgb([241, 143, 1]),
    Rgb([106, 153, 78]),
    Rgb([155, 93, 229]),
    Rgb([0, 187, 173]),
    Rgb([244, 211, 94]),
    Rgb([239, 108, 170]),
];

/// What the display surface gets after a completed prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub display: RgbImage,
    pub caption: String,
}

/// Produces the display image and caption for a completed prediction.
///
/// The annotated image is already RGB (the only channel order in this core),
/// so the conversion to display order is the identity. Pure: same inputs,
/// same outputs, nothing mutated.
#[must_use]
pub fn render(detections: &[Detection], annotated: RgbImage) -> Rendered {
    Rendered {
        display: annotated,
        caption: build_caption(detections),
    }
}

/// Builds the caption in detection order.
///
/// Reproduces the legacy format exactly, including the separator after the
/// last fragment: `"DETECTED: name=<n> confidence=<p>%, "`. An empty run
/// yields the bare prefix.
#[must_use]
pub fn build_caption(detections: &[Detection]) -> String {
    let mut caption = String::from(CAPTION_PREFIX);
    for detection in detections {
        let _ = write!(
            caption,
            " name={} confidence={}%,",
            detection.class_name,
            format_confidence(detection.score)
        );
    }
    // The leading space of the next fragment doubles as the separator, so
    // only the last fragment needs its trailing space appended here.
    if !detections.is_empty() {
        caption.push(' ');
    }
    caption
}

/// Percentage rounded to two decimals, printed with trailing zeros trimmed
/// down to one decimal digit: 0.91 -> "91.0", 0.653 -> "65.3", 0.6525 -> "65.25".
fn format_confidence(score: f32) -> String {
    let pct = (f64::from(score) * 100.0 * 100.0).round() / 100.0;
    let mut formatted = format!("{pct:.2}");
    if formatted.ends_with('0') {
        formatted.pop();
    }
    formatted
}

/// Draws hollow class-colored boxes for each detection, clamped to the image
/// bounds. Degenerate boxes are skipped.
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    for detection in detections {
        let color = class_color(&detection.class_name);

        let max_x = (width - 1) as f32;
        let max_y = (height - 1) as f32;
        let x0 = detection.bbox[0].clamp(0.0, max_x) as i32;
        let y0 = detection.bbox[1].clamp(0.0, max_y) as i32;
        let x1 = detection.bbox[2].clamp(0.0, max_x) as i32;
        let y1 = detection.bbox[3].clamp(0.0, max_y) as i32;
        if x1 <= x0 || y1 <= y0 {
            continue;
        }

        for inset in 0..BOX_THICKNESS as i32 {
            let box_w = x1 - x0 - 2 * inset;
            let box_h = y1 - y0 - 2 * inset;
            if box_w < 1 || box_h < 1 {
                break;
            }
            let rect = Rect::at(x0 + inset, y0 + inset).of_size(box_w as u32, box_h as u32);
            draw_hollow_rect_mut(image, rect, color);
        }
    }
}

fn class_color(class_name: &str) -> Rgb<u8> {
    let index = class_name
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    PALETTE[index % PALETTE.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(name: &str, bbox: [f32; 4], score: f32) -> Detection {
        Detection {
            class_name: name.to_string(),
            bbox,
            score,
        }
    }

    #[test]
    fn caption_empty_is_bare_prefix() {
        assert_eq!(build_caption(&[]), "DETECTED:");
    }

    #[test]
    fn caption_single_detection() {
        let detections = [detection("algaeA", [0.0, 0.0, 1.0, 1.0], 0.653)];
        assert_eq!(
            build_caption(&detections),
            "DETECTED: name=algaeA confidence=65.3%, "
        );
    }

    #[test]
    fn caption_keeps_detector_order_and_trailing_separator() {
        let detections = [
            detection("diatom", [10.0, 10.0, 50.0, 50.0], 0.91),
            detection("diatom", [60.0, 60.0, 100.0, 100.0], 0.40),
        ];
        assert_eq!(
            build_caption(&detections),
            "DETECTED: name=diatom confidence=91.0%, name=diatom confidence=40.0%, "
        );
    }

    #[test]
    fn caption_fragments_are_separated_by_a_single_space() {
        let detections = [
            detection("navicula", [0.0, 0.0, 10.0, 10.0], 0.5),
            detection("euglena", [20.0, 20.0, 30.0, 30.0], 0.75),
        ];
        let caption = build_caption(&detections);
        assert!(!caption.contains("  "));
        assert_eq!(
            caption,
            "DETECTED: name=navicula confidence=50.0%, name=euglena confidence=75.0%, "
        );
    }

    #[test]
    fn caption_keeps_two_significant_decimals() {
        let detections = [detection("volvox", [0.0, 0.0, 1.0, 1.0], 0.6525)];
        assert_eq!(
            build_caption(&detections),
            "DETECTED: name=volvox confidence=65.25%, "
        );
    }

    #[test]
    fn render_is_idempotent() {
        let image = RgbImage::from_pixel(64, 48, Rgb([7, 7, 7]));
        let detections = [detection("algaeA", [4.0, 4.0, 20.0, 20.0], 0.8)];

        let first = render(&detections, image.clone());
        let second = render(&detections, image);
        assert_eq!(first, second);
    }

    #[test]
    fn render_preserves_dimensions() {
        let image = RgbImage::new(640, 480);
        let rendered = render(&[], image);
        assert_eq!(rendered.display.dimensions(), (640, 480));
    }

    #[test]
    fn draw_clamps_out_of_bounds_boxes() {
        let mut image = RgbImage::new(32, 32);
        let detections = [
            detection("a", [-10.0, -10.0, 100.0, 100.0], 0.9),
            detection("b", [31.0, 31.0, 31.0, 31.0], 0.9), // degenerate
        ];
        draw_detections(&mut image, &detections);
        assert_eq!(image.dimensions(), (32, 32));
    }

    #[test]
    fn draw_marks_box_edges() {
        let mut image = RgbImage::new(64, 64);
        draw_detections(&mut image, &[detection("a", [8.0, 8.0, 40.0, 40.0], 0.9)]);
        assert_ne!(image.get_pixel(8, 8), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(60, 60), &Rgb([0, 0, 0]));
    }
}
