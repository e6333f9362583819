//! Perspective rectification to the canonical card view

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use tracing::{debug, warn};

use super::{Point, Quad, CARD_HEIGHT, CARD_WIDTH};

/// Order corners as top-left, top-right, bottom-right, bottom-left
///
/// Top-left has the smallest x+y and bottom-right the largest; top-right
/// has the smallest y-x and bottom-left the largest.
pub fn order_points(quad: &Quad) -> [Point; 4] {
    let pts = quad.points;
    let by = |key: fn(&Point) -> f32, largest: bool| -> Point {
        let mut best = pts[0];
        for p in &pts[1..] {
            let better = if largest { key(p) > key(&best) } else { key(p) < key(&best) };
            if better {
                best = *p;
            }
        }
        best
    };

    let sum = |p: &Point| p.0 + p.1;
    let diff = |p: &Point| p.1 - p.0;

    [
        by(sum, false),
        by(diff, false),
        by(sum, true),
        by(diff, true),
    ]
}

/// Warp the quadrilateral region of `frame` to a `width` x `height` image
///
/// Degenerate quads (no projective solution) fall back to a plain resize of
/// the whole frame.
pub fn rectify_to(frame: &RgbImage, quad: &Quad, width: u32, height: u32) -> RgbImage {
    let src = order_points(quad);
    let dst: [Point; 4] = [
        (0.0, 0.0),
        ((width - 1) as f32, 0.0),
        ((width - 1) as f32, (height - 1) as f32),
        (0.0, (height - 1) as f32),
    ];

    let Some(projection) = Projection::from_control_points(src, dst) else {
        warn!("Degenerate card quad {:?}; resizing whole frame", src);
        return image::imageops::resize(frame, width, height, image::imageops::FilterType::Triangle);
    };

    let mut output = RgbImage::new(width, height);
    warp_into(frame, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut output);
    debug!("Rectified quad {:?} to {}x{}", src, width, height);
    output
}

/// Warp the quadrilateral region of `frame` to the canonical card size
pub fn rectify(frame: &RgbImage, quad: &Quad) -> RgbImage {
    rectify_to(frame, quad, CARD_WIDTH, CARD_HEIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_points_from_shuffled_corners() {
        let quad = Quad::new([(400.0, 600.0), (100.0, 50.0), (90.0, 620.0), (420.0, 40.0)]);
        let ordered = order_points(&quad);
        assert_eq!(ordered, [(100.0, 50.0), (420.0, 40.0), (400.0, 600.0), (90.0, 620.0)]);
    }

    #[test]
    fn test_rectify_output_size() {
        let frame = RgbImage::from_pixel(800, 600, Rgb([50, 50, 50]));
        let quad = Quad::from_rect(200.0, 50.0, 300.0, 437.0);
        let out = rectify(&frame, &quad);
        assert_eq!(out.dimensions(), (CARD_WIDTH, CARD_HEIGHT));
    }

    #[test]
    fn test_rectify_maps_region_content() {
        // Red card region on a blue frame; the warp should be all red
        let frame = RgbImage::from_fn(800, 800, |x, y| {
            if (200..500).contains(&x) && (100..540).contains(&y) {
                Rgb([220, 20, 20])
            } else {
                Rgb([20, 20, 220])
            }
        });
        let quad = Quad::new([(499.0, 539.0), (200.0, 100.0), (499.0, 100.0), (200.0, 539.0)]);
        let out = rectify(&frame, &quad);

        for (x, y) in [(5, 5), (300, 437), (594, 869)] {
            let p = out.get_pixel(x, y).0;
            assert!(p[0] > 150 && p[2] < 100, "pixel ({}, {}) = {:?}", x, y, p);
        }
    }
}
