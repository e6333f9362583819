//! Artwork matching with FAST keypoints and BRIEF descriptors
//!
//! The art region of the scanned card is compared against reference card
//! images. A reference wins only when its cross-checked match count exceeds
//! the configured minimum; below that the count is indistinguishable from
//! card borders and backgrounds matching each other.

use image::{imageops, GrayImage, RgbImage};
use imageproc::corners::corners_fast9;
use tracing::debug;

use super::{CARD_HEIGHT, CARD_WIDTH, ROI_ART};
use crate::config::VisualConfig;

/// 256-bit binary descriptor
pub type Descriptor = [u8; 32];

/// Pixels kept clear of the border so every sampling pair is in bounds
const PATCH_MARGIN: u32 = 16;

/// Reference images whose height/width falls in this band are full card scans
const CARD_RATIO_BAND: (f32, f32) = (1.4, 1.6);

/// BRIEF descriptor around (x, y); `None` too close to the border
fn compute_brief(img: &GrayImage, x: u32, y: u32) -> Option<Descriptor> {
    let (w, h) = img.dimensions();
    if x < PATCH_MARGIN || y < PATCH_MARGIN || x + PATCH_MARGIN >= w || y + PATCH_MARGIN >= h {
        return None;
    }
    let mut desc = [0u8; 32];
    for i in 0..256u32 {
        let p1 = img.get_pixel(x + (i % 15) - 7, y + (i / 15 % 15) - 7);
        let p2 = img.get_pixel(x + (i % 13) - 6, y + (i / 13 % 13) - 6);
        if p1.0[0] > p2.0[0] {
            desc[(i / 8) as usize] |= 1 << (i % 8);
        }
    }
    Some(desc)
}

/// Descriptors for up to `max_keypoints` FAST corners
pub fn describe(gray: &GrayImage, config: &VisualConfig) -> Vec<Descriptor> {
    corners_fast9(gray, config.fast_threshold)
        .into_iter()
        .filter_map(|c| compute_brief(gray, c.x, c.y))
        .take(config.max_keypoints)
        .collect()
}

pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

fn nearest(desc: &Descriptor, set: &[Descriptor]) -> Option<(usize, u32)> {
    set.iter()
        .enumerate()
        .map(|(i, d)| (i, hamming_distance(desc, d)))
        .min_by_key(|&(_, dist)| dist)
}

/// Mutual nearest-neighbour matches closer than `max_distance`
pub fn count_matches(query: &[Descriptor], reference: &[Descriptor], max_distance: u32) -> usize {
    query
        .iter()
        .enumerate()
        .filter(|(qi, q)| match nearest(q, reference) {
            Some((ri, dist)) if dist < max_distance => {
                nearest(&reference[ri], query).is_some_and(|(back, _)| back == *qi)
            }
            _ => false,
        })
        .count()
}

/// Best reference by match count; `(None, 0)` unless it beats the minimum
pub fn best_reference<K: Clone>(
    query: &[Descriptor],
    references: &[(K, Vec<Descriptor>)],
    config: &VisualConfig,
) -> (Option<K>, usize) {
    let mut best: Option<(&K, usize)> = None;
    for (key, descriptors) in references {
        let matches = count_matches(query, descriptors, config.descriptor_max_distance);
        if best.map_or(true, |(_, m)| matches > m) {
            best = Some((key, matches));
        }
    }

    match best {
        Some((key, matches)) if matches > config.artwork_min_matches => (Some(key.clone()), matches),
        _ => (None, 0),
    }
}

/// Art region of a reference image
///
/// Full card scans are normalized to the canonical size and cropped to the
/// art box; anything else (already cropped art) is used whole.
fn reference_art(reference: &RgbImage) -> RgbImage {
    let (w, h) = reference.dimensions();
    if w == 0 {
        return reference.clone();
    }
    let ratio = h as f32 / w as f32;
    if ratio > CARD_RATIO_BAND.0 && ratio < CARD_RATIO_BAND.1 {
        let canonical = imageops::resize(reference, CARD_WIDTH, CARD_HEIGHT, imageops::FilterType::Triangle);
        if let Some(art) = ROI_ART.crop(&canonical) {
            return art;
        }
    }
    reference.clone()
}

/// Match the art of a rectified card against reference images
pub fn match_artwork<K: Clone>(
    card: &RgbImage,
    references: &[(K, RgbImage)],
    config: &VisualConfig,
) -> (Option<K>, usize) {
    let Some(art) = ROI_ART.crop(card) else {
        return (None, 0);
    };
    let query = describe(&imageops::grayscale(&art), config);
    if query.is_empty() {
        return (None, 0);
    }

    let described: Vec<(K, Vec<Descriptor>)> = references
        .iter()
        .map(|(key, img)| {
            let gray = imageops::grayscale(&reference_art(img));
            (key.clone(), describe(&gray, config))
        })
        .collect();

    let (best, matches) = best_reference(&query, &described, config);
    debug!(
        "Artwork: {} query descriptors, {} references, best {} matches",
        query.len(),
        references.len(),
        matches
    );
    (best, matches)
}
