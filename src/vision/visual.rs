//! Visual card analysis: rarity from the title foil, first-edition marker

use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::ROI_NAME;
use crate::config::VisualConfig;

/// Keywords that mark a first-edition print across languages
const FIRST_EDITION_KEYWORDS: &[&str] = &["1st", "edition", "auflage", "edizione", "edición", "edição"];

/// Gold title foil, HSV on the 0-180 hue scale
const GOLD_LOW: [f32; 3] = [10.0, 100.0, 100.0];
const GOLD_HIGH: [f32; 3] = [40.0, 255.0, 255.0];
/// Silver / white title text
const SILVER_LOW: [f32; 3] = [0.0, 0.0, 150.0];
const SILVER_HIGH: [f32; 3] = [180.0, 50.0, 255.0];

/// Rarity guessed from the title region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RarityEstimate {
    pub label: String,
    /// Percentage
    pub confidence: u8,
}

impl RarityEstimate {
    fn new(label: &str, confidence: u8) -> Self {
        Self {
            label: label.to_string(),
            confidence,
        }
    }
}

/// Title-region color statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TitleStats {
    pub gold_fraction: f32,
    pub silver_fraction: f32,
    pub gray_stddev: f32,
}

/// Classify rarity from the title region of a rectified card
pub fn detect_rarity(card: &RgbImage, config: &VisualConfig) -> RarityEstimate {
    match ROI_NAME.crop(card) {
        Some(title) => classify_rarity(title_stats(&title), config),
        None => RarityEstimate::new("Common", 50),
    }
}

/// Map title statistics to a rarity label
pub fn classify_rarity(stats: TitleStats, config: &VisualConfig) -> RarityEstimate {
    if stats.gold_fraction > config.rarity_fraction {
        RarityEstimate::new("Gold/Ultra Rare", 90)
    } else if stats.silver_fraction > config.rarity_fraction {
        if stats.gray_stddev > config.foil_stddev {
            RarityEstimate::new("Secret Rare", 75)
        } else {
            RarityEstimate::new("Common", 60)
        }
    } else {
        RarityEstimate::new("Common", 90)
    }
}

/// Gold / silver pixel fractions and grayscale spread of a region
pub fn title_stats(region: &RgbImage) -> TitleStats {
    let total = (region.width() * region.height()) as f32;
    if total == 0.0 {
        return TitleStats {
            gold_fraction: 0.0,
            silver_fraction: 0.0,
            gray_stddev: 0.0,
        };
    }

    let mut gold = 0u32;
    let mut silver = 0u32;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;

    for px in region.pixels() {
        let hsv = rgb_to_hsv(px.0);
        if in_band(hsv, GOLD_LOW, GOLD_HIGH) {
            gold += 1;
        }
        if in_band(hsv, SILVER_LOW, SILVER_HIGH) {
            silver += 1;
        }
        let [r, g, b] = px.0;
        let gray = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
        sum += gray;
        sum_sq += gray * gray;
    }

    let n = total as f64;
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);

    TitleStats {
        gold_fraction: gold as f32 / total,
        silver_fraction: silver as f32 / total,
        gray_stddev: variance.sqrt() as f32,
    }
}

fn in_band(hsv: [f32; 3], low: [f32; 3], high: [f32; 3]) -> bool {
    (0..3).all(|i| hsv[i] >= low[i] && hsv[i] <= high[i])
}

/// RGB to HSV with H in 0-180 and S, V in 0-255
fn rgb_to_hsv([r, g, b]: [u8; 3]) -> [f32; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let s = if max > 0.0 { delta / max * 255.0 } else { 0.0 };
    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta)
    } else if max == g {
        60.0 * ((b - r) / delta) + 120.0
    } else {
        60.0 * ((r - g) / delta) + 240.0
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    [h / 2.0, s, max]
}

/// Any first-edition keyword in any of the texts (case-insensitive)
pub fn detect_first_edition<S: AsRef<str>>(sources: &[S]) -> bool {
    sources.iter().any(|text| {
        let lower = text.as_ref().to_lowercase();
        FIRST_EDITION_KEYWORDS.iter().any(|k| lower.contains(k))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::{CARD_HEIGHT, CARD_WIDTH};
    use image::Rgb;

    fn card_with_title(color: impl Fn(u32, u32) -> Rgb<u8>) -> RgbImage {
        RgbImage::from_fn(CARD_WIDTH, CARD_HEIGHT, |x, y| {
            if ROI_NAME.x <= x && x < ROI_NAME.x + ROI_NAME.width && ROI_NAME.y <= y && y < ROI_NAME.y + ROI_NAME.height {
                color(x, y)
            } else {
                Rgb([40, 40, 40])
            }
        })
    }

    #[test]
    fn test_hsv_conversion() {
        assert_eq!(rgb_to_hsv([255, 0, 0]), [0.0, 255.0, 255.0]);
        let [h, s, v] = rgb_to_hsv([0, 0, 255]);
        assert!((h - 120.0).abs() < 1e-3);
        assert_eq!((s, v), (255.0, 255.0));
        assert_eq!(rgb_to_hsv([200, 200, 200]), [0.0, 0.0, 200.0]);
    }

    #[test]
    fn test_gold_title() {
        // orange-gold: hue ~ 22 on the 0-180 scale
        let card = card_with_title(|_, _| Rgb([220, 170, 40]));
        assert_eq!(detect_rarity(&card, &VisualConfig::default()).label, "Gold/Ultra Rare");
    }

    #[test]
    fn test_plain_silver_title_is_common() {
        let card = card_with_title(|_, _| Rgb([210, 210, 215]));
        let r = detect_rarity(&card, &VisualConfig::default());
        assert_eq!(r, RarityEstimate::new("Common", 60));
    }

    #[test]
    fn test_noisy_silver_title_is_secret() {
        let card = card_with_title(|x, y| if (x + y) % 2 == 0 { Rgb([250, 250, 250]) } else { Rgb([20, 20, 20]) });
        let stats = title_stats(&ROI_NAME.crop(&card).unwrap());
        assert!(stats.silver_fraction > 0.4);
        assert!(stats.gray_stddev > 50.0);
        assert_eq!(detect_rarity(&card, &VisualConfig::default()).label, "Secret Rare");
    }

    #[test]
    fn test_dark_title_is_common() {
        let card = card_with_title(|_, _| Rgb([30, 30, 60]));
        assert_eq!(detect_rarity(&card, &VisualConfig::default()), RarityEstimate::new("Common", 90));
    }

    #[test]
    fn test_first_edition_keywords() {
        assert!(detect_first_edition(&["1. Auflage"]));
        assert!(detect_first_edition(&["", "1st EDITION"]));
        assert!(detect_first_edition(&["1a Edición"]));
        assert!(detect_first_edition(&["1ª EDIÇÃO"]));
        assert!(detect_first_edition(&["Prima Edizione".to_string()]));
        assert!(!detect_first_edition(&["LOB-EN001", "Limited"]));
        assert!(!detect_first_edition::<&str>(&[]));
    }
}
