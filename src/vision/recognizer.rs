//! Structured recognition over one OCR engine pass
//!
//! Runs an engine over an image and pulls the card fields out of the text:
//! set code (through the identifier corrector), name, ATK/DEF and the
//! Spell/Trap tag.

use image::RgbImage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use super::ocr::{EngineKind, OcrOutput, TextEngine, TextLayout};
use super::ocr_preprocess::apply_preprocessing;
use super::preprocess::upscale_for_ocr;
use crate::analysis::set_code::{detect_language, IdentifierCorrector};
use crate::analysis::text::normalize_name;
use crate::config::{EngineSettings, OcrPreprocessing};
use crate::error::EngineError;
use crate::storage::CatalogLookup;

/// Only this many leading characters are searched for the card type
const TYPE_SCAN_CHARS: usize = 100;

const SPELL_KEYWORDS: &[&str] = &["SPELL", "ZAUBER", "MAGIE", "MAGIA", "MÁGICA", "MAGICA"];
const TRAP_KEYWORDS: &[&str] = &["TRAP", "FALLE", "PIÈGE", "PIEGE", "TRAPPOLA", "TRAMPA", "ARMADILHA"];

fn atk_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ATK[:/.]?\s*([0-9?]+)").expect("valid ATK pattern"))
}

fn def_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"DEF[:/.]?\s*([0-9?]+)").expect("valid DEF pattern"))
}

/// Which image an OCR pass ran over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// The whole captured frame
    Full,
    /// The rectified card
    Crop,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Full => "full",
            Scope::Crop => "crop",
        })
    }
}

/// Fields extracted by one (engine, scope) pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub engine: EngineKind,
    pub scope: Scope,
    /// Tokens joined with the token separator
    pub raw_text: String,
    pub set_id: Option<String>,
    /// 0 - 100
    pub set_id_conf: f32,
    pub language: String,
    pub card_name: Option<String>,
    pub atk: Option<String>,
    pub def: Option<String>,
    /// "Spell" or "Trap"
    pub card_type: Option<String>,
}

impl RecognitionResult {
    /// Result with no extracted fields, used when the engine failed
    pub fn empty(engine: EngineKind, scope: Scope, language: &str) -> Self {
        Self {
            engine,
            scope,
            raw_text: String::new(),
            set_id: None,
            set_id_conf: 0.0,
            language: language.to_uppercase(),
            card_name: None,
            atk: None,
            def: None,
            card_type: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw_text.is_empty() && self.set_id.is_none()
    }
}

/// Turns engine output into [`RecognitionResult`]s
pub struct Recognizer {
    catalog: Option<Arc<dyn CatalogLookup>>,
    upscale_min_width: u32,
    upscale_target_width: u32,
    preprocessing: OcrPreprocessing,
    default_language: String,
}

impl Recognizer {
    pub fn new(
        catalog: Option<Arc<dyn CatalogLookup>>,
        engines: &EngineSettings,
        preprocessing: OcrPreprocessing,
        default_language: &str,
    ) -> Self {
        Self {
            catalog,
            upscale_min_width: engines.upscale_min_width,
            upscale_target_width: engines.upscale_target_width,
            preprocessing,
            default_language: default_language.to_uppercase(),
        }
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    /// Run `engine` over `image` and interpret its output
    pub fn recognize(
        &self,
        image: &RgbImage,
        engine: &dyn TextEngine,
        scope: Scope,
    ) -> Result<RecognitionResult, EngineError> {
        let output = self.read_text(image, engine)?;
        Ok(self.interpret(engine.kind(), scope, &output))
    }

    /// Upscale, filter and OCR
    pub fn read_text(&self, image: &RgbImage, engine: &dyn TextEngine) -> Result<OcrOutput, EngineError> {
        let upscaled = upscale_for_ocr(image, self.upscale_min_width, self.upscale_target_width);
        let prepared = apply_preprocessing(&upscaled, &self.preprocessing);
        engine.run(&prepared)
    }

    /// Extract the card fields from an engine's output
    pub fn interpret(&self, engine: EngineKind, scope: Scope, output: &OcrOutput) -> RecognitionResult {
        let raw_text = output.raw_text();
        let texts = output.texts();
        let confidences = output.confidences();

        let candidate = match &self.catalog {
            Some(catalog) => IdentifierCorrector::new(catalog.as_ref()).parse(&texts, &confidences, &raw_text),
            None => IdentifierCorrector::standalone().parse(&texts, &confidences, &raw_text),
        };

        let (set_id, set_id_conf, language) = match candidate {
            Some(c) => {
                let language = if c.region.is_empty() {
                    detect_language(&c.code, &self.default_language)
                } else {
                    c.language(&self.default_language)
                };
                let conf = c.confidence();
                (Some(c.code), conf, language)
            }
            None => (None, 0.0, self.default_language.clone()),
        };

        let card_name = match (&output.layout, &self.catalog) {
            (Some(layout), Some(catalog)) => find_card_name(layout, catalog.as_ref()),
            _ => None,
        };

        let result = RecognitionResult {
            engine,
            scope,
            atk: capture_stat(atk_pattern(), &raw_text),
            def: capture_stat(def_pattern(), &raw_text),
            card_type: detect_card_type(&raw_text).map(str::to_string),
            raw_text,
            set_id,
            set_id_conf,
            language,
            card_name,
        };
        debug!(
            engine = %engine,
            scope = %scope,
            "Recognized set_id={:?} ({:.0}) name={:?}",
            result.set_id,
            result.set_id_conf,
            result.card_name
        );
        result
    }
}

fn capture_stat(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures(&text.to_uppercase())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// "Spell" / "Trap" from keywords near the start of the text
pub fn detect_card_type(raw_text: &str) -> Option<&'static str> {
    let head: String = raw_text.chars().take(TYPE_SCAN_CHARS).collect::<String>().to_uppercase();
    if SPELL_KEYWORDS.iter().any(|k| head.contains(k)) {
        Some("Spell")
    } else if TRAP_KEYWORDS.iter().any(|k| head.contains(k)) {
        Some("Trap")
    } else {
        None
    }
}

/// First dictionary hit: whole blocks first, then single lines
pub fn find_card_name(layout: &TextLayout, catalog: &dyn CatalogLookup) -> Option<String> {
    let lookup = |text: String| {
        let key = normalize_name(&text);
        if key.is_empty() {
            return None;
        }
        catalog.lookup_name(&key).map(str::to_string)
    };

    layout
        .blocks
        .iter()
        .find_map(|block| lookup(block.text()))
        .or_else(|| {
            layout
                .blocks
                .iter()
                .flat_map(|b| b.lines.iter())
                .find_map(|line| lookup(line.text()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CatalogCard, CatalogIndex, CatalogVariant};
    use crate::vision::ocr::testing::FakeEngine;
    use crate::vision::ocr::{LayoutBlock, LayoutLine, LayoutWord, OcrToken};

    fn catalog() -> Arc<dyn CatalogLookup> {
        let mut index = CatalogIndex::new("EN");
        index.insert_language(
            "EN",
            vec![
                CatalogCard {
                    id: 89631139,
                    name: "Blue-Eyes White Dragon".into(),
                    card_sets: vec![CatalogVariant::new("Legend of Blue Eyes", "LOB-EN001", "Ultra Rare")],
                    ..Default::default()
                },
                CatalogCard {
                    id: 5,
                    name: "Giftzähne".into(),
                    card_sets: vec![CatalogVariant::new("Metal Raiders", "MRD-DE005", "Common")],
                    ..Default::default()
                },
            ],
        );
        Arc::new(index)
    }

    fn recognizer() -> Recognizer {
        Recognizer::new(Some(catalog()), &EngineSettings::default(), OcrPreprocessing::default(), "EN")
    }

    fn layout(lines: &[&[&str]]) -> TextLayout {
        TextLayout {
            blocks: vec![LayoutBlock {
                lines: lines
                    .iter()
                    .map(|words| LayoutLine {
                        words: words
                            .iter()
                            .map(|w| LayoutWord {
                                text: w.to_string(),
                                confidence: 0.9,
                                bbox: (0, 0, 10, 10),
                            })
                            .collect(),
                    })
                    .collect(),
            }],
        }
    }

    #[test]
    fn test_scope_tags() {
        assert_eq!(serde_json::to_string(&Scope::Crop).unwrap(), "\"crop\"");
        assert_eq!(Scope::Full.to_string(), "full");
    }

    #[test]
    fn test_recognize_extracts_set_code() {
        let engine = FakeEngine::tokens(EngineKind::Paddle, &[("Blue-Eyes White Dragon", 0.95), ("LOB-EN001", 0.9)]);
        let result = recognizer()
            .recognize(&RgbImage::new(64, 64), &engine, Scope::Crop)
            .unwrap();

        assert_eq!(result.engine, EngineKind::Paddle);
        assert_eq!(result.scope, Scope::Crop);
        assert_eq!(result.raw_text, "Blue-Eyes White Dragon | LOB-EN001");
        assert_eq!(result.set_id.as_deref(), Some("LOB-EN001"));
        assert!(result.set_id_conf >= 90.0);
        assert_eq!(result.language, "EN");
        // no layout, no name
        assert_eq!(result.card_name, None);
    }

    #[test]
    fn test_recognize_propagates_engine_error() {
        let engine = FakeEngine::failing(EngineKind::PaddleWorker, EngineError::Timeout(30_000));
        let err = recognizer()
            .recognize(&RgbImage::new(8, 8), &engine, Scope::Full)
            .unwrap_err();
        assert_eq!(err, EngineError::Timeout(30_000));
    }

    #[test]
    fn test_language_from_region() {
        let output = OcrOutput::from_tokens(vec![OcrToken::new("MRD-DE005", 0.8)]);
        let result = recognizer().interpret(EngineKind::Paddle, Scope::Crop, &output);
        assert_eq!(result.set_id.as_deref(), Some("MRD-DE005"));
        assert_eq!(result.language, "DE");
    }

    #[test]
    fn test_no_code_keeps_default_language() {
        let output = OcrOutput::from_tokens(vec![OcrToken::new("nothing here", 0.8)]);
        let result = recognizer().interpret(EngineKind::Paddle, Scope::Full, &output);
        assert_eq!(result.set_id, None);
        assert_eq!(result.set_id_conf, 0.0);
        assert_eq!(result.language, "EN");
    }

    #[test]
    fn test_atk_def_extraction() {
        let output = OcrOutput::from_tokens(vec![OcrToken::new("ATK/3000 DEF/2500", 0.9)]);
        let result = recognizer().interpret(EngineKind::Paddle, Scope::Crop, &output);
        assert_eq!(result.atk.as_deref(), Some("3000"));
        assert_eq!(result.def.as_deref(), Some("2500"));

        let output = OcrOutput::from_tokens(vec![OcrToken::new("atk: ? def.  0", 0.9)]);
        let result = recognizer().interpret(EngineKind::Paddle, Scope::Crop, &output);
        assert_eq!(result.atk.as_deref(), Some("?"));
        assert_eq!(result.def.as_deref(), Some("0"));
    }

    #[test]
    fn test_card_type_only_near_start() {
        assert_eq!(detect_card_type("Pot of Greed | [SPELL CARD]"), Some("Spell"));
        assert_eq!(detect_card_type("Mirror Force | [CARTE PIÈGE]"), Some("Trap"));
        assert_eq!(detect_card_type("Zauberkarte"), Some("Spell"));

        let flavor = format!("{} negate a trap", "x".repeat(120));
        assert_eq!(detect_card_type(&flavor), None);
    }

    #[test]
    fn test_name_from_block_then_lines() {
        let catalog = catalog();
        let whole = layout(&[&["Blue-Eyes", "White"], &["Dragon"]]);
        assert_eq!(find_card_name(&whole, catalog.as_ref()).as_deref(), Some("Blue-Eyes White Dragon"));

        let noisy = layout(&[&["GIFTZÂHNE"], &["[FALLENKARTE]"]]);
        assert_eq!(find_card_name(&noisy, catalog.as_ref()).as_deref(), Some("Giftzähne"));

        let none = layout(&[&["Unknown", "Card"]]);
        assert_eq!(find_card_name(&none, catalog.as_ref()), None);
    }

    #[test]
    fn test_name_only_with_layout() {
        let mut output = OcrOutput::from_tokens(vec![OcrToken::new("Blue-Eyes White Dragon", 0.9)]);
        let result = recognizer().interpret(EngineKind::Paddle, Scope::Crop, &output);
        assert_eq!(result.card_name, None);

        output.layout = Some(layout(&[&["Blue-Eyes", "White", "Dragon"]]));
        let result = recognizer().interpret(EngineKind::Tesseract, Scope::Crop, &output);
        assert_eq!(result.card_name.as_deref(), Some("Blue-Eyes White Dragon"));
    }

    #[test]
    fn test_standalone_recognizer() {
        let recognizer = Recognizer::new(None, &EngineSettings::default(), OcrPreprocessing::default(), "en");
        let output = OcrOutput::from_tokens(vec![OcrToken::new("LOB-EN0O1", 0.9)]);
        let result = recognizer.interpret(EngineKind::Paddle, Scope::Crop, &output);
        assert_eq!(result.set_id.as_deref(), Some("LOB-EN001"));
        assert_eq!(recognizer.default_language(), "EN");
    }
}
