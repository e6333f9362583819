//! Card catalog
//!
//! Read-only card records loaded once at startup from JSON exports
//! (`card_db.json` for the default language, `card_db_<lang>.json` for the
//! others). The index is immutable after loading and shared behind an `Arc`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::analysis::set_code::{localized_variants, normalize_set_code};
use crate::analysis::text::normalize_name;

/// One artwork of a card
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogImage {
    pub id: u64,
    pub image_url: String,
    #[serde(default)]
    pub image_url_small: String,
    #[serde(default)]
    pub image_url_cropped: Option<String>,
}

/// One printing of a card (set + rarity)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogVariant {
    pub set_name: String,
    pub set_code: String,
    #[serde(default)]
    pub set_rarity: String,
    #[serde(default)]
    pub set_rarity_code: Option<String>,
    /// Artwork printed in this variant, when known
    #[serde(default)]
    pub image_id: Option<u64>,
}

impl CatalogVariant {
    pub fn new(set_name: &str, set_code: &str, set_rarity: &str) -> Self {
        Self {
            set_name: set_name.to_string(),
            set_code: set_code.to_string(),
            set_rarity: set_rarity.to_string(),
            ..Default::default()
        }
    }

    /// Stable identifier of this printing within its card
    pub fn variant_id(&self) -> String {
        format!("{}:{}", self.set_code.to_uppercase(), self.set_rarity)
    }
}

/// A catalog card record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogCard {
    pub id: u64,
    pub name: String,
    #[serde(default, rename = "type")]
    pub card_type: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub atk: Option<i32>,
    #[serde(default, rename = "def")]
    pub defense: Option<i32>,
    #[serde(default)]
    pub card_sets: Vec<CatalogVariant>,
    #[serde(default)]
    pub card_images: Vec<CatalogImage>,
}

/// Catalog exports come either bare or wrapped in `{"data": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    Wrapped { data: Vec<CatalogCard> },
    Bare(Vec<CatalogCard>),
}

/// Read-only catalog queries used by the scan pipeline
pub trait CatalogLookup: Send + Sync {
    /// Language the catalog falls back to
    fn default_language(&self) -> &str;

    /// All cards of a language (empty if the language is not loaded)
    fn cards(&self, language: &str) -> &[CatalogCard];

    /// Printings whose code matches `code`, region-agnostic if no exact hit
    fn find_by_set_code(&self, language: &str, code: &str) -> Vec<(&CatalogCard, &CatalogVariant)>;

    /// Card by id
    fn get_card(&self, language: &str, id: u64) -> Option<&CatalogCard>;

    /// Whether `code` (or a localized re-issue of it) exists
    fn is_valid_code(&self, code: &str) -> bool;

    /// Display name for a normalized name key
    fn lookup_name(&self, key: &str) -> Option<&str>;
}

#[derive(Debug, Default)]
struct LanguageCatalog {
    cards: Vec<CatalogCard>,
    /// Upper-cased set code -> (card index, variant index)
    by_code: HashMap<String, Vec<(usize, usize)>>,
    /// Region-less set code -> (card index, variant index)
    by_normalized_code: HashMap<String, Vec<(usize, usize)>>,
    by_id: HashMap<u64, usize>,
}

impl LanguageCatalog {
    fn new(cards: Vec<CatalogCard>) -> Self {
        let mut catalog = Self::default();
        for (ci, card) in cards.iter().enumerate() {
            catalog.by_id.entry(card.id).or_insert(ci);
            for (vi, variant) in card.card_sets.iter().enumerate() {
                let code = variant.set_code.to_uppercase();
                catalog
                    .by_normalized_code
                    .entry(normalize_set_code(&code))
                    .or_default()
                    .push((ci, vi));
                catalog.by_code.entry(code).or_default().push((ci, vi));
            }
        }
        catalog.cards = cards;
        catalog
    }

    fn resolve(&self, hits: &[(usize, usize)]) -> Vec<(&CatalogCard, &CatalogVariant)> {
        hits.iter()
            .filter_map(|&(ci, vi)| {
                let card = self.cards.get(ci)?;
                Some((card, card.card_sets.get(vi)?))
            })
            .collect()
    }
}

/// In-memory catalog with code, name and validity indexes
#[derive(Debug)]
pub struct CatalogIndex {
    default_language: String,
    languages: HashMap<String, LanguageCatalog>,
    names: HashMap<String, String>,
    valid_codes: HashSet<String>,
}

impl CatalogIndex {
    /// Empty catalog
    pub fn new(default_language: &str) -> Self {
        Self {
            default_language: default_language.to_uppercase(),
            languages: HashMap::new(),
            names: HashMap::new(),
            valid_codes: HashSet::new(),
        }
    }

    /// Add (or replace) the cards of one language
    pub fn insert_language(&mut self, language: &str, cards: Vec<CatalogCard>) {
        for card in &cards {
            let key = normalize_name(&card.name);
            if !key.is_empty() {
                self.names.entry(key).or_insert_with(|| card.name.clone());
            }
            for variant in &card.card_sets {
                let code = variant.set_code.to_uppercase();
                self.valid_codes.extend(localized_variants(&code));
                self.valid_codes.insert(code);
            }
        }
        debug!("Catalog {}: {} cards", language, cards.len());
        self.languages
            .insert(language.to_uppercase(), LanguageCatalog::new(cards));
    }

    /// Parse a catalog export
    pub fn parse_json(json: &str) -> Result<Vec<CatalogCard>> {
        let file: CatalogFile = serde_json::from_str(json).context("Malformed catalog JSON")?;
        Ok(match file {
            CatalogFile::Wrapped { data } => data,
            CatalogFile::Bare(cards) => cards,
        })
    }

    /// Load one language from a file
    pub fn load_file(&mut self, language: &str, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {:?}", path))?;
        let cards = Self::parse_json(&content).with_context(|| format!("In {:?}", path))?;
        info!("Loaded {} cards ({}) from {:?}", cards.len(), language, path);
        self.insert_language(language, cards);
        Ok(())
    }

    /// Load every `card_db*.json` in `dir`
    ///
    /// `card_db.json` is the default language; `card_db_de.json` is German
    /// and so on.
    pub fn load_dir(dir: &Path, default_language: &str) -> Result<Self> {
        let mut index = Self::new(default_language);
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read catalog directory {:?}", dir))?;

        let mut files: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        files.sort();

        for path in files {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let language = match stem.strip_prefix("card_db") {
                Some("") => index.default_language.clone(),
                Some(rest) => match rest.strip_prefix('_') {
                    Some(lang) if !lang.is_empty() => lang.to_uppercase(),
                    _ => continue,
                },
                None => continue,
            };
            if let Err(e) = index.load_file(&language, &path) {
                warn!("Skipping catalog file {:?}: {:#}", path, e);
            }
        }

        if index.languages.is_empty() {
            warn!("No catalog files found in {:?}", dir);
        }
        Ok(index)
    }

    /// Loaded languages
    pub fn languages(&self) -> Vec<String> {
        let mut langs: Vec<String> = self.languages.keys().cloned().collect();
        langs.sort();
        langs
    }

    fn language(&self, language: &str) -> Option<&LanguageCatalog> {
        self.languages.get(&language.to_uppercase())
    }
}

impl CatalogLookup for CatalogIndex {
    fn default_language(&self) -> &str {
        &self.default_language
    }

    fn cards(&self, language: &str) -> &[CatalogCard] {
        self.language(language)
            .map(|l| l.cards.as_slice())
            .unwrap_or(&[])
    }

    fn find_by_set_code(&self, language: &str, code: &str) -> Vec<(&CatalogCard, &CatalogVariant)> {
        let Some(catalog) = self.language(language) else {
            return Vec::new();
        };
        let code = code.to_uppercase();
        if let Some(hits) = catalog.by_code.get(&code) {
            return catalog.resolve(hits);
        }
        catalog
            .by_normalized_code
            .get(&normalize_set_code(&code))
            .map(|hits| catalog.resolve(hits))
            .unwrap_or_default()
    }

    fn get_card(&self, language: &str, id: u64) -> Option<&CatalogCard> {
        let catalog = self.language(language)?;
        catalog.by_id.get(&id).and_then(|&i| catalog.cards.get(i))
    }

    fn is_valid_code(&self, code: &str) -> bool {
        self.valid_codes.contains(&code.to_uppercase())
    }

    fn lookup_name(&self, key: &str) -> Option<&str> {
        self.names.get(key).map(String::as_str)
    }
}
