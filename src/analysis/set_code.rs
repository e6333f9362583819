//! Set code extraction and typo correction
//!
//! A set code reads `PREFIX[-][REGION]NUMBER`: a 3-4 character alphanumeric
//! prefix, an optional region marker and a 3 digit card number
//! (`LOB-EN001`, `SDK-001`, `RA01-DE054`, `LOB-E001`). OCR regularly swaps
//! look-alike glyphs in all three parts, so extraction enumerates the
//! plausible re-readings and scores them against the catalog.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::storage::CatalogLookup;

/// Two-letter region markers and the language they denote
pub const LANGUAGE_REGIONS: &[&str] = &["EN", "DE", "FR", "IT", "ES", "PT", "JP", "KR", "AE"];

/// One-letter markers used by early print runs
pub const LEGACY_REGIONS: &[(&str, &str)] = &[
    ("E", "EN"),
    ("G", "DE"),
    ("F", "FR"),
    ("I", "IT"),
    ("S", "ES"),
    ("P", "PT"),
];

/// Letters read where the card number should have digits
const NUMERIC_FIXES: &[(char, char)] = &[
    ('S', '5'),
    ('O', '0'),
    ('I', '1'),
    ('L', '1'),
    ('Z', '7'),
    ('B', '8'),
    ('Q', '0'),
    ('D', '0'),
    ('G', '6'),
];

/// Digits read where the region should have letters
const ALPHA_FIXES: &[(char, char)] = &[('5', 'S'), ('0', 'O'), ('1', 'I'), ('7', 'Z'), ('8', 'B'), ('6', 'G')];

/// Glyphs OCR confuses with each other inside a prefix
const PREFIX_CONFUSABLES: &[&[char]] = &[
    &['1', 'I', 'L'],
    &['0', 'O', 'Q', 'D'],
    &['5', 'S'],
    &['8', 'B'],
    &['2', '7', 'Z'],
    &['6', 'G'],
];

const CATALOG_BONUS: f32 = 0.5;
const KNOWN_REGION_BONUS: f32 = 0.2;
const UNKNOWN_REGION_PENALTY: f32 = 0.1;
const NUMERIC_PREFIX_PENALTY: f32 = 0.5;
const EARLY_LINE_BONUS: f32 = 0.1;
const EARLY_LINE_LIMIT: usize = 5;
const LINE_DECAY: f32 = 0.01;
const FALLBACK_CONFIDENCE: f32 = 0.4;

fn dashed_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([A-Z0-9]{3,4})-([A-Z0-9]{3,6})").expect("valid set code pattern"))
}

fn compact_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Z0-9]{6,9}").expect("valid set code pattern"))
}

fn split_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([A-Z0-9]{3,4})([A-Z0-9]{3,6})").expect("valid set code pattern"))
}

fn region_code_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9]+)-([A-Za-z]{1,2})(\d+)$").expect("valid set code pattern"))
}

/// A scored reading of a set code
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierCandidate {
    /// Formatted code, e.g. `LOB-EN001`
    pub code: String,
    /// Accumulated score; the token confidence plus bonuses
    pub score: f32,
    /// Region marker, empty when the code has none
    pub region: String,
}

impl IdentifierCandidate {
    /// Score mapped to the 0-100 confidence scale
    pub fn confidence(&self) -> f32 {
        (self.score * 100.0).clamp(0.0, 100.0)
    }

    /// Language denoted by the region, or `default_language`
    pub fn language(&self, default_language: &str) -> String {
        region_language(&self.region)
            .map(str::to_string)
            .unwrap_or_else(|| default_language.to_uppercase())
    }
}

/// Prefix / region / number split of one regex hit, before typo fixing
#[derive(Debug, Clone)]
struct RawSplit {
    prefix: String,
    region: String,
    number: String,
}

/// Map a region marker to its language code
pub fn region_language(region: &str) -> Option<&'static str> {
    if let Some(lang) = LANGUAGE_REGIONS.iter().copied().find(|r| *r == region) {
        return Some(lang);
    }
    LEGACY_REGIONS
        .iter()
        .find(|(legacy, _)| *legacy == region)
        .map(|(_, lang)| *lang)
}

fn fix_number(number: &str) -> String {
    number
        .chars()
        .map(|c| {
            NUMERIC_FIXES
                .iter()
                .find(|(from, _)| *from == c)
                .map_or(c, |(_, to)| *to)
        })
        .collect()
}

fn fix_region(region: &str) -> String {
    region
        .chars()
        .map(|c| {
            ALPHA_FIXES
                .iter()
                .find(|(from, _)| *from == c)
                .map_or(c, |(_, to)| *to)
        })
        .collect()
}

/// Every re-reading of `prefix` under the confusable classes
///
/// The unmodified prefix is always first.
pub fn prefix_permutations(prefix: &str) -> Vec<String> {
    let mut variants = vec![String::new()];
    for c in prefix.chars() {
        let mut options = vec![c];
        if let Some(class) = PREFIX_CONFUSABLES.iter().find(|class| class.contains(&c)) {
            options.extend(class.iter().copied().filter(|o| *o != c));
        }
        variants = variants
            .iter()
            .flat_map(|head| {
                options.iter().map(move |o| {
                    let mut next = head.clone();
                    next.push(*o);
                    next
                })
            })
            .collect();
    }
    variants
}

fn format_code(prefix: &str, region: &str, number: &str) -> String {
    format!("{}-{}{}", prefix, region, number)
}

/// Regex hits in one line of text
fn extract_splits(line: &str) -> Vec<RawSplit> {
    let mut splits = Vec::new();

    for caps in dashed_pattern().captures_iter(line) {
        let prefix = &caps[1];
        let suffix = &caps[2];
        let cut = suffix.len() - 3;
        splits.push(RawSplit {
            prefix: prefix.to_string(),
            region: suffix[..cut].to_string(),
            number: suffix[cut..].to_string(),
        });
    }
    if !splits.is_empty() {
        return splits;
    }

    // No dash: the boundaries are ambiguous, so try each tiling of the run
    for m in compact_pattern().find_iter(line) {
        let run = m.as_str();
        for prefix_len in [3usize, 4] {
            if run.len() < prefix_len + 3 {
                continue;
            }
            let region_len = run.len() - prefix_len - 3;
            if region_len > 2 {
                continue;
            }
            splits.push(RawSplit {
                prefix: run[..prefix_len].to_string(),
                region: run[prefix_len..prefix_len + region_len].to_string(),
                number: run[prefix_len + region_len..].to_string(),
            });
        }
    }
    splits
}

/// Ordered, de-duplicated candidate pool
#[derive(Default)]
struct CandidatePool {
    candidates: Vec<IdentifierCandidate>,
    index: HashMap<String, usize>,
}

impl CandidatePool {
    fn offer(&mut self, candidate: IdentifierCandidate) {
        match self.index.get(&candidate.code) {
            Some(&i) => {
                if candidate.score > self.candidates[i].score {
                    self.candidates[i] = candidate;
                }
            }
            None => {
                self.index.insert(candidate.code.clone(), self.candidates.len());
                self.candidates.push(candidate);
            }
        }
    }

    fn best(&self) -> Option<&IdentifierCandidate> {
        let mut best: Option<&IdentifierCandidate> = None;
        for candidate in &self.candidates {
            if best.map_or(true, |b| candidate.score > b.score) {
                best = Some(candidate);
            }
        }
        best
    }
}

/// Extracts and scores set codes from OCR output
pub struct IdentifierCorrector<'a> {
    catalog: Option<&'a dyn CatalogLookup>,
}

impl<'a> IdentifierCorrector<'a> {
    /// Corrector that validates against `catalog`
    pub fn new(catalog: &'a dyn CatalogLookup) -> Self {
        Self { catalog: Some(catalog) }
    }

    /// Corrector without catalog validation
    pub fn standalone() -> Self {
        Self { catalog: None }
    }

    fn is_known(&self, code: &str) -> bool {
        self.catalog.map_or(false, |c| c.is_valid_code(code))
    }

    fn score(&self, code: &str, prefix: &str, region: &str, base: f32, position: f32) -> f32 {
        let mut score = base + position;
        if self.is_known(code) {
            score += CATALOG_BONUS;
        }
        if !region.is_empty() {
            if region_language(region).is_some() {
                score += KNOWN_REGION_BONUS;
            } else {
                score -= UNKNOWN_REGION_PENALTY;
            }
        }
        if prefix.chars().all(|c| c.is_ascii_digit()) {
            score -= NUMERIC_PREFIX_PENALTY;
        }
        score
    }

    fn offer_line(&self, pool: &mut CandidatePool, line: &str, base: f32, position: f32) {
        let upper = line.trim().to_uppercase();
        let stripped: String = upper.chars().filter(|c| !c.is_whitespace()).collect();

        for text in [upper.as_str(), stripped.as_str()] {
            for split in extract_splits(text) {
                let fixed_number = fix_number(&split.number);
                let fixed_region = fix_region(&split.region);

                for prefix in prefix_permutations(&split.prefix) {
                    for number in [&split.number, &fixed_number] {
                        if !number.chars().all(|c| c.is_ascii_digit()) {
                            continue;
                        }
                        for region in [&split.region, &fixed_region] {
                            if !region.chars().all(|c| c.is_ascii_alphabetic()) {
                                continue;
                            }
                            let code = format_code(&prefix, region, number);
                            let score = self.score(&code, &prefix, region, base, position);
                            pool.offer(IdentifierCandidate {
                                code,
                                score,
                                region: region.clone(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// All candidates in generation order
    pub fn candidates(
        &self,
        texts: &[String],
        confidences: &[f32],
        fallback_text: &str,
    ) -> Vec<IdentifierCandidate> {
        let mut pool = CandidatePool::default();

        for (i, text) in texts.iter().enumerate() {
            let base = confidences.get(i).copied().unwrap_or(0.0);
            let position = if i < EARLY_LINE_LIMIT {
                EARLY_LINE_BONUS
            } else {
                -LINE_DECAY * i as f32
            };
            self.offer_line(&mut pool, text, base, position);
        }

        if pool.candidates.is_empty() && !fallback_text.is_empty() {
            self.offer_line(&mut pool, fallback_text, FALLBACK_CONFIDENCE, 0.0);
        }

        pool.candidates
    }

    /// Best set code reading, if any line holds one
    ///
    /// `confidences` are per-token on a 0-1 scale. `fallback_text` (usually
    /// the joined raw text) is only scanned when no single token yields a
    /// candidate. Equal scores resolve to the earliest generated reading.
    pub fn parse(
        &self,
        texts: &[String],
        confidences: &[f32],
        fallback_text: &str,
    ) -> Option<IdentifierCandidate> {
        let mut pool = CandidatePool::default();
        for candidate in self.candidates(texts, confidences, fallback_text) {
            pool.offer(candidate);
        }
        pool.best().cloned()
    }
}

/// Single-pass correction of a best-guess code string
///
/// Returns the corrected code and, when it differs, the cleaned input as
/// an alternative.
pub fn correct_set_code(raw: &str) -> (String, Vec<String>) {
    let mut text: String = raw.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_uppercase();

    if !text.contains('-') {
        if let Some(caps) = split_pattern().captures(&text) {
            text = format!("{}-{}", &caps[1], &caps[2]);
        }
    }

    let parts: Vec<&str> = text.split('-').collect();
    if parts.len() != 2 {
        return (text, Vec::new());
    }
    let (prefix, suffix) = (parts[0], parts[1]);

    let chars: Vec<char> = suffix.chars().collect();
    let fixed_suffix = if chars.len() >= 3 {
        let cut = chars.len() - 3;
        let region: String = chars[..cut].iter().collect();
        let number: String = chars[cut..].iter().collect();
        format!("{}{}", fix_region(&region), fix_number(&number))
    } else {
        suffix.to_string()
    };

    let corrected = format!("{}-{}", prefix, fixed_suffix);
    let alternatives = if corrected != text { vec![text] } else { Vec::new() };
    (corrected, alternatives)
}

/// Strip the region marker: `LOB-EN001` becomes `LOB-001`
pub fn normalize_set_code(code: &str) -> String {
    match region_code_pattern().captures(code) {
        Some(caps) => format!("{}-{}", &caps[1], &caps[3]).to_uppercase(),
        None => code.to_uppercase(),
    }
}

/// Swap a two-letter region marker for `language`
///
/// Codes without a two-letter region are returned unchanged.
pub fn transform_set_code(code: &str, language: &str) -> String {
    match region_code_pattern().captures(code) {
        Some(caps) if caps[2].len() == 2 => {
            format!("{}-{}{}", &caps[1], language.to_uppercase(), &caps[3])
        }
        _ => code.to_string(),
    }
}

/// The code re-issued under every known region marker
///
/// Lets an OCR read of another region's print validate against a catalog
/// that only lists one of them.
pub fn localized_variants(code: &str) -> Vec<String> {
    let Some(caps) = region_code_pattern().captures(code) else {
        return Vec::new();
    };
    let prefix = caps[1].to_uppercase();
    let number = &caps[3];
    LANGUAGE_REGIONS
        .iter()
        .copied()
        .chain(LEGACY_REGIONS.iter().map(|(legacy, _)| *legacy))
        .map(|region| format_code(&prefix, region, number))
        .collect()
}

/// Language from a code's region marker, else `default_language`
pub fn detect_language(code: &str, default_language: &str) -> String {
    region_code_pattern()
        .captures(&code.to_uppercase())
        .and_then(|caps| region_language(&caps[2]))
        .map(str::to_string)
        .unwrap_or_else(|| default_language.to_uppercase())
}
