//! Catalog matching
//!
//! Fuses every (engine, scope) recognition result into ranked catalog
//! candidates. Set code hits score `60 + 0.4 * ocr_confidence`; a fuzzy name
//! hit boosts code candidates of the same card or, when there are none,
//! adds a weaker name-only candidate.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use super::set_code::correct_set_code;
use super::text::fuzzy_ratio;
use crate::storage::{CatalogCard, CatalogLookup, CatalogVariant, ImageCache};
use crate::vision::ocr::TOKEN_SEPARATOR;
use crate::vision::RecognitionResult;

const CODE_BASE_SCORE: f32 = 60.0;
const CODE_CONFIDENCE_WEIGHT: f32 = 0.4;
const ALTERNATE_WEIGHT: f32 = 0.9;
/// Fuzzy ratios above this count as a name hit
const NAME_MATCH_RATIO: u32 = 80;
const NAME_BOOST_WEIGHT: f32 = 0.2;
const NAME_ONLY_WEIGHT: f32 = 0.8;
/// Shorter first segments are not treated as a title
const MIN_NAME_GUESS_LEN: usize = 4;
/// Runner-up above this fraction of the best score makes a match ambiguous
const AMBIGUITY_RATIO: f32 = 0.9;

/// A catalog printing the scan may be
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub card_id: u64,
    pub name: String,
    pub set_code: String,
    pub rarity: String,
    /// 0 - 100
    pub confidence: f32,
    pub reason: String,
    pub image_path: Option<PathBuf>,
}

impl MatchCandidate {
    fn from_variant(card: &CatalogCard, variant: &CatalogVariant, confidence: f32, reason: String) -> Self {
        Self {
            card_id: card.id,
            name: card.name.clone(),
            set_code: variant.set_code.clone(),
            rarity: variant.set_rarity.clone(),
            confidence,
            reason,
            image_path: None,
        }
    }
}

/// Ranked candidates of one scan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    /// Highest confidence first
    pub candidates: Vec<MatchCandidate>,
    pub best: Option<MatchCandidate>,
    /// Runner-up too close to the best to commit automatically
    pub ambiguous: bool,
    /// Language the catalog was searched in
    pub language: String,
}

/// Candidates keyed by (card, printing) in insertion order
#[derive(Default)]
struct CandidateTable {
    candidates: Vec<MatchCandidate>,
    index: HashMap<String, usize>,
}

impl CandidateTable {
    /// Insert, or replace score and reason on a strictly better score
    fn offer(&mut self, key: String, candidate: MatchCandidate) {
        match self.index.get(&key) {
            Some(&i) => {
                let existing = &mut self.candidates[i];
                if candidate.confidence > existing.confidence {
                    existing.confidence = candidate.confidence;
                    existing.reason = candidate.reason;
                }
            }
            None => {
                self.index.insert(key, self.candidates.len());
                self.candidates.push(candidate);
            }
        }
    }

    fn boost_card(&mut self, card_id: u64, ratio: u32) -> bool {
        let mut found = false;
        for candidate in self.candidates.iter_mut().filter(|c| c.card_id == card_id) {
            candidate.confidence = (candidate.confidence + ratio as f32 * NAME_BOOST_WEIGHT).min(100.0);
            candidate.reason.push_str(&format!(" + Name Match ({}%)", ratio));
            found = true;
        }
        found
    }
}

/// Set codes read across all results, with the best confidence of each
pub fn collect_codes(results: &[RecognitionResult]) -> Vec<(String, f32)> {
    let mut codes: Vec<(String, f32)> = Vec::new();
    let mut bump = |code: String, conf: f32| match codes.iter_mut().find(|(c, _)| *c == code) {
        Some((_, best)) => *best = best.max(conf),
        None => codes.push((code, conf)),
    };

    for result in results {
        let Some(raw) = result.set_id.as_deref().filter(|s| !s.trim().is_empty()) else {
            continue;
        };
        let (corrected, alternates) = correct_set_code(raw);
        bump(corrected, result.set_id_conf);
        for alt in alternates {
            bump(alt, result.set_id_conf * ALTERNATE_WEIGHT);
        }
    }
    codes
}

/// Majority language of the results that read a set code
///
/// Ties go to a language other than `default_language`; with no votes the
/// default is used.
pub fn vote_language(results: &[RecognitionResult], default_language: &str) -> String {
    let default_language = default_language.to_uppercase();
    let mut votes: Vec<(String, usize)> = Vec::new();
    for result in results.iter().filter(|r| r.set_id.is_some() && !r.language.is_empty()) {
        let lang = result.language.to_uppercase();
        match votes.iter_mut().find(|(l, _)| *l == lang) {
            Some((_, n)) => *n += 1,
            None => votes.push((lang, 1)),
        }
    }

    let mut winner: Option<(String, usize)> = None;
    for (lang, count) in votes {
        let better = match &winner {
            None => true,
            Some((best, best_count)) => {
                count > *best_count || (count == *best_count && *best == default_language && lang != default_language)
            }
        };
        if better {
            winner = Some((lang, count));
        }
    }
    winner.map(|(lang, _)| lang).unwrap_or(default_language)
}

/// Title guesses: recognized names, then the first raw-text segment
pub fn name_guesses(results: &[RecognitionResult]) -> Vec<String> {
    let mut guesses: Vec<String> = Vec::new();
    let mut add = |guess: &str| {
        let guess = guess.trim();
        if guess.chars().count() >= MIN_NAME_GUESS_LEN && !guesses.iter().any(|g| g == guess) {
            guesses.push(guess.to_string());
        }
    };

    for name in results.iter().filter_map(|r| r.card_name.as_deref()) {
        add(name);
    }
    for result in results {
        if let Some(first) = result.raw_text.split(TOKEN_SEPARATOR.trim()).next() {
            add(first);
        }
    }
    guesses
}

/// Matches recognition results against the catalog
pub struct Matcher {
    catalog: Arc<dyn CatalogLookup>,
    images: Option<Arc<dyn ImageCache>>,
}

impl Matcher {
    pub fn new(catalog: Arc<dyn CatalogLookup>, images: Option<Arc<dyn ImageCache>>) -> Self {
        Self { catalog, images }
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogLookup> {
        &self.catalog
    }

    /// Rank catalog candidates for one scan
    pub fn match_results(&self, results: &[RecognitionResult], default_language: &str) -> MatchOutcome {
        let language = vote_language(results, default_language);

        let mut search_language = language.clone();
        if self.catalog.cards(&search_language).is_empty() {
            search_language = self.catalog.default_language().to_string();
        }
        let cards = self.catalog.cards(&search_language);
        if cards.is_empty() {
            debug!("No catalog loaded for {} or the default language", language);
            return MatchOutcome {
                language,
                ..Default::default()
            };
        }

        let mut table = CandidateTable::default();

        for (code, conf) in collect_codes(results) {
            let score = (CODE_BASE_SCORE + conf * CODE_CONFIDENCE_WEIGHT).min(100.0);
            for (card, variant) in self.catalog.find_by_set_code(&search_language, &code) {
                let key = format!("{}_{}", card.id, variant.variant_id());
                let reason = format!("Set Code Match ({})", code);
                table.offer(key, MatchCandidate::from_variant(card, variant, score, reason));
            }
        }

        let guesses = name_guesses(results);
        if !guesses.is_empty() {
            for card in cards {
                let ratio = guesses
                    .iter()
                    .map(|g| fuzzy_ratio(g, &card.name))
                    .max()
                    .unwrap_or(0);
                if ratio <= NAME_MATCH_RATIO || table.boost_card(card.id, ratio) {
                    continue;
                }
                if let Some(variant) = card.card_sets.first() {
                    let reason = format!("Fuzzy Name Match ({}%)", ratio);
                    table.offer(
                        format!("{}_name", card.id),
                        MatchCandidate::from_variant(card, variant, ratio as f32 * NAME_ONLY_WEIGHT, reason),
                    );
                }
            }
        }

        let mut candidates = table.candidates;
        if let Some(images) = &self.images {
            for candidate in &mut candidates {
                candidate.image_path = Some(images.image_path_for(candidate.card_id));
            }
        }
        candidates.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

        let ambiguous = is_ambiguous(&candidates);
        debug!(
            "Matched {} candidates in {} (ambiguous: {})",
            candidates.len(),
            search_language,
            ambiguous
        );
        MatchOutcome {
            best: candidates.first().cloned(),
            candidates,
            ambiguous,
            language,
        }
    }
}

/// Two or more candidates with the runner-up above 90% of the best
pub fn is_ambiguous(sorted: &[MatchCandidate]) -> bool {
    match sorted {
        [best, runner_up, ..] => runner_up.confidence > best.confidence * AMBIGUITY_RATIO,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CatalogIndex, HttpImageCache};
    use crate::vision::ocr::EngineKind;
    use crate::vision::Scope;

    fn card(id: u64, name: &str, variants: &[(&str, &str)]) -> CatalogCard {
        CatalogCard {
            id,
            name: name.to_string(),
            card_sets: variants
                .iter()
                .map(|(code, rarity)| CatalogVariant::new("Set", code, rarity))
                .collect(),
            ..Default::default()
        }
    }

    fn result(raw_text: &str, set_id: Option<&str>, conf: f32, language: &str) -> RecognitionResult {
        RecognitionResult {
            raw_text: raw_text.to_string(),
            set_id: set_id.map(str::to_string),
            set_id_conf: conf,
            ..RecognitionResult::empty(EngineKind::Paddle, Scope::Crop, language)
        }
    }

    fn candidate(confidence: f32) -> MatchCandidate {
        MatchCandidate {
            card_id: 1,
            name: "x".into(),
            set_code: "X-001".into(),
            rarity: "Common".into(),
            confidence,
            reason: String::new(),
            image_path: None,
        }
    }

    fn matcher(cards: Vec<CatalogCard>) -> Matcher {
        let mut index = CatalogIndex::new("EN");
        index.insert_language("EN", cards);
        Matcher::new(Arc::new(index), None)
    }

    #[test]
    fn test_ambiguity_threshold() {
        assert!(is_ambiguous(&[candidate(90.0), candidate(85.0)]));
        assert!(!is_ambiguous(&[candidate(90.0), candidate(70.0)]));
        assert!(!is_ambiguous(&[candidate(90.0)]));
        assert!(!is_ambiguous(&[]));
    }

    #[test]
    fn test_code_and_name_match_end_to_end() {
        let matcher = matcher(vec![card(89631139, "Blue-Eyes White Dragon", &[("LOB-EN001", "Ultra Rare")])]);
        let results = vec![result("Blue-Eyes White Dragon | LOB-EN001", Some("LOB-EN001"), 90.0, "EN")];

        let outcome = matcher.match_results(&results, "EN");
        assert_eq!(outcome.candidates.len(), 1);
        assert!(!outcome.ambiguous);

        let best = outcome.best.unwrap();
        assert_eq!(best.card_id, 89631139);
        assert_eq!(best.set_code, "LOB-EN001");
        assert!(best.confidence >= 95.0);
        assert!(best.reason.contains("Set Code Match"));
        assert!(best.reason.contains("Name Match"));
    }

    #[test]
    fn test_code_score_formula() {
        let matcher = matcher(vec![card(1, "Dark Magician", &[("LOB-EN005", "Ultra Rare")])]);
        let outcome = matcher.match_results(&[result("", Some("LOB-EN005"), 50.0, "EN")], "EN");
        let best = outcome.best.unwrap();
        assert!((best.confidence - 80.0).abs() < 1e-4);
        assert_eq!(best.reason, "Set Code Match (LOB-EN005)");
    }

    #[test]
    fn test_confusable_code_is_corrected() {
        let matcher = matcher(vec![card(2, "Mystical Elf", &[("LOB-001", "Common")])]);
        let outcome = matcher.match_results(&[result("", Some("LOB-OO1"), 80.0, "EN")], "EN");
        let best = outcome.best.unwrap();
        assert_eq!(best.set_code, "LOB-001");
        assert_eq!(best.reason, "Set Code Match (LOB-001)");
        assert!((best.confidence - 92.0).abs() < 1e-4);
    }

    #[test]
    fn test_best_confidence_per_code() {
        let matcher = matcher(vec![card(3, "Kuriboh", &[("MRD-EN071", "Common")])]);
        let results = vec![
            result("", Some("MRD-EN071"), 40.0, "EN"),
            result("", Some("MRD-EN071"), 40.0, "EN"),
            result("", Some("MRD-EN07I"), 90.0, "EN"),
        ];
        let outcome = matcher.match_results(&results, "EN");
        assert_eq!(outcome.candidates.len(), 1);
        // corrected code reaches 90, the alternate only 81
        assert!((outcome.candidates[0].confidence - 96.0).abs() < 1e-4);
        assert_eq!(outcome.candidates[0].reason, "Set Code Match (MRD-EN071)");
    }

    #[test]
    fn test_fuzzy_name_only_candidate() {
        let matcher = matcher(vec![
            card(10, "Kashtira Oger", &[("DABL-EN012", "Ultra Rare"), ("DABL-EN012", "Secret Rare")]),
            card(11, "Kashtira Fenrir", &[("PHHY-EN011", "Secret Rare")]),
        ]);
        let outcome = matcher.match_results(&[result("Kashtira Ogre | 2500", None, 0.0, "EN")], "EN");

        let best = outcome.best.unwrap();
        assert_eq!(best.card_id, 10);
        assert_eq!(best.rarity, "Ultra Rare");
        assert!(best.reason.starts_with("Fuzzy Name Match"));
        assert!(best.confidence < 80.0);
        assert_eq!(outcome.candidates.len(), 1);
    }

    #[test]
    fn test_no_candidates() {
        let matcher = matcher(vec![card(1, "Dark Magician", &[("LOB-EN005", "Ultra Rare")])]);
        let outcome = matcher.match_results(&[result("abc", None, 0.0, "EN")], "EN");
        assert!(outcome.best.is_none());
        assert!(outcome.candidates.is_empty());
        assert!(!outcome.ambiguous);
    }

    #[test]
    fn test_language_vote() {
        let results = vec![
            result("", Some("LOB-DE001"), 50.0, "DE"),
            result("", Some("LOB-EN001"), 50.0, "EN"),
            result("", None, 0.0, "EN"),
        ];
        assert_eq!(vote_language(&results, "EN"), "DE");
        assert_eq!(vote_language(&results[1..], "EN"), "EN");
        assert_eq!(vote_language(&[], "fr"), "FR");

        let majority = vec![
            result("", Some("LOB-EN001"), 50.0, "EN"),
            result("", Some("LOB-EN001"), 50.0, "EN"),
            result("", Some("LOB-DE001"), 50.0, "DE"),
        ];
        assert_eq!(vote_language(&majority, "EN"), "EN");
    }

    #[test]
    fn test_missing_language_falls_back_to_default_catalog() {
        let matcher = matcher(vec![card(4, "Gaia The Fierce Knight", &[("LOB-EN006", "Ultra Rare")])]);
        let outcome = matcher.match_results(&[result("", Some("LOB-EN006"), 50.0, "FR")], "FR");
        assert_eq!(outcome.language, "FR");
        assert_eq!(outcome.best.map(|b| b.card_id), Some(4));
    }

    #[test]
    fn test_name_guesses() {
        let mut first = result("Dark Magician | LOB-EN005", None, 0.0, "EN");
        first.card_name = Some("Dark Magician".into());
        let results = vec![first, result("ATK | 2500", None, 0.0, "EN"), result("Mystic | x", None, 0.0, "EN")];
        assert_eq!(name_guesses(&results), vec!["Dark Magician".to_string(), "Mystic".to_string()]);
    }

    #[test]
    fn test_collect_codes_weights_alternates() {
        let codes = collect_codes(&[result("", Some("SDK-OO1"), 80.0, "EN")]);
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0].0, "SDK-001");
        assert!((codes[0].1 - 80.0).abs() < 1e-4);
        assert_eq!(codes[1].0, "SDK-OO1");
        assert!((codes[1].1 - 72.0).abs() < 1e-4);
    }

    #[test]
    fn test_image_paths_follow_cache_convention() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = HttpImageCache::new(dir.path().to_path_buf()).unwrap().with_offline(true);
        let mut index = CatalogIndex::new("EN");
        index.insert_language("EN", vec![card(7, "Celtic Guardian", &[("LOB-EN007", "Super Rare")])]);
        let cache: Arc<dyn ImageCache> = Arc::new(cache);
        let matcher = Matcher::new(Arc::new(index), Some(cache));

        let outcome = matcher.match_results(&[result("", Some("LOB-EN007"), 60.0, "EN")], "EN");
        assert_eq!(outcome.best.unwrap().image_path, Some(dir.path().join("7.jpg")));
    }
}
