//! Analysis Layer
//!
//! Turns OCR text into catalog matches: set code correction, card name
//! normalization and the matcher that fuses every engine's result.

pub mod matcher;
pub mod set_code;
pub mod text;

pub use matcher::{MatchCandidate, MatchOutcome, Matcher};
pub use set_code::{correct_set_code, IdentifierCandidate, IdentifierCorrector};
pub use text::{fuzzy_ratio, normalize_name};
