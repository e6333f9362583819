//! Card name normalization and fuzzy comparison

/// Accented Latin characters folded to their base letters
const ACCENT_FOLDS: &[(char, &str)] = &[
    ('à', "a"), ('á', "a"), ('â', "a"), ('ã', "a"), ('ä', "a"), ('å', "a"),
    ('À', "a"), ('Á', "a"), ('Â', "a"), ('Ã', "a"), ('Ä', "a"), ('Å', "a"),
    ('æ', "ae"), ('Æ', "ae"),
    ('ç', "c"), ('Ç', "c"),
    ('è', "e"), ('é', "e"), ('ê', "e"), ('ë', "e"),
    ('È', "e"), ('É', "e"), ('Ê', "e"), ('Ë', "e"),
    ('ì', "i"), ('í', "i"), ('î', "i"), ('ï', "i"),
    ('Ì', "i"), ('Í', "i"), ('Î', "i"), ('Ï', "i"),
    ('ñ', "n"), ('Ñ', "n"),
    ('ò', "o"), ('ó', "o"), ('ô', "o"), ('õ', "o"), ('ö', "o"), ('ø', "o"),
    ('Ò', "o"), ('Ó', "o"), ('Ô', "o"), ('Õ', "o"), ('Ö', "o"), ('Ø', "o"),
    ('œ', "oe"), ('Œ', "oe"),
    ('ù', "u"), ('ú', "u"), ('û', "u"), ('ü', "u"),
    ('Ù', "u"), ('Ú', "u"), ('Û', "u"), ('Ü', "u"),
    ('ý', "y"), ('ÿ', "y"), ('Ý', "y"),
    ('ß', "ss"),
];

fn fold_char(c: char) -> Option<&'static str> {
    ACCENT_FOLDS
        .iter()
        .find(|(accented, _)| *accented == c)
        .map(|(_, base)| *base)
}

/// Normalize a card name into a dictionary key
///
/// Folds accents, lowercases and drops everything that is not a letter or
/// digit, so `"GIFTZÂHNE"` and `"Giftzähne"` share the key `giftzahne`.
pub fn normalize_name(text: &str) -> String {
    let mut key = String::with_capacity(text.len());
    for c in text.chars() {
        if let Some(base) = fold_char(c) {
            key.push_str(base);
        } else if c.is_alphanumeric() {
            key.extend(c.to_lowercase());
        }
    }
    key
}

/// Character similarity of two strings as an integer percentage
///
/// Case-insensitive; 100 means identical.
pub fn fuzzy_ratio(a: &str, b: &str) -> u32 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a.is_empty() && b.is_empty() {
        return 100;
    }
    (strsim::normalized_levenshtein(&a, &b) * 100.0).floor() as u32
}
