//! Strip formatting that a speech engine would read aloud or choke on.

/// Characters used for emphasis, headings, and code in generated text.
const MARKUP_CHARS: [char; 3] = ['*', '#', '`'];

/// Emphasis markers that are only markup at the edge of a word.
const WRAPPING_CHARS: [char; 2] = ['_', '~'];

/// Remove markup characters from a fragment.
///
/// Works on arbitrary fragments (a single token, half a word), so it only
/// drops characters and never touches whitespace. Word-wrapping markers
/// need the whole unit and are left to [`normalize_unit`].
pub fn strip_markup(fragment: &str) -> String {
    fragment
        .chars()
        .filter(|c| !MARKUP_CHARS.contains(c) && *c != '\r')
        .collect()
}

/// Normalize a finished unit for synthesis: drop `_` and `~` where they
/// wrap a word, then collapse runs of whitespace.
pub fn normalize_unit(unit: &str) -> String {
    strip_wrapping(unit)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Keep a wrapping marker only between two alphanumerics, as in `snake_case`.
fn strip_wrapping(unit: &str) -> String {
    let chars: Vec<char> = unit.chars().collect();
    let is_word = |i: Option<usize>| {
        i.and_then(|i| chars.get(i))
            .is_some_and(|c| c.is_alphanumeric())
    };
    chars
        .iter()
        .enumerate()
        .filter(|&(i, c)| {
            !WRAPPING_CHARS.contains(c) || (is_word(i.checked_sub(1)) && is_word(Some(i + 1)))
        })
        .map(|(_, c)| *c)
        .collect()
}
