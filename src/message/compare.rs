//! Field comparison for scoring received messages against a model.
//!
//! A comparison yields a `score`/`out_of` pair plus masks over the two
//! values. Mask bytes are `' '` where the value matched and `'~'` where it
//! did not; the analyzer renders the non-matching regions into problem
//! strings.

use chrono::{NaiveDate, NaiveTime};

/// How a field's value is compared to the model's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareKind {
    /// Whole-value comparison, case-insensitive, whitespace-normalized.
    Exact,
    /// Word-by-word comparison; partial credit per matching word.
    Text,
    /// Comparison after date normalization.
    Date,
    /// Comparison after time normalization.
    Time,
    /// The field is never compared.
    None,
}

#[derive(Clone, Debug)]
pub struct CompareResult {
    pub score: usize,
    pub out_of: usize,
    pub expected: String,
    pub actual: String,
    /// Byte masks aligned with `expected`/`actual`: `' '` = match,
    /// anything else = mismatch.
    pub expected_mask: String,
    pub actual_mask: String,
}

impl CompareKind {
    /// Compare `actual` against `expected`. Returns `None` for fields that
    /// are never compared.
    pub fn compare(self, expected: &str, actual: &str) -> Option<CompareResult> {
        match self {
            CompareKind::None => None,
            CompareKind::Exact => Some(compare_whole(expected, actual, normalize)),
            CompareKind::Date => Some(compare_whole(expected, actual, normalize_date)),
            CompareKind::Time => Some(compare_whole(expected, actual, normalize_time)),
            CompareKind::Text => Some(compare_text(expected, actual)),
        }
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn normalize_date(s: &str) -> String {
    for fmt in ["%m/%d/%Y", "%Y-%m-%d", "%m-%d-%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s.trim(), fmt) {
            return d.format("%m/%d/%Y").to_string();
        }
    }
    normalize(s)
}

fn normalize_time(s: &str) -> String {
    for fmt in ["%H:%M", "%H%M", "%H:%M:%S"] {
        if let Ok(t) = NaiveTime::parse_from_str(s.trim(), fmt) {
            return t.format("%H:%M").to_string();
        }
    }
    normalize(s)
}

fn compare_whole(expected: &str, actual: &str, norm: fn(&str) -> String) -> CompareResult {
    let matched = norm(expected) == norm(actual);
    let mask = |s: &str| {
        if matched {
            " ".repeat(s.len())
        } else {
            "~".repeat(s.len())
        }
    };
    CompareResult {
        score: matched as usize,
        out_of: 1,
        expected_mask: mask(expected),
        actual_mask: mask(actual),
        expected: expected.to_owned(),
        actual: actual.to_owned(),
    }
}

fn compare_text(expected: &str, actual: &str) -> CompareResult {
    let ew: Vec<&str> = expected.split_whitespace().collect();
    let aw: Vec<&str> = actual.split_whitespace().collect();
    let out_of = ew.len().max(aw.len()).max(1);
    let mut score = 0;
    let mut bad_exp = Vec::new();
    let mut bad_act = Vec::new();
    for i in 0..ew.len().max(aw.len()) {
        match (ew.get(i), aw.get(i)) {
            (Some(e), Some(a)) if e.eq_ignore_ascii_case(a) => score += 1,
            (e, a) => {
                if e.is_some() {
                    bad_exp.push(i);
                }
                if a.is_some() {
                    bad_act.push(i);
                }
            }
        }
    }
    // Both sides empty counts as a (vacuous) match.
    if ew.is_empty() && aw.is_empty() {
        score = 1;
    }
    CompareResult {
        score,
        out_of,
        expected_mask: word_mask(expected, &bad_exp),
        actual_mask: word_mask(actual, &bad_act),
        expected: expected.to_owned(),
        actual: actual.to_owned(),
    }
}

/// Build a mask for `s` marking the words whose indexes appear in `bad`.
fn word_mask(s: &str, bad: &[usize]) -> String {
    let mut mask = vec![b' '; s.len()];
    let mut word = 0usize;
    let mut in_word = false;
    for (i, c) in s.char_indices() {
        if c.is_whitespace() {
            if in_word {
                word += 1;
                in_word = false;
            }
        } else {
            in_word = true;
            if bad.contains(&word) {
                for j in i..i + c.len_utf8() {
                    mask[j] = b'~';
                }
            }
        }
    }
    String::from_utf8(mask).unwrap_or_default()
}

/// Render the mismatched regions of a comparison as
/// `"actual fragments" s.b. "expected fragments"`.
pub fn render_compare(comp: &CompareResult) -> String {
    format!(
        "{} s.b. {}",
        render_mask(&comp.actual, &comp.actual_mask),
        render_mask(&comp.expected, &comp.expected_mask)
    )
}

fn render_mask(s: &str, mask: &str) -> String {
    if s.is_empty() {
        return "\"\"".to_owned();
    }
    let mask: Vec<u8> = {
        let mut m = mask.as_bytes().to_vec();
        // Extend a short mask with its final byte, so a truncated mask
        // still covers the whole value.
        let last = *m.last().unwrap_or(&b' ');
        m.resize(s.len(), last);
        m
    };
    let mut regions: Vec<(usize, usize)> = Vec::new();
    let mut start = None;
    for (i, &b) in mask.iter().enumerate() {
        match (b != b' ', start) {
            (true, None) => start = Some(i),
            (false, Some(st)) => {
                regions.push((st, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(st) = start {
        regions.push((st, mask.len()));
    }
    if regions.is_empty() {
        return "\"\"".to_owned();
    }
    regions
        .iter()
        .map(|&(st, en)| format!("{:?}", safe_slice(s, st, en)))
        .collect::<Vec<_>>()
        .join(",")
}

fn safe_slice(s: &str, mut start: usize, mut end: usize) -> &str {
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    while end > start && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[start..end.min(s.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_and_mismatch() {
        let r = CompareKind::Exact.compare("ROUTINE", "routine").unwrap();
        assert_eq!((r.score, r.out_of), (1, 1));
        let r = CompareKind::Exact.compare("ROUTINE", "PRIORITY").unwrap();
        assert_eq!((r.score, r.out_of), (0, 1));
        assert_eq!(render_compare(&r), "\"PRIORITY\" s.b. \"ROUTINE\"");
    }

    #[test]
    fn date_normalization() {
        let r = CompareKind::Date.compare("09/23/2023", "2023-09-23").unwrap();
        assert_eq!(r.score, 1);
    }

    #[test]
    fn time_normalization() {
        let r = CompareKind::Time.compare("08:05", "0805").unwrap();
        assert_eq!(r.score, 1);
    }

    #[test]
    fn text_partial_credit() {
        let r = CompareKind::Text
            .compare("send water to north station", "send water to south station")
            .unwrap();
        assert_eq!(r.out_of, 5);
        assert_eq!(r.score, 4);
        assert_eq!(render_compare(&r), "\"south\" s.b. \"north\"");
    }

    #[test]
    fn text_missing_words() {
        let r = CompareKind::Text.compare("one two three", "one two").unwrap();
        assert_eq!((r.score, r.out_of), (2, 3));
        assert_eq!(render_compare(&r), "\"\" s.b. \"three\"");
    }

    #[test]
    fn text_identical_scores_full() {
        let r = CompareKind::Text.compare("exact words", "exact words").unwrap();
        assert_eq!((r.score, r.out_of), (2, 2));
    }

    #[test]
    fn none_is_never_compared() {
        assert!(CompareKind::None.compare("a", "b").is_none());
    }

    #[test]
    fn empty_actual_renders_quoted_empty() {
        let r = CompareKind::Exact.compare("X", "").unwrap();
        assert_eq!(render_compare(&r), "\"\" s.b. \"X\"");
    }
}
