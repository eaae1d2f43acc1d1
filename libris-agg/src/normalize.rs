//! Shared normalization helpers
//!
//! Pure string functions used by every provider normalizer and by the
//! query fingerprint. No I/O.

use std::collections::HashSet;

const LEADING_ARTICLES: [&str; 3] = ["the", "a", "an"];

/// Collapse runs of whitespace into single spaces and trim
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase, drop punctuation, collapse whitespace
fn fold(s: &str) -> String {
    let mapped: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else if c == '\'' || c == '\u{2019}' {
                // "Ender's" folds to "enders", not "ender s"
                '\0'
            } else {
                ' '
            }
        })
        .filter(|c| *c != '\0')
        .collect();
    collapse_whitespace(&mapped)
}

/// Title key for identity comparison and fingerprints
///
/// "The Martian!" -> "martian". A title consisting only of an article keeps it.
pub fn normalize_title(title: &str) -> String {
    let folded = fold(title);
    if let Some((first, rest)) = folded.split_once(' ') {
        if LEADING_ARTICLES.contains(&first) && !rest.is_empty() {
            return rest.to_string();
        }
    }
    folded
}

/// Person name key: lowercase, punctuation-insensitive
pub fn normalize_name(name: &str) -> String {
    fold(name)
}

/// Trim names, drop empties and remove case-insensitive duplicates, keeping
/// the first spelling seen
pub fn clean_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for name in names {
        let cleaned = collapse_whitespace(name.as_ref());
        if cleaned.is_empty() {
            continue;
        }
        if seen.insert(cleaned.to_lowercase()) {
            out.push(cleaned);
        }
    }
    out
}

/// Split a comma separated credit line ("A, B and C") into names
pub fn split_credit_line(line: &str) -> Vec<String> {
    let replaced = line.replace(" and ", ",").replace(" & ", ",");
    clean_names(replaced.split(','))
}

/// Two-letter language code; unknown values are lowercased and truncated
pub fn normalize_language(language: &str) -> String {
    let lower = language.trim().to_lowercase();
    let base = lower
        .split(|c| c == '-' || c == '_')
        .next()
        .unwrap_or_default()
        .to_string();

    let code = match base.as_str() {
        "english" | "eng" => "en",
        "spanish" | "español" | "espanol" | "spa" => "es",
        "french" | "français" | "francais" | "fre" | "fra" => "fr",
        "german" | "deutsch" | "ger" | "deu" => "de",
        "italian" | "italiano" | "ita" => "it",
        "portuguese" | "português" | "por" => "pt",
        "japanese" | "jpn" => "ja",
        "chinese" | "mandarin" | "chi" | "zho" => "zh",
        "russian" | "rus" => "ru",
        "dutch" | "nld" | "dut" => "nl",
        other => return other.chars().take(2).collect(),
    };
    code.to_string()
}

/// First four-digit run between 1000 and 2999 in a date-like string
pub fn extract_year(date: &str) -> Option<i32> {
    let bytes = date.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if bytes[start].is_ascii_digit() {
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end - start == 4 {
                if let Ok(year) = date[start..end].parse::<i32>() {
                    if (1000..3000).contains(&year) {
                        return Some(year);
                    }
                }
            }
            start = end;
        } else {
            start += 1;
        }
    }
    None
}

/// Decode the handful of HTML entities providers put in descriptions and
/// drop tags
pub fn unescape_html(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                stripped.push(' ');
            }
            _ if !in_tag => stripped.push(c),
            _ => {}
        }
    }

    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        .replace("&rsquo;", "\u{2019}")
        .replace("&lsquo;", "\u{2018}")
        .replace("&mdash;", "\u{2014}")
        .replace("&ndash;", "\u{2013}")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        // Last, so "&amp;lt;" decodes to "&lt;" rather than "<"
        .replace("&amp;", "&");

    collapse_whitespace(&decoded)
}

/// Trimmed, non-empty string or None
pub fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(collapse_whitespace)
        .filter(|s| !s.is_empty())
}
