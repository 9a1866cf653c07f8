//! String helpers shared by condition preparation and evaluation.

/// Multiplicative factors for quantity suffixes, two-letter suffixes first.
///
/// Binary (`Ki`..`Ei`), decimal (`K`/`k`..`E`), milli (`m`) and percent.
const UNIT_FACTORS: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("K", 1e3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
    ("m", 1e-3),
    ("%", 1e-2),
];

/// Parse a number that may carry a quantity suffix (`"512Mi"`, `"250m"`, `"80%"`).
pub fn parse_with_units(raw: &str) -> Option<f64> {
    let s = strip_quotes(raw.trim()).trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(v) = s.parse::<f64>() {
        return Some(v);
    }
    for (suffix, factor) in UNIT_FACTORS {
        if let Some(number) = s.strip_suffix(suffix) {
            if let Ok(v) = number.trim_end().parse::<f64>() {
                return Some(v * factor);
            }
        }
    }
    None
}

/// Remove one pair of surrounding double or single quotes.
pub fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

pub fn has_wildcards(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

/// Anchored regex for a `*` / `?` wildcard pattern.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push('$');
    out
}

/// Anchored alternation matching exactly one of `items`.
pub fn alternation<S: AsRef<str>>(items: &[S]) -> String {
    let escaped: Vec<String> = items
        .iter()
        .map(|item| regex::escape(item.as_ref().trim()))
        .collect();
    format!("^(?:{})$", escaped.join("|"))
}

/// Split an IN/NIN value into its items.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_unit_factors() {
        assert_eq!(parse_with_units("12"), Some(12.0));
        assert_eq!(parse_with_units("1.5"), Some(1.5));
        assert_eq!(parse_with_units("2Ki"), Some(2048.0));
        assert_eq!(parse_with_units("1Mi"), Some(1_048_576.0));
        assert_eq!(parse_with_units("3K"), Some(3000.0));
        assert_eq!(parse_with_units("3k"), Some(3000.0));
        assert_eq!(parse_with_units("2M"), Some(2e6));
        assert_eq!(parse_with_units("250m"), Some(0.25));
        assert_eq!(parse_with_units("80%"), Some(0.8));
        assert_eq!(parse_with_units("\"4Gi\""), Some(4.0 * 1024.0 * 1024.0 * 1024.0));
        assert_eq!(parse_with_units("1E3"), Some(1000.0));
    }

    #[test]
    fn test_unit_parse_failures() {
        assert_eq!(parse_with_units(""), None);
        assert_eq!(parse_with_units("abc"), None);
        assert_eq!(parse_with_units("Ki"), None);
        assert_eq!(parse_with_units("12Xi"), None);
    }

    #[test]
    fn test_strip_quotes() {
        assert_eq!(strip_quotes("\"abc\""), "abc");
        assert_eq!(strip_quotes("'abc'"), "abc");
        assert_eq!(strip_quotes("\"abc"), "\"abc");
        assert_eq!(strip_quotes("\""), "\"");
    }

    #[test]
    fn test_wildcard_regex() {
        let re = Regex::new(&wildcard_to_regex("srv-*")).unwrap();
        assert!(re.is_match("srv-1"));
        assert!(re.is_match("srv-abc"));
        assert!(!re.is_match("other"));
        assert!(!re.is_match("my-srv-1"));

        let re = Regex::new(&wildcard_to_regex("a.b?")).unwrap();
        assert!(re.is_match("a.bc"));
        assert!(!re.is_match("axbc"));
    }

    #[test]
    fn test_alternation() {
        let re = Regex::new(&alternation(&["GET", " POST ", "a.b"])).unwrap();
        assert!(re.is_match("GET"));
        assert!(re.is_match("POST"));
        assert!(re.is_match("a.b"));
        assert!(!re.is_match("axb"));
        assert!(!re.is_match("GETX"));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
