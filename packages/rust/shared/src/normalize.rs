//! Identity-key normalization shared by discovery, assembly and storage.
//!
//! Every component that decides "is this the same thing?" goes through these
//! helpers so that search dedup, the processed-URL set and the event/organizer
//! tables agree on what counts as a duplicate.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{CatalogError, Result};

/// Query parameters that only carry campaign/click tracking.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "mc_cid", "mc_eid", "igshid", "_ga", "_gl", "ref",
    "ref_src", "yclid",
];

/// Collapses runs of whitespace.
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Matches a US EIN (`NN-NNNNNNN`).
pub static EIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{2}-\d{7}\b").expect("EIN regex"));

fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "utm" || lower.starts_with("utm_") || TRACKING_PARAMS.contains(&lower.as_str())
}

/// Normalize a URL into its identity key.
///
/// Scheme, host and path are lowercased, the fragment and tracking query
/// parameters are dropped, the remaining parameters are sorted, and a
/// trailing slash is removed.
pub fn normalize_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim())
        .map_err(|e| CatalogError::validation(format!("invalid URL '{raw}': {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CatalogError::validation(format!(
                "unsupported URL scheme '{other}' in {raw}"
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| CatalogError::validation(format!("URL has no host: {raw}")))?
        .to_ascii_lowercase();

    let mut out = format!("{}://{host}", url.scheme());
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }

    let path = url.path().to_lowercase();
    let path = path.trim_end_matches('/');
    out.push_str(path);

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();

    if !params.is_empty() {
        let query = params
            .iter()
            .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
            .collect::<Vec<_>>()
            .join("&");
        out.push('?');
        out.push_str(&query);
    }

    Ok(out)
}

/// Normalize a human name (event or organizer) for identity comparison.
///
/// Lowercases, replaces punctuation with spaces, collapses whitespace and
/// drops a leading "the".
pub fn normalize_name(raw: &str) -> String {
    let lowered: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let collapsed = WS_RE.replace_all(lowered.trim(), " ").to_string();
    collapsed
        .strip_prefix("the ")
        .map(str::to_string)
        .unwrap_or(collapsed)
}

/// Collapse whitespace and turn blank or placeholder strings into `None`.
pub fn clean_text(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    let cleaned = WS_RE.replace_all(raw.trim(), " ").to_string();
    match cleaned.as_str() {
        "" | "None" | "none" | "null" | "NULL" | "N/A" | "n/a" | "unknown" => None,
        _ => Some(cleaned),
    }
}

/// Parse the date formats event pages and the oracle commonly produce.
pub fn normalize_date(raw: &str) -> Option<NaiveDate> {
    const FORMATS: &[&str] = &[
        "%Y-%m-%d",
        "%Y/%m/%d",
        "%m/%d/%Y",
        "%m-%d-%Y",
        "%B %d, %Y",
        "%B %d %Y",
        "%b %d, %Y",
        "%b %d %Y",
        "%b. %d, %Y",
        "%A, %B %d, %Y",
        "%a, %b %d, %Y",
        "%d %B %Y",
        "%d %b %Y",
    ];

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // ISO timestamps: keep the date part only.
    let candidate = if trimmed.len() > 10 && trimmed.as_bytes().get(10) == Some(&b'T') {
        &trimmed[..10]
    } else {
        trimmed
    };

    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(candidate, fmt).ok())
}

/// Extract the first EIN found in free text, in canonical `NN-NNNNNNN` form.
pub fn find_ein(text: &str) -> Option<String> {
    EIN_RE.find(text).map(|m| m.as_str().to_string())
}

/// Canonicalize a bare 9-digit or dashed EIN; returns `None` if malformed.
pub fn normalize_ein(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() != 9 {
        return None;
    }
    Some(format!("{}-{}", &digits[..2], &digits[2..]))
}

/// Stable hex identifier derived from identity-key parts.
pub fn stable_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("\u{1f}").as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_params_are_stripped() {
        let a = normalize_url("https://a.org/gala?utm=1").unwrap();
        let b = normalize_url("https://a.org/gala").unwrap();
        assert_eq!(a, b);

        let c = normalize_url("https://a.org/gala/?utm_source=x&fbclid=abc#tickets").unwrap();
        assert_eq!(c, "https://a.org/gala");
    }

    #[test]
    fn host_and_path_are_lowercased() {
        let n = normalize_url("HTTPS://Events.A.ORG/Spring-Gala/").unwrap();
        assert_eq!(n, "https://events.a.org/spring-gala");
    }

    #[test]
    fn meaningful_params_survive_in_sorted_order() {
        let n = normalize_url("https://a.org/e?id=7&day=2&utm_medium=x").unwrap();
        assert_eq!(n, "https://a.org/e?day=2&id=7");
    }

    #[test]
    fn root_url_drops_slash() {
        assert_eq!(normalize_url("https://a.org/").unwrap(), "https://a.org");
    }

    #[test]
    fn non_http_urls_are_rejected() {
        assert!(normalize_url("mailto:events@a.org").is_err());
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn names_normalize_punctuation_and_case() {
        assert_eq!(normalize_name("  The Spring   Gala!! "), "spring gala");
        assert_eq!(normalize_name("Lakeview Charities, Inc."), "lakeview charities inc");
    }

    #[test]
    fn clean_text_drops_placeholders() {
        assert_eq!(clean_text(Some("  Navy  Pier ")), Some("Navy Pier".into()));
        assert_eq!(clean_text(Some("   ")), None);
        assert_eq!(clean_text(Some("null")), None);
        assert_eq!(clean_text(None), None);
    }

    #[test]
    fn dates_parse_common_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        assert_eq!(normalize_date("2025-05-01"), Some(expected));
        assert_eq!(normalize_date("May 1, 2025"), Some(expected));
        assert_eq!(normalize_date("05/01/2025"), Some(expected));
        assert_eq!(normalize_date("2025-05-01T18:00:00-05:00"), Some(expected));
        assert_eq!(normalize_date("sometime in spring"), None);
    }

    #[test]
    fn ein_helpers() {
        assert_eq!(
            find_ein("Lakeview Charities EIN 36-1234567 Chicago"),
            Some("36-1234567".into())
        );
        assert_eq!(find_ein("no tax id here"), None);
        assert_eq!(normalize_ein("361234567"), Some("36-1234567".into()));
        assert_eq!(normalize_ein("36-12345"), None);
    }

    #[test]
    fn stable_id_is_deterministic() {
        let a = stable_id(&["spring gala", "2025-05-01", "navy pier"]);
        let b = stable_id(&["spring gala", "2025-05-01", "navy pier"]);
        let c = stable_id(&["spring gala", "2025-05-02", "navy pier"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
