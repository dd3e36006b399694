//! HTML → oracle-ready page content.
//!
//! Strips page chrome, converts the main content area to Markdown with
//! `htmd`, and truncates it to a character budget. Also collects the page
//! title, first heading and outgoing links the assembler may follow.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use tracing::debug;
use url::Url;

/// Collapses three or more newlines.
static BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank lines regex"));

/// Words in a link's text or path that suggest it describes the same event.
const EVENT_LINK_WORDS: &[&str] = &[
    "ticket", "register", "registration", "sponsor", "sponsorship", "details", "event", "gala",
    "benefit", "auction", "fundraiser", "rsvp", "about",
];

/// Tags dropped before Markdown conversion.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "iframe", "noscript", "svg", "form",
];

/// A link found on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageLink {
    /// Absolute URL, fragment removed.
    pub url: String,
    pub text: String,
}

/// Page content prepared for extraction.
#[derive(Debug, Clone, Serialize)]
pub struct PageContent {
    pub url: String,
    /// `<title>` text.
    pub title: Option<String>,
    /// First `<h1>` text.
    pub heading: Option<String>,
    /// Main content as Markdown, truncated to the budget.
    pub text: String,
    pub links: Vec<PageLink>,
}

impl PageContent {
    /// Build content for `url` from raw `html`, keeping at most `max_chars`
    /// characters of text.
    pub fn from_html(url: &str, html: &str, max_chars: usize) -> Self {
        let doc = Html::parse_document(html);
        let base = Url::parse(url).ok();

        let title = first_text(&doc, "title");
        let heading = first_text(&doc, "h1");
        let links = base
            .as_ref()
            .map(|b| extract_links(&doc, b))
            .unwrap_or_default();

        let content_html = extract_content_html(&doc);
        let markdown = to_markdown(&content_html);
        let text = truncate_chars(&markdown, max_chars);

        debug!(url, chars = text.chars().count(), links = links.len(), "page content built");

        Self {
            url: url.to_string(),
            title,
            heading,
            text,
            links,
        }
    }

    /// Name to fall back on when extraction found none: the `<title>`
    /// (site suffix removed), else the first heading.
    pub fn fallback_name(&self) -> Option<String> {
        self.title
            .as_deref()
            .map(strip_site_suffix)
            .filter(|t| !t.is_empty())
            .or_else(|| self.heading.clone().filter(|h| !h.is_empty()))
    }

    /// Same-host links whose text or path suggests more detail on the event.
    pub fn event_links(&self) -> Vec<String> {
        let host = Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase));
        let Some(host) = host else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        self.links
            .iter()
            .filter(|link| {
                Url::parse(&link.url)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(&host)))
                    .unwrap_or(false)
            })
            .filter(|link| {
                let haystack = format!("{} {}", link.text, link.url).to_lowercase();
                EVENT_LINK_WORDS.iter().any(|w| haystack.contains(w))
            })
            .filter(|link| link.url.trim_end_matches('/') != self.url.trim_end_matches('/'))
            .filter(|link| seen.insert(link.url.clone()))
            .map(|link| link.url.clone())
            .collect()
    }
}

fn first_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
}

/// Drop a trailing " | Site" or " - Site" from a page title.
fn strip_site_suffix(title: &str) -> String {
    let cut = [" | ", " - ", " – ", " — "]
        .iter()
        .filter_map(|sep| title.find(sep))
        .min();
    match cut {
        Some(i) if i > 0 => title[..i].trim().to_string(),
        _ => title.trim().to_string(),
    }
}

/// Pick the main content area: `<main>`, `<article>`, role=main, else `<body>`.
fn extract_content_html(doc: &Html) -> String {
    let selectors = ["main", "article", r#"[role="main"]"#, "body"];
    for sel_str in selectors {
        let Ok(sel) = Selector::parse(sel_str) else {
            continue;
        };
        if let Some(el) = doc.select(&sel).next() {
            return el.inner_html();
        }
    }
    doc.root_element().inner_html()
}

fn to_markdown(html: &str) -> String {
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();

    let markdown = match converter.convert(html) {
        Ok(md) => md,
        Err(e) => {
            debug!(error = %e, "htmd conversion failed, using raw text");
            Html::parse_fragment(html)
                .root_element()
                .text()
                .collect::<Vec<_>>()
                .join(" ")
        }
    };
    BLANK_LINES_RE
        .replace_all(markdown.trim(), "\n\n")
        .to_string()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Extract all http(s) links from a document, resolved against the base URL.
fn extract_links(doc: &Html, base_url: &Url) -> Vec<PageLink> {
    let Ok(link_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut links = Vec::new();

    for el in doc.select(&link_sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        // Skip anchors, javascript:, mailto:, tel:
        if href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            continue;
        }

        if let Ok(mut resolved) = base_url.join(href) {
            if resolved.scheme() != "http" && resolved.scheme() != "https" {
                continue;
            }
            resolved.set_fragment(None);
            let text = el
                .text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            links.push(PageLink {
                url: resolved.to_string(),
                text,
            });
        }
    }

    links
}
