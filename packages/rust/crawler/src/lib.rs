//! Page fetching and content preparation.
//!
//! This crate provides:
//! - [`PageFetcher`]: the fetch seam, with typed [`FetchError`]s
//! - [`HttpFetcher`]: plain HTTP implementation with an SSRF guard
//! - [`PageContent`]: HTML reduced to title, Markdown text and links

pub mod content;
pub mod fetcher;

pub use content::{PageContent, PageLink};
pub use fetcher::{FetchError, FetchOptions, FetchedPage, HttpFetcher, PageFetcher, is_ssrf_target};
