//! Service layer for the change-detection engine.
//!
//! This module contains the observation machinery:
//! - HTTP fetching with bounded concurrency (`Fetcher`)
//! - Sitemap resolution (`SitemapResolver`)
//! - Content fingerprinting (`Fingerprinter`)

mod fetcher;
mod fingerprint;
mod sitemap;

pub use fetcher::{FetchMetricsSnapshot, FetchedPage, Fetcher};
pub use fingerprint::{canonical_text, hash_text, FingerprintSet, Fingerprinter};
pub use sitemap::SitemapResolver;
