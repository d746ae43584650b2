// src/services/sitemap.rs

//! Sitemap resolution.
//!
//! Expands a sitemap entry point (single sitemap or sitemap index) into a
//! deduplicated, lexicographically sorted URL set plus structural metadata.
//! Child sitemaps of an index are fetched in parallel under the fetcher's
//! semaphore; a failed child is recorded and skipped, and only total failure
//! aborts the resolution.

use std::collections::BTreeSet;
use std::io::Cursor;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use sitemap::reader::{SiteMapEntity, SiteMapReader};
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::models::{ChildSitemap, ChildSitemapStatus, SiteConfig, SitemapInfo, SitemapKind};
use crate::services::Fetcher;
use crate::utils::normalize_url;

/// Concurrent child-sitemap fetches; the fetcher semaphore still applies.
const CHILD_CONCURRENCY: usize = 8;

/// Reference to a child sitemap found in an index document.
struct ChildRef {
    url: String,
    last_modified: Option<String>,
}

/// Entities extracted from one sitemap document.
struct ParsedSitemap {
    urls: Vec<String>,
    children: Vec<ChildRef>,
}

/// Parse a sitemap document tolerantly.
///
/// Malformed entries and empty `<loc>` elements are skipped; URL fragments
/// are stripped so the returned set is comparable across runs.
fn parse_sitemap_document(bytes: &[u8]) -> ParsedSitemap {
    let mut urls = Vec::new();
    let mut children = Vec::new();

    for entity in SiteMapReader::new(Cursor::new(bytes)) {
        match entity {
            SiteMapEntity::Url(entry) => {
                if let Some(url) = entry.loc.get_url() {
                    let normalized = normalize_url(url.as_str());
                    if !normalized.is_empty() {
                        urls.push(normalized);
                    }
                }
            }
            SiteMapEntity::SiteMap(entry) => {
                if let Some(url) = entry.loc.get_url() {
                    children.push(ChildRef {
                        url: url.to_string(),
                        last_modified: entry.lastmod.get_time().map(|t| t.to_rfc3339()),
                    });
                }
            }
            _ => {}
        }
    }

    ParsedSitemap { urls, children }
}

/// Resolves a site's sitemap entry point into its URL universe.
pub struct SitemapResolver<'a> {
    fetcher: &'a Fetcher,
}

impl<'a> SitemapResolver<'a> {
    pub fn new(fetcher: &'a Fetcher) -> Self {
        Self { fetcher }
    }

    /// Resolve the URL set for a site, probing candidate entry points in
    /// order until one responds.
    pub async fn resolve(&self, site: &SiteConfig) -> Result<(Vec<String>, SitemapInfo)> {
        let candidates = site.sitemap_candidates();
        let mut last_reason = String::from("no sitemap candidates");

        for candidate in &candidates {
            match self.resolve_entry(candidate).await {
                Ok(resolved) => return Ok(resolved),
                Err(e) => {
                    debug!(entry = %candidate, error = %e, "sitemap candidate failed");
                    last_reason = e.to_string();
                }
            }
        }

        Err(AppError::sitemap_unavailable(
            candidates.first().cloned().unwrap_or_default(),
            last_reason,
        ))
    }

    async fn resolve_entry(&self, entry_url: &str) -> Result<(Vec<String>, SitemapInfo)> {
        let fetched_at = Utc::now();
        let page = self
            .fetcher
            .fetch(entry_url)
            .await
            .map_err(|e| AppError::sitemap_unavailable(entry_url, e.to_string()))?;

        let parsed = parse_sitemap_document(&page.body);

        if parsed.children.is_empty() {
            let set: BTreeSet<String> = parsed.urls.into_iter().collect();
            let info = SitemapInfo {
                entry_url: entry_url.to_string(),
                kind: SitemapKind::Single,
                total_urls: set.len(),
                children: Vec::new(),
                fetched_at,
            };
            return Ok((set.into_iter().collect(), info));
        }

        // Sitemap index: union the children, recording per-child outcomes.
        let mut set: BTreeSet<String> = parsed.urls.into_iter().collect();

        let mut results: Vec<_> = stream::iter(parsed.children.into_iter().enumerate())
            .map(|(index, child)| async move {
                let outcome = self.fetch_child(&child.url).await;
                (index, child, outcome)
            })
            .buffer_unordered(CHILD_CONCURRENCY)
            .collect()
            .await;
        results.sort_by_key(|(index, _, _)| *index);

        let mut children = Vec::with_capacity(results.len());
        for (_, child, outcome) in results {
            match outcome {
                Ok(urls) => {
                    let count = urls.len();
                    set.extend(urls);
                    children.push(ChildSitemap {
                        url: child.url,
                        status: ChildSitemapStatus::Success {
                            urls: count,
                            last_modified: child.last_modified,
                        },
                    });
                }
                Err(reason) => {
                    warn!(child = %child.url, %reason, "child sitemap failed, omitting its URLs");
                    children.push(ChildSitemap {
                        url: child.url,
                        status: ChildSitemapStatus::Error { reason },
                    });
                }
            }
        }

        let all_failed = children
            .iter()
            .all(|c| matches!(c.status, ChildSitemapStatus::Error { .. }));
        if set.is_empty() && all_failed {
            return Err(AppError::sitemap_unavailable(
                entry_url,
                "every child sitemap failed",
            ));
        }

        let info = SitemapInfo {
            entry_url: entry_url.to_string(),
            kind: SitemapKind::Index,
            total_urls: set.len(),
            children,
            fetched_at,
        };
        Ok((set.into_iter().collect(), info))
    }

    async fn fetch_child(&self, url: &str) -> std::result::Result<Vec<String>, String> {
        let page = self.fetcher.fetch(url).await.map_err(|e| e.to_string())?;
        Ok(parse_sitemap_document(&page.body).urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
            <url><loc>https://example.com/b</loc></url>
            <url><loc>https://example.com/a#section</loc></url>
            <url><loc>https://example.com/a</loc></url>
            <url><loc></loc></url>
        </urlset>"#;

    const INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
            <sitemap>
                <loc>https://example.com/sitemap-posts.xml</loc>
                <lastmod>2026-01-15T08:00:00+00:00</lastmod>
            </sitemap>
            <sitemap><loc>https://example.com/sitemap-pages.xml</loc></sitemap>
        </sitemapindex>"#;

    #[test]
    fn test_parse_urlset() {
        let parsed = parse_sitemap_document(URLSET.as_bytes());
        assert!(parsed.children.is_empty());
        // Fragment stripped, empty loc skipped; duplicates survive parsing
        // and are collapsed by the resolver's set union.
        assert_eq!(
            parsed.urls,
            vec![
                "https://example.com/b".to_string(),
                "https://example.com/a".to_string(),
                "https://example.com/a".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_sitemap_index() {
        let parsed = parse_sitemap_document(INDEX.as_bytes());
        assert!(parsed.urls.is_empty());
        assert_eq!(parsed.children.len(), 2);
        assert_eq!(
            parsed.children[0].url,
            "https://example.com/sitemap-posts.xml"
        );
        assert!(parsed.children[0].last_modified.is_some());
        assert!(parsed.children[1].last_modified.is_none());
    }

    #[test]
    fn test_parse_garbage_yields_nothing() {
        let parsed = parse_sitemap_document(b"<html><body>not a sitemap</body></html>");
        assert!(parsed.urls.is_empty());
        assert!(parsed.children.is_empty());
    }

    #[test]
    fn test_url_union_is_order_independent() {
        let forward: BTreeSet<String> = parse_sitemap_document(URLSET.as_bytes())
            .urls
            .into_iter()
            .collect();
        let mut reversed_input = parse_sitemap_document(URLSET.as_bytes()).urls;
        reversed_input.reverse();
        let reversed: BTreeSet<String> = reversed_input.into_iter().collect();
        assert_eq!(forward, reversed);
    }
}
