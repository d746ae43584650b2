// src/services/fingerprint.rs

//! Content fingerprinting.
//!
//! Fetches pages, reduces them to a canonical text form, and hashes the
//! result. Canonicalization is deterministic: identical bytes in always
//! produce the identical hash, independent of locale, clock, or map
//! iteration order.

use std::collections::BTreeMap;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use scraper::{Html, Node};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::models::ContentFingerprint;
use crate::services::Fetcher;
use crate::utils::{ignored_file_type, is_html_content_type, mime_subtype};

/// Characters of canonical text retained as the report preview.
const PREVIEW_CHARS: usize = 200;

/// Elements removed wholesale before text extraction.
const STRIPPED_ELEMENTS: &[&str] = &["script", "style", "nav", "header", "footer"];

/// Class/id substrings that mark boilerplate containers.
const NOISE_MARKERS: &[&str] = &["nav", "menu", "footer", "cookie"];

fn is_noise_element(element: &scraper::node::Element) -> bool {
    if STRIPPED_ELEMENTS.contains(&element.name()) {
        return true;
    }
    if element.attr("role") == Some("navigation") {
        return true;
    }
    for attr in ["class", "id"] {
        if let Some(value) = element.attr(attr) {
            let value = value.to_ascii_lowercase();
            if NOISE_MARKERS.iter().any(|m| value.contains(m)) {
                return true;
            }
        }
    }
    false
}

fn collect_text(node: ego_tree::NodeRef<'_, Node>, out: &mut Vec<String>) {
    match node.value() {
        Node::Element(element) if is_noise_element(element) => return,
        Node::Text(text) => {
            let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !collapsed.is_empty() {
                out.push(collapsed);
            }
            return;
        }
        // Comments, doctypes and processing instructions carry no text.
        _ => {}
    }
    for child in node.children() {
        collect_text(child, out);
    }
}

/// Reduce an HTML document to its canonical visible text.
///
/// Boilerplate containers are dropped, whitespace inside text nodes is
/// collapsed, and the surviving blocks are joined with a single newline in
/// document order.
pub fn canonical_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut blocks = Vec::new();
    collect_text(document.tree.root(), &mut blocks);
    blocks.join("\n")
}

/// Hex-encoded SHA-256 of a canonical text.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn preview_of(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
    if preview.len() < text.len() {
        preview.push_str("...");
    }
    Some(preview)
}

/// Per-URL fingerprinting outcome.
enum PageOutcome {
    Fingerprint(ContentFingerprint),
    Ignored { file_type: String },
}

/// Result of fingerprinting a URL set.
#[derive(Debug, Default)]
pub struct FingerprintSet {
    /// URL → fingerprint (including empty-hash sentinels for failures)
    pub fingerprints: BTreeMap<String, ContentFingerprint>,
    /// URL → file type for non-textual pages that were not hashed
    pub ignored: BTreeMap<String, String>,
}

/// Fingerprints URL batches with bounded concurrency.
pub struct Fingerprinter<'a> {
    fetcher: &'a Fetcher,
    batch_size: usize,
    concurrency: usize,
}

impl<'a> Fingerprinter<'a> {
    pub fn new(fetcher: &'a Fetcher, batch_size: usize, concurrency: usize) -> Self {
        Self {
            fetcher,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Fingerprint every URL, reporting progress at batch boundaries.
    pub async fn fingerprint_all(
        &self,
        urls: &[String],
        mut on_batch: impl FnMut(usize, usize),
    ) -> FingerprintSet {
        let total_batches = urls.len().div_ceil(self.batch_size);
        let mut set = FingerprintSet::default();

        for (index, batch) in urls.chunks(self.batch_size).enumerate() {
            let outcomes: Vec<(String, PageOutcome)> = stream::iter(batch.to_vec())
                .map(|url| async move { (url.clone(), self.fingerprint_one(&url).await) })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            for (url, outcome) in outcomes {
                match outcome {
                    PageOutcome::Fingerprint(fp) => {
                        set.fingerprints.insert(url, fp);
                    }
                    PageOutcome::Ignored { file_type } => {
                        set.ignored.insert(url, file_type);
                    }
                }
            }

            info!(
                batch = index + 1,
                total_batches,
                processed = set.fingerprints.len() + set.ignored.len(),
                "fingerprint batch complete"
            );
            on_batch(index + 1, total_batches);
        }

        set
    }

    async fn fingerprint_one(&self, url: &str) -> PageOutcome {
        let fetched_at = Utc::now();

        let page = match self.fetcher.fetch(url).await {
            Ok(page) => page,
            Err(err) => {
                debug!(url, error = %err, "fetch failed, recording hash sentinel");
                return PageOutcome::Fingerprint(ContentFingerprint::missing(
                    err.status(),
                    fetched_at,
                ));
            }
        };

        // Non-textual documents are never hashed; the classifier reports
        // them as ignored files.
        if let Some(file_type) = ignored_file_type(url) {
            return PageOutcome::Ignored { file_type };
        }
        if let Some(content_type) = &page.content_type {
            if !is_html_content_type(content_type) {
                return PageOutcome::Ignored {
                    file_type: mime_subtype(content_type),
                };
            }
        }

        let text = canonical_text(&page.text());
        if text.is_empty() {
            return PageOutcome::Fingerprint(ContentFingerprint::missing(
                Some(page.status),
                fetched_at,
            ));
        }

        PageOutcome::Fingerprint(ContentFingerprint {
            hash: hash_text(&text),
            content_length: text.len() as u64,
            status: Some(page.status),
            fetched_at,
            preview: preview_of(&text),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_text_strips_boilerplate() {
        let html = r#"
            <html>
            <head><title>Title</title><script>var x = 1;</script></head>
            <body>
                <nav>Home | About</nav>
                <header>Site header</header>
                <div class="main-NAV">menu entries</div>
                <div id="cookie-banner">Accept cookies</div>
                <main>
                    <h1>Hello   world</h1>
                    <!-- a comment -->
                    <p>Body    text here.</p>
                </main>
                <footer>Copyright</footer>
            </body>
            </html>
        "#;
        let text = canonical_text(html);
        assert_eq!(text, "Title\nHello world\nBody text here.");
    }

    #[test]
    fn test_canonical_text_removes_role_navigation() {
        let html = r#"<body><div role="navigation">skip me</div><p>keep me</p></body>"#;
        assert_eq!(canonical_text(html), "keep me");
    }

    #[test]
    fn test_canonical_text_is_deterministic() {
        let html = "<body><p>alpha</p><p>beta</p></body>";
        assert_eq!(canonical_text(html), canonical_text(html));
        assert_eq!(hash_text(&canonical_text(html)), hash_text("alpha\nbeta"));
    }

    #[test]
    fn test_hash_text_known_value() {
        // SHA-256 of the empty string
        assert_eq!(
            hash_text(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_preview_truncation() {
        let long = "x".repeat(500);
        let preview = preview_of(&long).unwrap();
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
        assert_eq!(preview_of(""), None);
        assert_eq!(preview_of("short").as_deref(), Some("short"));
    }
}
