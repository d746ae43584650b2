//! Utility functions and helpers.

use url::Url;

/// File extensions excluded from textual content comparison.
pub const IGNORED_EXTENSIONS: &[&str] = &[
    "pdf", "jpg", "jpeg", "png", "gif", "svg", "webp", "doc", "docx", "xls", "xlsx", "zip",
];

/// Normalize a URL for set comparison: strip the fragment, keep everything
/// else byte-for-byte (trailing slashes included, to avoid false
/// modifications).
pub fn normalize_url(raw: &str) -> String {
    match raw.split_once('#') {
        Some((before, _)) => before.to_string(),
        None => raw.to_string(),
    }
}

/// Extract the host from a URL string.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

/// Detect a non-textual file by its path extension.
///
/// Returns the lowercase extension when the URL points at a binary or
/// document type the fingerprinter does not hash.
pub fn ignored_file_type(url: &str) -> Option<String> {
    let path = match Url::parse(url) {
        Ok(u) => u.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    };
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    if IGNORED_EXTENSIONS.contains(&ext.as_str()) {
        Some(ext)
    } else {
        None
    }
}

/// Whether a Content-Type header denotes an HTML document.
pub fn is_html_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    matches!(
        essence.as_str(),
        "text/html" | "application/xhtml+xml" | "application/html"
    )
}

/// The MIME subtype of a Content-Type header, used to label ignored files
/// detected by MIME rather than extension.
pub fn mime_subtype(content_type: &str) -> String {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim();
    essence
        .rsplit_once('/')
        .map(|(_, sub)| sub.to_ascii_lowercase())
        .unwrap_or_else(|| essence.to_ascii_lowercase())
}
