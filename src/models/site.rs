// src/models/site.rs

//! Monitored-site configuration.

use serde::{Deserialize, Serialize};

/// How a detection run observes a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Compare sitemap URL sets only
    Sitemap,
    /// Compare content fingerprints over the known URL set
    Content,
    /// Sitemap comparison plus content fingerprints for the full URL universe
    Hybrid,
}

impl DetectionMethod {
    /// Stable name used in file names and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Sitemap => "sitemap",
            DetectionMethod::Content => "content",
            DetectionMethod::Hybrid => "hybrid",
        }
    }

    /// Whether this method fingerprints page content.
    pub fn uses_content(&self) -> bool {
        matches!(self, DetectionMethod::Content | DetectionMethod::Hybrid)
    }
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a single monitored site.
///
/// Loaded from the `[[sites]]` tables of the config file; immutable for the
/// lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    /// Stable site identifier, used for storage directories and API paths
    pub id: String,

    /// Display name
    pub name: String,

    /// Root URL of the site
    pub url: String,

    /// Sitemap entry point; guessed from the root URL when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sitemap_url: Option<String>,

    /// Enabled detection methods; each produces its own report per run
    #[serde(default = "default_methods")]
    pub methods: Vec<DetectionMethod>,

    /// Poll interval for scheduled runs
    #[serde(default = "default_interval")]
    pub check_interval_minutes: u64,

    /// Inactive sites are skipped by `detect-all` and `/trigger/all`
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_methods() -> Vec<DetectionMethod> {
    vec![DetectionMethod::Sitemap]
}

fn default_interval() -> u64 {
    1440
}

fn default_active() -> bool {
    true
}

impl SiteConfig {
    /// Candidate sitemap entry points, most specific first.
    ///
    /// When no `sitemap_url` is configured, the conventional locations under
    /// the site root are probed in order.
    pub fn sitemap_candidates(&self) -> Vec<String> {
        match &self.sitemap_url {
            Some(url) => vec![url.clone()],
            None => {
                let root = self.url.trim_end_matches('/');
                vec![
                    format!("{root}/sitemap.xml"),
                    format!("{root}/sitemap_index.xml"),
                ]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_site(sitemap_url: Option<&str>) -> SiteConfig {
        SiteConfig {
            id: "example".to_string(),
            name: "Example".to_string(),
            url: "https://example.com/".to_string(),
            sitemap_url: sitemap_url.map(|s| s.to_string()),
            methods: vec![DetectionMethod::Hybrid],
            check_interval_minutes: 60,
            active: true,
        }
    }

    #[test]
    fn test_sitemap_candidates_configured() {
        let site = make_site(Some("https://example.com/custom-sitemap.xml"));
        assert_eq!(
            site.sitemap_candidates(),
            vec!["https://example.com/custom-sitemap.xml".to_string()]
        );
    }

    #[test]
    fn test_sitemap_candidates_guessed() {
        let site = make_site(None);
        assert_eq!(
            site.sitemap_candidates(),
            vec![
                "https://example.com/sitemap.xml".to_string(),
                "https://example.com/sitemap_index.xml".to_string(),
            ]
        );
    }

    #[test]
    fn test_method_names() {
        assert_eq!(DetectionMethod::Sitemap.as_str(), "sitemap");
        assert!(DetectionMethod::Hybrid.uses_content());
        assert!(!DetectionMethod::Sitemap.uses_content());
    }
}
