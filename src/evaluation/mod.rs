//! Reference reliability check
//!
//! Compares the links cited in research output against an allow-list of
//! agricultural and scientific domains. The check is advisory only.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use url::Url;

/// Preferred agricultural research domains
pub const AGRO_DOMAINS: &[&str] = &[
    "ars.usda.gov",
    "npdn.org",
    "agriculture.canada.ca",
    "aciar.gov.au",
    "fao.org",
    "cals.cornell.edu",
    "ipm.ucanr.edu",
    "sfyl.ifas.ufl.edu",
    "extension.iastate.edu",
    "extension.purdue.edu",
    "cimmyt.org",
    "irri.org",
    "iita.org",
    "eppo.int",
];

/// General scientific publishers and institutions
pub const SCIENCE_DOMAINS: &[&str] = &[
    "wikipedia.org",
    "nature.com",
    "science.org",
    "cell.com",
    "arxiv.org",
    "pnas.org",
    "springer.com",
    "sciencedirect.com",
    "elifesciences.org",
    "europa.eu",
];

fn url_pattern() -> Option<&'static Regex> {
    static URL: OnceLock<Option<Regex>> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r#"(?i)https?://[^\s\)\]\}<>"']+"#).ok())
        .as_ref()
}

/// Every http(s) URL in `text`, in order of appearance
pub fn extract_urls(text: &str) -> Vec<String> {
    match url_pattern() {
        Some(pattern) => pattern
            .find_iter(text)
            .map(|m| m.as_str().trim_end_matches(|c| matches!(c, '.' | ',' | ';' | ':')).to_string())
            .collect(),
        None => Vec::new(),
    }
}

/// Host of a URL without a leading `www.`
pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").map(|h| h.to_string()).unwrap_or(host))
}

fn is_preferred(host: &str, domains: &[&str]) -> bool {
    domains
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
}

/// One cited link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDetail {
    pub url: String,
    pub host: Option<String>,
    pub preferred: bool,
}

/// Outcome of a reference reliability check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceCheck {
    pub total: usize,
    pub preferred: usize,
    pub ratio: f64,
    pub min_ratio: f64,
    pub passed: bool,
    pub details: Vec<ReferenceDetail>,
}

impl ReferenceCheck {
    /// One-line summary for logs and reports
    pub fn summary(&self) -> String {
        format!(
            "{} of {} cited links from preferred domains ({:.0}%, minimum {:.0}%): {}",
            self.preferred,
            self.total,
            self.ratio * 100.0,
            self.min_ratio * 100.0,
            if self.passed { "PASS" } else { "FAIL" }
        )
    }

    /// Markdown report with up to ten detail rows
    pub fn to_markdown(&self) -> String {
        let status = if self.passed { "PASS" } else { "FAIL" };
        let mut lines = vec![
            format!("### Evaluation: preferred reference domains ({})", status),
            format!("- Total: {}", self.total),
            format!("- Preferred: {}", self.preferred),
            format!("- Ratio: {:.0}% (min {:.0}%)", self.ratio * 100.0, self.min_ratio * 100.0),
            String::new(),
        ];

        if self.details.is_empty() {
            lines.push("No links were found in the research output.".to_string());
        } else {
            lines.push("| Host | Preferred | URL |".to_string());
            lines.push("|---|:---:|---|".to_string());
            for detail in self.details.iter().take(10) {
                lines.push(format!(
                    "| {} | {} | {} |",
                    detail.host.as_deref().unwrap_or("-"),
                    if detail.preferred { "yes" } else { "no" },
                    detail.url
                ));
            }
        }
        lines.join("\n")
    }
}

/// Evaluate the links in `text` against `domains`. A link cited more than
/// once counts once.
pub fn evaluate_references(text: &str, domains: &[&str], min_ratio: f64) -> ReferenceCheck {
    let mut seen = HashSet::new();
    let details: Vec<ReferenceDetail> = extract_urls(text)
        .into_iter()
        .filter(|url| seen.insert(url.clone()))
        .map(|url| {
            let host = host_of(&url);
            let preferred = host.as_deref().map(|h| is_preferred(h, domains)).unwrap_or(false);
            ReferenceDetail { url, host, preferred }
        })
        .collect();

    let total = details.len();
    let preferred = details.iter().filter(|d| d.preferred).count();
    let ratio = if total == 0 { 0.0 } else { preferred as f64 / total as f64 };

    ReferenceCheck {
        total,
        preferred,
        ratio,
        min_ratio,
        passed: total > 0 && ratio >= min_ratio,
        details,
    }
}
