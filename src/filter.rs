//! Transfer-url filters: pure functions mapping raw record metadata to the
//! payload urls it references.

use std::sync::Arc;

use regex::Regex;

use crate::error::{ExtractorError, Result};
use crate::xml;

/// A filter takes the raw metadata (if any) and returns the transfer urls
/// found in it. `None` input always yields an empty list.
pub type TransferUrlFilter = Arc<dyn Fn(Option<&str>) -> Result<Vec<String>> + Send + Sync>;

/// Collection of transfer-url filter factories.
pub struct TransferUrlFilters;

impl TransferUrlFilters {
    /// Filter applying `pattern` to the entire raw metadata.
    pub fn by_regex(pattern: &str) -> Result<TransferUrlFilter> {
        let regex = compile(pattern)?;
        Ok(Arc::new(move |source: Option<&str>| {
            let Some(source) = source else {
                return Ok(Vec::new());
            };
            let mut urls = Vec::new();
            collect_matches(&regex, source, &mut urls);
            Ok(urls)
        }))
    }

    /// Filter applying `pattern` to the text of every element reached by
    /// descending the qualified-name `path` (root segment included).
    pub fn by_regex_in_xml_path(pattern: &str, path: &[&str]) -> Result<TransferUrlFilter> {
        let regex = compile(pattern)?;
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        Ok(Arc::new(move |source: Option<&str>| {
            let Some(source) = source else {
                return Ok(Vec::new());
            };
            let root = xml::parse(source)?;
            let segments: Vec<&str> = path.iter().map(String::as_str).collect();
            let mut urls = Vec::new();
            for element in root.find_path(&segments) {
                if let Some(text) = element.text() {
                    collect_matches(&regex, text, &mut urls);
                }
            }
            Ok(urls)
        }))
    }

    /// Filter applying `pattern` to the text of every element selected by
    /// `xpath`, with namespace prefixes resolved through the declarations
    /// harvested from the document itself. An undeclared prefix fails the
    /// evaluation with a `prefix '<p>' not found in prefix map` error.
    pub fn by_regex_with_xpath_query(pattern: &str, xpath: &str) -> Result<TransferUrlFilter> {
        let regex = compile(pattern)?;
        let xpath = xpath.to_string();
        Ok(Arc::new(move |source: Option<&str>| {
            let Some(source) = source else {
                return Ok(Vec::new());
            };
            let (root, prefix_map) = xml::parse_with_prefix_map(source)?;
            let mut urls = Vec::new();
            for element in root.select(&xpath, &prefix_map)? {
                if let Some(text) = element.text() {
                    collect_matches(&regex, text, &mut urls);
                }
            }
            Ok(urls)
        }))
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ExtractorError::Filter(e.to_string()))
}

/// Collect matches the way the filters promise: when the pattern has
/// capture groups, every participating group contributes one url; without
/// groups the full match does. Empty matches are discarded.
fn collect_matches(regex: &Regex, text: &str, urls: &mut Vec<String>) {
    for captures in regex.captures_iter(text) {
        if regex.captures_len() > 1 {
            for group in captures.iter().skip(1).flatten() {
                if !group.as_str().is_empty() {
                    urls.push(group.as_str().to_string());
                }
            }
        } else if let Some(full) = captures.get(0) {
            if !full.as_str().is_empty() {
                urls.push(full.as_str().to_string());
            }
        }
    }
}
