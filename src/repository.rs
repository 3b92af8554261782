//! OAI-PMH verb executor. Stateless per call: every operation issues a
//! single GET against the repository base url and parses the XML response.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{ExtractorError, Result};
use crate::log::{EventLog, LogLevel};
use crate::record::Record;
use crate::xml::{self, Element};

pub const REPOSITORY_TAG: &str = "OAI Repository Interface";

/// Arguments for a selective `ListIdentifiers` harvest.
///
/// A resumption token is exclusive: when set, it is the only parameter sent
/// besides the verb. Otherwise `metadata_prefix` is required and the
/// remaining options are included when present.
#[derive(Debug, Clone, Default)]
pub struct ListIdentifiersRequest {
    pub metadata_prefix: Option<String>,
    pub from: Option<String>,
    pub until: Option<String>,
    pub set_spec: Option<String>,
    pub resumption_token: Option<String>,
}

impl ListIdentifiersRequest {
    pub fn with_prefix(metadata_prefix: impl Into<String>) -> Self {
        Self {
            metadata_prefix: Some(metadata_prefix.into()),
            ..Self::default()
        }
    }
}

/// One entry of a `ListMetadataFormats` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFormat {
    pub metadata_prefix: String,
    pub schema: String,
    pub metadata_namespace: String,
}

/// One entry of a `ListSets` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaiSet {
    pub set_spec: String,
    pub set_name: String,
}

/// Client for one OAI-PMH repository endpoint.
///
/// The interface owns an [`EventLog`] that is cleared at the entry of each
/// top-level verb call, unless `preserve_log` is set or the call continues
/// a paged sequence (non-null resumption token). This way the log always
/// describes the most recent verb call while multi-call sequences can
/// accumulate diagnostics.
pub struct RepositoryInterface {
    base_url: String,
    client: reqwest::Client,
    preserve_log: AtomicBool,
    log: Mutex<EventLog>,
}

impl RepositoryInterface {
    /// `timeout` applies per HTTP call; `None` disables it.
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            base_url: base_url.into(),
            client: builder.build()?,
            preserve_log: AtomicBool::new(false),
            log: Mutex::new(EventLog::new(REPOSITORY_TAG)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn preserve_log(&self) -> bool {
        self.preserve_log.load(Ordering::Relaxed)
    }

    pub fn set_preserve_log(&self, preserve: bool) {
        self.preserve_log.store(preserve, Ordering::Relaxed);
    }

    /// Snapshot of the interface log.
    pub fn log(&self) -> EventLog {
        self.log.lock().unwrap().clone()
    }

    /// Single-line rendition of the log, for quoting in job diagnostics.
    pub fn log_to_flat_string(&self) -> String {
        self.log.lock().unwrap().to_flat_string()
    }

    fn clear_log_unless_continuation(&self, continuation: bool) {
        if !self.preserve_log() && !continuation {
            self.log.lock().unwrap().clear();
        }
    }

    fn build_request(&self, options: &[(&str, &str)]) -> String {
        if options.is_empty() {
            return self.base_url.clone();
        }
        let mut url = self.base_url.clone();
        if !url.ends_with('?') {
            url.push('?');
        }
        let query: Vec<String> = options
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        url + &query.join("&")
    }

    async fn execute_http_request(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }

    /// Log an `<error>` element if the response carries one. Returns true
    /// when an error was found.
    fn check_for_oaipmh_errors(&self, root: &Element) -> bool {
        let Some(error) = root.child("error") else {
            return false;
        };
        let code = error.attr("code").unwrap_or_default();
        let text = error.text().unwrap_or_default();
        self.log
            .lock()
            .unwrap()
            .log(LogLevel::Error, format!("{code}: {text}"));
        true
    }

    /// `Identify` verb. No error path is expected per OAI-PMH; the parsed
    /// response tree is returned as-is.
    pub async fn identify(&self) -> Result<Element> {
        let response = self
            .execute_http_request(&self.build_request(&[("verb", "Identify")]))
            .await?;
        xml::parse(&response)
    }

    /// `ListMetadataFormats` verb. An OAI-PMH error yields an empty list
    /// and a log entry.
    pub async fn list_metadata_formats(&self) -> Result<Vec<MetadataFormat>> {
        self.clear_log_unless_continuation(false);

        let response = self
            .execute_http_request(&self.build_request(&[("verb", "ListMetadataFormats")]))
            .await?;
        let root = xml::parse(&response)?;
        if self.check_for_oaipmh_errors(&root) {
            return Ok(Vec::new());
        }

        let formats = root
            .child("ListMetadataFormats")
            .map(|list| {
                list.children_named("metadataFormat")
                    .map(|format| MetadataFormat {
                        metadata_prefix: format
                            .child_text("metadataPrefix")
                            .unwrap_or_default()
                            .to_string(),
                        schema: format.child_text("schema").unwrap_or_default().to_string(),
                        metadata_namespace: format
                            .child_text("metadataNamespace")
                            .unwrap_or_default()
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(formats)
    }

    /// The `metadataPrefix` projection of [`Self::list_metadata_formats`].
    pub async fn list_metadata_prefixes(&self) -> Result<Vec<String>> {
        let formats = self.list_metadata_formats().await?;
        Ok(formats
            .into_iter()
            .map(|format| format.metadata_prefix)
            .collect())
    }

    /// `ListIdentifiers` verb. Returns one page of identifiers plus the
    /// resumption token for the next page, if any. An OAI-PMH error yields
    /// an empty page, the token that was passed in, and a log entry.
    pub async fn list_identifiers(
        &self,
        request: &ListIdentifiersRequest,
    ) -> Result<(Vec<String>, Option<String>)> {
        let continuation = request.resumption_token.is_some();
        self.clear_log_unless_continuation(continuation);

        let mut options: Vec<(&str, &str)> = vec![("verb", "ListIdentifiers")];
        if let Some(token) = &request.resumption_token {
            options.push(("resumptionToken", token.as_str()));
        } else {
            let Some(prefix) = &request.metadata_prefix else {
                return Err(ExtractorError::Usage(
                    "Missing metadata_prefix for ListIdentifiers request.".into(),
                ));
            };
            options.push(("metadataPrefix", prefix.as_str()));
            if let Some(from) = &request.from {
                options.push(("from", from.as_str()));
            }
            if let Some(until) = &request.until {
                options.push(("until", until.as_str()));
            }
            if let Some(set_spec) = &request.set_spec {
                options.push(("set", set_spec.as_str()));
            }
        }

        let response = self
            .execute_http_request(&self.build_request(&options))
            .await?;
        let root = xml::parse(&response)?;
        if self.check_for_oaipmh_errors(&root) {
            return Ok((Vec::new(), request.resumption_token.clone()));
        }

        let mut identifiers = Vec::new();
        let mut resumption_token = None;
        if let Some(list) = root.child("ListIdentifiers") {
            for header in list.children_named("header") {
                if let Some(identifier) = header.child_text("identifier") {
                    identifiers.push(identifier.to_string());
                }
            }
            resumption_token = parse_resumption_token(list);
        }
        Ok((identifiers, resumption_token))
    }

    /// Repeat `ListIdentifiers` following resumption tokens until none is
    /// returned, concatenating the pages. Fails when more than
    /// `max_resumption_tokens` non-null tokens are processed (a bound of
    /// `None` or 0 means unlimited).
    pub async fn list_identifiers_exhaustive(
        &self,
        request: &ListIdentifiersRequest,
        max_resumption_tokens: Option<u64>,
    ) -> Result<Vec<String>> {
        let mut identifiers = Vec::new();
        let mut page_request = request.clone();
        let mut tokens_count: u64 = 0;
        loop {
            let (page, token) = self.list_identifiers(&page_request).await?;
            identifiers.extend(page);
            let Some(token) = token else {
                break;
            };
            tokens_count += 1;
            if let Some(max) = max_resumption_tokens {
                if max > 0 && tokens_count > max {
                    return Err(ExtractorError::TokenLimitExceeded { max });
                }
            }
            page_request.resumption_token = Some(token);
        }
        Ok(identifiers)
    }

    /// Exhaustive listing across multiple sets (logical OR): the
    /// de-duplicated union of one exhaustive listing per set. With no sets
    /// given this behaves like the single-set exhaustive form.
    pub async fn list_identifiers_exhaustive_multiple_sets(
        &self,
        request: &ListIdentifiersRequest,
        set_specs: Option<&[String]>,
        max_resumption_tokens: Option<u64>,
    ) -> Result<Vec<String>> {
        let Some(set_specs) = set_specs else {
            return self
                .list_identifiers_exhaustive(request, max_resumption_tokens)
                .await;
        };

        let mut seen = HashSet::new();
        let mut identifiers = Vec::new();
        for set_spec in set_specs {
            let mut set_request = request.clone();
            set_request.set_spec = Some(set_spec.clone());
            let set_identifiers = self
                .list_identifiers_exhaustive(&set_request, max_resumption_tokens)
                .await?;
            for identifier in set_identifiers {
                if seen.insert(identifier.clone()) {
                    identifiers.push(identifier);
                }
            }
        }
        Ok(identifiers)
    }

    /// `ListSets` verb. Token handling matches `ListIdentifiers`.
    pub async fn list_sets(
        &self,
        resumption_token: Option<&str>,
    ) -> Result<(Vec<OaiSet>, Option<String>)> {
        let continuation = resumption_token.is_some();
        self.clear_log_unless_continuation(continuation);

        let mut options: Vec<(&str, &str)> = vec![("verb", "ListSets")];
        if let Some(token) = resumption_token {
            options.push(("resumptionToken", token));
        }

        let response = self
            .execute_http_request(&self.build_request(&options))
            .await?;
        let root = xml::parse(&response)?;
        if self.check_for_oaipmh_errors(&root) {
            return Ok((Vec::new(), resumption_token.map(str::to_string)));
        }

        let mut sets = Vec::new();
        let mut next_token = None;
        if let Some(list) = root.child("ListSets") {
            for set in list.children_named("set") {
                sets.push(OaiSet {
                    set_spec: set.child_text("setSpec").unwrap_or_default().to_string(),
                    set_name: set.child_text("setName").unwrap_or_default().to_string(),
                });
            }
            next_token = parse_resumption_token(list);
        }
        Ok((sets, next_token))
    }

    /// `GetRecord` verb. Returns `None` when the response carries an
    /// OAI-PMH error. The record keeps the verbatim response XML as its
    /// raw metadata.
    pub async fn get_record(
        &self,
        metadata_prefix: &str,
        identifier: &str,
    ) -> Result<Option<Record>> {
        self.clear_log_unless_continuation(false);

        let response = self
            .execute_http_request(&self.build_request(&[
                ("verb", "GetRecord"),
                ("metadataPrefix", metadata_prefix),
                ("identifier", identifier),
            ]))
            .await?;
        let root = xml::parse(&response)?;
        if self.check_for_oaipmh_errors(&root) {
            return Ok(None);
        }

        let record_element = root
            .child("GetRecord")
            .and_then(|get_record| get_record.child("record"))
            .ok_or_else(|| {
                ExtractorError::Xml("GetRecord response misses the record element".into())
            })?;
        let status = record_element
            .child("header")
            .and_then(|header| header.attr("status"))
            .unwrap_or_default()
            .to_string();
        if !status.is_empty() {
            self.log.lock().unwrap().log(
                LogLevel::Warning,
                format!("Record {identifier} has status {status}."),
            );
        }

        let mut record = Record::new(identifier);
        record.status = status;
        record.metadata_prefix = Some(metadata_prefix.to_string());
        record.metadata_raw = Some(response);
        Ok(Some(record))
    }

    /// `ListRecords`, implemented as `ListIdentifiers` followed by one
    /// `GetRecord` per identifier. Harvesting is not time-critical, and
    /// fetching records one by one keeps each source-metadata document
    /// separate instead of splitting one enveloping response. If a single
    /// `GetRecord` fails, the whole page fails fast: an empty list and the
    /// token that was passed in are returned.
    pub async fn list_records(
        &self,
        request: &ListIdentifiersRequest,
    ) -> Result<(Vec<Record>, Option<String>)> {
        self.clear_log_unless_continuation(false);

        let (identifiers, resumption_token) = self.list_identifiers(request).await?;

        let metadata_prefix = request.metadata_prefix.as_deref().unwrap_or_default();
        let mut records = Vec::new();
        for identifier in identifiers {
            match self.get_record(metadata_prefix, &identifier).await? {
                Some(record) => records.push(record),
                None => return Ok((Vec::new(), request.resumption_token.clone())),
            }
        }
        Ok((records, resumption_token))
    }
}

/// Extract the resumption token of a list container: absent element or
/// empty text map to `None`, anything else to the text content.
fn parse_resumption_token(list: &Element) -> Option<String> {
    list.child("resumptionToken")
        .and_then(Element::text)
        .map(str::to_string)
}
