//! Payload collection: derive transfer urls from harvested metadata via a
//! filter pipeline and download the referenced files with retry.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::{ExtractorError, Result};
use crate::filter::TransferUrlFilter;
use crate::log::{EventLog, LogLevel};
use crate::record::Record;

pub const PAYLOAD_TAG: &str = "Payload Collector";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_ON_HTTP_STATUS: [u16; 2] = [429, 503];

/// Builder for [`PayloadCollector`]. Exactly one of
/// [`transfer_url_filter`](Self::transfer_url_filter) and
/// [`transfer_url_filters`](Self::transfer_url_filters) must be supplied.
#[derive(Default)]
pub struct PayloadCollectorBuilder {
    transfer_url_filter: Option<TransferUrlFilter>,
    transfer_url_filters: Option<Vec<TransferUrlFilter>>,
    timeout: Option<Option<Duration>>,
    max_retries: Option<u32>,
    retry_interval: Option<Duration>,
    retry_on_http_status: Option<HashSet<u16>>,
}

impl PayloadCollectorBuilder {
    pub fn transfer_url_filter(mut self, filter: TransferUrlFilter) -> Self {
        self.transfer_url_filter = Some(filter);
        self
    }

    pub fn transfer_url_filters(mut self, filters: Vec<TransferUrlFilter>) -> Self {
        self.transfer_url_filters = Some(filters);
        self
    }

    /// Per-request timeout; `None` disables it. Defaults to 10 seconds.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of retries after the first attempt. Defaults to 1.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sleep between attempts. Defaults to 1 second.
    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = Some(retry_interval);
        self
    }

    /// HTTP status codes worth retrying. Defaults to 429 and 503.
    pub fn retry_on_http_status(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retry_on_http_status = Some(statuses.into_iter().collect());
        self
    }

    pub fn build(self) -> Result<PayloadCollector> {
        let filters = match (self.transfer_url_filter, self.transfer_url_filters) {
            (Some(filter), None) => vec![filter],
            (None, Some(filters)) => filters,
            _ => {
                return Err(ExtractorError::Usage(
                    "Cannot build PayloadCollector: exactly one of 'transfer_url_filter' \
                     and 'transfer_url_filters' has to be specified."
                        .into(),
                ));
            }
        };

        let timeout = self.timeout.unwrap_or(Some(DEFAULT_TIMEOUT));
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(PayloadCollector {
            filters,
            client: builder.build()?,
            max_retries: self.max_retries.unwrap_or(1),
            retry_interval: self.retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL),
            retry_on_http_status: self
                .retry_on_http_status
                .unwrap_or_else(|| DEFAULT_RETRY_ON_HTTP_STATUS.into_iter().collect()),
            log: Mutex::new(EventLog::new(PAYLOAD_TAG)),
        })
    }
}

/// Extracts transfer urls from record metadata and downloads the
/// referenced files into a directory.
pub struct PayloadCollector {
    filters: Vec<TransferUrlFilter>,
    client: reqwest::Client,
    max_retries: u32,
    retry_interval: Duration,
    retry_on_http_status: HashSet<u16>,
    log: Mutex<EventLog>,
}

enum AttemptError {
    /// Non-2xx response; retried only for the configured status codes.
    Http { status: u16, source: reqwest::Error },
    /// Connection, DNS, timeout, or body-read failure; always retriable.
    Network(reqwest::Error),
    /// Filesystem or collision failure; never retried.
    Fatal(ExtractorError),
}

impl PayloadCollector {
    pub fn builder() -> PayloadCollectorBuilder {
        PayloadCollectorBuilder::default()
    }

    /// Snapshot of the collector log.
    pub fn log(&self) -> EventLog {
        self.log.lock().unwrap().clone()
    }

    /// Run the filter pipeline over the record's raw metadata and register
    /// the resulting urls as files, replacing any previous list. A no-op
    /// when the record already has files, unless `renew` is set.
    ///
    /// A filter failing on an undeclared XPath namespace prefix is logged
    /// and skipped; the remaining filters still run. Any other filter
    /// failure propagates. The url multiset is de-duplicated (first
    /// occurrence wins) before registration.
    pub fn extract_urls(&self, record: &mut Record, renew: bool) -> Result<()> {
        if !renew && !record.files.is_empty() {
            return Ok(());
        }
        record.files.clear();

        let mut urls = Vec::new();
        for (idx, filter) in self.filters.iter().enumerate() {
            match filter(record.metadata_raw.as_deref()) {
                Ok(mut found) => urls.append(&mut found),
                Err(error) => {
                    let message = error.to_string();
                    if message.contains("not found in prefix map") {
                        self.log.lock().unwrap().log(
                            LogLevel::Error,
                            format!(
                                "Failed to generate url with filter {idx}. XPath contains \
                                 unknown namespace: {message}."
                            ),
                        );
                    } else {
                        return Err(error);
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        let unique: Vec<String> = urls
            .into_iter()
            .filter(|url| seen.insert(url.clone()))
            .collect();

        let mut log = self.log.lock().unwrap();
        if unique.is_empty() {
            log.log(
                LogLevel::Warning,
                format!(
                    "Got no payload-urls from metadata of '{}'.",
                    record.identifier()
                ),
            );
        } else {
            let listed: Vec<String> = unique
                .iter()
                .map(|url| format!("'{}'", url.trim()))
                .collect();
            log.log(
                LogLevel::Info,
                format!(
                    "Filter on '{}'-metadata returned the following urls: {}",
                    record.identifier(),
                    listed.join(", ")
                ),
            );
        }
        drop(log);

        record.register_files_by_url(unique);
        Ok(())
    }

    /// Download one file into `dir` and return its path.
    ///
    /// The output filename is the caller override if given, otherwise the
    /// `Content-Disposition` filename, otherwise the percent-decoded
    /// basename of the final response url. When the name collides with an
    /// existing file, up to 10 probes (`name`, then `<stem>_<i><suffix>`)
    /// are tried before failing with a collision error.
    ///
    /// Retriable failures (configured HTTP statuses and network-level
    /// errors) are re-attempted up to `max_retries` times with
    /// `retry_interval` between attempts; every failed attempt is logged
    /// and echoed to standard error. The last underlying error surfaces
    /// when attempts are exhausted.
    pub async fn download_file(
        &self,
        dir: &Path,
        url: &str,
        filename: Option<&Path>,
    ) -> Result<PathBuf> {
        let mut attempt = 0;
        loop {
            match self.attempt_download(dir, url, filename).await {
                Ok(path) => return Ok(path),
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(AttemptError::Http { status, source }) => {
                    self.log_attempt_failure(url, dir, &source);
                    if !self.retry_on_http_status.contains(&status) || attempt >= self.max_retries
                    {
                        return Err(ExtractorError::Transport(source));
                    }
                }
                Err(AttemptError::Network(source)) => {
                    self.log_attempt_failure(url, dir, &source);
                    if attempt >= self.max_retries {
                        return Err(ExtractorError::Transport(source));
                    }
                }
            }
            attempt += 1;
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Extract urls for the record (see [`Self::extract_urls`]) and, unless
    /// `skip_download` is set, download every registered file into `dir`.
    ///
    /// A file that cannot be written because its target directory is
    /// missing is logged and left incomplete; other download errors
    /// propagate.
    pub async fn download_record_payload(
        &self,
        record: &mut Record,
        dir: Option<&Path>,
        renew_urls: bool,
        skip_download: bool,
    ) -> Result<()> {
        self.extract_urls(record, renew_urls)?;

        if skip_download {
            return Ok(());
        }

        let Some(dir) = dir else {
            let msg =
                "Missing expected filesystem path as argument in call to download_record_payload.";
            self.log.lock().unwrap().log(LogLevel::Error, msg);
            return Err(ExtractorError::Usage(msg.into()));
        };

        for idx in 0..record.files.len() {
            let url = record.files[idx].url.clone();
            match self.download_file(dir, &url, None).await {
                Ok(path) => {
                    record.files[idx].path = Some(path);
                    record.files[idx].complete = true;
                }
                Err(ExtractorError::Io(error)) if error.kind() == ErrorKind::NotFound => {
                    self.log
                        .lock()
                        .unwrap()
                        .log(LogLevel::Error, format!("Download failed: {error}."));
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    async fn attempt_download(
        &self,
        dir: &Path,
        url: &str,
        filename_override: Option<&Path>,
    ) -> std::result::Result<PathBuf, AttemptError> {
        if let Ok(parsed) = Url::parse(url)
            && parsed.scheme() == "file"
        {
            return self
                .attempt_file_copy(dir, &parsed, url, filename_override)
                .await;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(AttemptError::Network)?;
        let response = match response.error_for_status() {
            Ok(response) => response,
            Err(error) => {
                let status = error.status().map(|s| s.as_u16()).unwrap_or_default();
                return Err(AttemptError::Http {
                    status,
                    source: error,
                });
            }
        };

        let filename = match filename_override {
            Some(name) => name.to_path_buf(),
            None => resolve_filename(&response),
        };
        let target = self
            .choose_collision_free_path(dir, &filename, url)
            .map_err(AttemptError::Fatal)?;

        let body = response.bytes().await.map_err(AttemptError::Network)?;
        tokio::fs::write(&target, &body)
            .await
            .map_err(|error| AttemptError::Fatal(ExtractorError::Io(error)))?;
        Ok(target)
    }

    /// `file://` urls bypass the HTTP client and copy from the local
    /// filesystem instead.
    async fn attempt_file_copy(
        &self,
        dir: &Path,
        parsed: &Url,
        url: &str,
        filename_override: Option<&Path>,
    ) -> std::result::Result<PathBuf, AttemptError> {
        let source = parsed.to_file_path().map_err(|_| {
            AttemptError::Fatal(ExtractorError::Usage(format!("invalid file url '{url}'")))
        })?;
        let filename = match filename_override {
            Some(name) => name.to_path_buf(),
            None => source.file_name().map(PathBuf::from).unwrap_or_default(),
        };
        let target = self
            .choose_collision_free_path(dir, &filename, url)
            .map_err(AttemptError::Fatal)?;
        let body = tokio::fs::read(&source)
            .await
            .map_err(|error| AttemptError::Fatal(ExtractorError::Io(error)))?;
        tokio::fs::write(&target, &body)
            .await
            .map_err(|error| AttemptError::Fatal(ExtractorError::Io(error)))?;
        Ok(target)
    }

    fn choose_collision_free_path(
        &self,
        dir: &Path,
        filename: &Path,
        url: &str,
    ) -> Result<PathBuf> {
        let stem = filename
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let suffix = filename
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let mut candidate = filename.to_path_buf();
        for probe in 0..10 {
            if probe > 0 {
                candidate = PathBuf::from(format!("{stem}_{}{suffix}", probe - 1));
            }
            let target = dir.join(&candidate);
            if !target.is_file() {
                return Ok(target);
            }
        }

        self.log.lock().unwrap().log(
            LogLevel::Error,
            format!("Cannot find valid filename for requested file with url '{url}'."),
        );
        Err(ExtractorError::Collision {
            url: url.to_string(),
        })
    }

    fn log_attempt_failure(&self, url: &str, dir: &Path, error: &reqwest::Error) {
        let msg = format!(
            "Payload collector encountered an error while requesting '{url}' \
             (downloading to '{}'): {error}",
            dir.display()
        );
        self.log.lock().unwrap().log(LogLevel::Error, msg.clone());
        eprintln!("{msg}");
    }
}

fn resolve_filename(response: &reqwest::Response) -> PathBuf {
    if let Some(value) = response.headers().get(reqwest::header::CONTENT_DISPOSITION)
        && let Ok(value) = value.to_str()
        && let Some(name) = filename_from_content_disposition(value)
    {
        return name;
    }
    let path = percent_decode_str(response.url().path()).decode_utf8_lossy();
    Path::new(path.as_ref())
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_default()
}

fn filename_from_content_disposition(value: &str) -> Option<PathBuf> {
    value.split(';').map(str::trim).find_map(|part| {
        let name = part.strip_prefix("filename=")?.trim().trim_matches('"');
        if name.is_empty() {
            None
        } else {
            Some(PathBuf::from(name))
        }
    })
}
