#![allow(dead_code)]

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::bail;
use oai_extractor::ExtractionManager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const METADATA_PREFIX: &str = "oai_dc";

static TEST_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// One page of a scripted `ListIdentifiers` response.
#[derive(Clone, Default)]
pub struct IdentifierPage {
    pub identifiers: Vec<String>,
    /// Token leading to the next page; rendered as a bare element unless
    /// `token_xml` overrides it.
    pub token: Option<String>,
    /// Raw `<resumptionToken ...>` element rendered verbatim.
    pub token_xml: Option<String>,
}

impl IdentifierPage {
    pub fn of(identifiers: &[&str], token: Option<&str>) -> Self {
        Self {
            identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
            token: token.map(str::to_string),
            token_xml: None,
        }
    }
}

#[derive(Clone)]
pub enum RecordSpec {
    Metadata(String),
    StatusWithMetadata(String, String),
    OaiError,
}

#[derive(Clone, Default)]
pub struct MockOaiConfig {
    pub pages: Vec<IdentifierPage>,
    pub pages_by_set: HashMap<String, Vec<IdentifierPage>>,
    pub records: HashMap<String, RecordSpec>,
    pub metadata_formats: Vec<(String, String, String)>,
    pub sets: Vec<(String, String)>,
    pub list_identifiers_error: Option<(String, String)>,
    pub list_metadata_formats_error: Option<(String, String)>,
    pub list_identifiers_delay: Option<Duration>,
    pub get_record_delay: Option<Duration>,
    /// Respond with this HTTP status (and an empty body) to every request.
    pub http_status: Option<u16>,
}

pub struct MockOaiServer {
    pub endpoint: String,
    requests: Arc<Mutex<Vec<HashMap<String, String>>>>,
    handle: JoinHandle<()>,
}

impl Drop for MockOaiServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl MockOaiServer {
    pub fn requests(&self) -> Vec<HashMap<String, String>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_with_verb(&self, verb: &str) -> Vec<HashMap<String, String>> {
        self.requests()
            .into_iter()
            .filter(|params| params.get("verb").map(String::as_str) == Some(verb))
            .collect()
    }
}

/// Route `RUST_LOG`-filtered tracing output to the test harness once.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub async fn start_mock_oai_server(config: MockOaiConfig) -> anyhow::Result<MockOaiServer> {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let endpoint = format!("http://{}", address);
    let endpoint_for_task = endpoint.clone();
    let shared_config = Arc::new(config);
    let requests: Arc<Mutex<Vec<HashMap<String, String>>>> = Arc::new(Mutex::new(Vec::new()));
    let requests_for_task = requests.clone();

    let handle = tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(value) => value,
                Err(_) => break,
            };
            let endpoint = endpoint_for_task.clone();
            let config = shared_config.clone();
            let requests = requests_for_task.clone();
            tokio::spawn(async move {
                if let Err(error) =
                    handle_oai_connection(&mut socket, &endpoint, &config, &requests).await
                {
                    eprintln!("mock OAI server request handling failed: {}", error);
                }
            });
        }
    });

    Ok(MockOaiServer {
        endpoint,
        requests,
        handle,
    })
}

async fn handle_oai_connection(
    socket: &mut TcpStream,
    endpoint: &str,
    config: &MockOaiConfig,
    requests: &Mutex<Vec<HashMap<String, String>>>,
) -> anyhow::Result<()> {
    let path = read_request_path(socket).await?;
    let params = parse_query_params(&path);
    requests.lock().unwrap().push(params.clone());

    if let Some(status) = config.http_status {
        let response = format!(
            "HTTP/1.1 {} ERROR\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        );
        socket.write_all(response.as_bytes()).await?;
        return Ok(());
    }

    let body = match params.get("verb").map(String::as_str) {
        Some("Identify") => identify_response(endpoint),
        Some("ListMetadataFormats") => list_metadata_formats_response(endpoint, config),
        Some("ListIdentifiers") => {
            if let Some(delay) = config.list_identifiers_delay {
                tokio::time::sleep(delay).await;
            }
            list_identifiers_response(endpoint, config, &params)
        }
        Some("ListSets") => list_sets_response(endpoint, config),
        Some("GetRecord") => {
            if let Some(delay) = config.get_record_delay {
                tokio::time::sleep(delay).await;
            }
            get_record_response(endpoint, config, &params)
        }
        _ => error_response(endpoint, &params, "badVerb", "Unknown or missing verb"),
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/xml; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    Ok(())
}

fn identify_response(endpoint: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2026-02-07T00:00:00Z</responseDate>
  <request verb="Identify">{endpoint}</request>
  <Identify>
    <repositoryName>Mock Repository</repositoryName>
    <baseURL>{endpoint}</baseURL>
    <protocolVersion>2.0</protocolVersion>
    <adminEmail>mock@example.com</adminEmail>
    <earliestDatestamp>2026-01-01</earliestDatestamp>
    <deletedRecord>persistent</deletedRecord>
    <granularity>YYYY-MM-DD</granularity>
  </Identify>
</OAI-PMH>"#
    )
}

fn list_metadata_formats_response(endpoint: &str, config: &MockOaiConfig) -> String {
    if let Some((code, text)) = &config.list_metadata_formats_error {
        return error_response_raw(endpoint, "ListMetadataFormats", code, text);
    }
    let formats = config
        .metadata_formats
        .iter()
        .map(|(prefix, schema, namespace)| {
            format!(
                "<metadataFormat><metadataPrefix>{prefix}</metadataPrefix>\
                 <schema>{schema}</schema>\
                 <metadataNamespace>{namespace}</metadataNamespace></metadataFormat>"
            )
        })
        .collect::<Vec<_>>()
        .join("");
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2026-02-07T00:00:00Z</responseDate>
  <request verb="ListMetadataFormats">{endpoint}</request>
  <ListMetadataFormats>{formats}</ListMetadataFormats>
</OAI-PMH>"#
    )
}

fn list_sets_response(endpoint: &str, config: &MockOaiConfig) -> String {
    let sets = config
        .sets
        .iter()
        .map(|(spec, name)| {
            format!("<set><setSpec>{spec}</setSpec><setName>{name}</setName></set>")
        })
        .collect::<Vec<_>>()
        .join("");
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2026-02-07T00:00:00Z</responseDate>
  <request verb="ListSets">{endpoint}</request>
  <ListSets>{sets}</ListSets>
</OAI-PMH>"#
    )
}

fn list_identifiers_response(
    endpoint: &str,
    config: &MockOaiConfig,
    params: &HashMap<String, String>,
) -> String {
    if let Some((code, text)) = &config.list_identifiers_error {
        return error_response(endpoint, params, code, text);
    }

    let pages = params
        .get("set")
        .and_then(|set| config.pages_by_set.get(set))
        .unwrap_or(&config.pages);

    let page = match params.get("resumptionToken") {
        None => pages.first(),
        Some(token) => pages
            .iter()
            .position(|page| page.token.as_deref() == Some(token.as_str()))
            .and_then(|index| pages.get(index + 1)),
    };
    let Some(page) = page else {
        return error_response(endpoint, params, "badResumptionToken", "Unknown token");
    };

    let headers = page
        .identifiers
        .iter()
        .map(|identifier| {
            format!(
                "<header><identifier>{identifier}</identifier>\
                 <datestamp>2026-02-07</datestamp></header>"
            )
        })
        .collect::<Vec<_>>()
        .join("");
    let token_xml = match (&page.token_xml, &page.token) {
        (Some(raw), _) => raw.clone(),
        (None, Some(token)) => format!("<resumptionToken>{token}</resumptionToken>"),
        (None, None) => String::new(),
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2026-02-07T00:00:00Z</responseDate>
  <request verb="ListIdentifiers">{endpoint}</request>
  <ListIdentifiers>{headers}{token_xml}</ListIdentifiers>
</OAI-PMH>"#
    )
}

fn get_record_response(
    endpoint: &str,
    config: &MockOaiConfig,
    params: &HashMap<String, String>,
) -> String {
    let identifier = params
        .get("identifier")
        .map(String::as_str)
        .unwrap_or_default();
    let metadata_prefix = params
        .get("metadataPrefix")
        .map(String::as_str)
        .unwrap_or(METADATA_PREFIX);

    let (status_attr, metadata) = match config.records.get(identifier) {
        Some(RecordSpec::Metadata(metadata)) => (String::new(), metadata.clone()),
        Some(RecordSpec::StatusWithMetadata(status, metadata)) => {
            (format!(" status=\"{status}\""), metadata.clone())
        }
        Some(RecordSpec::OaiError) | None => {
            return error_response(endpoint, params, "idDoesNotExist", "Unknown identifier");
        }
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2026-02-07T00:00:00Z</responseDate>
  <request verb="GetRecord" metadataPrefix="{metadata_prefix}" identifier="{identifier}">{endpoint}</request>
  <GetRecord>
    <record>
      <header{status_attr}>
        <identifier>{identifier}</identifier>
        <datestamp>2026-02-07</datestamp>
      </header>
      <metadata>{metadata}</metadata>
    </record>
  </GetRecord>
</OAI-PMH>"#
    )
}

fn error_response(
    endpoint: &str,
    params: &HashMap<String, String>,
    code: &str,
    message: &str,
) -> String {
    let verb = params.get("verb").map(String::as_str).unwrap_or("Unknown");
    error_response_raw(endpoint, verb, code, message)
}

fn error_response_raw(endpoint: &str, verb: &str, code: &str, message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2026-02-07T00:00:00Z</responseDate>
  <request verb="{verb}">{endpoint}</request>
  <error code="{code}">{message}</error>
</OAI-PMH>"#
    )
}

/// A scripted file-download endpoint.
#[derive(Clone, Default)]
pub struct FileSpec {
    pub body: Vec<u8>,
    pub content_disposition: Option<String>,
    /// Statuses returned for the first requests, one per request, before
    /// the file is served normally.
    pub fail_statuses: Vec<u16>,
}

impl FileSpec {
    pub fn with_body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }
}

pub struct MockFileServer {
    pub base_url: String,
    files: Arc<Mutex<HashMap<String, FileSpec>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    handle: JoinHandle<()>,
}

impl Drop for MockFileServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl MockFileServer {
    pub fn add_file(&self, path: &str, spec: FileSpec) {
        self.files.lock().unwrap().insert(path.to_string(), spec);
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

pub async fn start_mock_file_server() -> anyhow::Result<MockFileServer> {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let base_url = format!("http://{}", address);
    let files: Arc<Mutex<HashMap<String, FileSpec>>> = Arc::new(Mutex::new(HashMap::new()));
    let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let files_for_task = files.clone();
    let hits_for_task = hits.clone();

    let handle = tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(value) => value,
                Err(_) => break,
            };
            let files = files_for_task.clone();
            let hits = hits_for_task.clone();
            tokio::spawn(async move {
                if let Err(error) = handle_file_connection(&mut socket, &files, &hits).await {
                    eprintln!("mock file server request handling failed: {}", error);
                }
            });
        }
    });

    Ok(MockFileServer {
        base_url,
        files,
        hits,
        handle,
    })
}

async fn handle_file_connection(
    socket: &mut TcpStream,
    files: &Mutex<HashMap<String, FileSpec>>,
    hits: &Mutex<HashMap<String, usize>>,
) -> anyhow::Result<()> {
    let path = read_request_path(socket).await?;
    let path = path.split('?').next().unwrap_or("/").to_string();
    *hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

    let (status, content_disposition, body) = {
        let mut files = files.lock().unwrap();
        match files.get_mut(&path) {
            Some(spec) => {
                if spec.fail_statuses.is_empty() {
                    (200, spec.content_disposition.clone(), spec.body.clone())
                } else {
                    (spec.fail_statuses.remove(0), None, Vec::new())
                }
            }
            None => (404, None, Vec::new()),
        }
    };

    let status_text = if status == 200 { "OK" } else { "ERROR" };
    let disposition_header = content_disposition
        .map(|value| format!("Content-Disposition: {}\r\n", value))
        .unwrap_or_default();
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/octet-stream\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        status_text,
        disposition_header,
        body.len()
    );
    socket.write_all(header.as_bytes()).await?;
    socket.write_all(&body).await?;
    Ok(())
}

async fn read_request_path(socket: &mut TcpStream) -> anyhow::Result<String> {
    let mut buf = vec![0u8; 8192];
    let mut total = 0usize;

    loop {
        let bytes_read = socket.read(&mut buf[total..]).await?;
        if bytes_read == 0 {
            break;
        }
        total += bytes_read;
        if buf[..total].windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
        if total == buf.len() {
            break;
        }
    }

    let request = String::from_utf8_lossy(&buf[..total]);
    let request_line = request.lines().next().unwrap_or_default();
    Ok(request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string())
}

fn parse_query_params(path: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let query = path.split_once('?').map(|(_, query)| query).unwrap_or("");
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(key.to_string(), value.to_string());
    }
    params
}

/// Metadata document embedding one `dc:identifier` per transfer url.
pub fn oai_dc_metadata(urls: &[&str]) -> String {
    let identifiers = urls
        .iter()
        .map(|url| format!("<dc:identifier>{url}</dc:identifier>"))
        .collect::<Vec<_>>()
        .join("");
    format!(
        "<oai_dc:dc xmlns:oai_dc=\"http://www.openarchives.org/OAI/2.0/oai_dc/\" \
         xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\
         <dc:title>A title</dc:title>{identifiers}</oai_dc:dc>"
    )
}

pub fn create_temp_dir(name: &str) -> anyhow::Result<PathBuf> {
    let path = unique_path(name);
    fs::create_dir_all(&path)?;
    Ok(path)
}

fn unique_path(name: &str) -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    env::temp_dir().join(format!("oai-extractor-{name}-{id}"))
}

/// Poll until the job reaches a terminal state (completion timestamp set).
pub async fn wait_for_job_end(
    manager: &ExtractionManager,
    job_id: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(job) = manager.get_job(job_id) {
            let job = job.lock().await;
            if job.complete_datetime() != "not completed" {
                return Ok(());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("job {job_id} did not end within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the manager no longer tracks the job as running.
pub async fn wait_for_worker_exit(
    manager: &ExtractionManager,
    job_id: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !manager.running_jobs().iter().any(|id| id == job_id) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("worker of job {job_id} did not exit within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
