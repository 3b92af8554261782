//! The extraction manager: a concurrent controller that spawns, tracks,
//! and cancels harvest and extraction jobs.
//!
//! Every job runs in its own tokio task. Within a task, work proceeds
//! sequentially; a cancellation token is polled at checkpoints (between
//! pages, records, files, and phases) and never interrupts an HTTP call
//! mid-flight. The manager owns the job registry; a worker task has
//! exclusive write access to its job while it runs, and external readers
//! observe snapshots through the shared handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ExtractorError, Result};
use crate::job::Job;
use crate::log::{EventLog, LogLevel};
use crate::payload::PayloadCollector;
use crate::record::Record;
use crate::repository::{ListIdentifiersRequest, RepositoryInterface};

pub const MANAGER_TAG: &str = "OAI Extraction Manager";

/// Handle to a live job. Workers hold it for writing, clients for reading.
pub type SharedJob = Arc<AsyncMutex<Job>>;

/// Predicate deciding whether a harvested record is kept; rejected records
/// move to the job's omitted list.
pub type RecordFilter = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Invoked with the job after every unit of work.
pub type ProgressCallback = Arc<dyn Fn(&Job) + Send + Sync>;

/// Async hook running inside the worker, either after the harvest phase or
/// after the job has ended.
pub type JobHook =
    Arc<dyn Fn(SharedJob, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Line sink for human-readable worker narration.
pub type VerboseSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Parameters of a harvest (or extraction) job.
///
/// When `identifiers` is given, the selective-harvest options are ignored
/// and no `ListIdentifiers` request is issued.
pub struct HarvestRequest {
    pub metadata_prefix: String,
    pub identifiers: Option<Vec<String>>,
    pub from: Option<String>,
    pub until: Option<String>,
    pub set_spec: Option<String>,
    pub filter: Option<RecordFilter>,
    pub on_progress: Option<ProgressCallback>,
    pub on_post_harvest: Option<JobHook>,
    pub on_final: Option<JobHook>,
    pub verbose: Option<VerboseSink>,
}

impl HarvestRequest {
    pub fn new(metadata_prefix: impl Into<String>) -> Self {
        Self {
            metadata_prefix: metadata_prefix.into(),
            identifiers: None,
            from: None,
            until: None,
            set_spec: None,
            filter: None,
            on_progress: None,
            on_post_harvest: None,
            on_final: None,
            verbose: None,
        }
    }
}

struct RunningJob {
    #[allow(dead_code)]
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Controller for OAI-PMH harvest and extraction processes.
pub struct ExtractionManager {
    repository: Arc<RepositoryInterface>,
    payload_collector: Option<Arc<PayloadCollector>>,
    jobs: StdMutex<HashMap<String, SharedJob>>,
    running: Arc<StdMutex<HashMap<String, RunningJob>>>,
    log: Arc<StdMutex<EventLog>>,
}

impl ExtractionManager {
    pub fn new(repository: RepositoryInterface) -> Self {
        Self {
            repository: Arc::new(repository),
            payload_collector: None,
            jobs: StdMutex::new(HashMap::new()),
            running: Arc::new(StdMutex::new(HashMap::new())),
            log: Arc::new(StdMutex::new(EventLog::new(MANAGER_TAG))),
        }
    }

    /// A payload collector is required for extraction jobs only.
    pub fn with_payload_collector(
        repository: RepositoryInterface,
        payload_collector: PayloadCollector,
    ) -> Self {
        let mut manager = Self::new(repository);
        manager.payload_collector = Some(Arc::new(payload_collector));
        manager
    }

    pub fn repository(&self) -> &RepositoryInterface {
        &self.repository
    }

    /// Snapshot of the manager log.
    pub fn log(&self) -> EventLog {
        self.log.lock().unwrap().clone()
    }

    /// Look up a job by identifier.
    pub fn get_job(&self, identifier: &str) -> Option<SharedJob> {
        self.jobs.lock().unwrap().get(identifier).cloned()
    }

    /// Identifiers of jobs whose worker task is still tracked.
    pub fn running_jobs(&self) -> Vec<String> {
        self.running.lock().unwrap().keys().cloned().collect()
    }

    /// Signal the worker of a job to cancel at its next checkpoint and
    /// drop it from the running registry. A no-op for unknown or already
    /// finished jobs.
    pub fn abort_job(&self, identifier: &str) {
        let mut running = self.running.lock().unwrap();
        if let Some(entry) = running.remove(identifier) {
            self.log
                .lock()
                .unwrap()
                .log(LogLevel::Info, format!("Aborted Job {identifier}."));
            entry.cancel.cancel();
        }
    }

    fn generate_unique_job_identifier(&self) -> Result<String> {
        let jobs = self.jobs.lock().unwrap();
        for retries in 0..100 {
            let identifier = Job::generate_identifier(&retries.to_string());
            if !jobs.contains_key(&identifier) {
                return Ok(identifier);
            }
        }
        self.log.lock().unwrap().log(
            LogLevel::Error,
            "Unable to generate unique job identifier.",
        );
        Err(ExtractorError::IdentifierExhausted)
    }

    /// Register a new harvest job, spawn its worker task, and return the
    /// job identifier immediately.
    ///
    /// Must be called within a tokio runtime.
    pub fn harvest(&self, request: HarvestRequest) -> Result<String> {
        self.log
            .lock()
            .unwrap()
            .log(LogLevel::Info, "Setting up new harvest Job..");

        let job_id = self.generate_unique_job_identifier()?;
        let mut job = Job::new(job_id.clone());
        job.description = format!("[{}] harvest job", job.creation_datetime());
        let short_id = job.abbreviated_identifier().to_string();

        let shared: SharedJob = Arc::new(AsyncMutex::new(job));
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.clone(), shared.clone());

        let cancel = CancellationToken::new();
        let context = WorkerContext {
            repository: self.repository.clone(),
            running: self.running.clone(),
            manager_log: self.log.clone(),
            job: shared,
            cancel: cancel.clone(),
            request,
            job_id: job_id.clone(),
            short_id,
        };

        // register before the worker can possibly reach its own removal
        {
            let mut running = self.running.lock().unwrap();
            let handle = tokio::spawn(context.run());
            running.insert(job_id.clone(), RunningJob { handle, cancel });
        }
        self.log
            .lock()
            .unwrap()
            .log(LogLevel::Info, format!("Started Job {job_id}."));
        Ok(job_id)
    }

    /// Register a harvest job whose post-harvest phase extracts transfer
    /// urls and downloads the payload files below `path`. Data lands in
    /// `path/<job id>/<record hash>-<suffix>/<file>`.
    ///
    /// Fails before any task is spawned when the manager was constructed
    /// without a payload collector.
    pub fn extract(&self, path: impl Into<PathBuf>, mut request: HarvestRequest) -> Result<String> {
        self.log
            .lock()
            .unwrap()
            .log(LogLevel::Info, "Setting up new extraction Job..");

        let Some(collector) = self.payload_collector.clone() else {
            let msg = "No payload collector available, cannot execute requested extraction.";
            self.log.lock().unwrap().log(LogLevel::Error, msg);
            return Err(ExtractorError::Usage(msg.into()));
        };

        let base_path = path.into();
        let progress = request.on_progress.clone();
        let verbose = request.verbose.clone();
        let hook: JobHook = Arc::new(move |job: SharedJob, cancel: CancellationToken| {
            let collector = collector.clone();
            let base_path = base_path.clone();
            let progress = progress.clone();
            let verbose = verbose.clone();
            Box::pin(async move {
                run_extraction(collector, base_path, job, cancel, progress, verbose).await;
            })
        });
        request.on_post_harvest = Some(hook);

        self.harvest(request)
    }
}

async fn report_progress(job: &SharedJob, progress: &Option<ProgressCallback>) {
    if let Some(callback) = progress {
        let job = job.lock().await;
        callback(&job);
    }
}

struct WorkerContext {
    repository: Arc<RepositoryInterface>,
    running: Arc<StdMutex<HashMap<String, RunningJob>>>,
    manager_log: Arc<StdMutex<EventLog>>,
    job: SharedJob,
    cancel: CancellationToken,
    request: HarvestRequest,
    job_id: String,
    short_id: String,
}

impl WorkerContext {
    fn verbose(&self, line: &str) {
        if let Some(sink) = &self.request.verbose {
            sink(&format!("[{}] {line}", self.short_id));
        }
    }

    async fn progress(&self) {
        report_progress(&self.job, &self.request.on_progress).await;
    }

    /// Cancellation endpoint: mark the job aborted and narrate it.
    async fn end_aborted(&self) {
        self.job.lock().await.end(true);
        self.verbose("Aborted job.");
    }

    async fn run(self) {
        self.verbose("Starting harvest..");
        self.job.lock().await.start();
        self.progress().await;

        let enumerated = match &self.request.identifiers {
            Some(identifiers) => {
                let identifiers = identifiers.clone();
                {
                    let mut job = self.job.lock().await;
                    for identifier in identifiers {
                        job.add_record(Record::new(identifier));
                    }
                }
                self.progress().await;
                self.verbose("Using given list of identifiers..");
                true
            }
            None => self.enumerate_identifiers().await,
        };
        if !enumerated {
            return;
        }

        if !self.fetch_records().await {
            return;
        }

        if let Some(hook) = &self.request.on_post_harvest {
            hook(self.job.clone(), self.cancel.clone()).await;
        }
        if self.cancel.is_cancelled() {
            self.end_aborted().await;
            return;
        }

        self.job.lock().await.end(false);
        self.manager_log
            .lock()
            .unwrap()
            .log(LogLevel::Info, format!("Completed Job {}.", self.job_id));
        self.progress().await;

        if let Some(hook) = &self.request.on_final {
            hook(self.job.clone(), self.cancel.clone()).await;
        }
        if self.cancel.is_cancelled() {
            self.end_aborted().await;
            return;
        }

        self.running.lock().unwrap().remove(&self.job_id);
        self.verbose("Done.");
    }

    /// Page through `ListIdentifiers`, filling the job with placeholder
    /// records. Returns false when the job was aborted: on a transport
    /// failure, or when a page comes back empty alongside a resumption
    /// token (the server rejected the token).
    async fn enumerate_identifiers(&self) -> bool {
        let mut request = ListIdentifiersRequest {
            metadata_prefix: Some(self.request.metadata_prefix.clone()),
            from: self.request.from.clone(),
            until: self.request.until.clone(),
            set_spec: self.request.set_spec.clone(),
            resumption_token: None,
        };

        loop {
            let (identifiers, token) = match self.repository.list_identifiers(&request).await {
                Ok(page) => page,
                Err(error) => {
                    self.job.lock().await.end(true);
                    self.verbose(&format!(
                        "A problem occurred while trying to execute ListIdentifiers: '{error}'"
                    ));
                    self.verbose("Aborted job.");
                    return false;
                }
            };

            if token.is_some() && identifiers.is_empty() {
                let diagnostics = self.repository.log_to_flat_string();
                self.job.lock().await.end(true);
                self.verbose(&format!(
                    "A problem occurred while trying to execute ListIdentifiers: '{diagnostics}'"
                ));
                self.verbose("Aborted job.");
                return false;
            }

            {
                let mut job = self.job.lock().await;
                for identifier in &identifiers {
                    job.add_record(Record::new(identifier.clone()));
                }
            }
            self.progress().await;

            let Some(token) = token else {
                break;
            };
            self.verbose(&format!(
                "Got {} identifiers, continuing with token {token}.",
                identifiers.len()
            ));
            request.resumption_token = Some(token);

            if self.cancel.is_cancelled() {
                self.end_aborted().await;
                return false;
            }
        }

        let diagnostics = self.repository.log_to_flat_string();
        if !diagnostics.is_empty() {
            self.verbose(&format!("Repository reported a problem: '{diagnostics}'"));
        }
        true
    }

    /// Fetch the full record for every placeholder. A failing `GetRecord`
    /// leaves that one record incomplete and the job continues.
    async fn fetch_records(&self) -> bool {
        let identifiers: Vec<String> = {
            let job = self.job.lock().await;
            job.records()
                .iter()
                .map(|record| record.identifier().to_string())
                .collect()
        };

        {
            let mut job = self.job.lock().await;
            job.log_mut().log(
                LogLevel::Info,
                format!("Job is associated with {} identifier(s).", identifiers.len()),
            );
        }
        self.verbose(&format!(
            "Total number of identifiers: {}",
            identifiers.len()
        ));
        self.verbose("Collecting metadata..");

        for identifier in identifiers {
            match self
                .repository
                .get_record(&self.request.metadata_prefix, &identifier)
                .await
            {
                Ok(Some(full_record)) => {
                    let mut job = self.job.lock().await;
                    let keep = {
                        let Some(record) = job.record_mut(&identifier) else {
                            continue;
                        };
                        record.status = full_record.status;
                        record.metadata_raw = full_record.metadata_raw;
                        record.metadata_prefix = full_record.metadata_prefix;
                        record.complete = true;
                        match &self.request.filter {
                            Some(filter) => filter(record),
                            None => true,
                        }
                    };
                    if keep {
                        job.log_mut().log(
                            LogLevel::Info,
                            format!("Record {identifier} marked complete."),
                        );
                        drop(job);
                        self.verbose(&format!("Collected metadata for record {identifier}."));
                    } else {
                        job.omit_record(&identifier, Some("Filter"));
                        drop(job);
                        self.verbose(&format!("Omit record {identifier} due to filter."));
                    }
                }
                Ok(None) => {
                    let diagnostics = self.repository.log_to_flat_string();
                    let msg =
                        format!("GetRecord for {identifier} returned error. {diagnostics}");
                    let mut job = self.job.lock().await;
                    if let Some(record) = job.record_mut(&identifier) {
                        record.complete = false;
                    }
                    job.log_mut().log(LogLevel::Error, msg.clone());
                    drop(job);
                    self.verbose(&msg);
                }
                Err(error) => {
                    let msg = format!(
                        "A problem occurred while trying to execute GetRecord for \
                         {identifier}: '{error}'"
                    );
                    let mut job = self.job.lock().await;
                    if let Some(record) = job.record_mut(&identifier) {
                        record.complete = false;
                    }
                    job.log_mut().log(LogLevel::Error, msg.clone());
                    drop(job);
                    self.verbose(&msg);
                }
            }

            self.progress().await;
            if self.cancel.is_cancelled() {
                self.end_aborted().await;
                return false;
            }
        }

        self.job
            .lock()
            .await
            .log_mut()
            .log(LogLevel::Info, "Harvest of metadata complete.");
        true
    }
}

/// Post-harvest extraction: derive transfer urls for every record, then
/// download the payload files into per-record directories below
/// `base_path/<job id>`.
async fn run_extraction(
    collector: Arc<PayloadCollector>,
    base_path: PathBuf,
    job: SharedJob,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
    verbose: Option<VerboseSink>,
) {
    let (job_id, short_id, identifiers) = {
        let job = job.lock().await;
        (
            job.identifier().to_string(),
            job.abbreviated_identifier().to_string(),
            job.records()
                .iter()
                .map(|record| record.identifier().to_string())
                .collect::<Vec<String>>(),
        )
    };
    let say = |line: &str| {
        if let Some(sink) = &verbose {
            sink(&format!("[{short_id}] {line}"));
        }
    };

    say("Extracting payload..");
    let mut found_anything = false;
    for identifier in &identifiers {
        let mut job_guard = job.lock().await;
        let Some(record) = job_guard.record_mut(identifier) else {
            continue;
        };
        let outcome = collector.extract_urls(record, true);
        let count = record.files.len();
        match outcome {
            Ok(()) => {
                if count > 0 {
                    found_anything = true;
                }
                job_guard.log_mut().log(
                    LogLevel::Info,
                    format!("Registered {count} file(s) for record {identifier}."),
                );
                drop(job_guard);
                say(&format!(
                    "Record {identifier} has {count} associated file(s)."
                ));
            }
            Err(error) => {
                job_guard.log_mut().log(
                    LogLevel::Error,
                    format!("Failed to collect transfer urls for record {identifier}: {error}"),
                );
                drop(job_guard);
            }
        }

        report_progress(&job, &progress).await;
        if cancel.is_cancelled() {
            job.lock().await.end(true);
            say("Aborted job.");
            return;
        }
    }
    job.lock()
        .await
        .log_mut()
        .log(LogLevel::Info, "Collected all transfer-urls.");
    report_progress(&job, &progress).await;

    if found_anything {
        let job_dir = base_path.join(&job_id);
        if let Err(error) = tokio::fs::create_dir_all(&job_dir).await {
            job.lock().await.log_mut().log(
                LogLevel::Error,
                format!(
                    "Failed to create job directory '{}': {error}",
                    job_dir.display()
                ),
            );
            return;
        }

        for identifier in &identifiers {
            let record_dir;
            let file_urls: Vec<String>;
            {
                let mut job_guard = job.lock().await;
                let Some(record) = job_guard.record_mut(identifier) else {
                    continue;
                };
                if record.files.is_empty() {
                    continue;
                }
                // probe suffixes until the directory name is unused
                let mut seed: u32 = 0;
                let dir = loop {
                    let suffix = Job::generate_identifier(&seed.to_string());
                    let candidate =
                        job_dir.join(format!("{}-{}", record.identifier_hash(), &suffix[..9]));
                    if !candidate.is_dir() {
                        break candidate;
                    }
                    seed += 1;
                };
                record.path = Some(dir.clone());
                record_dir = dir;
                file_urls = record.files.iter().map(|file| file.url.clone()).collect();
            }

            if let Err(error) = tokio::fs::create_dir(&record_dir).await {
                job.lock().await.log_mut().log(
                    LogLevel::Error,
                    format!(
                        "Failed to create record directory '{}': {error}",
                        record_dir.display()
                    ),
                );
                continue;
            }

            for url in &file_urls {
                say(&format!("Downloading file {url}"));
                match collector.download_file(&record_dir, url, None).await {
                    Ok(path) => {
                        let complete = path.is_file();
                        let mut job_guard = job.lock().await;
                        if let Some(record) = job_guard.record_mut(identifier)
                            && let Some(file) = record.file_mut(url)
                        {
                            file.path = Some(path);
                            file.complete = complete;
                        }
                        let msg = if complete {
                            format!("Downloaded file {url} associated with record {identifier}.")
                        } else {
                            format!(
                                "A problem occurred while getting file {url} associated with \
                                 record {identifier}."
                            )
                        };
                        job_guard.log_mut().log(LogLevel::Info, msg);
                    }
                    Err(error) => {
                        let mut job_guard = job.lock().await;
                        if let Some(record) = job_guard.record_mut(identifier)
                            && let Some(file) = record.file_mut(url)
                        {
                            file.complete = false;
                        }
                        job_guard
                            .log_mut()
                            .log(LogLevel::Info, format!("Download failed: {error}."));
                        drop(job_guard);
                        say(&format!(
                            "Failed to download {url} associated with record {identifier}: \
                             {error}"
                        ));
                    }
                }
            }

            report_progress(&job, &progress).await;
            if cancel.is_cancelled() {
                job.lock().await.end(true);
                say("Aborted job.");
                return;
            }
        }
    }

    job.lock()
        .await
        .log_mut()
        .log(LogLevel::Info, "Extraction complete.");
    say("Extraction complete.");
    report_progress(&job, &progress).await;
}
