use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::log::{EventLog, LogLevel};
use crate::record::Record;

pub const JOB_TAG: &str = "OAI JOB";

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Observable state record of a harvest or extraction job.
///
/// Lifecycle:
/// - created: `running=false`, `paused=false`, `complete=false`
/// - `start()`: created -> running, records `start_datetime`
/// - `pause()`/`resume()`: running <-> paused
/// - `end(abort=false)`: terminal, `complete=true`
/// - `end(abort=true)`: terminal, `complete=false`
///
/// `complete_datetime` is written on any terminal transition. Records are
/// added and moved with `add_record`, `add_omitted_record`, and
/// `omit_record`; both lists reject duplicate identifiers.
#[derive(Debug, Clone)]
pub struct Job {
    identifier: String,
    pub description: String,
    records: Vec<Record>,
    omitted_records: Vec<Record>,
    running: bool,
    paused: bool,
    complete: bool,
    creation_datetime: String,
    start_datetime: String,
    complete_datetime: String,
    log: EventLog,
}

impl Job {
    pub fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let mut log = EventLog::new(JOB_TAG);
        log.log(LogLevel::Info, format!("Job {identifier} created."));
        Self {
            identifier,
            description: String::new(),
            records: Vec::new(),
            omitted_records: Vec::new(),
            running: false,
            paused: false,
            complete: false,
            creation_datetime: Utc::now().format(DATETIME_FORMAT).to_string(),
            start_datetime: "not started".to_string(),
            complete_datetime: "not completed".to_string(),
            log,
        }
    }

    /// SHA-256 hex digest of the seed concatenated with the current UTC
    /// time at microsecond precision.
    pub fn generate_identifier(seed: &str) -> String {
        let input = format!("{seed}{}", Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"));
        let digest = Sha256::digest(input.as_bytes());
        hex::encode(digest)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// First 6 characters of the job identifier.
    pub fn abbreviated_identifier(&self) -> &str {
        &self.identifier[..self.identifier.len().min(6)]
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    pub fn record(&self, identifier: &str) -> Option<&Record> {
        self.records
            .iter()
            .find(|record| record.identifier() == identifier)
    }

    pub fn record_mut(&mut self, identifier: &str) -> Option<&mut Record> {
        self.records
            .iter_mut()
            .find(|record| record.identifier() == identifier)
    }

    pub fn omitted_records(&self) -> &[Record] {
        &self.omitted_records
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn complete(&self) -> bool {
        self.complete
    }

    pub fn creation_datetime(&self) -> &str {
        &self.creation_datetime
    }

    pub fn start_datetime(&self) -> &str {
        &self.start_datetime
    }

    pub fn complete_datetime(&self) -> &str {
        &self.complete_datetime
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut EventLog {
        &mut self.log
    }

    /// Transition to running. Invalid unless neither running nor paused.
    pub fn start(&mut self) {
        if !self.running && !self.paused {
            self.start_datetime = Utc::now().format(DATETIME_FORMAT).to_string();
            self.running = true;
            self.complete = false;
            self.log.log(LogLevel::Info, "Start Job.");
        } else {
            self.log.log(
                LogLevel::Error,
                "Attempt at starting Job while already in running state.",
            );
            eprintln!(
                "Job {} has already been started: cannot start. (Use resume() instead.)",
                self.identifier
            );
        }
    }

    pub fn pause(&mut self) {
        if self.running {
            self.paused = true;
            self.running = false;
            self.complete = false;
            self.log.log(LogLevel::Info, "Paused Job.");
        } else {
            self.log.log(
                LogLevel::Error,
                "Attempt at pausing Job which has not been started.",
            );
            eprintln!("Job {} has not been started: cannot pause.", self.identifier);
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.running = true;
            self.complete = false;
            self.log.log(LogLevel::Info, "Resumed Job.");
        } else {
            self.log.log(
                LogLevel::Error,
                "Attempt at resuming Job which has not been paused.",
            );
            eprintln!(
                "Job {} has not been paused: cannot resume. (Use start() instead.)",
                self.identifier
            );
        }
    }

    /// Terminal transition: `abort=false` marks the job complete, `abort=true`
    /// leaves it incomplete. Either way the job stops running and the
    /// completion timestamp is written.
    pub fn end(&mut self, abort: bool) {
        self.complete_datetime = Utc::now().format(DATETIME_FORMAT).to_string();
        self.running = false;
        self.complete = !abort;
        let reason = if abort { "Abort" } else { "Done" };
        self.log
            .log(LogLevel::Info, format!("Job ended. (Reason: {reason})"));
    }

    /// Add a record; rejected when a record with the same identifier is
    /// already listed.
    pub fn add_record(&mut self, record: Record) -> bool {
        if self.record(record.identifier()).is_some() {
            let msg = format!("Tried to add existing record ({}).", record.identifier());
            self.log.log(LogLevel::Error, msg.clone());
            eprintln!("Job {}: {msg}", self.identifier);
            return false;
        }
        self.log
            .log(LogLevel::Info, format!("Add record {}.", record.identifier()));
        self.records.push(record);
        true
    }

    /// Add a record directly to the omitted list.
    pub fn add_omitted_record(&mut self, record: Record, reason: Option<&str>) -> bool {
        if self
            .omitted_records
            .iter()
            .any(|r| r.identifier() == record.identifier())
        {
            let msg = format!("Tried to omit existing record ({}).", record.identifier());
            self.log.log(LogLevel::Error, msg.clone());
            eprintln!("Job {}: {msg}", self.identifier);
            return false;
        }
        self.log
            .log(LogLevel::Info, omission_message(record.identifier(), reason));
        self.omitted_records.push(record);
        true
    }

    /// Move a record from `records` to `omitted_records`. Returns false
    /// when no record with the identifier is tracked.
    pub fn omit_record(&mut self, identifier: &str, reason: Option<&str>) -> bool {
        let Some(position) = self
            .records
            .iter()
            .position(|record| record.identifier() == identifier)
        else {
            let msg = format!("Tried to omit untracked record ({identifier}).");
            self.log.log(LogLevel::Error, msg.clone());
            eprintln!("Job {}: {msg}", self.identifier);
            return false;
        };
        let record = self.records.remove(position);
        self.log
            .log(LogLevel::Info, omission_message(identifier, reason));
        self.omitted_records.push(record);
        true
    }
}

fn omission_message(identifier: &str, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!("Omit record {identifier}. (Reason: {reason})"),
        None => format!("Omit record {identifier}."),
    }
}
