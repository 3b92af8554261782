use std::path::PathBuf;

/// A payload file referenced by a record's metadata.
///
/// Files are considered identical when their `identifier`s are equal; the
/// identifier defaults to the transfer url, but callers may alias distinct
/// urls to one payload identity.
#[derive(Debug, Clone)]
pub struct File {
    pub identifier: String,
    pub url: String,
    pub path: Option<PathBuf>,
    pub complete: bool,
}

impl File {
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            identifier: url.clone(),
            url,
            path: None,
            complete: false,
        }
    }

    pub fn with_identifier(identifier: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            url: url.into(),
            path: None,
            complete: false,
        }
    }
}

impl PartialEq for File {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for File {}

/// A single harvested OAI-PMH item: identifier, header status, raw
/// metadata, and the payload files derived from it.
#[derive(Debug, Clone)]
pub struct Record {
    identifier: String,
    identifier_hash: String,
    pub status: String,
    pub metadata_prefix: Option<String>,
    pub metadata_raw: Option<String>,
    pub files: Vec<File>,
    pub path: Option<PathBuf>,
    pub complete: bool,
}

impl Record {
    pub fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let identifier_hash = format!("{:x}", md5::compute(identifier.as_bytes()));
        Self {
            identifier,
            identifier_hash,
            status: String::new(),
            metadata_prefix: None,
            metadata_raw: None,
            files: Vec::new(),
            path: None,
            complete: false,
        }
    }

    /// Construct a record with its file list pre-populated from urls.
    pub fn with_file_urls<I, S>(identifier: impl Into<String>, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut record = Self::new(identifier);
        record.register_files_by_url(urls);
        record
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Lowercase hex MD5 of the identifier, used for directory naming.
    pub fn identifier_hash(&self) -> &str {
        &self.identifier_hash
    }

    /// Append one file template per url (identifier = url).
    pub fn register_files_by_url<I, S>(&mut self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for url in urls {
            self.files.push(File::from_url(url));
        }
    }

    pub fn add_file(&mut self, file: File) {
        self.files.push(file);
    }

    /// Remove every file sharing the given identifier.
    pub fn remove_file(&mut self, identifier: &str) {
        self.files.retain(|file| file.identifier != identifier);
    }

    pub fn file(&self, identifier: &str) -> Option<&File> {
        self.files.iter().find(|file| file.identifier == identifier)
    }

    pub fn file_mut(&mut self, identifier: &str) -> Option<&mut File> {
        self.files
            .iter_mut()
            .find(|file| file.identifier == identifier)
    }
}
