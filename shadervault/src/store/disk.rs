//! The persisted artifact store.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cache::{Artifact, BuildKey};
use crate::store::format::{self, Header};

/// Errors from store maintenance operations.
///
/// Corruption is not an error surface: a corrupt store is discarded
/// during [`DiskStore::load`] and reported as an empty result.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure while opening, appending, or clearing the store.
    #[error("artifact store I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Reason a persisted store was discarded wholesale.
#[derive(Debug, Error)]
enum Discard {
    #[error("unreadable store file: {0}")]
    Io(#[from] io::Error),
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported format version {found}")]
    FormatVersion { found: u32 },
    #[error("artifact kind version {found}, expected {expected}")]
    KindVersion { found: u32, expected: u32 },
    #[error("truncated or corrupt record")]
    Truncated,
    #[error("record failed to decode")]
    Decode,
}

/// Append-only persistent log of (key, artifact) pairs.
///
/// Appends happen one record at a time from the owning thread, so no
/// file-level locking is required. A record is written once per
/// successfully built entry and never rewritten.
pub struct DiskStore<K, A> {
    path: PathBuf,
    artifact_kind_version: u32,
    writer: Option<BufWriter<File>>,
    records_written: u64,
    _types: PhantomData<fn() -> (K, A)>,
}

impl<K: BuildKey, A: Artifact> DiskStore<K, A> {
    /// Opens a store at `path` for artifacts of the given kind version.
    ///
    /// The parent directory is created; the file itself is only touched
    /// by [`DiskStore::load`] and the first append.
    pub fn open(path: PathBuf, artifact_kind_version: u32) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            artifact_kind_version,
            writer: None,
            records_written: 0,
            _types: PhantomData,
        })
    }

    /// Reads every persisted entry, trusting the whole file or none of it.
    ///
    /// A missing file yields an empty result. Any header mismatch,
    /// truncated record, or undecodable payload discards the entire
    /// store: the file is removed, a warning is logged, and an empty
    /// result is returned. Partial trust is never granted.
    pub fn load(&mut self) -> Vec<(K, A)> {
        match self.try_load() {
            Ok(entries) => {
                if !entries.is_empty() {
                    tracing::info!(
                        entries = entries.len(),
                        path = %self.path.display(),
                        "artifact store loaded"
                    );
                }
                entries
            }
            Err(reason) => {
                tracing::warn!(
                    %reason,
                    path = %self.path.display(),
                    "artifact store discarded"
                );
                self.discard();
                Vec::new()
            }
        }
    }

    fn try_load(&self) -> Result<Vec<(K, A)>, Discard> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Discard::Io(e)),
        };
        let mut reader = BufReader::new(file);

        let header = Header::read_from(&mut reader).map_err(|_| Discard::Truncated)?;
        if header.magic != format::MAGIC {
            return Err(Discard::BadMagic);
        }
        if header.format_version != format::FORMAT_VERSION {
            return Err(Discard::FormatVersion {
                found: header.format_version,
            });
        }
        if header.artifact_kind_version != self.artifact_kind_version {
            return Err(Discard::KindVersion {
                found: header.artifact_kind_version,
                expected: self.artifact_kind_version,
            });
        }

        let mut entries = Vec::new();
        loop {
            match format::read_record(&mut reader) {
                Ok(None) => break,
                Ok(Some((key_bytes, artifact_bytes))) => {
                    let key = K::decode(&key_bytes).ok_or(Discard::Decode)?;
                    let artifact = A::decode(&artifact_bytes).ok_or(Discard::Decode)?;
                    entries.push((key, artifact));
                }
                Err(_) => return Err(Discard::Truncated),
            }
        }
        Ok(entries)
    }

    /// Appends one record and flushes it.
    ///
    /// Writes the header first when the file is fresh. Must only be
    /// called from the owning thread.
    pub fn append(&mut self, key: &K, artifact: &A) -> Result<(), StoreError> {
        let opened = match self.writer.take() {
            Some(writer) => writer,
            None => Self::open_writer(&self.path, self.artifact_kind_version)?,
        };
        let writer = self.writer.insert(opened);

        let mut key_bytes = Vec::new();
        key.encode(&mut key_bytes);
        let mut artifact_bytes = Vec::new();
        artifact.encode(&mut artifact_bytes);

        format::write_record(writer, &key_bytes, &artifact_bytes)?;
        writer.flush()?;
        self.records_written += 1;
        Ok(())
    }

    /// Removes the backing file. Used when the artifact kind changes or
    /// the whole cache is invalidated.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.writer = None;
        self.records_written = 0;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Records appended through this handle.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_writer(path: &Path, artifact_kind_version: u32) -> Result<BufWriter<File>, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if fresh {
            Header::for_kind(artifact_kind_version).write_to(&mut writer)?;
        }
        Ok(writer)
    }

    fn discard(&mut self) {
        self.writer = None;
        if let Err(error) = fs::remove_file(&self.path) {
            if error.kind() != io::ErrorKind::NotFound {
                tracing::error!(%error, path = %self.path.display(), "failed to remove discarded store");
            }
        }
    }
}
