//! Scoped access to persisted solver data.
//!
//! Every file is used as `open -> read/write -> close`. [`ScopedFile`] ties the
//! close to scope exit so early returns and errors never leak an open file.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Result, SolverError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileId {
    /// Converged orbitals, used for restarts and the READ guess.
    Checkpoint,
    /// Out-of-core DIIS history.
    Diis,
    /// Density cumulant amplitudes.
    Cumulant,
    /// SO basis intermediates such as the transformed tau.
    SoTensors,
}

impl FileId {
    pub fn file_name(&self) -> &'static str {
        match self {
            FileId::Checkpoint => "checkpoint.json",
            FileId::Diis => "diis.json",
            FileId::Cumulant => "cumulant.json",
            FileId::SoTensors => "so_tensors.json",
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Start from an empty file.
    Create,
    /// Keep existing entries, an absent file is opened empty.
    Existing,
}

/// The persistence collaborator.
pub trait Persistence {
    fn open(&mut self, file: FileId, mode: OpenMode) -> Result<()>;

    /// `Ok(None)` if the label has never been written.
    fn read_entry(&mut self, file: FileId, label: &str) -> Result<Option<Vec<u8>>>;

    fn write_entry(&mut self, file: FileId, label: &str, bytes: &[u8]) -> Result<()>;

    /// Writes the entries of an open file through to the backing storage.
    fn flush(&mut self, file: FileId) -> Result<()> {
        if self.is_open(file) {
            Ok(())
        } else {
            Err(not_open(file))
        }
    }

    /// Closes the file. With `keep == false` its contents are discarded.
    fn close(&mut self, file: FileId, keep: bool) -> Result<()>;

    fn is_open(&self, file: FileId) -> bool;
}

fn not_open(file: FileId) -> SolverError {
    SolverError::Persistence {
        file: file.to_string(),
        reason: "file is not open".into(),
    }
}

type Entries = BTreeMap<String, Vec<u8>>;

/// Keeps every file in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: BTreeMap<FileId, Entries>,
    open: BTreeSet<FileId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels stored in `file`, open or not.
    pub fn labels(&self, file: FileId) -> Vec<String> {
        self.files
            .get(&file)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Persistence for MemoryStore {
    fn open(&mut self, file: FileId, mode: OpenMode) -> Result<()> {
        if mode == OpenMode::Create {
            self.files.insert(file, Entries::new());
        } else {
            self.files.entry(file).or_default();
        }
        self.open.insert(file);
        Ok(())
    }

    fn read_entry(&mut self, file: FileId, label: &str) -> Result<Option<Vec<u8>>> {
        if !self.open.contains(&file) {
            return Err(not_open(file));
        }
        Ok(self.files.get(&file).and_then(|e| e.get(label)).cloned())
    }

    fn write_entry(&mut self, file: FileId, label: &str, bytes: &[u8]) -> Result<()> {
        if !self.open.contains(&file) {
            return Err(not_open(file));
        }
        self.files
            .entry(file)
            .or_default()
            .insert(label.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn close(&mut self, file: FileId, keep: bool) -> Result<()> {
        if !self.open.remove(&file) {
            return Err(not_open(file));
        }
        if !keep {
            self.files.remove(&file);
        }
        Ok(())
    }

    fn is_open(&self, file: FileId) -> bool {
        self.open.contains(&file)
    }
}

/// One JSON document per file inside a directory, written on flush and close.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    open: BTreeMap<FileId, Entries>,
}

impl DirectoryStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            open: BTreeMap::new(),
        })
    }

    fn path(&self, file: FileId) -> PathBuf {
        self.root.join(file.file_name())
    }

    fn write_document(&self, file: FileId, entries: &Entries) -> Result<()> {
        let mut writer = BufWriter::new(File::create(self.path(file))?);
        serde_json::to_writer(&mut writer, entries)?;
        writer.flush()?;
        log::trace!("wrote {} entries to {}", entries.len(), file);
        Ok(())
    }
}

impl Persistence for DirectoryStore {
    fn open(&mut self, file: FileId, mode: OpenMode) -> Result<()> {
        let entries = match (mode, File::open(self.path(file))) {
            (OpenMode::Existing, Ok(handle)) => serde_json::from_reader(BufReader::new(handle))?,
            (OpenMode::Existing, Err(e)) if e.kind() == ErrorKind::NotFound => Entries::new(),
            (OpenMode::Existing, Err(e)) => return Err(e.into()),
            (OpenMode::Create, _) => Entries::new(),
        };
        log::trace!("opened {} with {} entries", file, entries.len());
        self.open.insert(file, entries);
        Ok(())
    }

    fn read_entry(&mut self, file: FileId, label: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.open.get(&file).ok_or_else(|| not_open(file))?;
        Ok(entries.get(label).cloned())
    }

    fn write_entry(&mut self, file: FileId, label: &str, bytes: &[u8]) -> Result<()> {
        let entries = self.open.get_mut(&file).ok_or_else(|| not_open(file))?;
        entries.insert(label.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn flush(&mut self, file: FileId) -> Result<()> {
        let entries = self.open.get(&file).ok_or_else(|| not_open(file))?;
        self.write_document(file, entries)
    }

    fn close(&mut self, file: FileId, keep: bool) -> Result<()> {
        let entries = self.open.remove(&file).ok_or_else(|| not_open(file))?;
        if keep {
            self.write_document(file, &entries)?;
        } else {
            match std::fs::remove_file(self.path(file)) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    fn is_open(&self, file: FileId) -> bool {
        self.open.contains_key(&file)
    }
}

/// An open file that is closed when dropped.
pub struct ScopedFile<'a> {
    store: &'a mut dyn Persistence,
    file: FileId,
    keep: bool,
    closed: bool,
}

impl<'a> ScopedFile<'a> {
    pub fn open(store: &'a mut dyn Persistence, file: FileId, mode: OpenMode) -> Result<Self> {
        store.open(file, mode)?;
        Ok(Self {
            store,
            file,
            keep: true,
            closed: false,
        })
    }

    /// Discard the contents instead of keeping them on close.
    pub fn discard_on_close(mut self) -> Self {
        self.keep = false;
        self
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn read(&mut self, label: &str) -> Result<Option<Vec<u8>>> {
        self.store.read_entry(self.file, label)
    }

    pub fn write(&mut self, label: &str, bytes: &[u8]) -> Result<()> {
        self.store.write_entry(self.file, label, bytes)
    }

    pub fn read_json<T: DeserializeOwned>(&mut self, label: &str) -> Result<Option<T>> {
        match self.read(label)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn write_json<T: Serialize + ?Sized>(&mut self, label: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.write(label, &bytes)
    }

    /// Writes the entries so far through without closing.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush(self.file)
    }

    /// The underlying store, for opening further files while this one stays open.
    pub fn store_mut(&mut self) -> &mut dyn Persistence {
        &mut *self.store
    }

    /// Closes explicitly so the caller sees a failing close.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.store.close(self.file, self.keep)
    }
}

impl Drop for ScopedFile<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.store.close(self.file, self.keep) {
                log::warn!("failed to close {}: {e}", self.file);
            }
        }
    }
}
