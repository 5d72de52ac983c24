//! Output resource management.
//!
//! The serializer never touches the filesystem directly; it drives an
//! [`OutputManager`], which hands out writable text resources keyed by a
//! label and a name, closes them, rewrites finished artifacts in place, and
//! reports what was produced. Two backends are provided:
//!
//! - [`MultiFileManager`]: one file per resource under an output directory.
//!   The finalization rewrite goes through a temporary file in the same
//!   directory and an atomic rename, so a reader that opens the file after
//!   the replace completes always sees a consistent document.
//! - [`MemoryBufferManager`]: in-memory string buffers, for tests and for
//!   directing output at something other than a disk.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Errors raised by output managers.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The same resource name was opened twice under one label.
    #[error("resource '{name}' is already open under label '{label}'")]
    AlreadyOpen {
        /// Label of the duplicate resource.
        label: String,
        /// Name of the duplicate resource.
        name: String,
    },

    /// A write or rewrite was attempted with an invalid handle.
    #[error("unknown artifact handle")]
    UnknownHandle,

    /// A write was attempted after the manager was closed.
    #[error("output manager is closed")]
    Closed,

    /// The rewritten artifact could not replace the original atomically.
    #[error("failed to persist rewritten artifact: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Opaque handle to one open resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactHandle(usize);

/// Contract the serializer requires of an output backend.
pub trait OutputManager {
    /// What the backend reports as a produced artifact (a path, a buffer).
    type Artifact: Clone;

    /// Open a writable text resource named `name` under `label`.
    fn open(&mut self, label: &str, name: &str) -> Result<ArtifactHandle, ManagerError>;

    /// Append text to an open resource.
    fn write_text(&mut self, handle: ArtifactHandle, text: &str) -> Result<(), ManagerError>;

    /// Flush and close every open resource. No further writes are accepted.
    fn close(&mut self) -> Result<(), ManagerError>;

    /// Replace every artifact's contents: `rewrite` is called once per
    /// artifact with its current contents and a sink for the replacement.
    /// The replacement is atomic per artifact for readers that open it only
    /// after this call returns.
    fn rewrite_artifacts(
        &mut self,
        rewrite: &mut dyn FnMut(&str, &mut dyn Write) -> std::io::Result<()>,
    ) -> Result<(), ManagerError>;

    /// Mapping from label to the artifacts produced under it.
    fn artifacts(&self) -> BTreeMap<String, Vec<Self::Artifact>>;
}

struct FileEntry {
    label: String,
    path: PathBuf,
    file: Option<File>,
}

/// File-backed manager: one file per resource under a directory.
pub struct MultiFileManager {
    directory: PathBuf,
    entries: Vec<FileEntry>,
    closed: bool,
}

impl MultiFileManager {
    /// Create a manager writing under `directory` (created on first open).
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            entries: Vec::new(),
            closed: false,
        }
    }

    fn entry_mut(&mut self, handle: ArtifactHandle) -> Result<&mut FileEntry, ManagerError> {
        self.entries.get_mut(handle.0).ok_or(ManagerError::UnknownHandle)
    }
}

impl OutputManager for MultiFileManager {
    type Artifact = PathBuf;

    fn open(&mut self, label: &str, name: &str) -> Result<ArtifactHandle, ManagerError> {
        if self.closed {
            return Err(ManagerError::Closed);
        }
        let path = self.directory.join(name);
        if self.entries.iter().any(|e| e.path == path) {
            return Err(ManagerError::AlreadyOpen {
                label: label.to_owned(),
                name: name.to_owned(),
            });
        }
        std::fs::create_dir_all(&self.directory)?;
        // Exclusive creation: refusing to clobber an existing file mirrors
        // text-exclusive open semantics.
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        self.entries.push(FileEntry {
            label: label.to_owned(),
            path,
            file: Some(file),
        });
        Ok(ArtifactHandle(self.entries.len() - 1))
    }

    fn write_text(&mut self, handle: ArtifactHandle, text: &str) -> Result<(), ManagerError> {
        let entry = self.entry_mut(handle)?;
        match entry.file.as_mut() {
            Some(file) => {
                file.write_all(text.as_bytes())?;
                Ok(())
            }
            None => Err(ManagerError::Closed),
        }
    }

    fn close(&mut self) -> Result<(), ManagerError> {
        for entry in &mut self.entries {
            if let Some(mut file) = entry.file.take() {
                file.flush()?;
            }
        }
        self.closed = true;
        Ok(())
    }

    fn rewrite_artifacts(
        &mut self,
        rewrite: &mut dyn FnMut(&str, &mut dyn Write) -> std::io::Result<()>,
    ) -> Result<(), ManagerError> {
        self.close()?;
        for entry in &self.entries {
            let contents = std::fs::read_to_string(&entry.path)?;
            let parent = entry.path.parent().unwrap_or(Path::new("."));
            let mut replacement = NamedTempFile::new_in(parent)?;
            rewrite(&contents, replacement.as_file_mut())?;
            replacement.as_file_mut().flush()?;
            replacement.persist(&entry.path)?;
        }
        Ok(())
    }

    fn artifacts(&self) -> BTreeMap<String, Vec<PathBuf>> {
        let mut out: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for entry in &self.entries {
            out.entry(entry.label.clone()).or_default().push(entry.path.clone());
        }
        out
    }
}

struct BufferEntry {
    label: String,
    name: String,
    contents: String,
}

/// In-memory manager: resources are plain string buffers.
#[derive(Default)]
pub struct MemoryBufferManager {
    entries: Vec<BufferEntry>,
    closed: bool,
}

impl MemoryBufferManager {
    /// Create an empty buffer manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of the named buffer, if it exists.
    pub fn contents(&self, label: &str, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.label == label && e.name == name)
            .map(|e| e.contents.as_str())
    }
}

impl OutputManager for MemoryBufferManager {
    type Artifact = String;

    fn open(&mut self, label: &str, name: &str) -> Result<ArtifactHandle, ManagerError> {
        if self.closed {
            return Err(ManagerError::Closed);
        }
        if self.entries.iter().any(|e| e.label == label && e.name == name) {
            return Err(ManagerError::AlreadyOpen {
                label: label.to_owned(),
                name: name.to_owned(),
            });
        }
        self.entries.push(BufferEntry {
            label: label.to_owned(),
            name: name.to_owned(),
            contents: String::new(),
        });
        Ok(ArtifactHandle(self.entries.len() - 1))
    }

    fn write_text(&mut self, handle: ArtifactHandle, text: &str) -> Result<(), ManagerError> {
        if self.closed {
            return Err(ManagerError::Closed);
        }
        let entry = self.entries.get_mut(handle.0).ok_or(ManagerError::UnknownHandle)?;
        entry.contents.push_str(text);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ManagerError> {
        self.closed = true;
        Ok(())
    }

    fn rewrite_artifacts(
        &mut self,
        rewrite: &mut dyn FnMut(&str, &mut dyn Write) -> std::io::Result<()>,
    ) -> Result<(), ManagerError> {
        self.closed = true;
        for entry in &mut self.entries {
            let mut replacement = Vec::new();
            rewrite(&entry.contents, &mut replacement)?;
            entry.contents = String::from_utf8(replacement)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        }
        Ok(())
    }

    fn artifacts(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in &self.entries {
            out.entry(entry.label.clone()).or_default().push(entry.contents.clone());
        }
        out
    }
}
