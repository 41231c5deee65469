use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::PersistenceError;

/// One JSON document on disk, read whole and replaced whole.
pub(crate) struct JsonDocument<D> {
    path: PathBuf,
    _phantom: PhantomData<D>,
}

impl<D: Serialize + DeserializeOwned> JsonDocument<D> {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _phantom: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load the document. Returns None if the file does not exist.
    pub fn load(&self) -> Result<Option<D>, PersistenceError> {
        if !self.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(None);
        }
        let doc = serde_json::from_str(&contents)?;
        Ok(Some(doc))
    }

    /// Replace the document through a temp file in the same directory, so a
    /// crash mid-write leaves the previous version intact.
    pub fn save(&self, doc: &D) -> Result<(), PersistenceError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, doc)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
