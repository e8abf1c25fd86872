//! Pod state file: TOML, replaced atomically on every save.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use pod_core::{PodState, Store, StoreError};

pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Store for FileStore {
    fn save(&self, state: &PodState) -> Result<(), StoreError> {
        let text = toml::to_string(state).map_err(|e| StoreError::Encode(e.to_string()))?;
        let tmp = self.temp_path();
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<PodState>, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = toml::from_str(&text).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(Some(state))
    }
}
