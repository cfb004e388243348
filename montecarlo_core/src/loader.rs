//! Resolving model references to validated models.

use crate::model::{Model, ModelError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Resolves a model reference (file name, catalog key) to a validated model.
pub trait ModelLoader: Send + Sync {
    fn load(&self, reference: &str) -> Result<Model, ModelError>;
}

/// Loads JSON model definitions from a directory.
///
/// Relative references resolve against `base_dir`, absolute paths are used
/// as given.
#[derive(Debug, Clone)]
pub struct FileModelLoader {
    base_dir: PathBuf,
}

impl FileModelLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// File names of the valid `*.json` models in `base_dir`, sorted.
    ///
    /// Invalid definitions are skipped with a warning.
    pub fn discover(&self) -> Result<Vec<String>, ModelError> {
        let entries = fs::read_dir(&self.base_dir).map_err(|source| ModelError::Io {
            path: self.base_dir.display().to_string(),
            source,
        })?;

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match self.load(file_name) {
                Ok(_) => found.push(file_name.to_string()),
                Err(e) => warn!(file = file_name, error = %e, "Skipping invalid model definition"),
            }
        }
        found.sort();
        Ok(found)
    }
}

impl ModelLoader for FileModelLoader {
    fn load(&self, reference: &str) -> Result<Model, ModelError> {
        let path = self.resolve(reference);
        debug!(path = %path.display(), "Reading model definition");

        let json = fs::read_to_string(&path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let model = Model::from_json_str(&json)?;

        info!(
            model = %model.name,
            formula = %model.formula,
            "Model loaded: {}",
            model.description
        );
        Ok(model)
    }
}

/// In-memory models keyed by reference.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: BTreeMap<String, Model>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `model` under `reference`, replacing any previous entry.
    pub fn insert(&mut self, reference: impl Into<String>, model: Model) {
        self.models.insert(reference.into(), model);
    }

    pub fn with(mut self, reference: impl Into<String>, model: Model) -> Self {
        self.insert(reference, model);
        self
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn get(&self, reference: &str) -> Option<&Model> {
        self.models.get(reference)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl ModelLoader for ModelCatalog {
    fn load(&self, reference: &str) -> Result<Model, ModelError> {
        let model = self
            .models
            .get(reference)
            .cloned()
            .ok_or_else(|| ModelError::UnknownReference(reference.to_string()))?;
        model.validate()?;
        Ok(model)
    }
}
