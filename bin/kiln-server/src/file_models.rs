//! Directory-backed model manager.
//!
//! Model artifacts live as flat files under the models directory, named by
//! digest.  An optional `tags.json` maps user-facing tags to digest file
//! names; tags that do not resolve pass through unchanged.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, warn};

use kiln_core::backend::{Model, ModelError, ModelManager};

const TAG_INDEX_FILE: &str = "tags.json";

pub struct DirModelManager {
    models_dir: PathBuf,
    /// tag → digest file name, loaded once at startup.
    index: HashMap<String, String>,
}

impl DirModelManager {
    pub fn open(models_dir: impl Into<PathBuf>) -> Self {
        let models_dir = models_dir.into();
        let index_path = models_dir.join(TAG_INDEX_FILE);
        let index = match std::fs::read_to_string(&index_path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(index) => {
                    info!(tags = index.len(), path = %index_path.display(), "model tag index loaded");
                    index
                }
                Err(err) => {
                    warn!(path = %index_path.display(), error = %err, "model tag index unreadable; tags disabled");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { models_dir, index }
    }
}

#[async_trait]
impl ModelManager for DirModelManager {
    fn resolve_model_id(&self, model_ref: &str) -> String {
        self.index
            .get(model_ref)
            .cloned()
            .unwrap_or_else(|| model_ref.to_owned())
    }

    async fn get_model(&self, model_ref: &str) -> Result<Model, ModelError> {
        let id = self.resolve_model_id(model_ref);
        let path = self.models_dir.join(&id);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Model {
                id,
                size: metadata.len(),
            }),
            Ok(_) => Err(ModelError::NotFound(model_ref.to_owned())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ModelError::NotFound(model_ref.to_owned()))
            }
            Err(err) => Err(ModelError::Other(err.into())),
        }
    }

    async fn disk_usage(&self) -> Result<u64, ModelError> {
        let mut entries = match tokio::fs::read_dir(&self.models_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(ModelError::Other(err.into())),
        };
        let mut total = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| ModelError::Other(err.into()))?
        {
            if let Ok(metadata) = entry.metadata().await {
                if metadata.is_file() {
                    total += metadata.len();
                }
            }
        }
        Ok(total)
    }
}
