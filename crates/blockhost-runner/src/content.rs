use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Per-server working directories under one root, named by server uuid.
#[derive(Debug, Clone)]
pub struct ContentDirectoryRepository {
    root: PathBuf,
}

impl ContentDirectoryRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, server_uuid: Uuid) -> PathBuf {
        self.root.join(server_uuid.to_string())
    }

    pub async fn get_or_create(&self, server_uuid: Uuid) -> Option<PathBuf> {
        let dir = self.path_for(server_uuid);
        match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => Some(dir),
            Err(e) => {
                tracing::warn!(
                    server = %server_uuid,
                    path = %dir.display(),
                    error = %e,
                    "create content directory failed"
                );
                None
            }
        }
    }

    pub async fn get_existing(&self, server_uuid: Uuid) -> Option<PathBuf> {
        let dir = self.path_for(server_uuid);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Some(dir),
            _ => None,
        }
    }

    /// Removes the directory and everything in it. A missing directory counts as deleted.
    pub async fn delete(&self, server_uuid: Uuid) -> bool {
        let dir = self.path_for(server_uuid);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(
                    server = %server_uuid,
                    path = %dir.display(),
                    error = %e,
                    "delete content directory failed"
                );
                false
            }
        }
    }
}
