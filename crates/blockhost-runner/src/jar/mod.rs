//! Reference-counted cache of server jars.
//!
//! The cache directory is the source of truth for which jars exist; the
//! reference table is the source of truth for which are still needed. A jar is
//! deleted only when its last reference is freed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use blockhost_model::ServerVersion;

use crate::config::format_error_chain;
use crate::repository::JarReferenceRepository;

mod api;

pub use api::{
    BetaCraftProvider, JarApiChain, JarFetcher, JarProvider, LauncherManifestProvider,
    MirrorProvider,
};

/// A cached jar file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jar {
    pub version: ServerVersion,
    pub path: PathBuf,
}

pub struct JarResourceManager {
    cache_dir: PathBuf,
    fetcher: Arc<dyn JarFetcher>,
    references: Arc<dyn JarReferenceRepository>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JarResourceManager {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        fetcher: Arc<dyn JarFetcher>,
        references: Arc<dyn JarReferenceRepository>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            fetcher,
            references,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// `<cache_dir>/<versionString>---<versionType>.jar`
    pub fn jar_path(&self, version: &ServerVersion) -> PathBuf {
        self.cache_dir.join(format!("{}.jar", version.cache_key()))
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Ensures the jar is cached and `accessor` references it. Idempotent per accessor.
    pub async fn prepare_jar(&self, version: &ServerVersion, accessor: &str) -> bool {
        match self.try_prepare(version, accessor).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    version = %version,
                    accessor,
                    error = %format_error_chain(&e),
                    "prepare jar failed"
                );
                false
            }
        }
    }

    async fn try_prepare(&self, version: &ServerVersion, accessor: &str) -> anyhow::Result<()> {
        let key = version.cache_key();
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let path = self.jar_path(version);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            self.download(version, &path).await?;
        }
        self.references.add(&key, accessor).await?;
        Ok(())
    }

    async fn download(&self, version: &ServerVersion, path: &Path) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .with_context(|| format!("create jar cache {}", self.cache_dir.display()))?;
        let bytes = self.fetcher.fetch(version).await?;

        let tmp = path.with_extension("jar.tmp");
        let written = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("write jar {}", path.display()));
        }
        tracing::info!(version = %version, path = %path.display(), "jar cached");
        Ok(())
    }

    /// [`prepare_jar`](Self::prepare_jar), then a handle to the cached file.
    pub async fn access_jar(&self, version: &ServerVersion, accessor: &str) -> Option<Jar> {
        if !self.prepare_jar(version, accessor).await {
            return None;
        }
        Some(Jar {
            version: version.clone(),
            path: self.jar_path(version),
        })
    }

    /// Drops `accessor`'s reference, deleting the jar once nobody references it.
    ///
    /// Returns `false` if the reference could not be removed, including when
    /// `accessor` never held one (a bookkeeping bug, logged as an error).
    pub async fn free_jar(&self, version: &ServerVersion, accessor: &str) -> bool {
        let key = version.cache_key();
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        match self.references.remove_and_count(&key, accessor).await {
            Ok(Some(0)) => {
                self.delete_cached(version).await;
                true
            }
            Ok(Some(_)) => true,
            Ok(None) => {
                tracing::error!(
                    version = %version,
                    accessor,
                    "freeing a jar reference that was never taken"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    version = %version,
                    accessor,
                    error = %format_error_chain(&e),
                    "free jar failed"
                );
                false
            }
        }
    }

    async fn delete_cached(&self, version: &ServerVersion) {
        let path = self.jar_path(version);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::info!(version = %version, "unreferenced jar deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                version = %version,
                path = %path.display(),
                error = %e,
                "delete jar failed"
            ),
        }
    }

    /// Versions with a jar in the cache directory.
    pub async fn cached_versions(&self) -> anyhow::Result<Vec<ServerVersion>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("list jar cache {}", self.cache_dir.display()));
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".jar")) else {
                continue;
            };
            match ServerVersion::from_cache_key(stem) {
                Ok(version) => out.push(version),
                Err(e) => tracing::debug!(file = stem, error = %e, "skipping foreign file in jar cache"),
            }
        }
        Ok(out)
    }

    /// Deletes cached jars no accessor references. Returns how many were removed.
    pub async fn prune_unreferenced(&self) -> anyhow::Result<usize> {
        let mut pruned = 0;
        for version in self.cached_versions().await? {
            let key = version.cache_key();
            let lock = self.lock_for(&key);
            let _guard = lock.lock().await;
            if self.references.count(&key).await? == 0 {
                self.delete_cached(&version).await;
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Serves a fixed body for every version, or fails every request.
    pub struct StaticFetcher {
        pub body: Option<Vec<u8>>,
        pub calls: AtomicUsize,
    }

    impl StaticFetcher {
        pub fn ok(body: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                body: Some(body.to_vec()),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                body: None,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JarFetcher for StaticFetcher {
        async fn fetch(&self, version: &ServerVersion) -> anyhow::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.body
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no upstream has {version}"))
        }
    }
}
