//! Upstream sources for server jars, tried in priority order.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use blockhost_model::{ServerVersion, VersionType};
use sha1::Digest;

use crate::config::env_string;

const DEFAULT_MANIFEST_URL: &str = "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json";
const DEFAULT_MIRROR_URL: &str = "https://s3.amazonaws.com/Minecraft.Download";
const DEFAULT_BETACRAFT_URL: &str = "https://files.betacraft.uk/server-archive";

const DOWNLOAD_ATTEMPTS: u32 = 3;

/// Source of server jar bytes for a version.
#[async_trait]
pub trait JarFetcher: Send + Sync {
    async fn fetch(&self, version: &ServerVersion) -> anyhow::Result<Vec<u8>>;
}

/// One upstream in a [`JarApiChain`].
#[async_trait]
pub trait JarProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, ty: VersionType) -> bool;

    async fn download(&self, version: &ServerVersion) -> anyhow::Result<Vec<u8>>;
}

/// Tries each provider that supports the version's type; the first success wins.
pub struct JarApiChain {
    providers: Vec<Box<dyn JarProvider>>,
}

impl JarApiChain {
    pub fn new(providers: Vec<Box<dyn JarProvider>>) -> Self {
        Self { providers }
    }

    /// Launcher manifest, then the legacy mirror, then BetaCraft.
    pub fn from_env() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("blockhost")
            .timeout(Duration::from_secs(15 * 60))
            .build()
            .context("build http client")?;
        Ok(Self::new(vec![
            Box::new(LauncherManifestProvider::new(
                client.clone(),
                env_string("BLOCKHOST_MANIFEST_URL")
                    .unwrap_or_else(|| DEFAULT_MANIFEST_URL.to_string()),
            )),
            Box::new(MirrorProvider::new(
                client.clone(),
                env_string("BLOCKHOST_MIRROR_URL").unwrap_or_else(|| DEFAULT_MIRROR_URL.to_string()),
            )),
            Box::new(BetaCraftProvider::new(
                client,
                env_string("BLOCKHOST_BETACRAFT_URL")
                    .unwrap_or_else(|| DEFAULT_BETACRAFT_URL.to_string()),
            )),
        ]))
    }
}

#[async_trait]
impl JarFetcher for JarApiChain {
    async fn fetch(&self, version: &ServerVersion) -> anyhow::Result<Vec<u8>> {
        let ty = version.version_type();
        let mut last_err: Option<anyhow::Error> = None;
        for provider in &self.providers {
            if !provider.supports(ty) {
                continue;
            }
            match provider.download(version).await {
                Ok(bytes) => {
                    tracing::info!(
                        provider = provider.name(),
                        version = %version,
                        bytes = bytes.len(),
                        "server jar downloaded"
                    );
                    return Ok(bytes);
                }
                Err(e) => {
                    tracing::warn!(
                        provider = provider.name(),
                        version = %version,
                        error = %crate::format_error_chain(&e),
                        "jar provider failed; trying next"
                    );
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e.context(format!("no provider could supply {version}"))),
            None => anyhow::bail!("no provider supports {ty} versions"),
        }
    }
}

async fn download_with_retries(client: &reqwest::Client, url: &str) -> anyhow::Result<Vec<u8>> {
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        let res: anyhow::Result<Vec<u8>> = async {
            let resp = client
                .get(url)
                .send()
                .await
                .context("download server jar")?
                .error_for_status()
                .context("download server jar (status)")?;
            let b = resp.bytes().await.context("read server jar body")?;
            Ok(b.to_vec())
        }
        .await;

        match res {
            Ok(b) => return Ok(b),
            Err(e) => {
                last_err = Some(e);
                if attempt < DOWNLOAD_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(
                        200_u64.saturating_mul(2_u64.pow(attempt - 1)),
                    ))
                    .await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("download failed ({url})")))
}

#[derive(Debug, Clone, serde::Deserialize)]
struct VersionManifest {
    versions: Vec<VersionRef>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct VersionRef {
    id: String,
    url: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct VersionJson {
    downloads: Downloads,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Downloads {
    server: Option<ServerDownload>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct ServerDownload {
    sha1: String,
    size: u64,
    url: String,
}

/// Mojang's launcher metadata. Verifies size and SHA-1 of the download.
pub struct LauncherManifestProvider {
    client: reqwest::Client,
    manifest_url: String,
}

impl LauncherManifestProvider {
    pub fn new(client: reqwest::Client, manifest_url: String) -> Self {
        Self {
            client,
            manifest_url,
        }
    }

    async fn resolve(&self, version_id: &str) -> anyhow::Result<ServerDownload> {
        let manifest: VersionManifest = self
            .client
            .get(&self.manifest_url)
            .send()
            .await
            .context("fetch version manifest")?
            .error_for_status()?
            .json()
            .await
            .context("parse version manifest")?;

        let vref = manifest
            .versions
            .into_iter()
            .find(|v| v.id == version_id)
            .ok_or_else(|| anyhow::anyhow!("version {version_id} is not in the launcher manifest"))?;

        let vjson: VersionJson = self
            .client
            .get(&vref.url)
            .send()
            .await
            .context("fetch version json")?
            .error_for_status()?
            .json()
            .await
            .context("parse version json")?;

        vjson
            .downloads
            .server
            .ok_or_else(|| anyhow::anyhow!("version {version_id} has no server download"))
    }
}

#[async_trait]
impl JarProvider for LauncherManifestProvider {
    fn name(&self) -> &'static str {
        "launcher-manifest"
    }

    fn supports(&self, ty: VersionType) -> bool {
        matches!(ty, VersionType::Release | VersionType::Snapshot)
    }

    async fn download(&self, version: &ServerVersion) -> anyhow::Result<Vec<u8>> {
        let server = self.resolve(&version.render()).await?;
        let bytes = download_with_retries(&self.client, &server.url).await?;

        if bytes.len() as u64 != server.size {
            anyhow::bail!(
                "server jar size mismatch: expected {} bytes, got {} bytes (url={})",
                server.size,
                bytes.len(),
                server.url
            );
        }
        let got_hex = hex::encode(sha1::Sha1::digest(bytes.as_slice()));
        if got_hex != server.sha1 {
            anyhow::bail!(
                "server jar sha1 mismatch: expected {}, got {got_hex} (url={})",
                server.sha1,
                server.url
            );
        }
        Ok(bytes)
    }
}

/// The legacy public S3 bucket, which still serves older release and snapshot jars.
pub struct MirrorProvider {
    client: reqwest::Client,
    base_url: String,
}

impl MirrorProvider {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url_for(&self, version: &ServerVersion) -> String {
        let v = version.render();
        format!("{}/versions/{v}/minecraft_server.{v}.jar", self.base_url)
    }
}

#[async_trait]
impl JarProvider for MirrorProvider {
    fn name(&self) -> &'static str {
        "mirror"
    }

    fn supports(&self, ty: VersionType) -> bool {
        matches!(ty, VersionType::Release | VersionType::Snapshot)
    }

    async fn download(&self, version: &ServerVersion) -> anyhow::Result<Vec<u8>> {
        download_with_retries(&self.client, &self.url_for(version)).await
    }
}

/// BetaCraft's archive of pre-release server jars.
pub struct BetaCraftProvider {
    client: reqwest::Client,
    base_url: String,
}

impl BetaCraftProvider {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url_for(&self, version: &ServerVersion) -> String {
        format!(
            "{}/{}/{}.jar",
            self.base_url,
            version.version_type(),
            version.render()
        )
    }
}

#[async_trait]
impl JarProvider for BetaCraftProvider {
    fn name(&self) -> &'static str {
        "betacraft"
    }

    fn supports(&self, ty: VersionType) -> bool {
        matches!(
            ty,
            VersionType::Alpha
                | VersionType::Beta
                | VersionType::Classic
                | VersionType::Indev
                | VersionType::Infdev
        )
    }

    async fn download(&self, version: &ServerVersion) -> anyhow::Result<Vec<u8>> {
        download_with_retries(&self.client, &self.url_for(version)).await
    }
}
