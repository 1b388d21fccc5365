use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::{Method, StatusCode};
use serde_json::Value;

use super::watch::WatchEvent;
use crate::config::env_string;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Server-side limit on one watch request; the reflector simply resyncs afterwards.
const WATCH_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Secret,
    PersistentVolumeClaim,
    Deployment,
    Service,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Secret => "Secret",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
        }
    }

    fn collection_path(&self, namespace: &str) -> String {
        match self {
            ResourceKind::Secret => format!("/api/v1/namespaces/{namespace}/secrets"),
            ResourceKind::PersistentVolumeClaim => {
                format!("/api/v1/namespaces/{namespace}/persistentvolumeclaims")
            }
            ResourceKind::Service => format!("/api/v1/namespaces/{namespace}/services"),
            ResourceKind::Deployment => format!("/apis/apps/v1/namespaces/{namespace}/deployments"),
        }
    }
}

/// API server location and credentials. Defaults to the pod's service account.
#[derive(Debug, Clone)]
pub struct KubeConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub namespace: String,
    pub ca_pem: Option<Vec<u8>>,
}

impl KubeConfig {
    pub fn from_env() -> Self {
        let sa = Path::new(SERVICE_ACCOUNT_DIR);
        let read_trimmed = |file: &str| {
            std::fs::read_to_string(sa.join(file))
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let api_url = env_string("BLOCKHOST_KUBE_API")
            .or_else(|| {
                let host = env_string("KUBERNETES_SERVICE_HOST")?;
                let port = env_string("KUBERNETES_SERVICE_PORT").unwrap_or_else(|| "443".to_string());
                Some(format!("https://{host}:{port}"))
            })
            .unwrap_or_else(|| "https://kubernetes.default.svc".to_string());

        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            token: env_string("BLOCKHOST_KUBE_TOKEN").or_else(|| read_trimmed("token")),
            namespace: env_string("BLOCKHOST_KUBE_NAMESPACE")
                .or_else(|| read_trimmed("namespace"))
                .unwrap_or_else(|| "default".to_string()),
            ca_pem: std::fs::read(sa.join("ca.crt")).ok(),
        }
    }
}

/// A `List` response: the items plus the collection's resource version.
#[derive(Debug, Clone)]
pub struct ObjectList {
    pub items: Vec<Value>,
    pub resource_version: String,
}

#[derive(Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
    namespace: String,
}

impl KubeClient {
    pub fn new(config: KubeConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent("blockhost");
        if let Some(pem) = &config.ca_pem {
            builder = builder
                .add_root_certificate(reqwest::Certificate::from_pem(pem).context("parse cluster CA")?);
        }
        Ok(Self {
            http: builder.build().context("build kubernetes http client")?,
            api_url: config.api_url,
            token: config.token,
            namespace: config.namespace,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn url(&self, kind: ResourceKind, name: Option<&str>) -> String {
        let collection = format!("{}{}", self.api_url, kind.collection_path(&self.namespace));
        match name {
            Some(name) => format!("{collection}/{name}"),
            None => collection,
        }
    }

    fn request(&self, method: Method, url: String) -> reqwest::RequestBuilder {
        let req = self.http.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    pub async fn create(&self, kind: ResourceKind, manifest: &Value) -> anyhow::Result<()> {
        let resp = self
            .request(Method::POST, self.url(kind, None))
            .timeout(REQUEST_TIMEOUT)
            .json(manifest)
            .send()
            .await
            .with_context(|| format!("create {}", kind.as_str()))?;
        check(resp)
            .await
            .with_context(|| format!("create {}", kind.as_str()))?;
        Ok(())
    }

    /// `false` when the object did not exist.
    pub async fn delete(&self, kind: ResourceKind, name: &str) -> anyhow::Result<bool> {
        let resp = self
            .request(Method::DELETE, self.url(kind, Some(name)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("delete {} {name}", kind.as_str()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(resp)
            .await
            .with_context(|| format!("delete {} {name}", kind.as_str()))?;
        Ok(true)
    }

    pub async fn get(&self, kind: ResourceKind, name: &str) -> anyhow::Result<Option<Value>> {
        let resp = self
            .request(Method::GET, self.url(kind, Some(name)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("get {} {name}", kind.as_str()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = check(resp).await?.json::<Value>().await?;
        Ok(Some(value))
    }

    pub async fn list(&self, kind: ResourceKind, label_selector: &str) -> anyhow::Result<ObjectList> {
        let resp = self
            .request(Method::GET, self.url(kind, None))
            .timeout(REQUEST_TIMEOUT)
            .query(&[("labelSelector", label_selector)])
            .send()
            .await
            .with_context(|| format!("list {}", kind.as_str()))?;
        let body = check(resp).await?.json::<Value>().await?;
        Ok(parse_list(body))
    }

    /// Opens a watch starting after `resource_version`.
    pub async fn watch(
        &self,
        kind: ResourceKind,
        label_selector: &str,
        resource_version: &str,
    ) -> anyhow::Result<WatchStream> {
        let timeout = WATCH_TIMEOUT_SECS.to_string();
        let resp = self
            .request(Method::GET, self.url(kind, None))
            .query(&[
                ("watch", "true"),
                ("labelSelector", label_selector),
                ("resourceVersion", resource_version),
                ("timeoutSeconds", timeout.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("watch {}", kind.as_str()))?;
        let resp = check(resp).await?;
        Ok(WatchStream {
            body: resp.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            buf: Vec::new(),
        })
    }
}

async fn check(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or(body);
    anyhow::bail!("kubernetes api returned {status}: {message}")
}

fn parse_list(body: Value) -> ObjectList {
    let resource_version = body["metadata"]["resourceVersion"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let items = match body.get("items") {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    ObjectList {
        items,
        resource_version,
    }
}

/// Newline-delimited JSON watch events from an open watch request.
pub struct WatchStream {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: Vec<u8>,
}

impl WatchStream {
    /// Next event; `None` when the server closed the watch.
    pub async fn next_event(&mut self) -> Option<anyhow::Result<WatchEvent>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some(WatchEvent::parse(&line));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Some(Err(anyhow::Error::new(e).context("read watch stream"))),
                None => {
                    if self.buf.iter().all(u8::is_ascii_whitespace) {
                        return None;
                    }
                    let line = std::mem::take(&mut self.buf);
                    return Some(WatchEvent::parse(&line));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use serde_json::json;

    use super::*;

    fn client() -> KubeClient {
        KubeClient::new(KubeConfig {
            api_url: "https://k8s.example:6443".to_string(),
            token: Some("t".to_string()),
            namespace: "games".to_string(),
            ca_pem: None,
        })
        .unwrap()
    }

    #[test]
    fn urls_per_kind() {
        let c = client();
        assert_eq!(
            c.url(ResourceKind::Deployment, Some("mc-1")),
            "https://k8s.example:6443/apis/apps/v1/namespaces/games/deployments/mc-1"
        );
        assert_eq!(
            c.url(ResourceKind::PersistentVolumeClaim, None),
            "https://k8s.example:6443/api/v1/namespaces/games/persistentvolumeclaims"
        );
    }

    #[test]
    fn list_body_parsing() {
        let list = parse_list(json!({
            "kind": "DeploymentList",
            "metadata": { "resourceVersion": "42" },
            "items": [{ "metadata": { "name": "mc-1", "namespace": "games" } }]
        }));
        assert_eq!(list.resource_version, "42");
        assert_eq!(list.items.len(), 1);
    }

    #[tokio::test]
    async fn watch_lines_split_across_chunks() {
        let chunks: Vec<reqwest::Result<Vec<u8>>> = vec![
            Ok(br#"{"type":"ADDED","object":{"metadata":{"name":"a","namespace":"g"}}}"#.to_vec()),
            Ok(b"\n{\"type\":\"DELE".to_vec()),
            Ok(br#"TED","object":{"metadata":{"name":"a","namespace":"g"}}}"#.to_vec()),
        ];
        let mut w = WatchStream {
            body: stream::iter(chunks).boxed(),
            buf: Vec::new(),
        };
        assert!(matches!(
            w.next_event().await,
            Some(Ok(WatchEvent::Added(_)))
        ));
        assert!(matches!(
            w.next_event().await,
            Some(Ok(WatchEvent::Deleted(_)))
        ));
        assert!(w.next_event().await.is_none());
    }
}
