//! Manifests for a server's monitor pod and its supporting objects.

use base64::Engine;
use blockhost_model::{DEFAULT_PORT, MinecraftServer};
use serde_json::{Value, json};
use uuid::Uuid;

pub const MONITOR_PORT: u16 = 8080;
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "blockhost";
pub const SERVER_LABEL: &str = "blockhost.dev/server";
pub const DATA_MOUNT: &str = "/data";
pub const TOKEN_KEY: &str = "token";

/// Selector matching every object created for any server.
pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY}")
}

/// Shared name of all four objects belonging to a server.
pub fn resource_name(server_uuid: Uuid) -> String {
    format!("mc-{server_uuid}")
}

/// In-cluster address of a server's monitor.
pub fn monitor_base_url(server_uuid: Uuid, namespace: &str) -> String {
    format!(
        "http://{}.{namespace}.svc:{MONITOR_PORT}",
        resource_name(server_uuid)
    )
}

fn labels(server_uuid: Uuid) -> Value {
    json!({
        MANAGED_BY_LABEL: MANAGED_BY,
        SERVER_LABEL: server_uuid.to_string(),
    })
}

fn metadata(server_uuid: Uuid, namespace: &str) -> Value {
    json!({
        "name": resource_name(server_uuid),
        "namespace": namespace,
        "labels": labels(server_uuid),
    })
}

pub fn secret(server_uuid: Uuid, namespace: &str, monitor_token: &str) -> Value {
    let b64 = base64::engine::general_purpose::STANDARD;
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": metadata(server_uuid, namespace),
        "type": "Opaque",
        "data": { TOKEN_KEY: b64.encode(monitor_token.as_bytes()) },
    })
}

pub fn persistent_volume_claim(server_uuid: Uuid, namespace: &str, storage: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": metadata(server_uuid, namespace),
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": storage } },
        },
    })
}

pub fn deployment(server: &MinecraftServer, namespace: &str, monitor_image: &str) -> Value {
    let name = resource_name(server.uuid);
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": metadata(server.uuid, namespace),
        "spec": {
            "replicas": 1,
            "strategy": { "type": "Recreate" },
            "selector": { "matchLabels": { SERVER_LABEL: server.uuid.to_string() } },
            "template": {
                "metadata": { "labels": labels(server.uuid) },
                "spec": {
                    "containers": [{
                        "name": "monitor",
                        "image": monitor_image,
                        "env": [
                            {
                                "name": "BLOCKHOST_MONITOR_TOKEN",
                                "valueFrom": { "secretKeyRef": { "name": name, "key": TOKEN_KEY } },
                            },
                            { "name": "BLOCKHOST_MONITOR_DATA", "value": DATA_MOUNT },
                            { "name": "BLOCKHOST_SERVER_VERSION", "value": server.version.render() },
                            {
                                "name": "BLOCKHOST_SERVER_VERSION_TYPE",
                                "value": server.version.version_type().as_str(),
                            },
                        ],
                        "ports": [
                            { "name": "monitor", "containerPort": MONITOR_PORT },
                            { "name": "minecraft", "containerPort": DEFAULT_PORT },
                        ],
                        "readinessProbe": {
                            "httpGet": { "path": "/status", "port": MONITOR_PORT },
                            "periodSeconds": 5,
                        },
                        "volumeMounts": [{ "name": "data", "mountPath": DATA_MOUNT }],
                    }],
                    "volumes": [{
                        "name": "data",
                        "persistentVolumeClaim": { "claimName": name },
                    }],
                },
            },
        },
    })
}

pub fn service(server_uuid: Uuid, namespace: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata(server_uuid, namespace),
        "spec": {
            "selector": { SERVER_LABEL: server_uuid.to_string() },
            "ports": [
                { "name": "monitor", "port": MONITOR_PORT, "targetPort": MONITOR_PORT },
                { "name": "minecraft", "port": DEFAULT_PORT, "targetPort": DEFAULT_PORT },
            ],
        },
    })
}
