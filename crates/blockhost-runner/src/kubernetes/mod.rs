//! Just enough of the Kubernetes API to deploy one monitor pod per server.

mod client;
pub mod resources;
mod watch;

pub use client::{KubeClient, KubeConfig, ObjectList, ResourceKind, WatchStream};
pub use watch::{
    Applied, ObjectKey, Reflector, WatchError, WatchEvent, apply_event, deployment_available,
    object_key,
};
