//! Control plane: server catalogue, runner registry and the HTTP surface over them.

pub mod config;
pub mod error;
pub mod registry;
pub mod routes;
pub mod servers;
pub mod service;
