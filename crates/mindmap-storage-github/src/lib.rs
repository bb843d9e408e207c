//! Versioned remote storage over the GitHub contents API.
//!
//! `GitHubClient` speaks the HTTP contract; `GitHubBackend` exposes it through the
//! backend-agnostic `StorageBackend` trait.

mod backend;
mod client;

pub use backend::GitHubBackend;
pub use client::{GitHubClient, GitHubSettings};
