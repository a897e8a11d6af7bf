//! GitHub REST API access: conditional list fetches and label writes.

pub mod api_types;
pub mod client;

pub use client::GithubClient;
