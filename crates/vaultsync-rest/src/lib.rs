//! HTTP backend for vaultsync against a PostgREST API with object storage.

mod backend;
mod client;
mod rows;

pub use backend::RestBackend;
pub use client::{RestClient, RestConfig};
