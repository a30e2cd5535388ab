//! syncbox REST - HTTP transport for the sync core
//!
//! Provides:
//! - [`HttpClient`]: `reqwest` implementation of `IRestClient`, with
//!   streamed uploads and downloads, cancellation and error classification
//! - [`RestRemoteStore`]: the default `IRemoteStore` adapter mapping engine
//!   operations onto REST endpoints
//!
//! ## Modules
//!
//! - [`client`] - One authenticated HTTP exchange per call
//! - [`store`] - Endpoint layout and JSON decoding

pub mod client;
pub mod store;

pub use client::HttpClient;
pub use store::RestRemoteStore;

/// `User-Agent` sent when the configuration does not override it
pub const DEFAULT_USER_AGENT: &str = concat!("syncbox/", env!("CARGO_PKG_VERSION"));
