//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the narrow contracts through which the sync core talks to its
//! collaborators. Implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`ILocalIndex`] - Durable last-synchronized state and change log
//! - [`IRemoteStore`] - Remote tree operations used by the engine and scheduler
//! - [`IRestClient`] - Raw authenticated HTTP exchange with the server

pub mod local_index;
pub mod remote_store;
pub mod rest_client;

pub use local_index::{CompletedSync, ILocalIndex};
pub use remote_store::{DownloadRequest, IRemoteStore, ProgressReporter, UploadRequest};
pub use rest_client::{
    partial_path, HttpError, HttpMethod, HttpRequest, IRestClient, RestSettings, TransferSpec,
    PARTIAL_SUFFIX,
};
