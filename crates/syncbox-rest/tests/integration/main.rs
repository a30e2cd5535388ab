//! Integration tests for syncbox-rest
//!
//! Uses wiremock to simulate the sync server and verifies the HttpClient
//! transport and the RestRemoteStore endpoint mapping end to end.

mod common;

mod test_client;
mod test_store;
