//! # sl-backend
//!
//! External collaborators of the sweep scheduler: the experiment-tracking
//! backend and the launch queue. Ships a GraphQL client with retrying,
//! checksummed uploads and an in-process sandbox implementation for tests
//! and dry runs.

pub mod api;
pub mod http;
pub mod memory;
pub mod retry;

pub use api::{
    AgentConfig, ArtifactSpec, LaunchOverrides, LaunchQueue, LaunchRequest, RunRecord,
    SweepBackend, SweepRecord, UpsertRun,
};
pub use http::{md5_base64, BackendSettings, GraphqlClient};
pub use memory::MemoryBackend;
pub use retry::RetryPolicy;
