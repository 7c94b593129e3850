//! Atrium Update Distribution Server
//!
//! Publishes signed releases of the Atrium desktop application over HTTP:
//! verified manifests, rate-limited delivery, aggregate download stats and
//! optional CDN offload.

pub mod api;
pub mod cdn;
pub mod config;
pub mod error;
pub mod guard;
pub mod manifest;
pub mod stats;
pub mod store;
pub mod verify;

pub use api::{create_router, AppState};
pub use config::{Config, ServerOptions};
pub use manifest::{Platform, ReleaseManifest};
pub use store::ReleaseStore;
pub use verify::Verifier;
