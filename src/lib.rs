//! Embedded Open Policy Agent authorization for layer-7 proxies.
//!
//! The crate manages a registry of policy-engine instances (one per
//! bundle), drives their lifecycle and periodic bundle polling, and turns
//! per-request policy decisions into HTTP actions: forward with header
//! mutations, reject, or serve the decision as the response.
//!
//! The policy engine itself and the hosting proxy are external
//! collaborators; their contracts live in [`engine`] and [`filters`].

pub mod authz;
pub mod body;
pub mod config;
pub mod engine;
pub mod error;
pub mod filters;
pub mod instance;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod routing;
pub mod trace;

pub use config::OpaConfig;
pub use error::{OpaError, OpaResult};
pub use registry::Registry;
