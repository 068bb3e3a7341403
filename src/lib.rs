//! # Forrst Core
//!
//! Request-lifecycle extension runtime for the Forrst RPC server:
//! an extension pipeline around every function call, plus three
//! coordination primitives built on a pluggable key-value store.
//!
//! ## Architecture
//!
//! - **Extension pipeline**: pre-validation, pre-execution, and
//!   post-execution phases dispatched over registered extensions in
//!   priority order, with an unconditional cleanup pass
//! - **Lock manager**: named application locks with TTLs, ownership,
//!   blocking acquisition, extension, and audited force-release
//! - **Cache validator**: strong validators (ETags) and conditional
//!   response caching with not-modified short-circuits
//! - **Cancellation coordinator**: single-use tokens for cooperative
//!   cancellation of in-flight calls
//!
//! All three primitives speak to the store through the
//! [`store::CoordinationStore`] trait; [`store::InMemoryStore`] is the
//! in-process implementation used in tests and single-node deployments.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use forrst_core::config::ForrstConfig;
//! use forrst_core::pipeline::extensions::standard_pipeline;
//! use forrst_core::store::InMemoryStore;
//!
//! # async fn example(request: forrst_core::pipeline::FunctionRequest) {
//! let store = Arc::new(InMemoryStore::new());
//! let pipeline = standard_pipeline(store, ForrstConfig::default());
//!
//! let response = pipeline
//!     .execute(&request, |req, _probe| async move {
//!         Ok(serde_json::json!({"echo": req.arguments}))
//!     })
//!     .await;
//! # let _ = response;
//! # }
//! ```

pub mod cache;
pub mod cancellation;
pub mod config;
pub mod constants;
pub mod error;
pub mod lock;
pub mod logging;
pub mod pipeline;
pub mod store;
pub mod validation;

pub use cache::{CacheEntry, CacheValidator};
pub use cancellation::{CancelOutcome, CancellationCoordinator, TokenStatus};
pub use config::ForrstConfig;
pub use error::{ForrstError, Result};
pub use lock::{LockHandle, LockManager, LockRecord};
pub use pipeline::{
    CancellationProbe, Extension, ExtensionPipeline, FunctionRequest, FunctionResponse, Phase,
    PhaseResult, RequestContext,
};
pub use store::{CoordinationStore, InMemoryStore};
