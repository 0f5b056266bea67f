//! Core library for the rust_echem application.
//!
//! Two engines share this crate:
//!
//! - the [`dispatcher`], which normalises and validates unit operations,
//!   routes them to pooled technique [`backends`] and persists the results
//!   through [`storage`];
//! - the [`workflow`] executor, which walks a node/edge graph of robot, arm
//!   and peripheral-board actions, gating each motion on a digital-twin
//!   safety verdict, and runs measurement nodes through the dispatcher.
//!
//! ```
//! use std::sync::Arc;
//! use rust_echem::backends::BackendContext;
//! use rust_echem::core::UnitOperationRequest;
//! use rust_echem::dispatcher::ExperimentDispatcher;
//! use rust_echem::hardware::mock::SimulatedBench;
//! use rust_echem::storage::ObjectStoreUploader;
//!
//! # tokio_test::block_on(async {
//! let context = BackendContext::new(Arc::new(SimulatedBench::new()));
//! let uploader = Arc::new(ObjectStoreUploader::in_memory("docs"));
//! let dispatcher = ExperimentDispatcher::new(context, uploader);
//!
//! let mut parameters = serde_json::Map::new();
//! parameters.insert("duration".into(), "10s".into());
//! let result = dispatcher
//!     .execute_experiment(UnitOperationRequest::new("OCV", parameters))
//!     .await;
//! assert!(result.is_success());
//! # });
//! ```

pub mod backends;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod logging;
pub mod parameters;
pub mod storage;
pub mod workflow;
