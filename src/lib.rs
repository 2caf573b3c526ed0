#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DPU
#![allow(clippy::upper_case_acronyms)]

//! # dpu-atomic: atomic display commits for display processing units
//!
//! This crate validates and commits display transactions on a display processing unit (DPU),
//! the hardware block scanning out planes through a limited set of hardware windows onto one
//! or more crtcs. It does not talk to the hardware itself, register programming is left to
//! the backends implementing the traits of [`backend::dpu::hw`].
//!
//! ## Structure of the crate
//!
//! - [`backend::dpu`] contains the [`DpuDevice`](backend::dpu::DpuDevice), the transaction
//!   types and the check and commit machinery.
//! - [`utils`] contains geometry, clock and serial helpers shared by the backend.
//!
//! ## General principles
//!
//! ### The event loop
//!
//! Completion and recovery events of the device are delivered through a [`calloop`] event
//! source, see [`DpuDeviceNotifier`](backend::dpu::DpuDeviceNotifier). Commits themselves can
//! be executed from any thread, non-blocking commits are completed by worker threads owned by
//! the device.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```
//!
//! If you do not want to use [`tracing`], refer to [`log compatibility`](tracing#log-compatibility)
//! for how to forward the debug output to other `log` compatible frameworks.

pub mod backend;
pub mod utils;

pub mod reexports;
