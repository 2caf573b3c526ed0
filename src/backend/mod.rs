//! Backend helpers
//!
//! Collection of the hardware facing parts of the crate.
//!
//! - [`dpu`] orchestrates atomic display commits on a display processing unit

pub mod dpu;
