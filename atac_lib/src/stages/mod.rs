//! Stage drivers.
//!
//! One submodule per stage of the plan. A driver takes an explicit input
//! struct, shells out through [`crate::tools`] where the work lives in an
//! external collaborator, and returns typed outputs for the conductor in
//! [`crate::exec`] to thread downstream. Drivers never decide whether they
//! should run; the planned [`crate::plan::StageGraph`] does.

pub mod align_library;
pub mod call_peaks;
pub mod consensus_peaks;
pub mod differential;
pub mod merge_condition;
pub mod merge_replicate;
