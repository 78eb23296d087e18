#![deny(dead_code)]
#![deny(unused_imports)]

//! Empirical-Bayes harmonization of multi-site measurements (ComBat).
//!
//! The numeric core lives in the leaf modules, in pipeline order:
//! [`design`] -> [`standardize`] -> [`location_scale`] -> [`priors`] -> [`bayes`] -> [`adjust`].
//! [`estimate`] orchestrates a fit, [`model`] owns the fitted state and applies it, and
//! [`table`] adapts labeled tab-separated tables onto the numeric interface.

pub mod adjust;
pub mod bayes;
pub mod data;
pub mod design;
pub mod estimate;
pub mod linalg;
pub mod location_scale;
pub mod model;
pub mod priors;
pub mod standardize;
pub mod table;

pub use data::CombatInput;
pub use estimate::{CombatError, fit_model};
pub use model::{CombatConfig, CombatTransformer, FittedModel, ModelError, ModelState};
pub use table::{CombatHarmonizer, ColumnRoles, Retain, TableError};
