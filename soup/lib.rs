#![deny(unused_imports)]
//! # SOUP: semi-soft clustering for expression matrices
//!
//! Given an n×p matrix of per-sample feature measurements, this crate assigns
//! each sample a continuous membership vector over K inferred clusters rather
//! than a single hard label, estimates cluster centers consistent with those
//! memberships, and selects K by cross-validated prediction error. A
//! one-dimensional pseudo-time ordering of samples can be derived from the
//! soft memberships.
//!
//! Pipeline, leaf-first:
//!
//! 1. [`purity`] picks anchor samples that are confidently homogeneous and
//!    maps them onto K target clusters, seeding the solver without iteration.
//! 2. [`solver`] alternates least-squares center estimation with per-sample
//!    simplex-constrained membership fits until the reconstruction error
//!    stabilizes.
//! 3. [`driver`] orchestrates selector + solver across a list of candidate K
//!    values; per-K failures are isolated, not fatal to the batch.
//! 4. [`crossval`] scores held-out reconstruction error per K over repeated
//!    seeded fold partitions and picks the minimizer.
//! 5. [`timeline`] orders clusters along a trajectory and computes a scalar
//!    pseudo-time per sample.

pub mod crossval;
pub mod distance;
pub mod driver;
pub mod error;
pub mod purity;
pub mod solver;
pub mod timeline;

pub use crossval::{CvResult, CvSettings, cross_validate};
pub use driver::{
    ExpressionScale, FeatureSelector, SoupFit, SoupRun, SoupSettings, major_labels,
    restrict_columns, run_soup,
};
pub use error::SoupError;
pub use purity::{AnchorSet, PurityPolicy, select_anchors};
pub use solver::{SolverSettings, SolverState, fit_memberships};
pub use timeline::{Timeline, estimate_timeline};
