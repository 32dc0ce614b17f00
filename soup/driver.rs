//! Orchestration of selector + solver across candidate K values.
//!
//! The driver is the public entry point for clustering: it validates the
//! expression matrix once, then fits every requested K independently. A K
//! that the data cannot support (typically [`SoupError::InsufficientAnchors`])
//! is reported as that K's failed slot while the remaining fits proceed, so
//! a multi-K run is not atomic. Candidate fits fan out across a bounded rayon
//! pool when more than one K is requested.

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SoupError;
use crate::purity::{PurityPolicy, select_anchors};
use crate::solver::{SolverSettings, fit_memberships};

/// Scale of the caller-supplied matrix. Metadata only: the driver never
/// re-normalizes, it just records which pre-processing contract the caller
/// claims to have honored, and feature-selection collaborators may branch on
/// it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpressionScale {
    /// Raw (or depth-normalized) counts.
    Count,
    /// Log-transformed expression.
    Log,
}

/// Everything a clustering run needs besides the matrix and the K list.
#[derive(Clone, Debug, Default)]
pub struct SoupSettings {
    pub scale: ExpressionScale,
    pub purity: PurityPolicy,
    pub solver: SolverSettings,
    /// Upper bound on worker threads for parallel phases. `None` uses the
    /// machine's logical CPU count; either way the pool never exceeds the
    /// number of independent tasks.
    pub workers: Option<usize>,
}

impl Default for ExpressionScale {
    fn default() -> Self {
        ExpressionScale::Log
    }
}

/// One successful fit for a single K.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SoupFit {
    pub k: usize,
    /// n×K soft memberships; every row is on the K-simplex.
    pub membership: Array2<f64>,
    /// K×p cluster centers in unit-scaled row space.
    pub centers: Array2<f64>,
    /// Row argmax of `membership`, ties toward the lower cluster index.
    pub major_labels: Vec<usize>,
    pub converged: bool,
    pub iterations: usize,
    /// Total squared reconstruction error over the unit-scaled sample rows.
    pub reconstruction_error: f64,
}

/// The per-K results of a driver run, in the order the K values were given.
#[derive(Debug)]
pub struct SoupRun {
    pub fits: Vec<(usize, Result<SoupFit, SoupError>)>,
}

impl SoupRun {
    /// The successful fit for a specific K, if there is one.
    pub fn fit_for(&self, k: usize) -> Option<&SoupFit> {
        self.fits
            .iter()
            .find(|(fit_k, _)| *fit_k == k)
            .and_then(|(_, result)| result.as_ref().ok())
    }

    pub fn successes(&self) -> impl Iterator<Item = &SoupFit> {
        self.fits.iter().filter_map(|(_, result)| result.as_ref().ok())
    }
}

/// Runs the full selector + solver pipeline once per candidate K.
///
/// Input invariants (violations are [`SoupError::InvalidInput`]): at least
/// one K, every K ≥ 2, n no smaller than the largest K, and no all-zero
/// sample rows (their membership would be undefined under scale-invariant
/// distance).
pub fn run_soup(
    x: ArrayView2<f64>,
    ks: &[usize],
    settings: &SoupSettings,
) -> Result<SoupRun, SoupError> {
    validate_input(x, ks)?;
    log::info!(
        "running SOUP on {}×{} matrix ({:?} scale), K ∈ {:?}",
        x.nrows(),
        x.ncols(),
        settings.scale,
        ks
    );

    let pool = bounded_pool(settings.workers, ks.len())?;
    let fits: Vec<(usize, Result<SoupFit, SoupError>)> = pool.install(|| {
        ks.par_iter()
            .map(|&k| {
                let result = fit_single_k(x, k, settings);
                if let Err(err) = &result {
                    log::warn!("K = {k} failed: {err}");
                }
                (k, result)
            })
            .collect()
    });

    Ok(SoupRun { fits })
}

pub(crate) fn fit_single_k(
    x: ArrayView2<f64>,
    k: usize,
    settings: &SoupSettings,
) -> Result<SoupFit, SoupError> {
    let anchors = select_anchors(x, k, &settings.purity)?;
    let state = fit_memberships(x, &anchors, &settings.solver)?;
    let major_labels = major_labels(state.theta.view());
    Ok(SoupFit {
        k,
        major_labels,
        converged: state.converged,
        iterations: state.iteration,
        reconstruction_error: state.error,
        membership: state.theta,
        centers: state.centers,
    })
}

/// Hard labels as the row argmax of a membership matrix; a tie between equal
/// maximal entries resolves to the lower cluster index.
pub fn major_labels(theta: ArrayView2<f64>) -> Vec<usize> {
    theta
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = 0usize;
            let mut best_value = f64::NEG_INFINITY;
            for (j, &v) in row.iter().enumerate() {
                if v > best_value {
                    best_value = v;
                    best = j;
                }
            }
            best
        })
        .collect()
}

/// Seam for the external feature-selection collaborator: the core treats the
/// procedure as opaque and only consumes the returned column identifiers.
pub trait FeatureSelector {
    fn select(&self, x: ArrayView2<f64>, scale: ExpressionScale) -> Vec<usize>;
}

/// Restricts a matrix to the given feature columns, in the given order.
pub fn restrict_columns(x: ArrayView2<f64>, features: &[usize]) -> Array2<f64> {
    x.select(Axis(1), features)
}

pub(crate) fn validate_input(x: ArrayView2<f64>, ks: &[usize]) -> Result<(), SoupError> {
    if ks.is_empty() {
        return Err(SoupError::InvalidInput(
            "at least one candidate K is required".into(),
        ));
    }
    if let Some(&bad) = ks.iter().find(|&&k| k < 2) {
        return Err(SoupError::InvalidInput(format!(
            "every candidate K must be at least 2, got {bad}"
        )));
    }
    let max_k = ks.iter().copied().max().unwrap_or(0);
    if x.nrows() < max_k {
        return Err(SoupError::InvalidInput(format!(
            "{} samples cannot support K = {max_k}",
            x.nrows()
        )));
    }
    if x.ncols() == 0 {
        return Err(SoupError::InvalidInput("matrix has no features".into()));
    }
    for (i, row) in x.rows().into_iter().enumerate() {
        if row.iter().all(|&v| v == 0.0) {
            return Err(SoupError::InvalidInput(format!(
                "sample {i} is all-zero; its membership would be undefined"
            )));
        }
    }
    Ok(())
}

/// A rayon pool bounded by the configured worker count and the number of
/// independent tasks; finer-grained parallelism buys nothing.
pub(crate) fn bounded_pool(
    workers: Option<usize>,
    tasks: usize,
) -> Result<rayon::ThreadPool, SoupError> {
    let threads = workers
        .unwrap_or_else(num_cpus::get)
        .min(tasks.max(1))
        .max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| SoupError::InvalidInput(format!("failed to build worker pool: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_blob_matrix() -> Array2<f64> {
        let mut rows = Vec::new();
        for i in 0..6 {
            let j = i as f64 * 0.02;
            rows.push([8.0 + j, 0.5, 7.5, 0.3 + j, 0.1, 6.9]);
        }
        for i in 0..6 {
            let j = i as f64 * 0.02;
            rows.push([0.4, 9.0 + j, 0.2 + j, 8.5, 7.8, 0.2]);
        }
        Array2::from(rows)
    }

    #[test]
    fn per_k_failures_do_not_poison_the_batch() {
        let x = two_blob_matrix();
        let run = run_soup(x.view(), &[2, 6], &SoupSettings::default()).unwrap();
        assert_eq!(run.fits.len(), 2);

        let fit = run.fit_for(2).expect("K = 2 should fit");
        assert!(fit.converged);
        assert_eq!(fit.membership.nrows(), 12);
        assert_eq!(fit.centers.nrows(), 2);
        for i in 0..6 {
            assert_eq!(fit.major_labels[i], fit.major_labels[0]);
            assert_ne!(fit.major_labels[i + 6], fit.major_labels[0]);
        }

        // Twelve near-duplicate samples cannot support six clusters.
        let (_, failed) = &run.fits[1];
        assert!(matches!(
            failed,
            Err(SoupError::InsufficientAnchors { requested: 6, .. })
        ));
    }

    #[test]
    fn major_label_ties_resolve_to_lowest_index() {
        let theta = array![[0.5, 0.5], [0.2, 0.8], [0.8, 0.2]];
        assert_eq!(major_labels(theta.view()), vec![0, 1, 0]);
    }

    #[test]
    fn all_zero_rows_are_rejected() {
        let mut x = two_blob_matrix();
        x.row_mut(3).fill(0.0);
        let err = run_soup(x.view(), &[2], &SoupSettings::default()).unwrap_err();
        assert!(matches!(err, SoupError::InvalidInput(_)));
    }

    #[test]
    fn k_below_two_is_rejected() {
        let x = two_blob_matrix();
        let err = run_soup(x.view(), &[1, 2], &SoupSettings::default()).unwrap_err();
        assert!(matches!(err, SoupError::InvalidInput(_)));
    }

    #[test]
    fn restrict_columns_preserves_order() {
        let x = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let r = restrict_columns(x.view(), &[2, 0]);
        assert_eq!(r, array![[3.0, 1.0], [6.0, 4.0]]);
    }
}
