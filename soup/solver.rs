//! Alternating membership/center estimation.
//!
//! The solver owns the algorithmic core of the crate: starting from one-hot
//! anchor memberships it alternates between (i) a least-squares center update
//! against the full soft membership matrix and (ii) an independent
//! simplex-constrained least-squares fit of each sample's membership row
//! against the current centers. Sample rows are scaled to unit L2 norm at
//! entry, so per-sample expression magnitude never drives membership; on the
//! unit-scaled rows both steps are exact block minimizers of the total
//! reconstruction error ‖X̂ − θC‖²_F, so the error trace is non-increasing
//! and the loop terminates at a fixed point (or the iteration cap, which is
//! reported, not fatal).
//!
//! Solver state is an immutable snapshot passed through a pure transition
//! function; nothing here mutates shared state, which is what lets the
//! per-sample subproblems fan out across a rayon pool and lets multiple K
//! fits run concurrently in the driver.

use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Factorize, Solve};

use crate::distance::unit_rows;
use crate::error::SoupError;
use crate::purity::AnchorSet;

/// Convergence policy for the alternating loop.
#[derive(Clone, Copy, Debug)]
pub struct SolverSettings {
    pub max_iter: usize,
    /// Relative decrease of reconstruction error below which the loop stops.
    pub tol: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol: 1e-6,
        }
    }
}

/// One converged (or best-effort) fit: memberships, centers and the
/// diagnostics of the loop that produced them.
#[derive(Clone, Debug)]
pub struct SolverState {
    /// n×K membership matrix; every row lies on the K-simplex.
    pub theta: Array2<f64>,
    /// K×p cluster centers in unit-scaled row space, least-squares optimal
    /// for `theta`.
    pub centers: Array2<f64>,
    pub iteration: usize,
    /// Total reconstruction error ‖X̂ − θC‖²_F over the unit-scaled rows at
    /// this state.
    pub error: f64,
    pub converged: bool,
}

/// Fits a (θ, Centers) pair from an anchor initialization.
///
/// Rows of `x` are scaled to unit L2 norm before the first center update, so
/// the whole alternation sees only expression direction. Anchor samples start
/// one-hot on their assigned cluster; all other samples start uniform, so the
/// first center update is dominated by the anchors.
pub fn fit_memberships(
    x: ArrayView2<f64>,
    anchors: &AnchorSet,
    settings: &SolverSettings,
) -> Result<SolverState, SoupError> {
    let n = x.nrows();
    let k = anchors.k;
    let mut theta = Array2::from_elem((n, k), 1.0 / k as f64);
    for &(sample, cluster) in &anchors.assignments {
        let mut row = theta.row_mut(sample);
        row.fill(0.0);
        row[cluster] = 1.0;
    }
    let xn = unit_rows(x);
    run_alternation(xn.view(), theta, settings)
}

/// Fits a (θ, Centers) pair warm-started from explicit centers: the first
/// step is a membership fit against `centers`, then the usual alternation on
/// the unit-scaled rows.
pub fn fit_from_centers(
    x: ArrayView2<f64>,
    centers: ArrayView2<f64>,
    settings: &SolverSettings,
) -> Result<SolverState, SoupError> {
    let xn = unit_rows(x);
    let theta = membership_rows(xn.view(), centers)?;
    run_alternation(xn.view(), theta, settings)
}

fn run_alternation(
    x: ArrayView2<f64>,
    theta0: Array2<f64>,
    settings: &SolverSettings,
) -> Result<SolverState, SoupError> {
    let mut state = SolverState {
        centers: update_centers(x, theta0.view())?,
        theta: theta0,
        iteration: 0,
        error: f64::INFINITY,
        converged: false,
    };
    state.error = reconstruction_error(x, state.theta.view(), state.centers.view());

    while state.iteration < settings.max_iter {
        let next = transition(x, &state)?;
        let decrease = state.error - next.error;
        let converged = decrease < settings.tol * state.error.max(1.0);
        log::debug!(
            "solver iter {}: error {:.6e} (decrease {:.3e})",
            next.iteration,
            next.error,
            decrease
        );
        state = next;
        if converged {
            state.converged = true;
            break;
        }
    }

    if state.converged {
        log::info!(
            "solver converged after {} iterations, error {:.6e}",
            state.iteration,
            state.error
        );
    } else {
        log::warn!(
            "solver hit the iteration cap ({}) without converging; returning best iterate",
            settings.max_iter
        );
    }
    Ok(state)
}

/// One full alternation step: membership refit, then center refit, then
/// error re-evaluation. Pure in its inputs.
fn transition(x: ArrayView2<f64>, state: &SolverState) -> Result<SolverState, SoupError> {
    let theta = membership_rows(x, state.centers.view())?;
    let centers = update_centers(x, theta.view())?;
    let error = reconstruction_error(x, theta.view(), centers.view());
    Ok(SolverState {
        theta,
        centers,
        iteration: state.iteration + 1,
        error,
        converged: false,
    })
}

/// Least-squares center update: solves (θᵀθ)C = θᵀX.
///
/// θ is not one-hot after the first iteration, so this is a genuine K×K
/// solve, not a weighted mean. A cluster whose effective weight has collapsed
/// makes the system meaningless and is reported as fatal for this K.
pub fn update_centers(x: ArrayView2<f64>, theta: ArrayView2<f64>) -> Result<Array2<f64>, SoupError> {
    let n = x.nrows();
    let p = x.ncols();
    let k = theta.ncols();

    let weights = theta.sum_axis(Axis(0));
    let floor = 1e-8 * n as f64;
    for (cluster, &w) in weights.iter().enumerate() {
        if w < floor {
            return Err(SoupError::DegenerateCluster { cluster });
        }
    }

    let mut gram = theta.t().dot(&theta);
    for j in 0..k {
        gram[[j, j]] += 1e-12;
    }
    let rhs = theta.t().dot(&x);

    let lu = gram.factorize()?;
    let mut centers = Array2::zeros((k, p));
    for (j, col) in rhs.axis_iter(Axis(1)).enumerate() {
        let solved = lu.solve(&col.to_owned())?;
        centers.column_mut(j).assign(&solved);
    }
    Ok(centers)
}

/// Fits every sample's membership row against fixed centers: n independent
/// K-dimensional simplex-constrained least-squares problems, dispatched in
/// parallel. This is also the projection primitive the cross-validator uses
/// on held-out samples.
pub fn membership_rows(
    x: ArrayView2<f64>,
    centers: ArrayView2<f64>,
) -> Result<Array2<f64>, SoupError> {
    let n = x.nrows();
    let k = centers.nrows();
    let gram = centers.dot(&centers.t());

    let rows: Vec<Array1<f64>> = x
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|sample| {
            let cross = centers.dot(&sample);
            simplex_least_squares(&gram, cross.view())
        })
        .collect::<Result<Vec<_>, SoupError>>()?;

    let mut theta = Array2::zeros((n, k));
    for (i, row) in rows.into_iter().enumerate() {
        theta.row_mut(i).assign(&row);
    }
    Ok(theta)
}

/// Solves min ‖x − θC‖² over the K-simplex given the Gram matrix G = CCᵀ and
/// cross term b = Cx, by an active set on the nonnegativity constraints.
///
/// The sum-to-one equality is kept in a KKT system over the current support;
/// each round drops the most negative coordinate, so at most K−1 small solves
/// are needed. The active set only shrinks: a dropped coordinate is never
/// re-examined, so on an ill-conditioned Gram matrix the final support can be
/// a slightly suboptimal face of the simplex. The drop order depends only on
/// the input values, so the result is fully deterministic.
fn simplex_least_squares(
    gram: &Array2<f64>,
    b: ArrayView1<f64>,
) -> Result<Array1<f64>, SoupError> {
    let k = gram.nrows();
    let mut support: Vec<usize> = (0..k).collect();

    loop {
        if support.len() == 1 {
            let mut theta = Array1::zeros(k);
            theta[support[0]] = 1.0;
            return Ok(theta);
        }

        let m = support.len();
        let mut kkt = Array2::zeros((m + 1, m + 1));
        let mut rhs = Array1::zeros(m + 1);
        for (a, &i) in support.iter().enumerate() {
            for (c, &j) in support.iter().enumerate() {
                kkt[[a, c]] = gram[[i, j]];
            }
            kkt[[a, a]] += 1e-12;
            kkt[[a, m]] = 1.0;
            kkt[[m, a]] = 1.0;
            rhs[a] = b[i];
        }
        rhs[m] = 1.0;

        let solution = kkt.solve(&rhs)?;

        let mut worst: Option<(usize, f64)> = None;
        for (a, &value) in solution.iter().take(m).enumerate() {
            if value < -1e-10 && worst.is_none_or(|(_, w)| value < w) {
                worst = Some((a, value));
            }
        }
        match worst {
            Some((a, _)) => {
                support.remove(a);
            }
            None => {
                let mut theta = Array1::zeros(k);
                for (a, &i) in support.iter().enumerate() {
                    theta[i] = solution[a].max(0.0);
                }
                // Exact simplex membership despite rounding in the solve.
                let total = theta.sum();
                theta.mapv_inplace(|v| v / total);
                return Ok(theta);
            }
        }
    }
}

/// Total squared reconstruction error ‖X − θC‖²_F.
pub fn reconstruction_error(
    x: ArrayView2<f64>,
    theta: ArrayView2<f64>,
    centers: ArrayView2<f64>,
) -> f64 {
    let residual = &x.to_owned() - &theta.dot(&centers);
    residual.mapv(|v| v * v).sum()
}
