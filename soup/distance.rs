//! Scale-invariant dissimilarity between matrix rows.
//!
//! Clusters may differ in total expression magnitude (sequencing depth,
//! library size), which must not by itself drive distance. Every comparison
//! here therefore projects out the global multiplicative scale of each vector
//! before computing squared Euclidean error, and every batch operation is a
//! single matrix product rather than a per-pair loop.

use ndarray::{Array2, ArrayView2, Axis};

/// Rows scaled to unit L2 norm. Exact-zero rows are left at zero; callers
/// that forbid them (the driver does) must reject them before this point.
pub fn unit_rows(x: ArrayView2<f64>) -> Array2<f64> {
    let mut out = x.to_owned();
    for mut row in out.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    }
    out
}

/// Squared Euclidean distance between unit-scaled rows of `x` (n×p) and
/// unit-scaled rows of `centers` (K×p), as an n×K matrix.
///
/// For unit vectors, ‖x̂ − ĉ‖² = 2 − 2·x̂·ĉ, so the whole pairing reduces to
/// one GEMM. Negative values from rounding are clamped to zero.
pub fn scale_free_sqdist(x: ArrayView2<f64>, centers: ArrayView2<f64>) -> Array2<f64> {
    let xn = unit_rows(x);
    let cn = unit_rows(centers);
    let mut d = xn.dot(&cn.t());
    d.mapv_inplace(|cos| (2.0 - 2.0 * cos).max(0.0));
    d
}

/// Pearson correlation between all pairs of rows of `x`, as an n×n matrix.
///
/// Rows are centered and scaled to unit norm so the Gram product of the
/// standardized matrix is exactly the correlation matrix. Constant rows have
/// no well-defined correlation and contribute zeros (including the diagonal).
pub fn row_correlation(x: ArrayView2<f64>) -> Array2<f64> {
    let z = standardize_rows(x);
    z.dot(&z.t())
}

/// Pearson correlation between rows of `a` (m×p) and rows of `b` (k×p), as an
/// m×k matrix. Same standardization convention as [`row_correlation`].
pub fn cross_correlation(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
    debug_assert_eq!(a.len_of(Axis(1)), b.len_of(Axis(1)));
    let za = standardize_rows(a);
    let zb = standardize_rows(b);
    za.dot(&zb.t())
}

fn standardize_rows(x: ArrayView2<f64>) -> Array2<f64> {
    let mut z = x.to_owned();
    for mut row in z.rows_mut() {
        let mean = row.mean().unwrap_or(0.0);
        row.mapv_inplace(|v| v - mean);
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        } else {
            row.fill(0.0);
        }
    }
    z
}
