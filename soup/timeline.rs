//! Pseudo-time ordering derived from a fitted (θ, Centers) pair.
//!
//! Clusters are chained greedily in center-correlation space starting from a
//! caller-designated terminal cluster; each sample's pseudo-time is then the
//! membership-weighted mean of the ordered cluster ranks. Soft memberships
//! are what make the timeline continuous: a sample halfway between two
//! adjacent clusters lands halfway between their ranks.

use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::distance::cross_correlation;
use crate::error::SoupError;

/// Per-sample pseudo-time plus the cluster ordering used to compute it:
/// `order[r]` is the original cluster index placed at rank `r + 1`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Timeline {
    pub pseudotime: Array1<f64>,
    pub order: Vec<usize>,
}

/// Orders the K clusters along a trajectory and scores each sample.
///
/// Starting from `terminal`, the not-yet-ordered cluster whose center is most
/// correlated with the most recently ordered center is appended until all K
/// are placed; ties resolve toward the lowest cluster index. Fails with
/// [`SoupError::InvalidClusterIndex`] before any computation if `terminal` is
/// out of range.
pub fn estimate_timeline(
    theta: ArrayView2<f64>,
    centers: ArrayView2<f64>,
    terminal: usize,
) -> Result<Timeline, SoupError> {
    let k = centers.nrows();
    if terminal >= k {
        return Err(SoupError::InvalidClusterIndex { index: terminal, k });
    }
    if theta.ncols() != k {
        return Err(SoupError::InvalidInput(format!(
            "membership matrix has {} columns but there are {k} centers",
            theta.ncols()
        )));
    }

    let corr = cross_correlation(centers, centers);

    let mut order = Vec::with_capacity(k);
    let mut placed = vec![false; k];
    order.push(terminal);
    placed[terminal] = true;
    while order.len() < k {
        let last = *order.last().expect("order is non-empty");
        let mut best: Option<(usize, f64)> = None;
        for c in 0..k {
            if placed[c] {
                continue;
            }
            let score = corr[[last, c]];
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((c, score));
            }
        }
        let (next, _) = best.expect("an unplaced cluster remains");
        order.push(next);
        placed[next] = true;
    }

    // rank[cluster] in 1..=K, so pseudo-time is a single matrix-vector product.
    let mut rank = Array1::zeros(k);
    for (pos, &cluster) in order.iter().enumerate() {
        rank[cluster] = (pos + 1) as f64;
    }
    let pseudotime = theta.dot(&rank);

    log::debug!("timeline order (terminal first): {order:?}");
    Ok(Timeline { pseudotime, order })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Centers are overlapping expression bumps drifting across five
    /// features, deliberately stored out of order: cluster 2 is the early
    /// (terminal) end, cluster 0 the late end. Adjacent stages correlate far
    /// more strongly than the two ends do.
    fn drifting_centers() -> ndarray::Array2<f64> {
        array![
            [0.0, 0.0, 1.0, 4.0, 5.0], // late
            [1.0, 4.0, 5.0, 4.0, 1.0], // middle
            [5.0, 4.0, 1.0, 0.0, 0.0], // terminal (early)
        ]
    }

    #[test]
    fn recovers_linear_order_from_terminal() {
        let centers = drifting_centers();
        let theta = array![
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.5, 0.5]
        ];
        let timeline = estimate_timeline(theta.view(), centers.view(), 2).unwrap();
        assert_eq!(timeline.order, vec![2, 1, 0]);

        // One-hot samples land exactly on their cluster's rank.
        assert_abs_diff_eq!(timeline.pseudotime[0], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(timeline.pseudotime[1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(timeline.pseudotime[2], 1.0, epsilon = 1e-12);
        // A half-and-half sample lands between its two clusters.
        assert_abs_diff_eq!(timeline.pseudotime[3], 1.5, epsilon = 1e-12);
    }

    #[test]
    fn correlation_ties_resolve_to_lowest_index() {
        // Clusters 1 and 2 are identical, so both correlate equally with the
        // terminal cluster; the chain must pick cluster 1 first.
        let centers = array![
            [1.0, 2.0, 3.0],
            [3.0, 2.0, 1.0],
            [3.0, 2.0, 1.0]
        ];
        let theta = array![[1.0, 0.0, 0.0]];
        let timeline = estimate_timeline(theta.view(), centers.view(), 0).unwrap();
        assert_eq!(timeline.order, vec![0, 1, 2]);
    }

    #[test]
    fn out_of_range_terminal_is_rejected() {
        let centers = drifting_centers();
        let theta = array![[1.0, 0.0, 0.0]];
        let err = estimate_timeline(theta.view(), centers.view(), 3).unwrap_err();
        assert!(matches!(err, SoupError::InvalidClusterIndex { index: 3, k: 3 }));
    }
}
