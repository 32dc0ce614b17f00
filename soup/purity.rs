//! Anchor-sample selection.
//!
//! Before any alternating optimization runs, the selector identifies samples
//! that are confidently homogeneous: a coarse over-clustering of the data is
//! built and folded into the K target clusters by between-group similarity,
//! each sample is scored by how uniformly its nearest neighbors agree with
//! its target cluster, and only high-purity samples survive as anchors. The
//! solver then starts from one-hot memberships that already respect the
//! broad structure of the data.
//!
//! The scoring policy (neighborhood size, group count, threshold) is an
//! empirically tuned heuristic, exposed as [`PurityPolicy`] rather than fixed
//! constants. The selector is fully deterministic: the coarse grouping is
//! average-linkage agglomerative clustering with index-ordered tie-breaking,
//! so no seed is consumed here.

use ndarray::ArrayView2;

use crate::distance::row_correlation;
use crate::error::SoupError;

/// Tunable policy for anchor scoring. `None` fields derive their value from
/// the data shape at call time.
#[derive(Clone, Copy, Debug)]
pub struct PurityPolicy {
    /// Number of coarse groups to over-cluster into before purity scoring.
    /// Default: `min(n, 2K)`.
    pub coarse_groups: Option<usize>,
    /// Neighborhood size for the homogeneity score. Default: `n/10` clamped
    /// to `[3, 20]`.
    pub neighbors: Option<usize>,
    /// Minimum purity score (neighborhood vote times separation factor) for a
    /// sample to qualify as an anchor.
    pub threshold: f64,
}

impl Default for PurityPolicy {
    fn default() -> Self {
        Self {
            coarse_groups: None,
            neighbors: None,
            threshold: 0.6,
        }
    }
}

/// Sparse anchor assignment: `(sample index, target cluster)` pairs for the
/// samples that passed the purity threshold. Consumed only to seed initial
/// centers; not part of any final output.
#[derive(Clone, Debug)]
pub struct AnchorSet {
    pub assignments: Vec<(usize, usize)>,
    pub k: usize,
}

impl AnchorSet {
    /// Number of anchors assigned to each of the K clusters.
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.k];
        for &(_, c) in &self.assignments {
            sizes[c] += 1;
        }
        sizes
    }
}

/// Selects anchor samples for a K-cluster fit.
///
/// Fails with [`SoupError::InsufficientAnchors`] when fewer than K coarse
/// groups retain at least one high-purity sample, which signals that K is not
/// supported by the data under the current policy.
pub fn select_anchors(
    x: ArrayView2<f64>,
    k: usize,
    policy: &PurityPolicy,
) -> Result<AnchorSet, SoupError> {
    let n = x.nrows();
    if k < 2 {
        return Err(SoupError::InvalidInput(format!(
            "K must be at least 2, got {k}"
        )));
    }
    if n < k {
        return Err(SoupError::InvalidInput(format!(
            "cannot form {k} clusters from {n} samples"
        )));
    }

    let num_coarse = policy.coarse_groups.unwrap_or_else(|| (2 * k).min(n));
    let num_neighbors = policy.neighbors.unwrap_or_else(|| (n / 10).clamp(3, 20));
    let num_neighbors = num_neighbors.min(n - 1);

    // Similarity is correlation, so magnitude differences never matter.
    let sim = row_correlation(x);

    // Over-cluster into more groups than K so the coarse structure is finer
    // than any plausible cluster, then fold the coarse groups into K
    // super-clusters by average between-group similarity. Purity is scored
    // against the folded labels: a sample is pure when its neighborhood
    // agrees on which of the K target clusters it belongs to AND its own
    // cluster is clearly more correlated with it than any other.
    let mut dissim = sim.mapv(|s| 1.0 - s);
    for i in 0..n {
        dissim[[i, i]] = 0.0;
    }
    let coarse = average_linkage(&dissim, num_coarse);
    let num_coarse = coarse.iter().max().map_or(0, |&m| m + 1);

    let group_dissim = group_dissimilarity(&sim, &coarse, num_coarse);
    let folded = average_linkage(&group_dissim, k);
    let mapped: Vec<usize> = coarse.iter().map(|&g| folded[g]).collect();

    let purity = purity_scores(&sim, &mapped, num_neighbors);
    let anchors: Vec<usize> = (0..n).filter(|&i| purity[i] >= policy.threshold).collect();

    // A target cluster survives only if at least one of its members is pure.
    let mut surviving: Vec<usize> = anchors.iter().map(|&i| mapped[i]).collect();
    surviving.sort_unstable();
    surviving.dedup();
    if surviving.len() < k {
        log::debug!(
            "purity selector kept {} of {k} clusters above threshold {} ({} anchors)",
            surviving.len(),
            policy.threshold,
            anchors.len()
        );
        return Err(SoupError::InsufficientAnchors {
            requested: k,
            found: surviving.len(),
        });
    }

    let assignments: Vec<(usize, usize)> = anchors.iter().map(|&i| (i, mapped[i])).collect();
    let set = AnchorSet { assignments, k };
    log::info!(
        "selected {} anchors across {k} clusters ({} coarse groups)",
        set.assignments.len(),
        num_coarse
    );
    Ok(set)
}

/// Homogeneity score per sample: the fraction of its `q` most-similar
/// neighbors that share its label, damped by a separation factor of
/// `1 − other̄/own̄`. Here own̄ is the sample's mean correlation with the
/// agreeing part of its neighborhood (local homogeneity) and other̄ the
/// largest mean correlation with the full membership of any other cluster.
/// A boundary that merely subdivides one homogeneous blob puts half the blob
/// in another cluster, so other̄ ≈ own̄ and the score collapses no matter
/// how the neighborhood votes fall. Neighbor ties resolve toward the lower
/// index.
fn purity_scores(sim: &ndarray::Array2<f64>, labels: &[usize], q: usize) -> Vec<f64> {
    let n = labels.len();
    let num_labels = labels.iter().max().map_or(0, |&m| m + 1);
    let mut scores = vec![0.0; n];
    for i in 0..n {
        let mut order: Vec<usize> = (0..n).filter(|&j| j != i).collect();
        order.sort_by(|&a, &b| {
            sim[[i, b]]
                .partial_cmp(&sim[[i, a]])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        let agreeing: Vec<usize> = order
            .iter()
            .take(q)
            .copied()
            .filter(|&j| labels[j] == labels[i])
            .collect();
        if agreeing.is_empty() {
            continue;
        }
        let vote = agreeing.len() as f64 / q as f64;
        let own = agreeing.iter().map(|&j| sim[[i, j]]).sum::<f64>() / agreeing.len() as f64;

        let mut totals = vec![0.0; num_labels];
        let mut counts = vec![0usize; num_labels];
        for j in 0..n {
            if j != i {
                totals[labels[j]] += sim[[i, j]];
                counts[labels[j]] += 1;
            }
        }
        let other = (0..num_labels)
            .filter(|&c| c != labels[i] && counts[c] > 0)
            .map(|c| totals[c] / counts[c] as f64)
            .fold(f64::NEG_INFINITY, f64::max);
        let separation = if own <= 0.0 {
            0.0
        } else {
            (1.0 - (other / own).clamp(0.0, 1.0)).max(0.0)
        };
        scores[i] = vote * separation;
    }
    scores
}

/// Mean sample-to-sample dissimilarity between each pair of coarse groups.
fn group_dissimilarity(
    sim: &ndarray::Array2<f64>,
    coarse: &[usize],
    num_groups: usize,
) -> ndarray::Array2<f64> {
    let g = num_groups;
    let members: Vec<Vec<usize>> = (0..g)
        .map(|label| {
            (0..coarse.len())
                .filter(|&i| coarse[i] == label)
                .collect()
        })
        .collect();

    let mut d = ndarray::Array2::zeros((g, g));
    for a in 0..g {
        for b in (a + 1)..g {
            let mut total = 0.0;
            for &i in &members[a] {
                for &j in &members[b] {
                    total += 1.0 - sim[[i, j]];
                }
            }
            let pairs = (members[a].len() * members[b].len()) as f64;
            let mean = total / pairs;
            d[[a, b]] = mean;
            d[[b, a]] = mean;
        }
    }
    d
}

/// Average-linkage agglomerative clustering of `n` items given a symmetric
/// dissimilarity matrix, stopped at `target` clusters. Returns one label in
/// `0..target` per item; labels are ordered by each cluster's smallest member
/// index, so the output is deterministic. Merge ties resolve toward the
/// lexicographically smallest cluster pair.
fn average_linkage(dissim: &ndarray::Array2<f64>, target: usize) -> Vec<usize> {
    let n = dissim.nrows();
    let target = target.clamp(1, n);
    let mut clusters: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut d = dissim.clone();

    while clusters.len() > target {
        let m = clusters.len();
        let (mut best_a, mut best_b, mut best) = (0, 1, f64::INFINITY);
        for a in 0..m {
            for b in (a + 1)..m {
                if d[[a, b]] < best {
                    best = d[[a, b]];
                    best_a = a;
                    best_b = b;
                }
            }
        }

        // Lance-Williams update for average linkage: the merged cluster's
        // distance to any other is the size-weighted mean of its parents'.
        let (sa, sb) = (clusters[best_a].len() as f64, clusters[best_b].len() as f64);
        let merged_dist: Vec<f64> = (0..m)
            .map(|c| (sa * d[[best_a, c]] + sb * d[[best_b, c]]) / (sa + sb))
            .collect();

        let absorbed = clusters.remove(best_b);
        clusters[best_a].extend(absorbed);
        for c in 0..m {
            if c == best_a || c == best_b {
                continue;
            }
            d[[best_a, c]] = merged_dist[c];
            d[[c, best_a]] = merged_dist[c];
        }
        // best_a < best_b, so best_a stays valid after the removal.
        d = shrink_remove(&d, best_b);
        d[[best_a, best_a]] = 0.0;
    }

    // Stable labels: clusters ordered by their smallest member.
    let mut keyed: Vec<(usize, &Vec<usize>)> = clusters
        .iter()
        .map(|members| (*members.iter().min().expect("non-empty cluster"), members))
        .collect();
    keyed.sort_by_key(|&(key, _)| key);

    let mut labels = vec![0usize; n];
    for (label, (_, members)) in keyed.into_iter().enumerate() {
        for &i in members {
            labels[i] = label;
        }
    }
    labels
}

/// Copy of `d` with row and column `idx` removed.
fn shrink_remove(d: &ndarray::Array2<f64>, idx: usize) -> ndarray::Array2<f64> {
    let m = d.nrows();
    let mut out = ndarray::Array2::zeros((m - 1, m - 1));
    let mut r = 0;
    for i in 0..m {
        if i == idx {
            continue;
        }
        let mut c = 0;
        for j in 0..m {
            if j == idx {
                continue;
            }
            out[[r, c]] = d[[i, j]];
            c += 1;
        }
        r += 1;
    }
    out
}
