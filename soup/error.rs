use thiserror::Error;

/// A comprehensive error type for the clustering pipeline.
///
/// Per-K failures during a multi-K run are isolated and reported per K; the
/// cross-validator additionally distinguishes recoverable failures (a fold
/// simply cannot support that K) from systematic ones that abort the run.
#[derive(Error, Debug)]
pub enum SoupError {
    #[error(
        "Only {found} coarse groups survived the purity threshold, but K = {requested} clusters were requested. Lower K or relax the purity policy."
    )]
    InsufficientAnchors { requested: usize, found: usize },

    #[error(
        "Cluster {cluster} collapsed to zero effective weight during the center update; the fit for this K cannot continue."
    )]
    DegenerateCluster { cluster: usize },

    #[error("Terminal cluster index {index} is out of range for K = {k} clusters.")]
    InvalidClusterIndex { index: usize, k: usize },

    #[error("A linear system solve failed. The cluster Gram matrix may be singular. Error: {0}")]
    LinearSolveFailed(#[from] ndarray_linalg::error::LinalgError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SoupError {
    /// Whether the caller can recover by adjusting K or the purity policy.
    ///
    /// Recoverable failures in one cross-validation fold only void that K's
    /// candidacy; anything else is treated as systematic and aborts the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SoupError::InsufficientAnchors { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_anchor_shortage_is_recoverable() {
        assert!(
            SoupError::InsufficientAnchors {
                requested: 5,
                found: 3
            }
            .is_recoverable()
        );
        assert!(!SoupError::DegenerateCluster { cluster: 2 }.is_recoverable());
        assert!(!SoupError::InvalidClusterIndex { index: 7, k: 4 }.is_recoverable());
        assert!(!SoupError::InvalidInput("empty matrix".into()).is_recoverable());
    }
}
