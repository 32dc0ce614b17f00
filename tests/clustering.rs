use approx::assert_abs_diff_eq;
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use soup::{CvSettings, SoupSettings, cross_validate, estimate_timeline, run_soup};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Samples drawn from well-separated Gaussian blobs with random nonnegative
/// mean expression profiles. Returns the matrix and the true blob label per
/// row.
fn blob_matrix(
    seed: u64,
    sizes: &[usize],
    p: usize,
    noise: f64,
) -> (Array2<f64>, Vec<usize>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let means: Vec<Vec<f64>> = sizes
        .iter()
        .map(|_| (0..p).map(|_| rng.gen_range(0.0..10.0)).collect())
        .collect();
    let normal = Normal::new(0.0, noise).unwrap();

    let n: usize = sizes.iter().sum();
    let mut x = Array2::zeros((n, p));
    let mut labels = Vec::with_capacity(n);
    let mut row = 0;
    for (blob, &size) in sizes.iter().enumerate() {
        for _ in 0..size {
            for j in 0..p {
                x[[row, j]] = means[blob][j] + normal.sample(&mut rng);
            }
            labels.push(blob);
            row += 1;
        }
    }
    (x, labels)
}

/// Fraction of samples whose predicted label agrees with the true blob,
/// after mapping each predicted cluster to its majority blob.
fn labeling_accuracy(predicted: &[usize], truth: &[usize], k: usize) -> f64 {
    let blobs = truth.iter().max().map_or(0, |&b| b + 1);
    let mut votes = vec![vec![0usize; blobs]; k];
    for (&pred, &blob) in predicted.iter().zip(truth) {
        votes[pred][blob] += 1;
    }
    let mapping: Vec<usize> = votes
        .iter()
        .map(|counts| {
            counts
                .iter()
                .enumerate()
                .max_by_key(|&(_, &c)| c)
                .map_or(0, |(b, _)| b)
        })
        .collect();
    let correct = predicted
        .iter()
        .zip(truth)
        .filter(|&(&pred, &blob)| mapping[pred] == blob)
        .count();
    correct as f64 / truth.len() as f64
}

fn assert_simplex_rows(theta: &Array2<f64>) {
    for (i, row) in theta.rows().into_iter().enumerate() {
        let mut total = 0.0;
        for &v in row {
            assert!(v >= 0.0, "row {i} has negative membership {v}");
            total += v;
        }
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
    }
}

#[test]
fn three_blobs_recovered_at_k3() {
    init_logs();
    let (x, truth) = blob_matrix(42, &[34, 33, 33], 50, 0.5);
    let run = run_soup(x.view(), &[3], &SoupSettings::default()).unwrap();
    let fit = run.fit_for(3).expect("K = 3 should fit three blobs");

    assert!(fit.converged);
    assert_simplex_rows(&fit.membership);
    let accuracy = labeling_accuracy(&fit.major_labels, &truth, 3);
    assert!(accuracy >= 0.95, "blob recovery accuracy {accuracy}");
}

#[test]
fn sequencing_depth_does_not_drive_clustering() {
    init_logs();
    let (mut x, truth) = blob_matrix(42, &[34, 33, 33], 50, 0.5);
    // Rescale every sample by a rotating depth factor spanning two orders of
    // magnitude; the blob structure lives entirely in the profile shape.
    let depths = [1.0, 12.0, 0.2];
    for (i, mut row) in x.rows_mut().into_iter().enumerate() {
        let depth = depths[i % depths.len()];
        row.mapv_inplace(|v| v * depth);
    }

    let run = run_soup(x.view(), &[3], &SoupSettings::default()).unwrap();
    let fit = run.fit_for(3).expect("depth-scaled blobs should still fit");
    assert_simplex_rows(&fit.membership);
    let accuracy = labeling_accuracy(&fit.major_labels, &truth, 3);
    assert!(accuracy >= 0.95, "depth-scaled recovery accuracy {accuracy}");
}

#[test]
fn memberships_stay_on_simplex_across_seeds() {
    for seed in [1u64, 2, 3] {
        let (x, _) = blob_matrix(seed, &[25, 25, 25], 40, 0.6);
        let run = run_soup(x.view(), &[2, 3, 4], &SoupSettings::default()).unwrap();
        for fit in run.successes() {
            assert_simplex_rows(&fit.membership);
            assert_eq!(fit.major_labels.len(), x.nrows());
        }
    }
}

#[test]
fn cross_validation_selects_three_clusters() {
    init_logs();
    let (x, _) = blob_matrix(42, &[34, 33, 33], 50, 0.5);
    let settings = CvSettings {
        nfold: 5,
        seeds: vec![11, 12, 13],
        soup: SoupSettings::default(),
    };
    let result = cross_validate(x.view(), &[2, 3, 4, 5], &settings).unwrap();

    assert_eq!(result.best_k, Some(3));
    // K = 2 must fit everywhere, and fit strictly worse than K = 3.
    assert!(result.failures[0].is_none());
    assert!(result.failures[1].is_none());
    assert!(result.mean_error[1] < result.mean_error[0]);
}

#[test]
fn cross_validation_is_deterministic() {
    let (x, _) = blob_matrix(7, &[30, 30, 30], 40, 0.5);
    let settings = CvSettings {
        nfold: 4,
        seeds: vec![5, 6],
        soup: SoupSettings::default(),
    };
    let a = cross_validate(x.view(), &[2, 3], &settings).unwrap();
    let b = cross_validate(x.view(), &[2, 3], &settings).unwrap();
    assert_eq!(a.mean_error, b.mean_error);
    assert_eq!(a.var_error, b.var_error);
    assert_eq!(a.best_k, b.best_k);
}

#[test]
fn single_blob_cannot_support_k3() {
    init_logs();
    let (x, _) = blob_matrix(9, &[60], 20, 0.5);
    let run = run_soup(x.view(), &[3], &SoupSettings::default()).unwrap();
    let (_, result) = &run.fits[0];
    assert!(matches!(
        result,
        Err(soup::SoupError::InsufficientAnchors { requested: 3, .. })
    ));
}

#[test]
fn fit_results_round_trip_through_json() {
    let (x, _) = blob_matrix(42, &[20, 20], 30, 0.5);
    let run = run_soup(x.view(), &[2], &SoupSettings::default()).unwrap();
    let fit = run.fit_for(2).unwrap();

    let json = serde_json::to_string(fit).unwrap();
    let restored: soup::SoupFit = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.k, fit.k);
    assert_eq!(restored.major_labels, fit.major_labels);
    assert_eq!(restored.membership, fit.membership);
    assert_eq!(restored.centers, fit.centers);
}

#[test]
fn timeline_runs_on_a_fitted_model() {
    let (x, truth) = blob_matrix(42, &[34, 33, 33], 50, 0.5);
    let run = run_soup(x.view(), &[3], &SoupSettings::default()).unwrap();
    let fit = run.fit_for(3).unwrap();

    let timeline = estimate_timeline(fit.membership.view(), fit.centers.view(), 0).unwrap();
    assert_eq!(timeline.pseudotime.len(), truth.len());
    assert_eq!(timeline.order.len(), 3);
    assert_eq!(timeline.order[0], 0);

    // Pseudo-times are bounded by the rank range.
    for &t in &timeline.pseudotime {
        assert!((1.0..=3.0).contains(&t), "pseudo-time {t} out of range");
    }
}
