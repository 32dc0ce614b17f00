//! Cross-validated selection of the number of clusters.
//!
//! Prediction error is estimated with a speckled (Gabriel-style) holdout:
//! each repetition's seed drives both a partition of the samples into folds
//! and a split of the features into a fit half and an eval half. A fold's
//! held-out samples never influence the centers they are scored against, and
//! their memberships are estimated on the fit-half features only, so the
//! eval-half reconstruction error is a genuine out-of-sample quantity. An
//! over-fitted K buys little on the eval half, which is what makes the error
//! curve turn back up past the true cluster count.
//!
//! Folds within a repetition are embarrassingly parallel and fan out across
//! a bounded rayon pool; each fold writes only its own output slot, keyed by
//! (repetition, fold, K), and aggregation happens after all slots for a key
//! are complete.

use ndarray::{ArrayView2, Axis};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::distance::unit_rows;
use crate::driver::{SoupSettings, bounded_pool, validate_input};
use crate::error::SoupError;
use crate::purity::select_anchors;
use crate::solver::{fit_memberships, membership_rows};

/// Cross-validation configuration. The number of repetitions is the number
/// of seeds; each seed deterministically produces one repetition's fold
/// partition and feature mask, so identical settings give identical results.
#[derive(Clone, Debug)]
pub struct CvSettings {
    pub nfold: usize,
    /// One seed per repetition, consumed deterministically.
    pub seeds: Vec<u64>,
    pub soup: SoupSettings,
}

impl Default for CvSettings {
    fn default() -> Self {
        Self {
            nfold: 5,
            seeds: (0..10).collect(),
            soup: SoupSettings::default(),
        }
    }
}

/// K-indexed table of cross-validated prediction error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CvResult {
    pub ks: Vec<usize>,
    /// Mean prediction error per K across repetitions; NaN for failed Ks.
    pub mean_error: Vec<f64>,
    /// Variance of the per-repetition error across repetitions.
    pub var_error: Vec<f64>,
    /// First failure reason per K, if any fold in any repetition failed.
    pub failures: Vec<Option<String>>,
    /// Smallest K attaining the minimum mean error among Ks with no failed
    /// folds; `None` if every K failed somewhere.
    pub best_k: Option<usize>,
}

/// Estimates out-of-sample prediction error per candidate K and selects the
/// minimizer (ties broken toward the smaller K).
///
/// Recoverable per-fold failures (a fold that cannot support some K) only
/// void that K's candidacy; systematic failures abort the whole run, since a
/// fitting failure at one fold would likely recur at all of them and masking
/// it risks a silently wrong selection.
pub fn cross_validate(
    x: ArrayView2<f64>,
    ks: &[usize],
    settings: &CvSettings,
) -> Result<CvResult, SoupError> {
    validate_input(x, ks)?;
    let n = x.nrows();
    let p = x.ncols();
    if settings.seeds.is_empty() {
        return Err(SoupError::InvalidInput(
            "at least one repetition seed is required".into(),
        ));
    }
    if settings.nfold < 2 || settings.nfold > n {
        return Err(SoupError::InvalidInput(format!(
            "nfold must be in [2, {n}], got {}",
            settings.nfold
        )));
    }
    if p < 2 {
        return Err(SoupError::InvalidInput(
            "at least two features are required to mask a holdout slice".into(),
        ));
    }
    let max_k = ks.iter().copied().max().unwrap_or(0);
    let largest_fold = n.div_ceil(settings.nfold);
    if n - largest_fold < max_k {
        return Err(SoupError::InvalidInput(format!(
            "held-in folds of {} samples cannot support K = {max_k}",
            n - largest_fold
        )));
    }

    log::info!(
        "cross-validating K ∈ {ks:?} with {} folds × {} repetitions",
        settings.nfold,
        settings.seeds.len()
    );

    let pool = bounded_pool(settings.soup.workers, settings.nfold)?;
    let mut rep_errors: Vec<Vec<f64>> = vec![Vec::new(); ks.len()];
    let mut failures: Vec<Option<String>> = vec![None; ks.len()];

    for (rep, &seed) in settings.seeds.iter().enumerate() {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let folds = sample_folds(n, settings.nfold, &mut rng);
        let (fit_features, eval_features) = feature_split(p, &mut rng);

        let fold_scores: Vec<Vec<Result<f64, String>>> = pool.install(|| {
            folds
                .par_iter()
                .map(|held_out| {
                    score_fold(x, held_out, &fit_features, &eval_features, ks, &settings.soup)
                })
                .collect::<Result<Vec<_>, SoupError>>()
        })?;

        for (j, &k) in ks.iter().enumerate() {
            let mut total = 0.0;
            let mut ok = true;
            for per_fold in &fold_scores {
                match &per_fold[j] {
                    Ok(err) => total += err,
                    Err(reason) => {
                        if failures[j].is_none() {
                            failures[j] = Some(reason.clone());
                        }
                        ok = false;
                    }
                }
            }
            if ok {
                let mean = total / fold_scores.len() as f64;
                log::debug!("rep {rep}: K = {k} mean fold error {mean:.6e}");
                rep_errors[j].push(mean);
            }
        }
    }

    let reps = settings.seeds.len();
    let mut mean_error = vec![f64::NAN; ks.len()];
    let mut var_error = vec![f64::NAN; ks.len()];
    for j in 0..ks.len() {
        if failures[j].is_some() {
            continue;
        }
        let errs = &rep_errors[j];
        debug_assert_eq!(errs.len(), reps);
        let mean = errs.iter().sum::<f64>() / reps as f64;
        let var = if reps > 1 {
            errs.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / (reps - 1) as f64
        } else {
            0.0
        };
        mean_error[j] = mean;
        var_error[j] = var;
    }

    let best_k = select_best_k(ks, &mean_error, &failures);
    if let Some(k) = best_k {
        log::info!("cross-validation selected K = {k}");
    } else {
        log::warn!("cross-validation could not select any K: all candidates failed");
    }

    Ok(CvResult {
        ks: ks.to_vec(),
        mean_error,
        var_error,
        failures,
        best_k,
    })
}

/// Fits every candidate K on the held-in samples and scores the held-out
/// samples' eval-half reconstruction. Recoverable failures come back as
/// per-K reasons; anything systematic propagates as a hard error.
fn score_fold(
    x: ArrayView2<f64>,
    held_out: &[usize],
    fit_features: &[usize],
    eval_features: &[usize],
    ks: &[usize],
    soup: &SoupSettings,
) -> Result<Vec<Result<f64, String>>, SoupError> {
    let n = x.nrows();
    let mut out_mask = vec![false; n];
    for &i in held_out {
        out_mask[i] = true;
    }
    let held_in: Vec<usize> = (0..n).filter(|&i| !out_mask[i]).collect();

    let x_in = x.select(Axis(0), &held_in);
    // Held-out rows are scored against centers fitted in unit-scaled row
    // space, so they are unit-scaled before the feature slicing.
    let x_out = unit_rows(x.select(Axis(0), held_out).view());
    let x_out_fit = x_out.select(Axis(1), fit_features);
    let x_out_eval = x_out.select(Axis(1), eval_features);

    let mut scores = Vec::with_capacity(ks.len());
    for &k in ks {
        let anchors = match select_anchors(x_in.view(), k, &soup.purity) {
            Ok(anchors) => anchors,
            Err(err) if err.is_recoverable() => {
                scores.push(Err(err.to_string()));
                continue;
            }
            Err(err) => return Err(err),
        };
        let state = fit_memberships(x_in.view(), &anchors, &soup.solver)?;

        // Project each held-out sample onto the fitted centers using only the
        // fit-half features, then score on the complementary slice.
        let centers_fit = state.centers.select(Axis(1), fit_features);
        let centers_eval = state.centers.select(Axis(1), eval_features);
        let theta_hat = membership_rows(x_out_fit.view(), centers_fit.view())?;
        let residual = &x_out_eval - &theta_hat.dot(&centers_eval);
        let err = residual.mapv(|v| v * v).mean().unwrap_or(0.0);
        scores.push(Ok(err));
    }
    Ok(scores)
}

/// Smallest K attaining the minimum mean error among non-failed candidates.
fn select_best_k(ks: &[usize], mean_error: &[f64], failures: &[Option<String>]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    let mut order: Vec<usize> = (0..ks.len()).collect();
    order.sort_by_key(|&j| ks[j]);
    for j in order {
        if failures[j].is_some() {
            continue;
        }
        let err = mean_error[j];
        if best.is_none_or(|(_, b)| err < b) {
            best = Some((ks[j], err));
        }
    }
    best.map(|(k, _)| k)
}

/// Shuffled partition of `0..n` into `nfold` roughly-equal folds; the first
/// `n % nfold` folds take the extra sample.
fn sample_folds(n: usize, nfold: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    let base = n / nfold;
    let extra = n % nfold;
    let mut folds = Vec::with_capacity(nfold);
    let mut start = 0;
    for f in 0..nfold {
        let size = base + usize::from(f < extra);
        folds.push(indices[start..start + size].to_vec());
        start += size;
    }
    folds
}

/// Shuffled split of `0..p` into a fit half and an eval half, both non-empty.
fn feature_split(p: usize, rng: &mut ChaCha8Rng) -> (Vec<usize>, Vec<usize>) {
    let mut features: Vec<usize> = (0..p).collect();
    features.shuffle(rng);
    let cut = (p / 2).max(1);
    let eval = features.split_off(cut);
    (features, eval)
}
