use ndarray::{Array1, Array2, ArrayView1};
use std::f64::consts::PI;
use tracing::debug;

use crate::error::{RegimeError, RegimeResult};

/// Probabilities are floored here so no transition or start state is ever
/// strictly impossible (keeps every log finite).
const PROB_FLOOR: f64 = 1e-10;

/// Hidden Markov Model with full-covariance Gaussian emissions, fitted by
/// Baum-Welch in log space.
#[derive(Debug, Clone)]
pub struct GaussianHMM {
    pub n_states: usize,
    pub n_features: usize,
    /// Row-stochastic transition matrix (n_states x n_states)
    pub transition: Array2<f64>,
    pub start_prob: Array1<f64>,
    /// Mean vectors (n_states x n_features)
    pub means: Array2<f64>,
    /// One full covariance matrix per state
    pub covars: Vec<Array2<f64>>,
    covar_invs: Vec<Array2<f64>>,
    log_dets: Vec<f64>,
    pub tol: f64,
    pub max_iter: usize,
    /// Added to every covariance diagonal after each update
    pub min_covar: f64,
}

/// Outcome of a Baum-Welch run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitStats {
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl GaussianHMM {
    /// Uniform start, self-persistent transitions, zero means, identity covariances.
    pub fn new(n_states: usize, n_features: usize) -> Self {
        let start_prob = Array1::from_elem(n_states, 1.0 / n_states as f64);

        let mut transition = if n_states > 1 {
            Array2::from_elem((n_states, n_states), 0.5 / (n_states - 1) as f64)
        } else {
            Array2::from_elem((1, 1), 1.0)
        };
        if n_states > 1 {
            for i in 0..n_states {
                transition[[i, i]] = 0.5;
            }
        }

        Self {
            n_states,
            n_features,
            transition,
            start_prob,
            means: Array2::zeros((n_states, n_features)),
            covars: vec![Array2::eye(n_features); n_states],
            covar_invs: vec![Array2::eye(n_features); n_states],
            log_dets: vec![0.0; n_states],
            tol: 1e-4,
            max_iter: 100,
            min_covar: 1e-3,
        }
    }

    pub fn with_training(mut self, max_iter: usize, tol: f64, min_covar: f64) -> Self {
        self.max_iter = max_iter;
        self.tol = tol;
        self.min_covar = min_covar;
        self
    }

    /// Rebuild a model from stored parameters, validating shapes and
    /// factorising every covariance.
    pub fn from_parameters(
        start_prob: Array1<f64>,
        transition: Array2<f64>,
        means: Array2<f64>,
        covars: Vec<Array2<f64>>,
    ) -> RegimeResult<Self> {
        let n_states = start_prob.len();
        let n_features = means.ncols();

        if transition.shape() != [n_states, n_states] {
            return Err(RegimeError::InvalidModel(format!(
                "transition matrix is {:?}, expected {}x{}",
                transition.shape(),
                n_states,
                n_states
            )));
        }
        if means.nrows() != n_states {
            return Err(RegimeError::InvalidModel(format!(
                "means have {} rows, expected {}",
                means.nrows(),
                n_states
            )));
        }
        if covars.len() != n_states
            || covars.iter().any(|c| c.shape() != [n_features, n_features])
        {
            return Err(RegimeError::InvalidModel(
                "covariance matrices do not match state/feature counts".to_string(),
            ));
        }
        check_stochastic(start_prob.view(), "start probabilities")?;
        for row in transition.rows() {
            check_stochastic(row, "transition row")?;
        }

        let mut hmm = Self::new(n_states, n_features);
        hmm.start_prob = start_prob;
        hmm.transition = transition;
        hmm.means = means;
        hmm.covars = covars;
        hmm.refresh_cache()?;
        Ok(hmm)
    }

    /// Seed means and covariances from the data. Observations are split
    /// into quantile bands of `sort_feature`, then refined with k-means.
    /// Deterministic for a given input.
    pub fn init_from_observations(
        &mut self,
        observations: &Array2<f64>,
        sort_feature: usize,
    ) -> RegimeResult<()> {
        self.check_observations(observations)?;
        if sort_feature >= self.n_features {
            return Err(RegimeError::InvalidModel(format!(
                "sort feature {} out of range",
                sort_feature
            )));
        }

        let n_obs = observations.nrows();
        let mut order: Vec<usize> = (0..n_obs).collect();
        order.sort_by(|&a, &b| {
            observations[[a, sort_feature]].total_cmp(&observations[[b, sort_feature]])
        });
        let mut labels = vec![0usize; n_obs];
        for (rank, &idx) in order.iter().enumerate() {
            labels[idx] = (rank * self.n_states) / n_obs;
        }

        let global_mean = column_means(observations);
        let global_cov = weighted_covariance(observations, &global_mean, None);

        for _ in 0..10 {
            self.update_means_from_labels(observations, &labels, &global_mean);

            let mut changed = false;
            for i in 0..n_obs {
                let obs = observations.row(i);
                let mut min_dist = f64::INFINITY;
                let mut best_state = labels[i];
                for state in 0..self.n_states {
                    let dist: f64 = obs
                        .iter()
                        .zip(self.means.row(state).iter())
                        .map(|(o, m)| (o - m).powi(2))
                        .sum();
                    if dist < min_dist {
                        min_dist = dist;
                        best_state = state;
                    }
                }
                if best_state != labels[i] {
                    labels[i] = best_state;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        self.update_means_from_labels(observations, &labels, &global_mean);

        for state in 0..self.n_states {
            let members: Vec<usize> = (0..n_obs).filter(|&i| labels[i] == state).collect();
            let mut cov = if members.len() > self.n_features {
                let weights = Array1::from_shape_fn(n_obs, |i| {
                    if labels[i] == state {
                        1.0
                    } else {
                        0.0
                    }
                });
                let mean = self.means.row(state).to_owned();
                weighted_covariance(observations, &mean, Some(&weights))
            } else {
                global_cov.clone()
            };
            for j in 0..self.n_features {
                cov[[j, j]] += self.min_covar;
            }
            self.covars[state] = cov;
        }

        self.refresh_cache()
    }

    fn update_means_from_labels(
        &mut self,
        observations: &Array2<f64>,
        labels: &[usize],
        fallback: &Array1<f64>,
    ) {
        let mut sums = Array2::<f64>::zeros((self.n_states, self.n_features));
        let mut counts = vec![0usize; self.n_states];
        for (i, &label) in labels.iter().enumerate() {
            for j in 0..self.n_features {
                sums[[label, j]] += observations[[i, j]];
            }
            counts[label] += 1;
        }
        for state in 0..self.n_states {
            for j in 0..self.n_features {
                self.means[[state, j]] = if counts[state] > 0 {
                    sums[[state, j]] / counts[state] as f64
                } else {
                    fallback[j]
                };
            }
        }
    }

    /// Recompute cached inverses and log-determinants. Covariances that
    /// are not positive definite get extra diagonal loading.
    fn refresh_cache(&mut self) -> RegimeResult<()> {
        self.covar_invs.clear();
        self.log_dets.clear();
        for state in 0..self.n_states {
            let mut jitter = 0.0;
            let factor = loop {
                let mut cov = self.covars[state].clone();
                for j in 0..self.n_features {
                    cov[[j, j]] += jitter;
                }
                if let Some(l) = cholesky(&cov) {
                    self.covars[state] = cov;
                    break l;
                }
                jitter = if jitter == 0.0 { self.min_covar.max(1e-9) } else { jitter * 10.0 };
                if jitter > 1e6 {
                    return Err(RegimeError::Numerical(format!(
                        "covariance of state {} is not positive definite",
                        state
                    )));
                }
            };
            let log_det = 2.0 * factor.diag().iter().map(|d| d.ln()).sum::<f64>();
            self.covar_invs.push(inverse_from_cholesky(&factor));
            self.log_dets.push(log_det);
        }
        Ok(())
    }

    fn check_observations(&self, observations: &Array2<f64>) -> RegimeResult<()> {
        if observations.ncols() != self.n_features {
            return Err(RegimeError::InvalidModel(format!(
                "observations have {} features, model expects {}",
                observations.ncols(),
                self.n_features
            )));
        }
        if observations.nrows() == 0 {
            return Err(RegimeError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }
        Ok(())
    }

    fn log_emission(&self, obs: ArrayView1<f64>, state: usize) -> f64 {
        let diff = &obs - &self.means.row(state);
        let inv = &self.covar_invs[state];
        let mut mahal = 0.0;
        for i in 0..self.n_features {
            for j in 0..self.n_features {
                mahal += diff[i] * inv[[i, j]] * diff[j];
            }
        }
        -0.5 * (self.n_features as f64 * (2.0 * PI).ln() + self.log_dets[state] + mahal)
    }

    /// log b_j(o_t) for every observation and state.
    fn log_emissions(&self, observations: &Array2<f64>) -> Array2<f64> {
        Array2::from_shape_fn((observations.nrows(), self.n_states), |(t, state)| {
            self.log_emission(observations.row(t), state)
        })
    }

    fn forward(&self, log_b: &Array2<f64>) -> (Array2<f64>, f64) {
        let n_obs = log_b.nrows();
        let log_a = self.transition.mapv(f64::ln);
        let mut log_alpha = Array2::from_elem((n_obs, self.n_states), f64::NEG_INFINITY);
        let mut terms = vec![0.0; self.n_states];

        for state in 0..self.n_states {
            log_alpha[[0, state]] = self.start_prob[state].ln() + log_b[[0, state]];
        }

        for t in 1..n_obs {
            for j in 0..self.n_states {
                for i in 0..self.n_states {
                    terms[i] = log_alpha[[t - 1, i]] + log_a[[i, j]];
                }
                log_alpha[[t, j]] = log_sum_exp(&terms) + log_b[[t, j]];
            }
        }

        let log_prob = log_sum_exp(&log_alpha.row(n_obs - 1).to_vec());
        (log_alpha, log_prob)
    }

    fn backward(&self, log_b: &Array2<f64>) -> Array2<f64> {
        let n_obs = log_b.nrows();
        let log_a = self.transition.mapv(f64::ln);
        let mut log_beta = Array2::zeros((n_obs, self.n_states));
        let mut terms = vec![0.0; self.n_states];

        for t in (0..n_obs - 1).rev() {
            for i in 0..self.n_states {
                for j in 0..self.n_states {
                    terms[j] = log_a[[i, j]] + log_b[[t + 1, j]] + log_beta[[t + 1, j]];
                }
                log_beta[[t, i]] = log_sum_exp(&terms);
            }
        }

        log_beta
    }

    /// Filtered state distribution P(state_T | o_1..o_T) at the last observation.
    pub fn filtered_posterior(&self, observations: &Array2<f64>) -> RegimeResult<Array1<f64>> {
        self.check_observations(observations)?;
        let (log_alpha, log_prob) = self.forward(&self.log_emissions(observations));
        finite(log_prob, "log-likelihood")?;

        let last = log_alpha.row(log_alpha.nrows() - 1);
        let norm = log_sum_exp(&last.to_vec());
        let mut posterior = last.mapv(|v| (v - norm).exp());
        let total = posterior.sum();
        posterior /= total;
        Ok(posterior)
    }

    /// Baum-Welch EM. Parameters must be seeded first (see
    /// `init_from_observations`).
    pub fn fit(&mut self, observations: &Array2<f64>) -> RegimeResult<FitStats> {
        self.check_observations(observations)?;
        let n_obs = observations.nrows();
        if n_obs < 2 {
            return Err(RegimeError::InsufficientData {
                required: 2,
                actual: n_obs,
            });
        }

        let mut prev_log_prob = f64::NEG_INFINITY;

        for iteration in 0..self.max_iter {
            let log_b = self.log_emissions(observations);
            let (log_alpha, log_prob) = self.forward(&log_b);
            finite(log_prob, "log-likelihood")?;
            let log_beta = self.backward(&log_b);

            debug!("EM iteration {}: log-likelihood {:.4}", iteration + 1, log_prob);

            if (log_prob - prev_log_prob).abs() < self.tol {
                return Ok(FitStats {
                    log_likelihood: log_prob,
                    iterations: iteration + 1,
                    converged: true,
                });
            }
            prev_log_prob = log_prob;

            // E-step
            let mut gamma = Array2::zeros((n_obs, self.n_states));
            let mut terms = vec![0.0; self.n_states];
            for t in 0..n_obs {
                for s in 0..self.n_states {
                    terms[s] = log_alpha[[t, s]] + log_beta[[t, s]];
                }
                let log_denom = log_sum_exp(&terms);
                for s in 0..self.n_states {
                    gamma[[t, s]] = (terms[s] - log_denom).exp();
                }
            }

            let log_a = self.transition.mapv(f64::ln);
            let mut xi_sum = Array2::<f64>::zeros((self.n_states, self.n_states));
            for t in 0..n_obs - 1 {
                for i in 0..self.n_states {
                    for j in 0..self.n_states {
                        let log_xi = log_alpha[[t, i]]
                            + log_a[[i, j]]
                            + log_b[[t + 1, j]]
                            + log_beta[[t + 1, j]]
                            - log_prob;
                        xi_sum[[i, j]] += log_xi.exp();
                    }
                }
            }

            // M-step
            let mut start_prob = gamma.row(0).to_owned();
            normalize_with_floor(&mut start_prob);
            self.start_prob = start_prob;

            for i in 0..self.n_states {
                if xi_sum.row(i).sum() > 0.0 {
                    let mut row = xi_sum.row(i).to_owned();
                    normalize_with_floor(&mut row);
                    self.transition.row_mut(i).assign(&row);
                }
            }

            for state in 0..self.n_states {
                let weights = gamma.column(state).to_owned();
                let weight_sum = weights.sum();
                if weight_sum < 1e-10 {
                    continue;
                }

                let mut mean = Array1::zeros(self.n_features);
                for t in 0..n_obs {
                    mean.scaled_add(weights[t], &observations.row(t));
                }
                mean /= weight_sum;

                let mut cov = weighted_covariance(observations, &mean, Some(&weights));
                for j in 0..self.n_features {
                    cov[[j, j]] += self.min_covar;
                }

                self.means.row_mut(state).assign(&mean);
                self.covars[state] = cov;
            }
            self.refresh_cache()?;
        }

        Ok(FitStats {
            log_likelihood: prev_log_prob,
            iterations: self.max_iter,
            converged: false,
        })
    }

    /// Most likely state sequence (Viterbi).
    pub fn predict(&self, observations: &Array2<f64>) -> RegimeResult<Vec<usize>> {
        self.check_observations(observations)?;

        let n_obs = observations.nrows();
        let log_b = self.log_emissions(observations);
        let log_a = self.transition.mapv(f64::ln);
        let mut log_delta = Array2::from_elem((n_obs, self.n_states), f64::NEG_INFINITY);
        let mut psi = Array2::<usize>::zeros((n_obs, self.n_states));

        for state in 0..self.n_states {
            log_delta[[0, state]] = self.start_prob[state].ln() + log_b[[0, state]];
        }

        for t in 1..n_obs {
            for j in 0..self.n_states {
                let mut max_val = f64::NEG_INFINITY;
                let mut max_state = 0;
                for i in 0..self.n_states {
                    let val = log_delta[[t - 1, i]] + log_a[[i, j]];
                    if val > max_val {
                        max_val = val;
                        max_state = i;
                    }
                }
                log_delta[[t, j]] = max_val + log_b[[t, j]];
                psi[[t, j]] = max_state;
            }
        }

        let mut states = vec![0; n_obs];
        let mut max_val = f64::NEG_INFINITY;
        for state in 0..self.n_states {
            if log_delta[[n_obs - 1, state]] > max_val {
                max_val = log_delta[[n_obs - 1, state]];
                states[n_obs - 1] = state;
            }
        }
        for t in (0..n_obs - 1).rev() {
            states[t] = psi[[t + 1, states[t + 1]]];
        }

        Ok(states)
    }

    /// State indices ordered by ascending mean of `feature`.
    pub fn states_sorted_by_feature(&self, feature: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.n_states).collect();
        order.sort_by(|&a, &b| self.means[[a, feature]].total_cmp(&self.means[[b, feature]]));
        order
    }
}

fn finite(value: f64, what: &str) -> RegimeResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RegimeError::Numerical(format!("{} is not finite", what)))
    }
}

fn check_stochastic(row: ArrayView1<f64>, what: &str) -> RegimeResult<()> {
    if row.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return Err(RegimeError::InvalidModel(format!("{} contain invalid values", what)));
    }
    let sum = row.sum();
    if (sum - 1.0).abs() > 1e-6 {
        return Err(RegimeError::InvalidModel(format!(
            "{} sum to {}, expected 1",
            what, sum
        )));
    }
    Ok(())
}

fn normalize_with_floor(probs: &mut Array1<f64>) {
    probs.mapv_inplace(|p| p.max(PROB_FLOOR));
    let sum = probs.sum();
    *probs /= sum;
}

fn column_means(observations: &Array2<f64>) -> Array1<f64> {
    let n = observations.nrows() as f64;
    let mut mean = Array1::zeros(observations.ncols());
    for row in observations.rows() {
        mean += &row;
    }
    mean / n
}

/// Covariance around `mean`, optionally weighted per observation.
fn weighted_covariance(
    observations: &Array2<f64>,
    mean: &Array1<f64>,
    weights: Option<&Array1<f64>>,
) -> Array2<f64> {
    let d = observations.ncols();
    let mut cov = Array2::zeros((d, d));
    let mut total = 0.0;
    for (t, row) in observations.rows().into_iter().enumerate() {
        let w = weights.map_or(1.0, |w| w[t]);
        if w == 0.0 {
            continue;
        }
        let diff = &row - mean;
        for i in 0..d {
            for j in 0..d {
                cov[[i, j]] += w * diff[i] * diff[j];
            }
        }
        total += w;
    }
    if total > 0.0 {
        cov /= total;
    }
    cov
}

/// Lower-triangular L with L Lᵀ = mat, or None if mat is not positive definite.
fn cholesky(mat: &Array2<f64>) -> Option<Array2<f64>> {
    let n = mat.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = mat[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// (L Lᵀ)⁻¹ = L⁻ᵀ L⁻¹
fn inverse_from_cholesky(l: &Array2<f64>) -> Array2<f64> {
    let n = l.nrows();
    let mut l_inv = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        l_inv[[i, i]] = 1.0 / l[[i, i]];
        for j in 0..i {
            let mut sum = 0.0;
            for k in j..i {
                sum -= l[[i, k]] * l_inv[[k, j]];
            }
            l_inv[[i, j]] = sum / l[[i, i]];
        }
    }
    l_inv.t().dot(&l_inv)
}

/// Log-sum-exp trick for numerical stability
pub(crate) fn log_sum_exp(log_values: &[f64]) -> f64 {
    if log_values.is_empty() {
        return f64::NEG_INFINITY;
    }

    let max_val = log_values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }

    let sum_exp: f64 = log_values.iter().map(|&v| (v - max_val).exp()).sum();
    max_val + sum_exp.ln()
}
