//! Tree-structured Parzen Estimator.
//!
//! The first `startup` suggestions are uniform. After that, completed trials are
//! split at the `gamma` quantile of their scores into good and bad sets, and each
//! parameter is drawn from candidates around good values, keeping the one that
//! maximizes `l(x) / g(x)`.

use super::space::{ParamDomain, Point, SearchSpace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const N_CANDIDATES: usize = 24;

#[derive(Debug, Clone)]
pub struct TpeSampler {
    space: SearchSpace,
    gamma: f64,
    startup: usize,
    kde_bandwidth: f64,
    rng: StdRng,
}

impl TpeSampler {
    pub fn new(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            gamma: 0.25,
            startup: 10,
            kde_bandwidth: 1.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma.clamp(0.01, 0.99);
        self
    }

    pub fn with_startup(mut self, startup: usize) -> Self {
        self.startup = startup;
        self
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// Suggest the next point given the completed `(point, score)` pairs so far (lower is better).
    pub fn suggest(&mut self, completed: &[(Point, f64)]) -> Point {
        let scored: Vec<&(Point, f64)> = completed.iter().filter(|(_, s)| s.is_finite()).collect();
        if scored.len() < self.startup.max(2) {
            return self.space.sample_uniform(&mut self.rng);
        }

        let mut sorted = scored;
        // stable sort keeps earlier trials first on ties
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1));
        let n_good = ((sorted.len() as f64) * self.gamma).ceil() as usize;
        let n_good = n_good.clamp(1, sorted.len() - 1);
        let (good, bad) = sorted.split_at(n_good);

        let mut point = Point::new();
        let params: Vec<(String, ParamDomain)> = self
            .space
            .iter()
            .map(|(n, d)| (n.to_string(), d.clone()))
            .collect();
        for (name, domain) in params {
            let good_vals: Vec<f64> = good.iter().filter_map(|(p, _)| p.get(&name).copied()).collect();
            let bad_vals: Vec<f64> = bad.iter().filter_map(|(p, _)| p.get(&name).copied()).collect();
            let value = match domain {
                ParamDomain::Float { low, high, log } => {
                    let tf = |v: f64| if log { v.max(f64::MIN_POSITIVE).ln() } else { v };
                    let g: Vec<f64> = good_vals.iter().copied().map(tf).collect();
                    let b: Vec<f64> = bad_vals.iter().copied().map(tf).collect();
                    let v = sample_continuous(&g, &b, tf(low), tf(high), self.kde_bandwidth, &mut self.rng);
                    let v = if log { v.exp() } else { v };
                    v.clamp(low, high)
                }
                ParamDomain::Int { low, step, .. } => {
                    let n = domain.grid_len().unwrap_or(1);
                    let to_idx = |v: f64| (((v.round() as i64 - low) / step).max(0) as usize).min(n - 1);
                    let g: Vec<usize> = good_vals.iter().copied().map(to_idx).collect();
                    let b: Vec<usize> = bad_vals.iter().copied().map(to_idx).collect();
                    let idx = sample_discrete(&g, &b, n, &mut self.rng);
                    (low + step * idx as i64) as f64
                }
            };
            point.insert(name, value);
        }
        point
    }
}

/// Gaussian KDE density of `x` under `values`, up to a constant.
pub fn kde_score(x: f64, values: &[f64], bandwidth: f64) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    values
        .iter()
        .map(|&v| (-(x - v).powi(2) / (2.0 * bandwidth.powi(2))).exp())
        .sum::<f64>()
        / values.len() as f64
}

fn sample_continuous<R: Rng>(good: &[f64], bad: &[f64], low: f64, high: f64, kde_bw: f64, rng: &mut R) -> f64 {
    if good.is_empty() || high <= low {
        return if high <= low { low } else { rng.gen_range(low..=high) };
    }
    let bandwidth = kde_bw * (high - low) / 10.0;
    let mut best_value = low;
    let mut best_ei = f64::NEG_INFINITY;
    for _ in 0..N_CANDIDATES {
        let base = good[rng.gen_range(0..good.len())];
        // Box-Muller
        let u1: f64 = rng.gen::<f64>().max(1e-10);
        let u2: f64 = rng.gen();
        let noise = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos() * bandwidth;
        let candidate = (base + noise).clamp(low, high);
        let ei = kde_score(candidate, good, bandwidth) / (kde_score(candidate, bad, bandwidth) + 1e-10);
        if ei > best_ei {
            best_ei = ei;
            best_value = candidate;
        }
    }
    best_value
}

/// Draw a grid index with probability proportional to Laplace-smoothed `l / g` counts.
fn sample_discrete<R: Rng>(good: &[usize], bad: &[usize], n: usize, rng: &mut R) -> usize {
    let mut good_counts = vec![1.0; n];
    let mut bad_counts = vec![1.0; n];
    for &i in good {
        good_counts[i] += 1.0;
    }
    for &i in bad {
        bad_counts[i] += 1.0;
    }
    let weights: Vec<f64> = good_counts.iter().zip(&bad_counts).map(|(l, g)| l / g).collect();
    let total: f64 = weights.iter().sum();
    let r: f64 = rng.gen::<f64>() * total;
    let mut cumsum = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumsum += w;
        if r < cumsum {
            return i;
        }
    }
    n - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpaceConfig;

    fn space() -> SearchSpace {
        SearchSpace::from_config(&SpaceConfig::default()).unwrap()
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = TpeSampler::new(space(), 42).with_startup(3);
        let mut b = TpeSampler::new(space(), 42).with_startup(3);
        let mut hist_a = Vec::new();
        let mut hist_b = Vec::new();
        for i in 0..8 {
            let pa = a.suggest(&hist_a);
            let pb = b.suggest(&hist_b);
            assert_eq!(pa, pb);
            let score = pa["dropout"] + i as f64 * 0.01;
            hist_a.push((pa, score));
            hist_b.push((pb, score));
        }
    }

    #[test]
    fn guided_points_stay_in_space() {
        let s = space();
        let mut sampler = TpeSampler::new(s.clone(), 7).with_startup(2);
        let mut hist: Vec<(Point, f64)> = Vec::new();
        for _ in 0..30 {
            let p = sampler.suggest(&hist);
            for (name, domain) in s.iter() {
                assert!(domain.contains(p[name]), "{name} = {}", p[name]);
            }
            let score = (p["learning_rate"].ln() - (1e-3f64).ln()).abs();
            hist.push((p, score));
        }
    }

    #[test]
    fn guided_sampling_concentrates_near_good_region() {
        let s = SearchSpace::new().float("x", 0.0, 1.0, false).unwrap();
        let mut sampler = TpeSampler::new(s, 3).with_startup(10);
        let mut hist: Vec<(Point, f64)> = Vec::new();
        for _ in 0..60 {
            let p = sampler.suggest(&hist);
            let score = (p["x"] - 0.2).abs();
            hist.push((p, score));
        }
        let tail_mean: f64 = hist[40..].iter().map(|(p, _)| (p["x"] - 0.2).abs()).sum::<f64>() / 20.0;
        assert!(tail_mean < 0.2, "late suggestions mean distance {tail_mean}");
    }

    #[test]
    fn kde_prefers_nearby_points() {
        let vals = [0.5];
        assert!(kde_score(0.5, &vals, 0.1) > kde_score(0.9, &vals, 0.1));
        assert_eq!(kde_score(0.3, &[], 0.1), 1.0);
    }

    #[test]
    fn discrete_sampler_favors_good_bins() {
        let mut rng = StdRng::seed_from_u64(1);
        let good = vec![2; 20];
        let bad = vec![0, 1, 3, 4];
        let hits = (0..500).filter(|_| sample_discrete(&good, &bad, 5, &mut rng) == 2).count();
        assert!(hits > 300, "hits = {hits}");
    }
}
