//! Two-sample drift statistics.

/// Outcome of one two-sample comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftTest {
    pub statistic: f64,
    pub p_value: f64,
}

/// A two-sample test between a reference and a current sample.
pub trait DriftStatistic: Send + Sync {
    fn name(&self) -> &str;

    /// `None` when either sample has no finite values.
    fn test(&self, reference: &[f64], current: &[f64]) -> Option<DriftTest>;
}

/// Two-sample Kolmogorov-Smirnov test with the asymptotic p-value.
#[derive(Debug, Clone, Copy, Default)]
pub struct KsTest;

impl DriftStatistic for KsTest {
    fn name(&self) -> &str {
        "ks"
    }

    fn test(&self, reference: &[f64], current: &[f64]) -> Option<DriftTest> {
        let a = sorted_finite(reference);
        let b = sorted_finite(current);
        if a.is_empty() || b.is_empty() {
            return None;
        }
        let d = ks_statistic(&a, &b);
        let (n1, n2) = (a.len() as f64, b.len() as f64);
        let n_eff = (n1 * n2) / (n1 + n2);
        let lambda = d * n_eff.sqrt();
        Some(DriftTest {
            statistic: d,
            p_value: ks_p_value(lambda),
        })
    }
}

fn sorted_finite(values: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    v.sort_by(f64::total_cmp);
    v
}

/// Maximum distance between the empirical CDFs of two sorted samples.
pub fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0usize, 0usize);
    let mut d = 0.0f64;
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        // step past every copy of x in both samples before comparing
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        d = d.max((i as f64 / n1 - j as f64 / n2).abs());
    }
    d
}

/// Kolmogorov distribution tail: `2 * sum (-1)^(k+1) exp(-2 k^2 lambda^2)`.
pub fn ks_p_value(lambda: f64) -> f64 {
    if lambda <= 0.0 {
        return 1.0;
    }
    let mut p = 0.0;
    for k in 1..=100 {
        let sign = if k % 2 == 1 { 1.0 } else { -1.0 };
        let term = sign * (-2.0 * f64::from(k).powi(2) * lambda.powi(2)).exp();
        p += term;
        if term.abs() < 1e-10 {
            break;
        }
    }
    (2.0 * p).clamp(0.0, 1.0)
}
