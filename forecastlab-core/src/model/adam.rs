/// Adam over a flat parameter vector.
///
/// `θ_t = θ_{t-1} - lr_t * m_t / (√v_t + ε)` with bias-corrected step size
/// `lr_t = lr * √(1 - β2^t) / (1 - β1^t)`.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    t: i32,
    m: Vec<f64>,
    v: Vec<f64>,
}

impl Adam {
    pub fn new(lr: f64, n_params: usize) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            t: 0,
            m: vec![0.0; n_params],
            v: vec![0.0; n_params],
        }
    }

    pub fn step(&mut self, params: &mut [f64], grads: &[f64]) {
        debug_assert_eq!(params.len(), grads.len());
        self.t = self.t.saturating_add(1);
        let lr_t = self.lr * (1.0 - self.beta2.powi(self.t)).sqrt() / (1.0 - self.beta1.powi(self.t));
        for i in 0..params.len() {
            let g = grads[i];
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * g * g;
            params[i] -= lr_t * self.m[i] / (self.v[i].sqrt() + self.epsilon);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimizes_quadratic() {
        // f(x) = (x - 3)^2
        let mut x = vec![0.0];
        let mut opt = Adam::new(0.1, 1);
        for _ in 0..500 {
            let g = vec![2.0 * (x[0] - 3.0)];
            opt.step(&mut x, &g);
        }
        assert!((x[0] - 3.0).abs() < 5e-2, "x = {}", x[0]);
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut x = vec![1.0];
        let mut opt = Adam::new(0.01, 1);
        opt.step(&mut x, &[5.0]);
        assert!((x[0] - 0.99).abs() < 1e-6);
    }
}
