//! Limited-memory BFGS with Armijo backtracking.
//!
//! Small and allocation-light; the weekday objective is smooth and convex,
//! so a backtracking line search is enough.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct LbfgsConfig {
    /// Correction pairs kept for the inverse-Hessian estimate.
    pub memory: usize,
    pub max_iter: usize,
    /// Stop when the largest gradient component falls below this.
    pub grad_tol: f64,
    /// Stop when the relative objective decrease falls below this.
    pub f_tol: f64,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            memory: 10,
            max_iter: 1000,
            grad_tol: 1e-8,
            f_tol: 1e-14,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Minimum {
    pub x: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn max_abs(a: &[f64]) -> f64 {
    a.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
}

struct Pair {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

/// Minimize `f`, which writes the gradient into its second argument and
/// returns the objective value.
///
/// A non-finite starting value returns immediately with `converged = false`.
pub fn minimize<F>(f: F, x0: Vec<f64>, config: &LbfgsConfig) -> Minimum
where
    F: Fn(&[f64], &mut [f64]) -> f64,
{
    let n = x0.len();
    let mut x = x0;
    let mut g = vec![0.0; n];
    let mut fx = f(&x, &mut g);
    if !fx.is_finite() {
        return Minimum {
            x,
            value: fx,
            iterations: 0,
            converged: false,
        };
    }

    let mut history: VecDeque<Pair> = VecDeque::with_capacity(config.memory);
    let mut x_new = vec![0.0; n];
    let mut g_new = vec![0.0; n];
    let mut converged = false;
    let mut iterations = 0;

    while iterations < config.max_iter {
        if max_abs(&g) < config.grad_tol {
            converged = true;
            break;
        }
        iterations += 1;

        // Two-loop recursion: r = H * g
        let mut q = g.clone();
        let mut alphas = Vec::with_capacity(history.len());
        for pair in history.iter().rev() {
            let a = pair.rho * dot(&pair.s, &q);
            for (qi, yi) in q.iter_mut().zip(&pair.y) {
                *qi -= a * yi;
            }
            alphas.push(a);
        }
        let gamma = match history.back() {
            Some(last) => dot(&last.s, &last.y) / dot(&last.y, &last.y),
            None => 1.0 / dot(&g, &g).sqrt().max(1.0),
        };
        let mut r: Vec<f64> = q.iter().map(|v| gamma * v).collect();
        for (pair, a) in history.iter().zip(alphas.iter().rev()) {
            let b = pair.rho * dot(&pair.y, &r);
            for (ri, si) in r.iter_mut().zip(&pair.s) {
                *ri += si * (a - b);
            }
        }

        let mut direction: Vec<f64> = r.iter().map(|v| -v).collect();
        let mut slope = dot(&direction, &g);
        if slope >= 0.0 || slope.is_nan() {
            history.clear();
            direction = g.iter().map(|v| -v).collect();
            slope = -dot(&g, &g);
        }

        let mut step = 1.0;
        let mut f_new = f64::INFINITY;
        let mut accepted = false;
        for _ in 0..60 {
            for i in 0..n {
                x_new[i] = x[i] + step * direction[i];
            }
            f_new = f(&x_new, &mut g_new);
            if f_new.is_finite() && f_new <= fx + 1e-4 * step * slope {
                accepted = true;
                break;
            }
            step *= 0.5;
        }
        if !accepted {
            break;
        }

        let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        if sy > 1e-12 {
            if history.len() == config.memory {
                history.pop_front();
            }
            history.push_back(Pair { s, y, rho: 1.0 / sy });
        }

        let decrease = fx - f_new;
        std::mem::swap(&mut x, &mut x_new);
        std::mem::swap(&mut g, &mut g_new);
        fx = f_new;

        if decrease.abs() <= config.f_tol * fx.abs().max(1.0) {
            converged = true;
            break;
        }
    }

    Minimum {
        x,
        value: fx,
        iterations,
        converged,
    }
}
