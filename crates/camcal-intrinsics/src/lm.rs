//! Dense Levenberg-Marquardt for small least-squares problems.
//!
//! Solves the Marquardt-scaled normal equations
//! `(JᵀJ + λ diag(JᵀJ)) δ = -Jᵀr` over the free parameters only.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// A residual function with a Jacobian.
pub trait LeastSquaresProblem {
    fn num_params(&self) -> usize;

    fn num_residuals(&self) -> usize;

    /// Fill `out` (length `num_residuals`) for `params`.
    fn residuals(&self, params: &[f64], out: &mut [f64]);

    /// Fill `jac` (`num_residuals × num_params`) for `params`.
    fn jacobian(&self, params: &[f64], jac: &mut DMatrix<f64>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Relative cost decrease below tolerance.
    CostConverged,
    /// Largest gradient component below tolerance.
    GradientConverged,
    /// Step too small relative to the parameters.
    StepConverged,
    MaxIterations,
    /// No descent step found before the damping limit.
    LambdaMaxExceeded,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmOptions {
    pub max_iterations: usize,
    pub lambda_init: f64,
    pub lambda_factor: f64,
    pub lambda_max: f64,
    pub cost_tolerance: f64,
    pub gradient_tolerance: f64,
    pub step_tolerance: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            lambda_init: 1e-3,
            lambda_factor: 10.0,
            lambda_max: 1e10,
            cost_tolerance: 1e-12,
            gradient_tolerance: 1e-10,
            step_tolerance: 1e-12,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LmReport {
    pub params: Vec<f64>,
    /// `0.5 * Σ r²` at `params`.
    pub cost: f64,
    pub iterations: usize,
    pub termination: TerminationReason,
}

/// Minimize `problem` starting at `x0`. Parameters with `free[i] == false`
/// keep their initial value.
pub fn minimize<P: LeastSquaresProblem>(
    problem: &P,
    x0: &[f64],
    free: &[bool],
    opts: &LmOptions,
) -> LmReport {
    let n = problem.num_params();
    let m = problem.num_residuals();
    debug_assert_eq!(x0.len(), n);
    debug_assert_eq!(free.len(), n);

    let active: Vec<usize> = (0..n).filter(|&i| free[i]).collect();
    let mut x = x0.to_vec();
    let mut r = vec![0.0; m];
    problem.residuals(&x, &mut r);
    let mut cost = half_sq_norm(&r);

    if active.is_empty() || m == 0 {
        return report(x, cost, 0, TerminationReason::GradientConverged);
    }

    let mut jac_full = DMatrix::<f64>::zeros(m, n);
    let mut r_new = vec![0.0; m];
    let mut lambda = opts.lambda_init;

    for iter in 0..opts.max_iterations {
        problem.jacobian(&x, &mut jac_full);
        let jac = jac_full.select_columns(active.iter());
        let rv = DVector::from_column_slice(&r);
        let jtj = jac.transpose() * &jac;
        let g = jac.transpose() * &rv;

        if g.amax() < opts.gradient_tolerance {
            return report(x, cost, iter, TerminationReason::GradientConverged);
        }

        loop {
            let mut damped = jtj.clone();
            for k in 0..active.len() {
                damped[(k, k)] += lambda * jtj[(k, k)].max(1e-9);
            }
            let step = damped.cholesky().map(|c| c.solve(&(-&g)));

            if let Some(delta) = step.filter(|d| d.iter().all(|v| v.is_finite())) {
                let mut x_new = x.clone();
                for (k, &i) in active.iter().enumerate() {
                    x_new[i] += delta[k];
                }
                problem.residuals(&x_new, &mut r_new);
                let cost_new = half_sq_norm(&r_new);

                if cost_new.is_finite() && cost_new < cost {
                    let x_norm: f64 = active.iter().map(|&i| x[i] * x[i]).sum::<f64>().sqrt();
                    let decrease = cost - cost_new;
                    x = x_new;
                    std::mem::swap(&mut r, &mut r_new);
                    let prev = cost;
                    cost = cost_new;
                    lambda = (lambda / opts.lambda_factor).max(1e-15);

                    if decrease <= opts.cost_tolerance * prev {
                        return report(x, cost, iter + 1, TerminationReason::CostConverged);
                    }
                    if delta.norm() <= opts.step_tolerance * (x_norm + opts.step_tolerance) {
                        return report(x, cost, iter + 1, TerminationReason::StepConverged);
                    }
                    break;
                }
            }

            lambda *= opts.lambda_factor;
            if lambda > opts.lambda_max {
                return report(x, cost, iter + 1, TerminationReason::LambdaMaxExceeded);
            }
        }
    }

    report(x, cost, opts.max_iterations, TerminationReason::MaxIterations)
}

fn report(params: Vec<f64>, cost: f64, iterations: usize, termination: TerminationReason) -> LmReport {
    LmReport {
        params,
        cost,
        iterations,
        termination,
    }
}

fn half_sq_norm(r: &[f64]) -> f64 {
    0.5 * r.iter().map(|v| v * v).sum::<f64>()
}

/// Central-difference step for parameter value `v`.
#[inline]
pub(crate) fn diff_step(v: f64) -> f64 {
    1e-6 * v.abs().max(1e-2)
}
