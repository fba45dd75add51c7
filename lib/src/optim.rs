//! Optimizers that drive the canvas pixels towards a lower loss.
//!
//! An [`Optimizer`] only sees a flat parameter vector and an [`Objective`]
//! that computes the loss and its gradient at a point, so the quasi-Newton
//! method can be swapped for a first-order one without changing the
//! optimization loop.

use std::collections::VecDeque;

/// Something that can be minimized
pub trait Objective {
    /// Evaluates the loss at `x` and writes its gradient into `grad`.
    ///
    /// The objective may project `x` in place (eg. clamp it into a valid
    /// range) before evaluating, the returned loss and gradient then belong
    /// to the projected point.
    fn evaluate(&mut self, x: &mut [f32], grad: &mut [f32]) -> f32;
}

impl<F> Objective for F
where
    F: FnMut(&mut [f32], &mut [f32]) -> f32,
{
    fn evaluate(&mut self, x: &mut [f32], grad: &mut [f32]) -> f32 {
        self(x, grad)
    }
}

/// Performs one optimization step at a time on a parameter vector
pub trait Optimizer {
    /// Moves `x` towards a lower loss, possibly evaluating the objective
    /// several times. Returns the loss at `x` before the step.
    fn step(&mut self, x: &mut [f32], objective: &mut dyn Objective) -> f32;
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

#[inline]
fn max_abs(a: &[f32]) -> f32 {
    a.iter().fold(0.0, |m, v| m.max(v.abs()))
}

/// `dst += alpha * src`
#[inline]
fn axpy(dst: &mut [f32], alpha: f32, src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += alpha * *s;
    }
}

/// How L-BFGS picks the step length along its search direction
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineSearch {
    /// Take the step given by the learning rate as is
    Fixed,
    /// Bracketing line search satisfying the strong Wolfe conditions
    StrongWolfe,
}

/// Configuration to create a [`Lbfgs`] optimizer
#[derive(Clone, Debug)]
pub struct LbfgsConfig {
    /// Step length multiplier
    pub lr: f32,
    /// Quasi-Newton iterations per call to [`Optimizer::step`]
    pub max_iter: usize,
    /// Objective evaluations per call to [`Optimizer::step`], defaults to
    /// `max_iter * 5 / 4`
    pub max_eval: Option<usize>,
    /// Stop when every gradient component is at most this large
    pub tolerance_grad: f32,
    /// Stop when the loss or the parameters change less than this
    pub tolerance_change: f32,
    /// Number of curvature pairs kept for the inverse Hessian estimate
    pub history_size: usize,
    pub line_search: LineSearch,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            lr: 1.0,
            max_iter: 1,
            max_eval: None,
            tolerance_grad: 1e-7,
            tolerance_change: 1e-9,
            history_size: 100,
            line_search: LineSearch::StrongWolfe,
        }
    }
}

/// Limited-memory BFGS. The curvature history is kept across calls to
/// [`Optimizer::step`], so every outer step continues the same quasi-Newton
/// run.
pub struct Lbfgs {
    config: LbfgsConfig,
    direction: Vec<f32>,
    step_len: f32,
    old_steps: VecDeque<Vec<f32>>,
    old_dirs: VecDeque<Vec<f32>>,
    rho: VecDeque<f64>,
    hessian_diag: f64,
    prev_grad: Vec<f32>,
    iterations: usize,
}

impl Lbfgs {
    pub fn new(config: LbfgsConfig) -> Self {
        Self {
            config,
            direction: Vec::new(),
            step_len: 0.0,
            old_steps: VecDeque::new(),
            old_dirs: VecDeque::new(),
            rho: VecDeque::new(),
            hessian_diag: 1.0,
            prev_grad: Vec::new(),
            iterations: 0,
        }
    }

    /// Total number of quasi-Newton iterations performed so far
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Updates the curvature history with the last step and computes the
    /// next search direction with the two-loop recursion.
    fn update_direction(&mut self, grad: &[f32]) {
        if self.iterations == 1 {
            self.direction = grad.iter().map(|g| -g).collect();
            self.old_dirs.clear();
            self.old_steps.clear();
            self.rho.clear();
            self.hessian_diag = 1.0;
            return;
        }

        let y: Vec<f32> = grad
            .iter()
            .zip(self.prev_grad.iter())
            .map(|(g, p)| g - p)
            .collect();
        let s: Vec<f32> = self.direction.iter().map(|d| d * self.step_len).collect();
        let ys = dot(&y, &s);

        if ys > 1e-10 {
            if self.old_dirs.len() == self.config.history_size {
                self.old_dirs.pop_front();
                self.old_steps.pop_front();
                self.rho.pop_front();
            }

            self.hessian_diag = ys / dot(&y, &y);
            self.old_dirs.push_back(y);
            self.old_steps.push_back(s);
            self.rho.push_back(1.0 / ys);
        }

        let count = self.old_dirs.len();
        let mut alpha = vec![0.0f64; count];
        let mut q: Vec<f32> = grad.iter().map(|g| -g).collect();

        for i in (0..count).rev() {
            alpha[i] = dot(&self.old_steps[i], &q) * self.rho[i];
            axpy(&mut q, -alpha[i] as f32, &self.old_dirs[i]);
        }

        let diag = self.hessian_diag as f32;
        for v in &mut q {
            *v *= diag;
        }

        for i in 0..count {
            let beta = dot(&self.old_dirs[i], &q) * self.rho[i];
            axpy(&mut q, (alpha[i] - beta) as f32, &self.old_steps[i]);
        }

        self.direction = q;
    }
}

impl Optimizer for Lbfgs {
    fn step(&mut self, x: &mut [f32], objective: &mut dyn Objective) -> f32 {
        let cfg = self.config.clone();
        let max_eval = cfg.max_eval.unwrap_or(cfg.max_iter * 5 / 4).max(1);

        let mut grad = vec![0.0; x.len()];
        let mut loss = objective.evaluate(x, &mut grad);
        let orig_loss = loss;
        let mut evals = 1;

        if max_abs(&grad) <= cfg.tolerance_grad {
            return orig_loss;
        }

        let mut n_iter = 0;
        while n_iter < cfg.max_iter {
            n_iter += 1;
            self.iterations += 1;

            self.update_direction(&grad);
            self.prev_grad.clear();
            self.prev_grad.extend_from_slice(&grad);
            let prev_loss = loss;

            self.step_len = if self.iterations == 1 {
                let l1: f32 = grad.iter().map(|g| g.abs()).sum();
                (1.0f32).min(1.0 / l1) * cfg.lr
            } else {
                cfg.lr
            };

            let gtd = dot(&grad, &self.direction);
            if gtd > -f64::from(cfg.tolerance_change) {
                break;
            }

            let ls_evals = match cfg.line_search {
                LineSearch::StrongWolfe => {
                    let found = strong_wolfe(
                        objective,
                        x,
                        self.step_len,
                        &self.direction,
                        loss,
                        &grad,
                        gtd,
                        cfg.tolerance_change,
                    );
                    x.copy_from_slice(&found.point.x);
                    loss = found.point.f;
                    grad = found.point.g;
                    self.step_len = found.point.t;
                    found.evals
                }
                LineSearch::Fixed => {
                    axpy(x, self.step_len, &self.direction);
                    if n_iter != cfg.max_iter {
                        loss = objective.evaluate(x, &mut grad);
                        1
                    } else {
                        0
                    }
                }
            };
            evals += ls_evals;

            if n_iter == cfg.max_iter || evals >= max_eval {
                break;
            }

            if max_abs(&grad) <= cfg.tolerance_grad {
                break;
            }

            if max_abs(&self.direction) * self.step_len.abs() <= cfg.tolerance_change {
                break;
            }

            if (loss - prev_loss).abs() < cfg.tolerance_change {
                break;
            }
        }

        orig_loss
    }
}

/// A point evaluated during the line search
#[derive(Clone)]
struct Trial {
    t: f32,
    f: f32,
    gtd: f64,
    g: Vec<f32>,
    x: Vec<f32>,
}

struct Found {
    point: Trial,
    evals: usize,
}

fn trial_at(objective: &mut dyn Objective, x0: &[f32], t: f32, d: &[f32]) -> Trial {
    let mut x = x0.to_vec();
    axpy(&mut x, t, d);
    let mut g = vec![0.0; x.len()];
    let f = objective.evaluate(&mut x, &mut g);
    let gtd = dot(&g, d);
    Trial { t, f, gtd, g, x }
}

/// Minimizer of the cubic interpolating two points and their derivatives,
/// clamped into `bounds` (or the interval between the points).
fn cubic_interpolate(
    (x1, f1, g1): (f64, f64, f64),
    (x2, f2, g2): (f64, f64, f64),
    bounds: Option<(f64, f64)>,
) -> f64 {
    let (min_bound, max_bound) = bounds.unwrap_or(if x1 <= x2 { (x1, x2) } else { (x2, x1) });

    let d1 = g1 + g2 - 3.0 * (f1 - f2) / (x1 - x2);
    let d2_square = d1 * d1 - g1 * g2;
    if d2_square >= 0.0 {
        let d2 = d2_square.sqrt();
        let min_pos = if x1 <= x2 {
            x2 - (x2 - x1) * ((g2 + d2 - d1) / (g2 - g1 + 2.0 * d2))
        } else {
            x1 - (x1 - x2) * ((g1 + d2 - d1) / (g1 - g2 + 2.0 * d2))
        };
        min_pos.max(min_bound).min(max_bound)
    } else {
        (min_bound + max_bound) / 2.0
    }
}

const C1: f64 = 1e-4;
const C2: f64 = 0.9;
const MAX_LS: usize = 25;

#[allow(clippy::too_many_arguments)]
fn strong_wolfe(
    objective: &mut dyn Objective,
    x0: &[f32],
    t: f32,
    d: &[f32],
    f: f32,
    g: &[f32],
    gtd: f64,
    tolerance_change: f32,
) -> Found {
    let f0 = f64::from(f);
    let d_norm = f64::from(max_abs(d));
    let sufficient = |p: &Trial| f64::from(p.f) <= f0 + C1 * f64::from(p.t) * gtd;
    let curvature = |p: &Trial| p.gtd.abs() <= -C2 * gtd;

    let start = Trial {
        t: 0.0,
        f,
        gtd,
        g: g.to_vec(),
        x: x0.to_vec(),
    };

    let mut new = trial_at(objective, x0, t, d);
    let mut evals = 1;
    let mut prev = start.clone();
    let mut ls_iter = 0;

    // bracketing phase
    let mut bracket = loop {
        if ls_iter >= MAX_LS {
            // ran out of iterations while extrapolating
            break [start, new];
        }

        if !sufficient(&new) || (ls_iter > 1 && new.f >= prev.f) {
            break [prev, new];
        }

        if curvature(&new) {
            return Found { point: new, evals };
        }

        if new.gtd >= 0.0 {
            break [prev, new];
        }

        // extrapolate
        let t_new = f64::from(new.t);
        let min_step = t_new + 0.01 * (t_new - f64::from(prev.t));
        let max_step = t_new * 10.0;
        let next_t = cubic_interpolate(
            (f64::from(prev.t), f64::from(prev.f), prev.gtd),
            (t_new, f64::from(new.f), new.gtd),
            Some((min_step, max_step)),
        );

        prev = new;
        new = trial_at(objective, x0, next_t as f32, d);
        evals += 1;
        ls_iter += 1;
    };

    // zoom phase
    let mut low = if bracket[0].f <= bracket[1].f { 0 } else { 1 };
    let mut insufficient_progress = false;
    while ls_iter < MAX_LS {
        let (a, b) = (f64::from(bracket[0].t), f64::from(bracket[1].t));
        if (b - a).abs() * d_norm < f64::from(tolerance_change) {
            break;
        }

        let mut t = cubic_interpolate(
            (a, f64::from(bracket[0].f), bracket[0].gtd),
            (b, f64::from(bracket[1].f), bracket[1].gtd),
            None,
        );

        // keep the trial point away from the bracket ends
        let (lo, hi) = (a.min(b), a.max(b));
        let eps = 0.1 * (hi - lo);
        if (hi - t).min(t - lo) < eps {
            if insufficient_progress || t >= hi || t <= lo {
                t = if (t - hi).abs() < (t - lo).abs() {
                    hi - eps
                } else {
                    lo + eps
                };
                insufficient_progress = false;
            } else {
                insufficient_progress = true;
            }
        } else {
            insufficient_progress = false;
        }

        let new = trial_at(objective, x0, t as f32, d);
        evals += 1;
        ls_iter += 1;

        let high = 1 - low;
        if !sufficient(&new) || new.f >= bracket[low].f {
            bracket[high] = new;
            low = if bracket[0].f <= bracket[1].f { 0 } else { 1 };
        } else {
            let done = curvature(&new);
            if !done && new.gtd * (f64::from(bracket[high].t) - f64::from(bracket[low].t)) >= 0.0 {
                bracket[high] = bracket[low].clone();
            }
            bracket[low] = new;

            if done {
                break;
            }
        }
    }

    let [first, second] = bracket;
    let point = if low == 0 { first } else { second };
    Found { point, evals }
}

/// Configuration to create a [`Momentum`] optimizer
#[derive(Clone, Debug)]
pub struct MomentumConfig {
    pub lr: f32,
    /// Momentum factor
    pub momentum: f32,
    /// Dampening factor
    pub dampening: f32,
    /// Enables Nesterov momentum
    pub nesterov: bool,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.9,
            dampening: 0.1,
            nesterov: false,
        }
    }
}

/// Gradient descent with momentum, one objective evaluation per step.
///
/// Needs many more steps than [`Lbfgs`] for a comparable result.
pub struct Momentum {
    config: MomentumConfig,
    velocity: Option<Vec<f32>>,
}

impl Momentum {
    pub fn new(config: MomentumConfig) -> Self {
        Self {
            config,
            velocity: None,
        }
    }
}

impl Optimizer for Momentum {
    fn step(&mut self, x: &mut [f32], objective: &mut dyn Objective) -> f32 {
        let mut grad = vec![0.0; x.len()];
        let loss = objective.evaluate(x, &mut grad);

        let cfg = &self.config;
        let velocity = match self.velocity.take() {
            Some(mut v) => {
                for (v, g) in v.iter_mut().zip(grad.iter()) {
                    *v = cfg.momentum * *v + (1.0 - cfg.dampening) * g;
                }
                v
            }
            None => grad.clone(),
        };

        if cfg.nesterov {
            for ((xi, g), v) in x.iter_mut().zip(grad.iter()).zip(velocity.iter()) {
                *xi -= cfg.lr * (g + cfg.momentum * v);
            }
        } else {
            axpy(x, -cfg.lr, &velocity);
        }

        self.velocity = Some(velocity);
        loss
    }
}

/// Selects and configures the optimizer a transfer job uses
#[derive(Clone, Debug)]
pub enum OptimizerKind {
    Lbfgs(LbfgsConfig),
    Momentum(MomentumConfig),
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Lbfgs(LbfgsConfig::default())
    }
}

impl OptimizerKind {
    /// Creates a fresh optimizer with no history
    pub fn build(&self) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Lbfgs(config) => Box::new(Lbfgs::new(config.clone())),
            OptimizerKind::Momentum(config) => Box::new(Momentum::new(config.clone())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rosenbrock(x: &mut [f32], grad: &mut [f32]) -> f32 {
        let (a, b) = (x[0], x[1]);
        grad[0] = -2.0 * (1.0 - a) - 400.0 * a * (b - a * a);
        grad[1] = 200.0 * (b - a * a);
        (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2)
    }

    fn quadratic(x: &mut [f32], grad: &mut [f32]) -> f32 {
        let mut loss = 0.0;
        for (i, (xi, gi)) in x.iter().zip(grad.iter_mut()).enumerate() {
            let scale = (i + 1) as f32;
            let diff = xi - 0.25 * i as f32;
            *gi = 2.0 * scale * diff;
            loss += scale * diff * diff;
        }
        loss
    }

    #[test]
    fn cubic_interpolation_finds_parabola_minimum() {
        // f(t) = (t - 1)^2 sampled at 0 and 3
        let t = cubic_interpolate((0.0, 1.0, -2.0), (3.0, 4.0, 4.0), None);
        assert!((t - 1.0).abs() < 1e-9);
    }

    #[test]
    fn lbfgs_strong_wolfe_solves_rosenbrock() {
        let mut opt = Lbfgs::new(LbfgsConfig::default());
        let mut x = vec![-1.2f32, 1.0];
        let mut objective = rosenbrock;

        let mut last = f32::MAX;
        for _ in 0..200 {
            let loss = opt.step(&mut x, &mut objective);
            // the line search only accepts sufficient decrease
            assert!(loss <= last);
            last = loss;
        }

        assert!((x[0] - 1.0).abs() < 1e-2, "{:?}", x);
        assert!((x[1] - 1.0).abs() < 2e-2, "{:?}", x);
    }

    #[test]
    fn lbfgs_fixed_step_solves_quadratic() {
        let mut opt = Lbfgs::new(LbfgsConfig {
            max_iter: 20,
            line_search: LineSearch::Fixed,
            ..LbfgsConfig::default()
        });
        let mut x = vec![1.0f32; 5];
        let mut objective = quadratic;

        for _ in 0..10 {
            opt.step(&mut x, &mut objective);
        }

        for (i, v) in x.iter().enumerate() {
            assert!((v - 0.25 * i as f32).abs() < 1e-3, "{:?}", x);
        }
    }

    #[test]
    fn lbfgs_respects_projection() {
        // minimum at 2.0, but the objective clamps into [0, 1]
        let mut objective = |x: &mut [f32], grad: &mut [f32]| {
            for v in x.iter_mut() {
                *v = v.max(0.0).min(1.0);
            }
            grad[0] = 2.0 * (x[0] - 2.0);
            (x[0] - 2.0).powi(2)
        };

        let mut opt = Lbfgs::new(LbfgsConfig::default());
        let mut x = vec![0.5f32];
        for _ in 0..10 {
            opt.step(&mut x, &mut objective);
        }

        assert!(x[0] <= 1.0);
        assert!((x[0] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn momentum_solves_quadratic() {
        let mut opt = Momentum::new(MomentumConfig {
            lr: 0.02,
            ..MomentumConfig::default()
        });
        let mut x = vec![1.0f32; 4];
        let mut objective = quadratic;

        let first = opt.step(&mut x, &mut objective);
        let mut last = first;
        for _ in 0..500 {
            last = opt.step(&mut x, &mut objective);
        }

        assert!(last < first * 1e-4, "{} -> {}", first, last);
    }

    #[test]
    fn zero_gradient_leaves_parameters_alone() {
        let mut opt = Lbfgs::new(LbfgsConfig::default());
        let mut x = vec![0.0f32, 0.25, 0.5];
        let mut objective = quadratic;

        opt.step(&mut x, &mut objective);
        assert_eq!(x, vec![0.0, 0.25, 0.5]);
        assert_eq!(opt.iterations(), 0);
    }
}
