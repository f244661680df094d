use super::method::{CoefficientTable, Method};
use super::nordsieck::Nordsieck;
use super::{OdeSystem, SolverOptions, SolverStats};
use crate::error::{SimError, SimResult};
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};

/// Consecutive failures tolerated on a single step.
const MAX_FAILURES: usize = 10;
/// Corrector iterations per attempt.
const MAX_ITERS_NEWTON: usize = 4;
const MAX_ITERS_FUNCTIONAL: usize = 3;
/// Steps on one method before another switch is considered.
const MIN_STEPS_BETWEEN_SWITCHES: usize = 20;
/// BDF must promise this much larger a step before leaving Adams.
const SWITCH_TO_BDF_RATIO: f64 = 5.0;
/// Largest step growth per change.
const MAX_GROWTH: f64 = 10.0;
/// Largest step growth on the first change after an error test failure.
const MAX_GROWTH_AFTER_FAILURE: f64 = 2.0;
/// Step factor applied when the history is restarted at order 1.
const RESTART_FACTOR: f64 = 0.1;
/// Error test failures on one step before the history is restarted.
const FAILURES_BEFORE_RESTART: usize = 3;
/// Accepted steps between step and order evaluations when nothing changed.
const STEPS_BEFORE_RETRY: usize = 3;
/// Accepted steps after a restart before the step is adapted again.
const STEPS_AFTER_RESTART: usize = 5;
/// Bias of the step factor estimates for order `q - 1`, `q` and `q + 1`.
const BIAS_DOWN: f64 = 1.3;
const BIAS_SAME: f64 = 1.2;
const BIAS_UP: f64 = 1.4;

/// Integration state between output times.
pub struct Stepper<'a, S: OdeSystem> {
    system: &'a S,
    opts: &'a SolverOptions,
    coeffs: CoefficientTable,

    t: f64,
    h: f64,
    method: Method,
    hist: Nordsieck,
    pred: Nordsieck,
    ewt: Vec<f64>,

    jac: Option<DMatrix<f64>>,
    jac_current: bool,
    lu: Option<(f64, LU<f64, Dyn, Dyn>)>,
    newton_tol: f64,
    conv_rate: f64,

    /// Accepted steps left before the step size and order are reconsidered.
    steps_to_adapt: usize,
    steps_since_switch: usize,
    max_growth: f64,
    /// Correction of the step before an evaluation, for the order increase estimate.
    prev_delta: Option<Vec<f64>>,

    stats: SolverStats,
}

impl<'a, S: OdeSystem> Stepper<'a, S> {
    /// Set up a first-order Adams history at `t0` and pick the initial step.
    pub fn new(
        system: &'a S,
        opts: &'a SolverOptions,
        t0: f64,
        y0: &[f64],
        span: f64,
    ) -> SimResult<Self> {
        let n = y0.len();
        let mut stepper = Self {
            system,
            opts,
            coeffs: CoefficientTable::new(),
            t: t0,
            h: 0.0,
            method: Method::Adams,
            hist: Nordsieck::new(y0.to_vec(), vec![0.0; n]),
            pred: Nordsieck::new(y0.to_vec(), vec![0.0; n]),
            ewt: vec![0.0; n],
            jac: None,
            jac_current: false,
            lu: None,
            newton_tol: (10.0 * f64::EPSILON / opts.rtol).max(opts.rtol.sqrt().min(0.03)),
            conv_rate: 0.7,
            steps_to_adapt: 2,
            steps_since_switch: 0,
            max_growth: MAX_GROWTH,
            prev_delta: None,
            stats: SolverStats::default(),
        };

        let f0 = stepper.eval_rhs(t0, y0)?;
        stepper.update_weights();
        let h = match opts.first_step {
            Some(h0) => h0.min(opts.max_step),
            None => stepper.initial_step(y0, &f0, span)?,
        };
        stepper.h = h;
        stepper.hist = Nordsieck::new(y0.to_vec(), f0.iter().map(|f| h * f).collect());

        Ok(stepper)
    }

    pub fn into_stats(self) -> SolverStats {
        self.stats
    }

    /// Step until `t_out` is covered and interpolate the solution there.
    pub fn advance_to(&mut self, t_out: f64, y_out: &mut [f64]) -> SimResult<()> {
        let mut n_steps = 0;
        while self.t < t_out {
            if n_steps >= self.opts.max_steps {
                return Err(self.failure(format!(
                    "exceeded {} steps before reaching t = {t_out}",
                    self.opts.max_steps
                )));
            }
            self.step()?;
            n_steps += 1;
        }
        self.hist.interpolate((t_out - self.t) / self.h, y_out);
        Ok(())
    }

    /// Take one accepted step, then adapt step size, order and method.
    fn step(&mut self) -> SimResult<()> {
        let mut n_err_fails = 0;
        let mut n_conv_fails = 0;

        let (delta, err) = loop {
            if !(self.h >= 10.0 * f64::EPSILON * self.t.abs().max(1.0)) {
                return Err(self.failure(format!("step size {} underflowed", self.h)));
            }

            let q = self.hist.order();
            self.pred.clone_from(&self.hist);
            self.pred.predict();
            self.update_weights();

            let y = match self.correct()? {
                Some(y) => y,
                None => {
                    n_conv_fails += 1;
                    if n_conv_fails >= MAX_FAILURES {
                        return Err(self.failure("corrector failed to converge repeatedly".into()));
                    }
                    if self.method == Method::Bdf && !self.jac_current {
                        self.refresh_jacobian()?;
                        continue;
                    }
                    if self.method == Method::Adams && n_conv_fails >= 2 {
                        log::debug!(
                            "functional iteration diverges at t = {}, switching to BDF",
                            self.t
                        );
                        self.switch_method(Method::Bdf);
                        self.jac = None;
                        continue;
                    }
                    self.shrink_step(0.25);
                    continue;
                }
            };

            let coef = self.coeffs.get(self.method, q);
            let y_pred = self.pred.y();
            let delta: Vec<f64> = y.iter().zip(y_pred).map(|(a, b)| (a - b) / coef.l[0]).collect();
            let scale = coef.err_const * factorial(q) * coef.l[q];
            let err = self.weighted_norm(delta.iter().map(|d| scale * d));

            if err <= 1.0 {
                break (delta, err);
            }

            n_err_fails += 1;
            self.stats.rejected_steps += 1;
            self.max_growth = MAX_GROWTH_AFTER_FAILURE;
            if n_err_fails >= MAX_FAILURES {
                return Err(self.failure("error test failed repeatedly".into()));
            }
            if n_err_fails >= FAILURES_BEFORE_RESTART {
                // The higher rows no longer describe the solution.
                self.restart(RESTART_FACTOR)?;
                continue;
            }

            let (mut eta, new_q) = self.reduce_after_failure(err, q);
            if n_err_fails >= 2 {
                eta = eta.min(0.2);
            }
            if new_q < q {
                self.hist.truncate(new_q);
            }
            self.shrink_step(eta);
            self.steps_to_adapt = new_q + 1;
        };

        let q = self.hist.order();
        let l = self.coeffs.get(self.method, q).l.clone();
        self.hist.clone_from(&self.pred);
        self.hist.correct(&l, &delta);
        self.t += self.h;
        self.stats.steps += 1;
        self.jac_current = false;
        self.steps_since_switch += 1;

        self.adapt(&delta, err, &l)
    }

    /// Run the corrector on the predicted history.
    ///
    /// Returns `None` when the iteration does not converge.
    fn correct(&mut self) -> SimResult<Option<Vec<f64>>> {
        let n = self.ewt.len();
        let q = self.hist.order();
        let l0 = self.coeffs.get(self.method, q).l[0];
        let h = self.h;
        let t_new = self.t + h;
        let y_pred = self.pred.y().to_vec();
        let hdy_pred = self.pred.row(1).to_vec();

        let max_iters = match self.method {
            Method::Bdf => {
                if self.jac.is_none() {
                    self.refresh_jacobian()?;
                }
                if !self.factorize(h * l0) {
                    return Ok(None);
                }
                MAX_ITERS_NEWTON
            }
            Method::Adams => MAX_ITERS_FUNCTIONAL,
        };

        let mut y = y_pred.clone();
        let mut norm_old: Option<f64> = None;
        for iter in 0..max_iters {
            let f = self.eval_rhs(t_new, &y)?;
            let residual: Vec<f64> = (0..n)
                .map(|i| y[i] - y_pred[i] - l0 * (h * f[i] - hdy_pred[i]))
                .collect();

            let dy: Vec<f64> = match (&self.method, &self.lu) {
                (Method::Bdf, Some((_, lu))) => {
                    let rhs = DVector::from_iterator(n, residual.iter().map(|r| -r));
                    match lu.solve(&rhs) {
                        Some(sol) => sol.iter().copied().collect(),
                        None => return Ok(None),
                    }
                }
                _ => residual.iter().map(|r| -r).collect(),
            };

            y.iter_mut().zip(&dy).for_each(|(a, d)| *a += d);
            let norm = self.weighted_norm(dy.iter().copied());
            if let Some(norm_old) = norm_old {
                self.conv_rate = (0.2 * self.conv_rate).max(norm / norm_old);
                if iter >= 2 && norm > 2.0 * norm_old {
                    return Ok(None);
                }
            }
            if norm * (1.5 * self.conv_rate).min(1.0) <= self.newton_tol {
                return Ok(Some(y));
            }
            norm_old = Some(norm);
        }

        Ok(None)
    }

    /// Choose the next step size, order and method after an accepted step.
    fn adapt(&mut self, delta: &[f64], err: f64, l: &[f64]) -> SimResult<()> {
        self.steps_to_adapt = self.steps_to_adapt.saturating_sub(1);
        if self.steps_to_adapt == 1 {
            self.prev_delta = Some(delta.to_vec());
        }
        if self.steps_to_adapt > 0 {
            return Ok(());
        }

        let q = self.hist.order();
        let fact = factorial(q) * l[q];
        // h^(q+1) y^(q+1)
        let est: Vec<f64> = delta.iter().map(|d| fact * d).collect();

        let eta_same = step_factor(err, q + 1, BIAS_SAME);
        let (mut eta, mut new_q) = (eta_same, q);

        if q > 1 {
            let eta_down = step_factor(self.err_down(q), q, BIAS_DOWN);
            if eta_down > eta {
                eta = eta_down;
                new_q = q - 1;
            }
        }

        if let Some(prev) = self.prev_delta.take() {
            if q < self.max_order(self.method) {
                let c_up = self.coeffs.get(self.method, q + 1).err_const * fact;
                let err_up =
                    self.weighted_norm(delta.iter().zip(&prev).map(|(d, p)| c_up * (d - p)));
                let eta_up = step_factor(err_up, q + 2, BIAS_UP);
                if eta_up > eta {
                    eta = eta_up;
                    new_q = q + 1;
                }
            }
        }

        if self.steps_since_switch >= MIN_STEPS_BETWEEN_SWITCHES {
            if let Some(eta_switch) = self.consider_switch(&est, eta_same)? {
                let order = self.hist.order();
                self.change_step(eta_switch, order, delta, l);
                return Ok(());
            }
        }

        if new_q >= q && eta < 1.1 {
            self.steps_to_adapt = STEPS_BEFORE_RETRY;
            return Ok(());
        }
        self.change_step(eta, new_q, delta, l);

        Ok(())
    }

    /// Apply a new step size and order to the history.
    fn change_step(&mut self, eta: f64, new_q: usize, delta: &[f64], l: &[f64]) {
        let q = self.hist.order();
        let eta = eta.min(self.max_growth).min(self.opts.max_step / self.h);
        if new_q > q {
            let z = delta.iter().map(|d| l[q] * d / (q + 1) as f64).collect();
            self.hist.push_row(z);
        } else if new_q < q {
            self.hist.truncate(new_q);
        }
        self.hist.rescale(eta);
        self.h *= eta;
        self.steps_to_adapt = self.hist.order() + 1;
        self.max_growth = MAX_GROWTH;
    }

    /// Step factor and order for retrying a step that failed the error test.
    fn reduce_after_failure(&self, err: f64, q: usize) -> (f64, usize) {
        let mut eta = step_factor(err, q + 1, BIAS_SAME);
        let mut new_q = q;
        if q > 1 {
            let eta_down = step_factor(self.err_down(q), q, BIAS_DOWN);
            if eta_down > eta {
                eta = eta_down;
                new_q = q - 1;
            }
        }
        (eta.min(1.0), new_q)
    }

    /// Weighted error the order `q - 1` formula would make, from the last history row.
    fn err_down(&self, q: usize) -> f64 {
        let c_down = self.coeffs.get(self.method, q - 1).err_const * factorial(q);
        self.weighted_norm(self.hist.row(q).iter().map(|z| c_down * z))
    }

    /// Drop the history to order 1, rebuilt from the derivative at the current point.
    fn restart(&mut self, eta: f64) -> SimResult<()> {
        let y = self.hist.y().to_vec();
        let f = self.eval_rhs(self.t, &y)?;
        self.h *= eta;
        log::debug!("restarting at order 1 at t = {} with h = {:e}", self.t, self.h);
        self.hist = Nordsieck::new(y, f.iter().map(|x| self.h * x).collect());
        self.steps_to_adapt = STEPS_AFTER_RESTART;
        self.prev_delta = None;
        Ok(())
    }

    /// Compare the step each family could take next and switch if worthwhile.
    ///
    /// Returns the step factor to apply when the method changed.
    fn consider_switch(&mut self, est: &[f64], eta_same: f64) -> SimResult<Option<f64>> {
        let q = self.hist.order();
        let y = self.hist.y().to_vec();
        let jac = self.eval_jacobian(self.t, &y)?;
        let rho = jac
            .row_iter()
            .map(|row| row.iter().map(|x| x.abs()).sum::<f64>())
            .fold(0.0, f64::max);

        let adams_order = q.min(self.opts.max_order_adams);
        let l0_adams = self.coeffs.get(Method::Adams, adams_order).l[0];
        let h_stable = if rho > 0.0 {
            0.5 / (l0_adams * rho)
        } else {
            f64::INFINITY
        };

        match self.method {
            Method::Adams => {
                let bdf_order = q.min(self.opts.max_order_bdf);
                let h_adams = (eta_same * self.h).min(h_stable);
                let h_bdf = self.eta_for(Method::Bdf, bdf_order, est) * self.h;
                if h_bdf > SWITCH_TO_BDF_RATIO * h_adams {
                    log::debug!(
                        "stiffness detected at t = {}: h_adams = {h_adams:e}, h_bdf = {h_bdf:e}",
                        self.t
                    );
                    self.switch_method(Method::Bdf);
                    self.jac = Some(jac);
                    self.jac_current = true;
                    return Ok(Some((h_bdf / self.h).min(MAX_GROWTH)));
                }
            }
            Method::Bdf => {
                let h_adams =
                    (self.eta_for(Method::Adams, adams_order, est) * self.h).min(h_stable);
                let h_bdf = eta_same * self.h;
                if h_adams >= h_bdf {
                    log::debug!(
                        "stiffness vanished at t = {}: h_adams = {h_adams:e}, h_bdf = {h_bdf:e}",
                        self.t
                    );
                    self.switch_method(Method::Adams);
                    return Ok(Some((h_adams / self.h).min(MAX_GROWTH)));
                }
            }
        }

        Ok(None)
    }

    /// Step factor the order-`order` formula of `method` would allow now.
    fn eta_for(&self, method: Method, order: usize, est: &[f64]) -> f64 {
        let c = self.coeffs.get(method, order).err_const;
        let err = if order == self.hist.order() {
            self.weighted_norm(est.iter().map(|e| c * e))
        } else {
            let scale = c * factorial(order + 1);
            self.weighted_norm(self.hist.row(order + 1).iter().map(|z| scale * z))
        };
        step_factor(err, order + 1, BIAS_SAME)
    }

    fn switch_method(&mut self, method: Method) {
        let order = self.hist.order().min(self.max_order(method));
        self.hist.truncate(order);
        self.method = method;
        self.stats.method_switches += 1;
        self.steps_since_switch = 0;
        self.steps_to_adapt = order + 1;
        self.prev_delta = None;
        self.lu = None;
        self.conv_rate = 0.7;
    }

    fn shrink_step(&mut self, eta: f64) {
        self.hist.rescale(eta);
        self.h *= eta;
        self.prev_delta = None;
    }

    fn max_order(&self, method: Method) -> usize {
        match method {
            Method::Adams => self.opts.max_order_adams,
            Method::Bdf => self.opts.max_order_bdf,
        }
    }

    fn refresh_jacobian(&mut self) -> SimResult<()> {
        let y = self.pred.y().to_vec();
        self.jac = Some(self.eval_jacobian(self.t + self.h, &y)?);
        self.jac_current = true;
        self.lu = None;
        self.conv_rate = 0.7;
        Ok(())
    }

    /// Factorize `I - hl0 J` unless the cached factorization already matches.
    ///
    /// Returns `false` if the matrix is singular.
    fn factorize(&mut self, hl0: f64) -> bool {
        if let Some((cached, _)) = &self.lu {
            if *cached == hl0 {
                return true;
            }
        }
        let Some(jac) = &self.jac else {
            return false;
        };
        let n = jac.nrows();
        let lu = (DMatrix::identity(n, n) - jac * hl0).lu();
        self.stats.lu_decomps += 1;
        if !lu.is_invertible() {
            self.lu = None;
            return false;
        }
        self.lu = Some((hl0, lu));
        true
    }

    fn eval_rhs(&mut self, t: f64, y: &[f64]) -> SimResult<Vec<f64>> {
        let mut f = vec![0.0; y.len()];
        self.system.rhs(t, y, &mut f);
        self.stats.rhs_evals += 1;
        if f.iter().any(|x| !x.is_finite()) {
            return Err(self.failure("derivative is not finite".into()));
        }
        Ok(f)
    }

    fn eval_jacobian(&mut self, t: f64, y: &[f64]) -> SimResult<DMatrix<f64>> {
        let jac = self.system.jacobian(t, y);
        self.stats.jac_evals += 1;
        if jac.iter().any(|x| !x.is_finite()) {
            return Err(self.failure("jacobian is not finite".into()));
        }
        Ok(jac)
    }

    /// Error weights `atol + rtol |y|` from the state at the start of the step.
    fn update_weights(&mut self) {
        let (rtol, atol) = (self.opts.rtol, self.opts.atol);
        for (w, y) in self.ewt.iter_mut().zip(self.hist.y()) {
            *w = atol + rtol * y.abs();
        }
    }

    fn weighted_norm<I: Iterator<Item = f64>>(&self, vals: I) -> f64 {
        let sum: f64 = vals.zip(&self.ewt).map(|(v, w)| (v / w).powi(2)).sum();
        (sum / self.ewt.len() as f64).sqrt()
    }

    /// Hairer–Wanner starting step estimate for a first-order method.
    fn initial_step(&mut self, y0: &[f64], f0: &[f64], span: f64) -> SimResult<f64> {
        let d0 = self.weighted_norm(y0.iter().copied());
        let d1 = self.weighted_norm(f0.iter().copied());
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };

        let y1: Vec<f64> = y0.iter().zip(f0).map(|(y, f)| y + h0 * f).collect();
        let f1 = self.eval_rhs(self.t + h0, &y1)?;
        let d2 = self.weighted_norm(f1.iter().zip(f0).map(|(a, b)| a - b)) / h0;

        let d_max = d1.max(d2);
        let h1 = if d_max <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d_max).sqrt()
        };

        Ok((100.0 * h0).min(h1).min(self.opts.max_step).min(span))
    }

    fn failure(&self, reason: String) -> SimError {
        SimError::NumericalFailure {
            t_reached: self.t,
            reason,
        }
    }
}

/// Step factor for a weighted error `err` of a formula with error order `p`.
fn step_factor(err: f64, p: usize, bias: f64) -> f64 {
    1.0 / (bias * err.powf(1.0 / p as f64) + bias * 1e-6)
}

fn factorial(n: usize) -> f64 {
    (1..=n).map(|k| k as f64).product()
}
