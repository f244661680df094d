/// Multistep formula family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Adams–Moulton, for non-stiff stretches.
    Adams,
    /// Backward differentiation formulas, for stiff stretches.
    Bdf,
}

impl Method {
    /// Highest order supported by the family.
    pub fn max_order(self) -> usize {
        match self {
            Method::Adams => 12,
            Method::Bdf => 5,
        }
    }
}

/// Nordsieck correction vector and local error constant of one formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients {
    /// Correction weights `l_0..=l_q`, normalised so that `l_1 = 1`.
    pub l: Vec<f64>,
    /// Magnitude of the local truncation error constant.
    pub err_const: f64,
}

impl Coefficients {
    /// Coefficients of the order-`order` formula of `method`.
    ///
    /// BDF: `Λ(x) = ∏_{i=1..q} (1 + x/i)`.
    /// Adams: `Λ'(x) ∝ ∏_{i=1..q-1} (x + i)` with `Λ(-1) = 0`.
    pub fn new(method: Method, order: usize) -> Self {
        match method {
            Method::Bdf => {
                let mut poly = vec![1.0];
                for i in 1..=order {
                    poly = poly_mul(&poly, &[1.0, 1.0 / i as f64]);
                }
                let l1 = poly[1];
                let l: Vec<f64> = poly.iter().map(|c| c / l1).collect();
                let err_const = l[0] / (order + 1) as f64;
                Self { l, err_const }
            }
            Method::Adams => {
                let mut deriv = vec![1.0];
                for i in 1..order {
                    deriv = poly_mul(&deriv, &[i as f64, 1.0]);
                }
                let d0 = deriv[0];
                let mut l = Vec::with_capacity(order + 1);
                l.push(0.0);
                l.extend(deriv.iter().enumerate().map(|(k, c)| c / d0 / (k + 1) as f64));
                let at_minus_one: f64 = l
                    .iter()
                    .enumerate()
                    .map(|(k, c)| if k % 2 == 0 { *c } else { -c })
                    .sum();
                l[0] = -at_minus_one;
                Self {
                    l,
                    err_const: adams_moulton_error_constant(order),
                }
            }
        }
    }
}

fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// `|γ*_q|` from `Σ_{j=0..m} γ*_j / (m + 1 - j) = 0`, `γ*_0 = 1`.
fn adams_moulton_error_constant(order: usize) -> f64 {
    let mut gamma = vec![1.0];
    for m in 1..=order {
        let sum: f64 = (0..m).map(|j| gamma[j] / (m + 1 - j) as f64).sum();
        gamma.push(-sum);
    }
    gamma[order].abs()
}

/// Coefficients for every order of both families, indexed by order.
#[derive(Debug, Clone)]
pub struct CoefficientTable {
    adams: Vec<Coefficients>,
    bdf: Vec<Coefficients>,
}

impl CoefficientTable {
    pub fn new() -> Self {
        let build = |method: Method| -> Vec<Coefficients> {
            (0..=method.max_order())
                .map(|order| {
                    if order == 0 {
                        Coefficients {
                            l: vec![1.0],
                            err_const: 0.0,
                        }
                    } else {
                        Coefficients::new(method, order)
                    }
                })
                .collect()
        };
        Self {
            adams: build(Method::Adams),
            bdf: build(Method::Bdf),
        }
    }

    pub fn get(&self, method: Method, order: usize) -> &Coefficients {
        match method {
            Method::Adams => &self.adams[order],
            Method::Bdf => &self.bdf[order],
        }
    }
}
