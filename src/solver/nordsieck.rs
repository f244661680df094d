/// Nordsieck history array `[y, h y', h² y''/2!, ..., h^q y^(q)/q!]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Nordsieck {
    rows: Vec<Vec<f64>>,
}

impl Nordsieck {
    /// First-order history from the state and the scaled derivative `h f(y)`.
    pub fn new(y: Vec<f64>, h_dydt: Vec<f64>) -> Self {
        Self {
            rows: vec![y, h_dydt],
        }
    }

    pub fn order(&self) -> usize {
        self.rows.len() - 1
    }

    pub fn y(&self) -> &[f64] {
        &self.rows[0]
    }

    pub fn row(&self, j: usize) -> &[f64] {
        &self.rows[j]
    }

    /// Extrapolate one step ahead by applying the Pascal triangle matrix.
    pub fn predict(&mut self) {
        let q = self.order();
        for k in 0..q {
            for j in (k + 1..=q).rev() {
                let (lower, upper) = self.rows.split_at_mut(j);
                for (a, b) in lower[j - 1].iter_mut().zip(&upper[0]) {
                    *a += b;
                }
            }
        }
    }

    /// Apply the corrector: `z_j += l_j * delta`.
    pub fn correct(&mut self, l: &[f64], delta: &[f64]) {
        for (row, &l_j) in self.rows.iter_mut().zip(l) {
            for (z, d) in row.iter_mut().zip(delta) {
                *z += l_j * d;
            }
        }
    }

    /// Rescale for a step size change `h -> eta * h`.
    pub fn rescale(&mut self, eta: f64) {
        let mut factor = 1.0;
        for row in self.rows.iter_mut().skip(1) {
            factor *= eta;
            row.iter_mut().for_each(|z| *z *= factor);
        }
    }

    /// Append the next higher-order row.
    pub fn push_row(&mut self, row: Vec<f64>) {
        self.rows.push(row);
    }

    /// Drop rows above `order`.
    pub fn truncate(&mut self, order: usize) {
        self.rows.truncate(order + 1);
    }

    /// Evaluate the interpolating polynomial at `t + s*h` into `out`.
    pub fn interpolate(&self, s: f64, out: &mut [f64]) {
        out.fill(0.0);
        for row in self.rows.iter().rev() {
            for (o, z) in out.iter_mut().zip(row) {
                *o = *o * s + z;
            }
        }
    }
}
