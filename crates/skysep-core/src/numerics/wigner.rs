/// Memoised `ln(n!)` table, grown on demand.
#[derive(Debug, Clone, Default)]
pub struct LogFactorial {
    values: Vec<f64>,
}

impl LogFactorial {
    pub fn new() -> Self {
        Self { values: vec![0.0] }
    }

    pub fn value(&mut self, n: usize) -> f64 {
        if self.values.is_empty() {
            self.values.push(0.0);
        }
        while self.values.len() <= n {
            let next_index = self.values.len();
            let next_value = self.values[next_index - 1] + (next_index as f64).ln();
            self.values.push(next_value);
        }

        self.values[n]
    }
}

/// Wigner small-d matrix element `d^l_{m1,m2}(beta)` from the explicit
/// finite sum. Adequate for the modest degrees used by direct transforms.
pub fn wigner_small_d(
    degree: i32,
    m1: i32,
    m2: i32,
    beta: f64,
    log_factorial: &mut LogFactorial,
) -> f64 {
    if degree < 0 || m1.abs() > degree || m2.abs() > degree {
        return 0.0;
    }

    let half_cos = (0.5 * beta).cos();
    let half_sin = (0.5 * beta).sin();
    let prefactor_log = 0.5
        * (log_factorial.value((degree + m1) as usize)
            + log_factorial.value((degree - m1) as usize)
            + log_factorial.value((degree + m2) as usize)
            + log_factorial.value((degree - m2) as usize));

    let k_min = 0.max(m2 - m1);
    let k_max = (degree + m2).min(degree - m1);
    let mut result = 0.0;
    for k in k_min..=k_max {
        let denominator_log = log_factorial.value((degree + m2 - k) as usize)
            + log_factorial.value(k as usize)
            + log_factorial.value((degree - k - m1) as usize)
            + log_factorial.value((k - m2 + m1) as usize);
        let sign = if (k - m2 + m1).rem_euclid(2) == 0 {
            1.0
        } else {
            -1.0
        };
        let cos_power = 2 * degree - 2 * k + m2 - m1;
        let sin_power = 2 * k - m2 + m1;
        result += sign
            * (prefactor_log - denominator_log).exp()
            * half_cos.powi(cos_power)
            * half_sin.powi(sin_power);
    }

    result
}
