//! Statistical primitives: sample summaries and Welch's t-test.
//!
//! The p-value comes from the regularized incomplete beta identity
//! `P(|T| > t) = I_x(df/2, 1/2)` with `x = df/(df + t²)`, evaluated with
//! a Lentz continued fraction. Self-contained on purpose: the only
//! consumers are the regression detector and the A/B framework, both of
//! which need exactly this one test.

/// Summary of one sample.
#[derive(Debug, Clone, Copy)]
pub struct SampleStats {
    pub n: usize,
    pub mean: f64,
    /// Sample variance (n − 1 denominator).
    pub var: f64,
}

impl SampleStats {
    pub fn from_slice(values: &[f64]) -> Self {
        let n = values.len();
        if n == 0 {
            return Self {
                n: 0,
                mean: 0.0,
                var: 0.0,
            };
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let var = if n < 2 {
            0.0
        } else {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        };
        Self { n, mean, var }
    }
}

/// Outcome of a two-sample Welch test.
#[derive(Debug, Clone, Copy)]
pub struct WelchResult {
    pub t: f64,
    pub df: f64,
    /// Two-sided p-value.
    pub p_value: f64,
}

/// Welch's unequal-variance t-test, two-sided.
///
/// Returns `None` when either sample has fewer than two observations.
/// Degenerate zero-variance samples short-circuit: equal means give
/// p = 1, different means give p = 0.
pub fn welch_t_test(a: &SampleStats, b: &SampleStats) -> Option<WelchResult> {
    if a.n < 2 || b.n < 2 {
        return None;
    }

    let se_a = a.var / a.n as f64;
    let se_b = b.var / b.n as f64;
    let se = (se_a + se_b).sqrt();

    if se == 0.0 {
        let p = if (a.mean - b.mean).abs() < f64::EPSILON {
            1.0
        } else {
            0.0
        };
        return Some(WelchResult {
            t: 0.0,
            df: (a.n + b.n - 2) as f64,
            p_value: p,
        });
    }

    let t = (a.mean - b.mean) / se;
    // Welch–Satterthwaite degrees of freedom.
    let df = (se_a + se_b).powi(2)
        / (se_a.powi(2) / (a.n - 1) as f64 + se_b.powi(2) / (b.n - 1) as f64);

    let x = df / (df + t * t);
    let p_value = incomplete_beta(df / 2.0, 0.5, x).clamp(0.0, 1.0);

    Some(WelchResult { t, df, p_value })
}

/// Lanczos log-gamma (g = 7, n = 9).
fn ln_gamma(z: f64) -> f64 {
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_93,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_13,
        -176.615_029_162_140_59,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_571_6e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if z < 0.5 {
        // Reflection formula.
        let pi = std::f64::consts::PI;
        return (pi / (pi * z).sin()).ln() - ln_gamma(1.0 - z);
    }
    let z = z - 1.0;
    let mut x = COEFFS[0];
    for (i, c) in COEFFS.iter().enumerate().skip(1) {
        x += c / (z + i as f64);
    }
    let t = z + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (z + 0.5) * t.ln() - t + x.ln()
}

/// Continued-fraction evaluation for the incomplete beta function
/// (modified Lentz).
fn beta_cf(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 200;
    const EPS: f64 = 3e-12;
    const FPMIN: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m_f = m as f64;
        let m2 = 2.0 * m_f;

        let aa = m_f * (b - m_f) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m_f) * (qab + m_f) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;

        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Regularized incomplete beta function I_x(a, b).
fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_bt = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let bt = ln_bt.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        bt * beta_cf(a, b, x) / a
    } else {
        1.0 - bt * beta_cf(b, a, 1.0 - x) / b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ln_gamma_matches_known_values() {
        // Γ(5) = 24, Γ(0.5) = √π
        assert!((ln_gamma(5.0) - 24.0f64.ln()).abs() < 1e-10);
        assert!((ln_gamma(0.5) - std::f64::consts::PI.sqrt().ln()).abs() < 1e-10);
    }

    #[test]
    fn incomplete_beta_symmetry_point() {
        // I_{0.5}(a, a) = 0.5 for any a.
        assert!((incomplete_beta(0.5, 0.5, 0.5) - 0.5).abs() < 1e-9);
        assert!((incomplete_beta(2.0, 2.0, 0.5) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn welch_p_value_matches_tables() {
        // t = 2.0 at df = 10 has a two-sided p of about 0.0734. Build two
        // samples that produce exactly that t and df: equal n, equal var.
        // With n = 6 per arm and var v, t = d/sqrt(2v/6), df = 10.
        // Choose d = 1.0, v = 3/(2*2²)=0.75 → t = 2.0.
        let a = SampleStats {
            n: 6,
            mean: 1.0,
            var: 0.75,
        };
        let b = SampleStats {
            n: 6,
            mean: 0.0,
            var: 0.75,
        };
        let result = welch_t_test(&a, &b).unwrap();
        assert!((result.t - 2.0).abs() < 1e-9);
        assert!((result.df - 10.0).abs() < 1e-9);
        assert!(
            (result.p_value - 0.0734).abs() < 5e-3,
            "p = {}",
            result.p_value
        );
    }

    #[test]
    fn welch_identical_samples_are_insignificant() {
        let values = [0.9, 0.91, 0.89, 0.92, 0.9, 0.88];
        let stats = SampleStats::from_slice(&values);
        let result = welch_t_test(&stats, &stats).unwrap();
        assert!(result.p_value > 0.99);
    }

    #[test]
    fn welch_separated_samples_are_significant() {
        let a: Vec<f64> = (0..40).map(|i| 0.93 + if i % 2 == 0 { 0.05 } else { -0.05 }).collect();
        let b: Vec<f64> = (0..40).map(|i| 0.80 + if i % 2 == 0 { 0.05 } else { -0.05 }).collect();
        let result =
            welch_t_test(&SampleStats::from_slice(&a), &SampleStats::from_slice(&b)).unwrap();
        assert!(result.p_value < 0.001, "p = {}", result.p_value);
        assert!(result.t > 0.0);
    }

    #[test]
    fn welch_requires_two_observations_per_arm() {
        let one = SampleStats::from_slice(&[0.5]);
        let many = SampleStats::from_slice(&[0.5, 0.6, 0.7]);
        assert!(welch_t_test(&one, &many).is_none());
    }

    #[test]
    fn welch_zero_variance_degenerate_cases() {
        let flat_a = SampleStats::from_slice(&[0.9, 0.9, 0.9]);
        let flat_b = SampleStats::from_slice(&[0.8, 0.8, 0.8]);
        assert_eq!(welch_t_test(&flat_a, &flat_b).unwrap().p_value, 0.0);
        assert_eq!(welch_t_test(&flat_a, &flat_a).unwrap().p_value, 1.0);
    }

    #[test]
    fn sample_stats_from_slice() {
        let stats = SampleStats::from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(stats.n, 3);
        assert!((stats.mean - 2.0).abs() < 1e-12);
        assert!((stats.var - 1.0).abs() < 1e-12);
    }
}
