//! Kaiser-windowed lowpass prototype design for the rate converter.

use std::f32::consts::PI;

fn lngamma(z: f32) -> f32 {
    if z < 10.0 {
        // gamma(z+1) = z * gamma(z)
        lngamma(z + 1.0) - z.ln()
    } else {
        let mut g = 0.5 * ((2.0 * PI).ln() - z.ln());
        g += z * ((z + (1.0 / (12.0 * z - 0.1 / z))).ln() - 1.0);
        g
    }
}

/// Modified Bessel function of the first kind, order zero.
fn besseli0(z: f32) -> f32 {
    if z == 0.0 {
        return 1.0;
    }
    let mut y = 0.0f32;
    for k in 0..32 {
        let t = k as f32 * (0.5 * z).ln() - lngamma(k as f32 + 1.0);
        y += (2.0 * t).exp();
    }
    y
}

fn sinc(x: f32) -> f32 {
    if x.abs() < 0.01 {
        (PI * x / 2.0).cos() * (PI * x / 4.0).cos() * (PI * x / 8.0).cos()
    } else {
        (PI * x).sin() / (PI * x)
    }
}

fn kaiser(n: usize, len: usize, beta: f32, mu: f32) -> f32 {
    let t = n as f32 - (len - 1) as f32 / 2.0 + mu;
    let r = 2.0 * t / len as f32;
    besseli0(beta * (1.0 - r * r).sqrt()) / besseli0(beta)
}

fn kaiser_beta(stopband_db: f32) -> f32 {
    let a = stopband_db.abs();
    if a > 50.0 {
        0.1102 * (a - 8.7)
    } else if a > 21.0 {
        0.5842 * (a - 21.0).powf(0.4) + 0.07886 * (a - 21.0)
    } else {
        0.0
    }
}

/// Designs an `n`-tap lowpass with cutoff `fc` (normalized to the sample
/// rate) and stopband attenuation `stopband_db`, with fractional sample
/// offset `mu`.
pub fn firdes_kaiser(n: usize, fc: f32, stopband_db: f32, mu: f32) -> Vec<f32> {
    let beta = kaiser_beta(stopband_db);
    (0..n)
        .map(|i| {
            let t = i as f32 - (n - 1) as f32 / 2.0 + mu;
            sinc(2.0 * fc * t) * kaiser(i, n, beta, mu)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prototype_is_symmetric_with_unity_peak() {
        let h = firdes_kaiser(257, 0.45 / 16.0, 60.0, 0.0);
        assert_eq!(h.len(), 257);
        for i in 0..h.len() / 2 {
            assert!((h[i] - h[h.len() - 1 - i]).abs() < 1e-5);
        }
        let peak = h[h.len() / 2];
        assert!(h.iter().all(|&x| x <= peak + 1e-6));
    }

    #[test]
    fn dc_gain_is_positive_and_finite() {
        let h = firdes_kaiser(257, 0.45 / 16.0, 60.0, 0.0);
        let gain: f32 = h.iter().sum();
        assert!(gain > 0.0 && gain.is_finite());
    }
}
