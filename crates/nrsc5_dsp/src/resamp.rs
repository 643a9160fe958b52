use crate::cint16::CInt16;
use crate::firdes::firdes_kaiser;
use num::complex::Complex32;

const WINDOW_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, Default)]
struct CInt32 {
    re: i32,
    im: i32,
}

fn cq31_to_cf(x: CInt32) -> Complex32 {
    Complex32::new(x.re as f32 / 2147483647.0, x.im as f32 / 2147483647.0)
}

/// Polyphase filter bank over Q31 complex samples. Each of the `nf` branches
/// holds `h_len / nf` coefficients evaluated over a shared input window.
struct FirPfbQ31 {
    nf: usize,
    h: Vec<i32>,
    h_sub_len: usize,
    window: Vec<CInt32>,
    idx: usize,
}

impl FirPfbQ31 {
    fn new(nf: usize, taps: &[f32]) -> Self {
        let h_len = taps.len();
        let h_sub_len = h_len / nf;
        assert!(h_sub_len * nf == h_len, "Tap count must split evenly across the filter bank");

        // Branch-major, reversed within each branch so new samples push onto
        // the window tail.
        let mut h = vec![0i32; h_len];
        for i in 0..nf {
            for j in 0..h_sub_len {
                h[i * h_sub_len + j] =
                    (taps[(h_sub_len - 1 - j) * nf + i] as f64 * 2147483647.0).round() as i32;
            }
        }

        Self {
            nf,
            h,
            h_sub_len,
            window: vec![CInt32::default(); WINDOW_SIZE],
            idx: h_sub_len - 1,
        }
    }

    fn reset(&mut self) {
        self.window.fill(CInt32::default());
        self.idx = self.h_sub_len - 1;
    }

    fn push(&mut self, x: CInt32) {
        if self.idx == WINDOW_SIZE {
            for i in 0..self.h_sub_len - 1 {
                self.window[i] = self.window[self.idx - self.h_sub_len + i];
            }
            self.idx = self.h_sub_len - 1;
        }
        self.window[self.idx] = x;
        self.idx += 1;
    }

    fn execute(&self, branch: usize) -> CInt32 {
        debug_assert!(branch < self.nf);
        let taps = &self.h[branch * self.h_sub_len..(branch + 1) * self.h_sub_len];
        let window = &self.window[self.idx - self.h_sub_len..self.idx];
        let mut sum_re: i64 = 0;
        let mut sum_im: i64 = 0;
        for (sample, tap) in window.iter().zip(taps) {
            sum_re += (sample.re as i64 * *tap as i64) >> 31;
            sum_im += (sample.im as i64 * *tap as i64) >> 31;
        }
        CInt32 {
            re: sum_re.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            im: sum_im.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
        }
    }
}

enum ResampState {
    /// Between input samples; only branch zero of the next sample remains.
    Boundary,
    /// Regular interpolation between adjacent branches.
    Interp,
}

/// Arbitrary-rate resampler: a Kaiser-designed polyphase bank with linear
/// interpolation between adjacent branch outputs. The rate is nominally 1.0
/// and trimmed by the symbol-tracking feedback to absorb clock drift.
pub struct ResampQ15 {
    rate: f32,
    del: f32,
    tau: f32,
    bf: f32,
    b: i32,
    mu: f32,
    y0: CInt32,
    y1: CInt32,
    npfb: usize,
    pfb: FirPfbQ31,
    state: ResampState,
}

impl ResampQ15 {
    /// `m` is the prototype semi-length in output samples, `fc` the cutoff,
    /// `stopband_db` the attenuation and `npfb` the branch count.
    pub fn new(m: usize, fc: f32, stopband_db: f32, npfb: usize) -> Self {
        let n = 2 * m * npfb + 1;
        let mut taps = firdes_kaiser(n, fc / npfb as f32, stopband_db, 0.0);

        // Normalize by DC gain so the bank is unity-gain per branch.
        let gain: f32 = taps.iter().sum();
        let gain = npfb as f32 / gain;
        for tap in &mut taps {
            *tap *= gain;
        }

        Self {
            rate: 1.0,
            del: 1.0,
            tau: 0.0,
            bf: 0.0,
            b: 0,
            mu: 0.0,
            y0: CInt32::default(),
            y1: CInt32::default(),
            npfb,
            pfb: FirPfbQ31::new(npfb, &taps[..n - 1]),
            state: ResampState::Interp,
        }
    }

    pub fn set_rate(&mut self, rate: f32) {
        self.rate = rate;
        self.del = 1.0 / rate;
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn reset(&mut self) {
        self.pfb.reset();
        self.tau = 0.0;
        self.bf = 0.0;
        self.b = 0;
        self.mu = 0.0;
        self.state = ResampState::Interp;
    }

    fn update_timing_state(&mut self) {
        self.tau += self.del;
        self.bf = self.tau * self.npfb as f32;
        self.b = self.bf.floor() as i32;
        self.mu = self.bf - self.b as f32;
    }

    /// Pushes one Q15 sample and appends the resampled output (zero or more
    /// samples) to `out`.
    pub fn execute(&mut self, x: CInt16, out: &mut Vec<Complex32>) {
        self.pfb.push(CInt32 {
            re: (x.re as i32) << 16,
            im: (x.im as i32) << 16,
        });

        while self.b < self.npfb as i32 {
            match self.state {
                ResampState::Interp => {
                    self.y0 = self.pfb.execute(self.b as usize);
                    if self.b == self.npfb as i32 - 1 {
                        self.state = ResampState::Boundary;
                        self.b = self.npfb as i32;
                    } else {
                        self.y1 = self.pfb.execute(self.b as usize + 1);
                        out.push(
                            cq31_to_cf(self.y0) * (1.0 - self.mu) + cq31_to_cf(self.y1) * self.mu,
                        );
                        self.update_timing_state();
                    }
                }
                ResampState::Boundary => {
                    self.y1 = self.pfb.execute(0);
                    out.push(
                        cq31_to_cf(self.y0) * (1.0 - self.mu) + cq31_to_cf(self.y1) * self.mu,
                    );
                    self.update_timing_state();
                    self.state = ResampState::Interp;
                }
            }
        }

        self.tau -= 1.0;
        self.bf -= self.npfb as f32;
        self.b -= self.npfb as i32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(rate: f32, total_in: usize) -> usize {
        let mut resamp = ResampQ15::new(8, 0.45, 60.0, 16);
        resamp.set_rate(rate);
        let mut out = Vec::new();
        for i in 0..total_in {
            let x = CInt16::new(if i % 2 == 0 { 8192 } else { -8192 }, 0);
            resamp.execute(x, &mut out);
        }
        out.len()
    }

    #[test]
    fn unity_rate_is_one_to_one_on_average() {
        let n = run(1.0, 10_000);
        assert!((n as i32 - 10_000).abs() <= 1, "got {n} outputs");
    }

    #[test]
    fn rate_trim_changes_output_count() {
        let fast = run(1.001, 10_000);
        let slow = run(0.999, 10_000);
        assert!(fast > 10_000 && slow < 10_000, "fast={fast} slow={slow}");
    }

    #[test]
    fn dc_input_passes_at_unity_gain() {
        let mut resamp = ResampQ15::new(8, 0.45, 60.0, 16);
        let mut out = Vec::new();
        for _ in 0..2_000 {
            resamp.execute(CInt16::new(16384, 0), &mut out);
        }
        // Skip the filter transient, then the output should settle at the
        // input level (0.5 full scale).
        let tail = &out[out.len() - 256..];
        for y in tail {
            assert!((y.re - 0.5).abs() < 0.01, "got {}", y.re);
            assert!(y.im.abs() < 0.01);
        }
    }
}
