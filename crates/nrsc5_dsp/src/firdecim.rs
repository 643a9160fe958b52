use crate::cint16::CInt16;

const WINDOW_SIZE: usize = 2048;

/// Fixed-coefficient FIR filter operating on Q15 complex samples.
///
/// Coefficients are stored in reverse order so that new samples can be pushed
/// onto the tail of a sliding window and the dot product taken over the most
/// recent `taps.len()` entries. The window is periodically compacted instead
/// of wrapping, which keeps the inner product over contiguous memory.
pub struct FirQ15 {
    taps: Vec<i16>,
    window: Vec<CInt16>,
    idx: usize,
}

impl FirQ15 {
    pub fn new(taps: &[f32]) -> Self {
        let ntaps = taps.len();
        let mut q15_taps = vec![0i16; ntaps];
        for (i, tap) in q15_taps.iter_mut().enumerate() {
            *tap = (taps[ntaps - 1 - i] * 32767.0) as i16;
        }
        Self {
            taps: q15_taps,
            window: vec![CInt16::default(); WINDOW_SIZE],
            idx: ntaps - 1,
        }
    }

    pub fn reset(&mut self) {
        let ntaps = self.taps.len();
        self.window.fill(CInt16::default());
        self.idx = ntaps - 1;
    }

    fn push(&mut self, x: CInt16) {
        let ntaps = self.taps.len();
        if self.idx == WINDOW_SIZE {
            for i in 0..ntaps - 1 {
                self.window[i] = self.window[self.idx - ntaps + i];
            }
            self.idx = ntaps - 1;
        }
        self.window[self.idx] = x;
        self.idx += 1;
    }

    fn dotprod(&self) -> CInt16 {
        let ntaps = self.taps.len();
        let start = self.idx - ntaps;
        let mut sum_re: i32 = 0;
        let mut sum_im: i32 = 0;
        for (sample, tap) in self.window[start..self.idx].iter().zip(&self.taps) {
            sum_re += (sample.re as i32 * *tap as i32) >> 15;
            sum_im += (sample.im as i32 * *tap as i32) >> 15;
        }
        CInt16::new(
            sum_re.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            sum_im.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
        )
    }

    /// One-in, one-out filtering used on the acquisition path.
    pub fn execute(&mut self, x: CInt16) -> CInt16 {
        self.push(x);
        self.dotprod()
    }
}

/// FIR filter plus decimator for the sample front-end.
pub struct FirDecimQ15 {
    fir: FirQ15,
    decim: usize,
    phase: usize,
}

impl FirDecimQ15 {
    pub fn new(decim: usize, taps: &[f32]) -> Self {
        assert!(decim >= 1);
        Self {
            fir: FirQ15::new(taps),
            decim,
            phase: 0,
        }
    }

    pub fn reset(&mut self) {
        self.fir.reset();
        self.phase = 0;
    }

    /// Pushes one input sample; yields a filtered output every `decim`
    /// samples. The output is computed at the first sample of each group to
    /// match the reference front-end.
    pub fn execute(&mut self, x: CInt16) -> Option<CInt16> {
        let out = if self.phase == 0 {
            self.fir.push(x);
            Some(self.fir.dotprod())
        } else {
            self.fir.push(x);
            None
        };
        self.phase = (self.phase + 1) % self.decim;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_impulse_reproduces_taps() {
        let taps = [0.5f32, 0.25, -0.125, 0.0625];
        let mut fir = FirQ15::new(&taps);
        let mut out = Vec::new();
        out.push(fir.execute(CInt16::new(16384, 0)));
        for _ in 0..3 {
            out.push(fir.execute(CInt16::new(0, 0)));
        }
        // Impulse response replays the taps scaled by the impulse height.
        for (y, tap) in out.iter().zip(&taps) {
            let expected = (16384.0 * tap) as i32;
            assert!((y.re as i32 - expected).abs() <= 2, "got {} want {}", y.re, expected);
            assert_eq!(y.im, 0);
        }
    }

    #[test]
    fn decimator_keeps_every_nth_output() {
        let taps = [1.0f32, 0.0, 0.0, 0.0];
        let mut decim = FirDecimQ15::new(2, &taps);
        let mut outputs = 0;
        for i in 0..10i16 {
            if decim.execute(CInt16::new(i, 0)).is_some() {
                outputs += 1;
            }
        }
        assert_eq!(outputs, 5);
    }

    #[test]
    fn window_compaction_preserves_history() {
        let taps = [0.0f32, 0.0, 0.0, 1.0];
        let mut fir = FirQ15::new(&taps);
        let mut last = CInt16::default();
        for i in 0..(WINDOW_SIZE as i32 + 64) {
            last = fir.execute(CInt16::new((i % 100) as i16, 0));
        }
        // Reversed taps put the unity coefficient on the newest sample three
        // pushes ago; compaction across the window boundary must not lose it.
        let expected = ((WINDOW_SIZE as i32 + 63 - 3) % 100) as i16;
        assert!((last.re - expected).abs() <= 1);
    }
}
