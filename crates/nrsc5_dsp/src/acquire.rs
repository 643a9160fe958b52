use crate::cint16::CInt16;
use crate::firdecim::FirQ15;
use crate::sync::{SoftBitSink, Sync, SyncFeedback, SyncState};
use nrsc5_core::nrsc5_mode::Mode;
use nrsc5_core::nrsc5_parameters::*;
use num::complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

// Acquisition filters, 32 taps each with group delay 15. The AM set also
// serves as the front-end decimation filter for that mode.
pub const FILTER_TAPS_FM: [f32; 32] = [
    -0.000685643230099231,
    0.005636964458972216,
    0.009015781804919243,
    -0.015486305579543114,
    -0.035108357667922974,
    0.017446253448724747,
    0.08155813068151474,
    0.007995186373591423,
    -0.13311293721199036,
    -0.0727422907948494,
    0.15914097428321838,
    0.16498781740665436,
    -0.1324498951435089,
    -0.2484012246131897,
    0.051773931831121445,
    0.2821577787399292,
    0.051773931831121445,
    -0.2484012246131897,
    -0.1324498951435089,
    0.16498781740665436,
    0.15914097428321838,
    -0.0727422907948494,
    -0.13311293721199036,
    0.007995186373591423,
    0.08155813068151474,
    0.017446253448724747,
    -0.035108357667922974,
    -0.015486305579543114,
    0.009015781804919243,
    0.005636964458972216,
    -0.000685643230099231,
    0.0,
];

pub const FILTER_TAPS_AM: [f32; 32] = [
    -0.00038464731187559664,
    -0.00021618751634377986,
    0.0026779419276863337,
    -0.00029802651260979474,
    -0.0012626448879018426,
    -0.0013182522961869836,
    -0.012252614833414555,
    0.015980124473571777,
    0.037112727761268616,
    -0.05451361835002899,
    -0.05804193392395973,
    0.11320608854293823,
    0.055298302322626114,
    -0.16878043115139008,
    -0.022917453199625015,
    0.19178225100040436,
    -0.022917453199625015,
    -0.16878043115139008,
    0.055298302322626114,
    0.11320608854293823,
    -0.05804193392395973,
    -0.05451361835002899,
    0.037112727761268616,
    0.015980124473571777,
    -0.012252614833414555,
    -0.0013182522961869836,
    -0.0012626448879018426,
    -0.00029802651260979474,
    0.0026779419276863337,
    -0.00021618751634377986,
    -0.00038464731187559664,
    0.0,
];

/// Pulse shaping window: sine ramp over the cyclic prefix, flat across the
/// FFT payload, cosine ramp over the trailing overlap.
fn build_shape(fft: usize, cp: usize) -> Vec<f32> {
    let fftcp = fft + cp;
    (0..fftcp)
        .map(|i| {
            if i < cp {
                (PI / 2.0 * i as f32 / cp as f32).sin()
            } else if i < fft {
                1.0
            } else {
                (PI / 2.0 * (i - fft) as f32 / cp as f32).cos()
            }
        })
        .collect()
}

fn fftshift(buf: &mut [Complex32]) {
    let half = buf.len() / 2;
    for i in 0..half {
        buf.swap(i, i + half);
    }
}

/// Symbol timing and carrier recovery.
///
/// Consumes `(ACQUIRE_SYMBOLS + 1)` symbol periods of baseband samples per
/// pass, leaving one symbol of overlap for the next call, and hands
/// `ACQUIRE_SYMBOLS` frequency-domain symbols to the reference tracker.
/// While unsynchronized it searches for symbol timing with a cyclic-prefix
/// autocorrelation; once the tracker reports fine lock it applies the
/// tracker's timing and phase corrections instead.
pub struct Acquire {
    mode: Mode,
    fft: usize,
    fftcp: usize,
    cp: usize,
    fft_plan_fm: Arc<dyn Fft<f32>>,
    fft_plan_am: Arc<dyn Fft<f32>>,
    shape_fm: Vec<f32>,
    shape_am: Vec<f32>,
    filter_fm: FirQ15,
    filter_am: FirQ15,
    in_buffer: Vec<CInt16>,
    idx: usize,
    buffer: Vec<Complex32>,
    sums: Vec<Complex32>,
    fftin: Vec<Complex32>,
    /// Carrier phase accumulator, kept at unit magnitude.
    phase: Complex32,
    prev_angle: f32,
    /// Integer carrier offset in FFT bins, folded into the mixing angle.
    cfo: i32,
}

impl Acquire {
    pub fn new(mode: Mode) -> Self {
        let mut planner = FftPlanner::new();
        let fft_plan_fm = planner.plan_fft_forward(FFT_FM);
        let fft_plan_am = planner.plan_fft_forward(FFT_AM);

        let mut acquire = Self {
            mode: Mode::Fm,
            fft: FFT_FM,
            fftcp: FFTCP_FM,
            cp: CP_FM,
            fft_plan_fm,
            fft_plan_am,
            shape_fm: build_shape(FFT_FM, CP_FM),
            shape_am: build_shape(FFT_AM, CP_AM),
            filter_fm: FirQ15::new(&FILTER_TAPS_FM),
            filter_am: FirQ15::new(&FILTER_TAPS_AM),
            in_buffer: vec![CInt16::default(); FFTCP_FM * (ACQUIRE_SYMBOLS + 1)],
            idx: 0,
            buffer: vec![Complex32::default(); FFTCP_FM * (ACQUIRE_SYMBOLS + 1)],
            sums: vec![Complex32::default(); FFTCP_FM],
            fftin: vec![Complex32::default(); FFT_FM],
            phase: Complex32::new(1.0, 0.0),
            prev_angle: 0.0,
            cfo: 0,
        };
        acquire.set_mode(mode);
        acquire
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        match mode {
            Mode::Fm => {
                self.fft = FFT_FM;
                self.fftcp = FFTCP_FM;
                self.cp = CP_FM;
            }
            Mode::Am => {
                self.fft = FFT_AM;
                self.fftcp = FFTCP_AM;
                self.cp = CP_AM;
            }
        }
    }

    pub fn reset(&mut self) {
        self.filter_fm.reset();
        self.filter_am.reset();
        self.idx = 0;
        self.prev_angle = 0.0;
        self.phase = Complex32::new(1.0, 0.0);
        self.cfo = 0;
    }

    /// Adds `cfo` FFT bins to the integer carrier offset.
    pub fn cfo_adjust(&mut self, cfo: i32) {
        self.cfo += cfo;
    }

    /// Copies one symbol period worth of samples from `buf`, or nothing if
    /// fewer are available. Returns the number of samples consumed.
    pub fn push(&mut self, buf: &[CInt16]) -> usize {
        let needed = self.fftcp - self.idx % self.fftcp;
        if buf.len() < needed {
            return 0;
        }
        self.in_buffer[self.idx..self.idx + needed].copy_from_slice(&buf[..needed]);
        self.idx += needed;
        needed
    }

    fn to_cf(&self, x: CInt16) -> Complex32 {
        match self.mode {
            Mode::Fm => x.to_cf_conj(),
            Mode::Am => x.to_cf(),
        }
    }

    /// Windows symbol `sym` of the working buffer into the FFT input with
    /// cyclic-prefix overlap, advancing the carrier phase one sample at a
    /// time. Returns the carrier phase after the symbol.
    fn fill_fftin(&mut self, sym: usize, samperr: usize, mut phase: Complex32, increment: Complex32) -> Complex32 {
        let offset = match self.mode {
            Mode::Fm => 0,
            Mode::Am => (FFT_AM - CP_AM) / 2,
        };
        let shape = match self.mode {
            Mode::Fm => &self.shape_fm,
            Mode::Am => &self.shape_am,
        };
        for j in 0..self.fftcp {
            let sample = phase * self.buffer[sym * self.fftcp + j + samperr];
            let bin = (j + offset) % self.fft;
            if j < self.cp {
                self.fftin[bin] = shape[j] * sample;
            } else if j < self.fft {
                self.fftin[bin] = sample;
            } else {
                self.fftin[bin] += shape[j] * sample;
            }
            phase *= increment;
        }
        phase / phase.norm()
    }

    fn run_fft(&mut self) {
        let plan = match self.mode {
            Mode::Fm => &self.fft_plan_fm,
            Mode::Am => &self.fft_plan_am,
        };
        plan.process(&mut self.fftin[..self.fft]);
        fftshift(&mut self.fftin[..self.fft]);
    }

    /// One acquisition pass. Requires a full input buffer; otherwise a no-op.
    pub fn process<S: SoftBitSink>(
        &mut self,
        state: &mut SyncState,
        fb: &mut SyncFeedback,
        sync: &mut Sync,
        sink: &mut S,
    ) {
        let fftcp = self.fftcp;
        let fft = self.fft;
        if self.idx != fftcp * (ACQUIRE_SYMBOLS + 1) {
            return;
        }

        let mut samperr: usize = 0;
        let angle;

        if *state == SyncState::Fine {
            samperr = (fftcp as i32 / 2 + fb.samperr).clamp(0, fftcp as i32 - 1) as usize;
            fb.samperr = 0;

            let angle_diff = -fb.angle;
            fb.angle = 0.0;
            angle = self.prev_angle + angle_diff;
            self.prev_angle = angle;
        } else {
            // Filter the whole window and search the cyclic-prefix
            // autocorrelation for symbol timing.
            for i in 0..fftcp * (ACQUIRE_SYMBOLS + 1) {
                let y = match self.mode {
                    Mode::Fm => self.filter_fm.execute(self.in_buffer[i]),
                    Mode::Am => self.filter_am.execute(self.in_buffer[i]),
                };
                self.buffer[i] = self.to_cf(y);
            }

            for s in self.sums[..fftcp].iter_mut() {
                *s = Complex32::default();
            }
            for i in 0..fftcp {
                for j in 0..ACQUIRE_SYMBOLS {
                    self.sums[i] +=
                        self.buffer[i + j * fftcp] * self.buffer[i + j * fftcp + fft].conj();
                }
            }

            let shape = match self.mode {
                Mode::Fm => &self.shape_fm,
                Mode::Am => &self.shape_am,
            };
            let mut max_mag = -1.0f32;
            let mut max_v = Complex32::default();
            for i in 0..fftcp {
                let mut v = Complex32::default();
                for j in 0..self.cp {
                    v += self.sums[(i + j) % fftcp] * shape[j] * shape[j + fft];
                }
                let mag = v.norm_sqr();
                if mag > max_mag {
                    max_mag = mag;
                    max_v = v;
                    samperr = (i + fftcp - FILTER_DELAY) % fftcp;
                }
            }

            let angle_diff = (max_v * Complex32::from_polar(1.0, -self.prev_angle)).arg();
            let angle_factor = if self.prev_angle != 0.0 { 0.25 } else { 1.0 };
            angle = self.prev_angle + angle_diff * angle_factor;
            self.prev_angle = angle;
            if *state == SyncState::None {
                *state = SyncState::Coarse;
            }
        }

        for i in 0..fftcp * (ACQUIRE_SYMBOLS + 1) {
            self.buffer[i] = self.to_cf(self.in_buffer[i]);
        }

        sync.adjust_timing(fftcp as i32 / 2 - samperr as i32, fb);
        let angle = angle - 2.0 * PI * self.cfo as f32;

        self.phase *= Complex32::from_polar(
            1.0,
            -(fftcp as f32 / 2.0 - samperr as f32) * angle / fft as f32,
        );
        let mut phase_increment = Complex32::from_polar(1.0, angle / fft as f32);

        if self.mode == Mode::Am {
            phase_increment = self.am_carrier_tracking(state, samperr, phase_increment);
        }

        for i in 0..ACQUIRE_SYMBOLS {
            self.phase = self.fill_fftin(i, samperr, self.phase, phase_increment);
            self.run_fft();
            sync.push_symbol(&self.fftin[..fft], state, fb, sink);
        }

        let keep = (fftcp as i32 + (fftcp as i32 / 2 - samperr as i32)) as usize;
        self.in_buffer.copy_within(self.idx - keep..self.idx, 0);
        self.idx = keep;
    }

    /// AM carrier recovery: an integer CFO search over the PIDS subcarrier
    /// neighborhood plus a linear regression of the center-carrier phase for
    /// the fractional offset.
    fn am_carrier_tracking(
        &mut self,
        state: &SyncState,
        samperr: usize,
        phase_increment: Complex32,
    ) -> Complex32 {
        let mut sum_y = 0.0f32;
        let mut sum_xy = 0.0f32;
        let mut sum_x2 = 0.0f32;
        let mut y = 0.0f32;
        let mut last_carrier = Complex32::new(1.0, 0.0);
        let mut mag_sums = [0.0f32; FFT_AM];
        let mut temp_phase = self.phase;

        for i in 0..ACQUIRE_SYMBOLS {
            temp_phase = self.fill_fftin(i, samperr, temp_phase, phase_increment);
            self.run_fft();

            let x = self.fftcp as f32 * (i as f32 - (ACQUIRE_SYMBOLS - 1) as f32 / 2.0);
            if i == 0 {
                y = self.fftin[CENTER_AM].arg();
            } else {
                y += (self.fftin[CENTER_AM] / last_carrier).arg();
            }
            last_carrier = self.fftin[CENTER_AM];

            sum_y += y;
            sum_xy += x * y;
            sum_x2 += x * x;

            if *state != SyncState::Fine {
                for j in CENTER_AM - PIDS_OUTER_INDEX_AM..=CENTER_AM + PIDS_OUTER_INDEX_AM {
                    mag_sums[j] += self.fftin[j].norm();
                }
            }
        }

        if *state != SyncState::Fine {
            let mut max_mag = -1.0f32;
            let mut max_index = CENTER_AM;
            for j in CENTER_AM - PIDS_OUTER_INDEX_AM..=CENTER_AM + PIDS_OUTER_INDEX_AM {
                if mag_sums[j] > max_mag {
                    max_mag = mag_sums[j];
                    max_index = j;
                }
            }
            self.cfo_adjust(max_index as i32 - CENTER_AM as i32);
        }

        let slope = sum_xy / sum_x2;
        // TODO: confirm the 0.06 rad bias against a known-good capture
        self.phase *= Complex32::from_polar(
            1.0,
            -sum_y / ACQUIRE_SYMBOLS as f32 + slope * ACQUIRE_SYMBOLS as f32 * self.fftcp as f32 / 2.0
                - 0.06,
        );
        phase_increment * Complex32::from_polar(1.0, -slope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tests::NullSink;

    #[test]
    fn shape_window_covers_prefix_payload_and_tail() {
        let shape = build_shape(FFT_FM, CP_FM);
        assert_eq!(shape.len(), FFTCP_FM);
        assert_eq!(shape[0], 0.0);
        assert!((shape[CP_FM] - 1.0).abs() < 1e-6);
        assert!((shape[FFT_FM - 1] - 1.0).abs() < 1e-6);
        assert!(shape[FFTCP_FM - 1] < 0.05);
        // Overlapped prefix and tail sum to unity power at the seam.
        for i in 0..CP_FM {
            let s = shape[i] * shape[i] + shape[i + FFT_FM] * shape[i + FFT_FM];
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn push_consumes_whole_symbols_only() {
        let mut acq = Acquire::new(Mode::Fm);
        let short = vec![CInt16::default(); FFTCP_FM - 1];
        assert_eq!(acq.push(&short), 0);
        let full = vec![CInt16::default(); FFTCP_FM + 10];
        assert_eq!(acq.push(&full), FFTCP_FM);
        assert_eq!(acq.push(&full), FFTCP_FM);
    }

    #[test]
    fn all_zero_input_does_not_sync() {
        let mut acq = Acquire::new(Mode::Fm);
        let mut sync = Sync::new();
        let mut state = SyncState::None;
        let mut fb = SyncFeedback::default();
        let mut sink = NullSink::default();

        let zeros = vec![CInt16::default(); FFTCP_FM];
        for _ in 0..(ACQUIRE_SYMBOLS + 1) {
            assert_eq!(acq.push(&zeros), FFTCP_FM);
        }
        acq.process(&mut state, &mut fb, &mut sync, &mut sink);

        // A coarse timing estimate exists but nothing downstream locks.
        assert_ne!(state, SyncState::Fine);
        assert!(sync.take_events().iter().all(|e| !matches!(e, crate::sync::SyncEvent::Synced { .. })));
        assert_eq!(sink.pm_bits, 0);
    }

    #[test]
    fn process_leaves_one_symbol_of_overlap() {
        let mut acq = Acquire::new(Mode::Fm);
        let mut sync = Sync::new();
        let mut state = SyncState::None;
        let mut fb = SyncFeedback::default();
        let mut sink = NullSink::default();

        let samples: Vec<CInt16> = (0..FFTCP_FM)
            .map(|i| CInt16::new((i % 251) as i16 * 64, (i % 13) as i16 * 64))
            .collect();
        for _ in 0..(ACQUIRE_SYMBOLS + 1) {
            acq.push(&samples);
        }
        acq.process(&mut state, &mut fb, &mut sync, &mut sink);
        // keep = fftcp + (fftcp/2 - samperr) with samperr in [0, fftcp)
        assert!(acq.idx > FFTCP_FM / 2 && acq.idx <= FFTCP_FM + FFTCP_FM / 2);
    }
}
