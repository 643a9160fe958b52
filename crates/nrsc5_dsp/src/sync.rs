use itertools::izip;
use log::{debug, info};
use nrsc5_core::nrsc5_parameters::*;
use num::complex::Complex32;
use std::f32::consts::PI;

/// Differentially decoded sync bits carried by every reference subcarrier.
const SYNC_BITS: [i8; 7] = [-1, 1, -1, -1, -1, 1, 1];

/// Block-sync needle: 10 fixed bits, parity/don't-care region, 11 fixed
/// bits. Negative entries are don't-cares.
const BLOCK_NEEDLE: [i8; 24] = [
    0, 1, 1, 0, 0, 1, 0, -1, -1, 1, 1, 0, 0, 1, 0, -1, 0, 0, 0, 0, -1, 1, 1, 1,
];

/// Smoothing factor for the per-reference slope estimate.
const SLOPE_EMA: f32 = 0.9;
/// Timing-feedback history depth, in acquire passes.
const TIMING_HISTORY: i32 = 16;
/// Gain applied to the measured clock drift before it reaches the resampler.
const RATE_GAIN: f32 = 0.1;

/// Pipeline synchronization progress, shared between the acquisition and
/// tracking stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    None,
    Coarse,
    Fine,
}

/// The single backward control edge of the pipeline: corrections written by
/// the tracker and consumed upstream on the next pass.
#[derive(Debug, Default)]
pub struct SyncFeedback {
    /// Fine timing correction in samples, consumed and zeroed by Acquire.
    pub samperr: i32,
    /// Fine carrier angle increment, consumed and zeroed by Acquire.
    pub angle: f32,
    /// Baseband samples the input ring should drop to reach block zero.
    pub skip_samples: usize,
    /// Integer CFO bins for Acquire's mixing angle.
    pub cfo_bins: i32,
    /// Resampler rate trim absorbing clock drift.
    pub rate_adjust: f32,
}

/// Consumer of the demodulated soft bits, one per logical stream.
pub trait SoftBitSink {
    fn push_pm(&mut self, bit: i8);
    fn push_px1(&mut self, bit: i8);
    /// Current L1 block index within the P1 frame.
    fn block(&self) -> usize;
    /// Restart the frame alignment from block zero.
    fn reset(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Synced { psmi: i32 },
    LostSync,
    Mer { lower_db: f32, upper_db: f32 },
    Psmi { psmi: i32 },
}

/// Frequency-domain reference-subcarrier tracker.
///
/// Collects one L1 block (BLKSZ symbols) of FFT output, corrects the phase
/// and slope of every reference subcarrier, locates block zero, and turns
/// the data subcarriers into MER-weighted soft bits. Also hosts the coarse
/// CFO sweep used before block alignment is found.
pub struct Sync {
    /// One block of spectra, laid out bin-major: `[bin * BLKSZ + symbol]`.
    buffer: Vec<Complex32>,
    phases: Vec<f32>,
    prev_slope: Vec<f32>,
    ref_buf: [u8; BLKSZ],
    idx: usize,
    ready: bool,
    psmi: i32,
    reported_psmi: i32,
    cfo_wait: u32,
    mer_cnt: u32,
    error_lb: f32,
    error_ub: f32,
    samperr_acc: i32,
    adjust_cnt: i32,
    events: Vec<SyncEvent>,
}

impl Default for Sync {
    fn default() -> Self {
        Self::new()
    }
}

impl Sync {
    pub fn new() -> Self {
        Self {
            buffer: vec![Complex32::default(); BLKSZ * FFT_FM],
            phases: vec![0.0; BLKSZ * FFT_FM],
            prev_slope: vec![0.0; FFT_FM],
            ref_buf: [0; BLKSZ],
            idx: 0,
            ready: false,
            psmi: 1,
            reported_psmi: 1,
            cfo_wait: 0,
            mer_cnt: 0,
            error_lb: 0.0,
            error_ub: 0.0,
            samperr_acc: 0,
            adjust_cnt: 0,
            events: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.idx = 0;
        self.ready = false;
        self.psmi = 1;
        self.cfo_wait = 0;
        self.mer_cnt = 0;
        self.error_lb = 0.0;
        self.error_ub = 0.0;
        self.samperr_acc = 0;
        self.adjust_cnt = 0;
        self.prev_slope.fill(0.0);
        self.events.clear();
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn psmi(&self) -> i32 {
        self.psmi
    }

    /// Drains the notices produced since the last call.
    pub fn take_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    /// Timing deviation observed by Acquire, accumulated into a resampler
    /// rate trim once enough history exists.
    pub fn adjust_timing(&mut self, sample_adj: i32, fb: &mut SyncFeedback) {
        self.samperr_acc += sample_adj;
        self.adjust_cnt += 1;
        if self.adjust_cnt == TIMING_HISTORY {
            let span = (TIMING_HISTORY as usize * ACQUIRE_SYMBOLS * FFTCP_FM) as f32;
            fb.rate_adjust += self.samperr_acc as f32 / span * RATE_GAIN;
            self.samperr_acc = 0;
            self.adjust_cnt = 0;
        }
    }

    /// Accepts one frequency-domain symbol from Acquire. Tracking only runs
    /// on the FM waveform geometry.
    pub fn push_symbol<S: SoftBitSink>(
        &mut self,
        fftout: &[Complex32],
        state: &mut SyncState,
        fb: &mut SyncFeedback,
        sink: &mut S,
    ) {
        if fftout.len() != FFT_FM {
            return;
        }
        for (i, x) in fftout.iter().enumerate() {
            self.buffer[i * BLKSZ + self.idx] = *x;
        }
        self.idx += 1;
        if self.idx == BLKSZ {
            self.idx = 0;
            self.process(state, fb, sink);
        }
    }

    fn calc_phase(&self, ref_idx: usize) -> (f32, f32) {
        let col = &self.buffer[ref_idx * BLKSZ..(ref_idx + 1) * BLKSZ];

        // Squaring removes the DBPSK modulation from the pilots.
        let sum: Complex32 = col.iter().map(|x| x * x).sum();
        let phase = sum.arg() * 0.5;

        let sum: Complex32 = izip!(col.iter(), col.iter().skip(1))
            .map(|(a, b)| {
                let d = a.conj() * b;
                d * d
            })
            .sum();
        let slope = sum.arg() * 0.5;

        (phase, slope)
    }

    fn adjust_ref(&mut self, ref_idx: usize) {
        let (phase, mut slope) = self.calc_phase(ref_idx);

        if self.prev_slope[ref_idx] != 0.0 {
            slope = slope * (1.0 - SLOPE_EMA) + self.prev_slope[ref_idx] * SLOPE_EMA;
        }
        self.prev_slope[ref_idx] = slope;

        for n in 0..BLKSZ {
            let item_phase = phase + slope * (n as i32 - (BLKSZ as i32 - 1) / 2) as f32;
            self.phases[ref_idx * BLKSZ + n] = item_phase;
            self.buffer[ref_idx * BLKSZ + n] *= Complex32::from_polar(1.0, -item_phase);
        }

        // Resolve the 180-degree ambiguity against the known sync bits.
        let x: f32 = SYNC_BITS
            .iter()
            .enumerate()
            .map(|(n, s)| self.buffer[ref_idx * BLKSZ + n].re * *s as f32)
            .sum();
        if x < 0.0 {
            for n in 0..BLKSZ {
                self.phases[ref_idx * BLKSZ + n] += PI;
                self.buffer[ref_idx * BLKSZ + n] *= -1.0;
            }
        }
    }

    fn hard_diff_bits(&self, ref_idx: usize) -> [u8; BLKSZ] {
        let mut data = [0u8; BLKSZ];
        let mut prev = 0u8;
        for n in 0..BLKSZ {
            let bit = if self.buffer[ref_idx * BLKSZ + n].re <= 0.0 { 0 } else { 1 };
            data[n] = bit ^ prev;
            prev = bit;
        }
        data
    }

    /// Searches a corrected reference for the block-sync needle. Returns the
    /// offset of block zero within the current block, and extracts the PSMI
    /// bits whenever the match is at offset zero.
    fn find_first_block(&mut self, ref_idx: usize) -> i32 {
        let data = self.hard_diff_bits(ref_idx);
        self.psmi = -1;
        for n in 0..BLKSZ {
            let matched = BLOCK_NEEDLE.iter().enumerate().all(|(i, want)| {
                // The first differential bit of the block straddles the
                // previous block and may be wrong; don't-cares are skipped.
                (n + i) % BLKSZ == 0 || *want < 0 || *want as u8 == data[(n + i) % BLKSZ]
            });
            if matched {
                if n == 0 {
                    self.psmi = ((data[25] as i32) << 5)
                        | ((data[26] as i32) << 4)
                        | ((data[27] as i32) << 3)
                        | ((data[28] as i32) << 2)
                        | ((data[29] as i32) << 1)
                        | data[30] as i32;
                }
                return n as i32;
            }
        }
        -1
    }

    /// Searches for a reference carrying a specific reference-subcarrier
    /// identifier, used by the coarse CFO sweep.
    fn find_ref(&self, ref_idx: usize, rsid: u8) -> i32 {
        let needle: [i8; 24] = [
            0, 1, 1, 0, 0, 1, 0, -1, -1, 1,
            (rsid >> 1) as i8, (rsid & 1) as i8, 0, ((rsid >> 1) ^ (rsid & 1)) as i8, 0,
            -1, -1, -1, -1, -1, -1, 1, 1, 1,
        ];
        let data = self.hard_diff_bits(ref_idx);
        for n in 0..BLKSZ {
            let matched = needle.iter().enumerate().all(|(i, want)| {
                (n + i) % BLKSZ == 0 || *want < 0 || *want as u8 == data[(n + i) % BLKSZ]
            });
            if matched {
                return n as i32;
            }
        }
        -1
    }

    fn calc_smag(&self, ref_idx: usize) -> f32 {
        // Phase is already corrected, so the energy sits on the real axis.
        let sum: f32 = self.buffer[ref_idx * BLKSZ..(ref_idx + 1) * BLKSZ]
            .iter()
            .map(|x| x.re.abs())
            .sum();
        sum / BLKSZ as f32
    }

    /// Rotates the data subcarriers between two references by the
    /// magnitude-weighted interpolation of the reference phases. The
    /// (19 + 19i) numerator folds in the 45-degree offset between the pilot
    /// axis and the QPSK constellation.
    fn adjust_data(&mut self, lower: usize, upper: usize) {
        let smag0 = self.calc_smag(lower);
        let smag19 = self.calc_smag(upper);

        for n in 0..BLKSZ {
            let e_lower = Complex32::from_polar(1.0, self.phases[lower * BLKSZ + n]);
            let e_upper = Complex32::from_polar(1.0, self.phases[upper * BLKSZ + n]);
            for k in 1..19 {
                let c = Complex32::new(19.0, 19.0)
                    / (k as f32 * smag19 * e_upper + (19 - k) as f32 * smag0 * e_lower);
                self.buffer[(lower + k) * BLKSZ + n] *= c;
            }
        }
    }

    /// Residual fine timing and carrier corrections handed back to Acquire.
    /// Timing shows up as a phase gradient across the band, carrier offset
    /// as a common slope across the block.
    fn fine_feedback(&self, partitions: usize, fb: &mut SyncFeedback) {
        let center = (BLKSZ - 1) / 2;
        let mut diff_sum = 0.0f32;
        let mut diff_cnt = 0u32;
        let mut slope_sum = 0.0f32;
        let mut slope_cnt = 0u32;

        for i in (0..partitions * PARTITION_WIDTH).step_by(PARTITION_WIDTH) {
            for (lo, hi) in [
                (LB_START + i, LB_START + i + PARTITION_WIDTH),
                (UB_END - i - PARTITION_WIDTH, UB_END - i),
            ] {
                let mut d = self.phases[hi * BLKSZ + center] - self.phases[lo * BLKSZ + center];
                // Pilot flips are only known modulo pi.
                d = (d + PI / 2.0).rem_euclid(PI) - PI / 2.0;
                diff_sum += d;
                diff_cnt += 1;
                slope_sum += self.prev_slope[lo] + self.prev_slope[hi];
                slope_cnt += 2;
            }
        }

        let mean_diff = diff_sum / diff_cnt as f32;
        let samperr = -mean_diff * FFT_FM as f32 / (2.0 * PI * PARTITION_WIDTH as f32);
        fb.samperr = (samperr.round() as i32).clamp(-(CP_FM as i32) / 2, CP_FM as i32 / 2);
        fb.angle = slope_sum / slope_cnt as f32 * FFT_FM as f32 / FFTCP_FM as f32;
    }

    fn process<S: SoftBitSink>(&mut self, state: &mut SyncState, fb: &mut SyncFeedback, sink: &mut S) {
        let partitions = partitions_per_band(self.psmi);

        for i in (0..=partitions * PARTITION_WIDTH).step_by(PARTITION_WIDTH) {
            self.adjust_ref(LB_START + i);
            self.adjust_ref(UB_END - i);
        }

        if self.ready {
            if sink.block() == 0
                && self.find_first_block(LB_START) != 0
                && self.find_first_block(UB_END) != 0
            {
                debug!("lost sync");
                self.ready = false;
                self.events.push(SyncEvent::LostSync);
            }
        } else {
            self.prev_slope.fill(0.0);

            // First and last reference subcarriers carry the same data; try
            // both in case one sideband is corrupted.
            let mut offset = self.find_first_block(LB_START);
            if offset < 0 {
                offset = self.find_first_block(UB_END);
            }

            if offset > 0 {
                debug!("first block @ {}", offset);
                fb.skip_samples += offset as usize * FFTCP_FM;
            } else if offset == 0 {
                info!("synchronized");
                sink.reset();
                self.ready = true;
                *state = SyncState::Fine;
                self.reported_psmi = self.psmi;
                self.events.push(SyncEvent::Synced { psmi: self.psmi });
            } else if self.cfo_wait == 0 {
                for i in -300i32..300 {
                    let lower = (LB_START as i32 + i + BAND_LENGTH as i32 - 1) as usize;
                    self.adjust_ref(lower);
                    let offset = self.find_ref(lower, 0);
                    if offset < 0 {
                        continue;
                    }
                    // We think we found the start; check the upper sideband
                    // to confirm before committing the CFO.
                    let upper = (UB_END as i32 + i - BAND_LENGTH as i32 + 1) as usize;
                    self.adjust_ref(upper);
                    if self.find_ref(upper, 0) == offset {
                        fb.skip_samples += offset as usize * FFTCP_FM;
                        fb.cfo_bins += i;
                        debug!("first block @ {}, cfo {} bins", offset, i);
                        // Wait until the buffers have cleared before
                        // measuring again.
                        self.cfo_wait = 2 * BUFS as u32;
                        break;
                    }
                }
            } else {
                self.cfo_wait -= 1;
            }
        }

        if !self.ready {
            return;
        }

        if self.psmi >= 0 && self.psmi != self.reported_psmi {
            self.reported_psmi = self.psmi;
            self.events.push(SyncEvent::Psmi { psmi: self.psmi });
        }

        for i in (0..partitions * PARTITION_WIDTH).step_by(PARTITION_WIDTH) {
            self.adjust_data(LB_START + i, LB_START + i + PARTITION_WIDTH);
            self.adjust_data(UB_END - i - PARTITION_WIDTH, UB_END - i);
        }

        // Modulation error against the nearest QPSK corner.
        let mut error_lb = 0.0f32;
        let mut error_ub = 0.0f32;
        for n in 0..BLKSZ {
            for i in (0..partitions * PARTITION_WIDTH).step_by(PARTITION_WIDTH) {
                for j in 1..PARTITION_WIDTH {
                    let c = self.buffer[(LB_START + i + j) * BLKSZ + n];
                    let ideal = Complex32::new(
                        if c.re >= 0.0 { 1.0 } else { -1.0 },
                        if c.im >= 0.0 { 1.0 } else { -1.0 },
                    );
                    error_lb += (ideal - c).norm_sqr();

                    let c = self.buffer[(UB_END - i - PARTITION_WIDTH + j) * BLKSZ + n];
                    let ideal = Complex32::new(
                        if c.re >= 0.0 { 1.0 } else { -1.0 },
                        if c.im >= 0.0 { 1.0 } else { -1.0 },
                    );
                    error_ub += (ideal - c).norm_sqr();
                }
            }
        }

        self.error_lb += error_lb;
        self.error_ub += error_ub;

        self.mer_cnt += 1;
        if self.mer_cnt == 16 {
            let signal = (2 * BLKSZ * DATA_PER_BAND) as f32 * self.mer_cnt as f32;
            let lower_db = 10.0 * (signal / self.error_lb).log10();
            let upper_db = 10.0 * (signal / self.error_ub).log10();
            info!("MER: {:.1} dB (lower), {:.1} dB (upper)", lower_db, upper_db);
            self.events.push(SyncEvent::Mer { lower_db, upper_db });
            self.mer_cnt = 0;
            self.error_lb = 0.0;
            self.error_ub = 0.0;
        }

        // Soft demod: sign times a per-sideband confidence from this
        // block's MER.
        let mer_lb = (2 * BLKSZ * DATA_PER_BAND) as f32 / error_lb;
        let mer_ub = (2 * BLKSZ * DATA_PER_BAND) as f32 / error_ub;
        let mult_lb = (mer_lb * 10.0).clamp(1.0, 127.0);
        let mult_ub = (mer_ub * 10.0).clamp(1.0, 127.0);

        fn demod(x: f32) -> i8 {
            if x >= 0.0 {
                1
            } else {
                -1
            }
        }

        for n in 0..BLKSZ {
            for i in (LB_START..LB_START + 190).step_by(PARTITION_WIDTH) {
                for j in 1..PARTITION_WIDTH {
                    let c = self.buffer[(i + j) * BLKSZ + n];
                    sink.push_pm(demod(c.re) * mult_lb as i8);
                    sink.push_pm(demod(c.im) * mult_lb as i8);
                }
            }
            for i in (UB_END - 190..UB_END).step_by(PARTITION_WIDTH) {
                for j in 1..PARTITION_WIDTH {
                    let c = self.buffer[(i + j) * BLKSZ + n];
                    sink.push_pm(demod(c.re) * mult_ub as i8);
                    sink.push_pm(demod(c.im) * mult_ub as i8);
                }
            }
            if self.psmi == 3 {
                // The extended partitions feed the P3 stream.
                for i in (LB_START + 190..LB_START + 190 + 38).step_by(PARTITION_WIDTH) {
                    for j in 1..PARTITION_WIDTH {
                        let c = self.buffer[(i + j) * BLKSZ + n];
                        sink.push_px1(demod(c.re) * mult_lb as i8);
                        sink.push_px1(demod(c.im) * mult_lb as i8);
                    }
                }
                for i in (UB_END - 190 - 38..UB_END - 190).step_by(PARTITION_WIDTH) {
                    for j in 1..PARTITION_WIDTH {
                        let c = self.buffer[(i + j) * BLKSZ + n];
                        sink.push_px1(demod(c.re) * mult_ub as i8);
                        sink.push_px1(demod(c.im) * mult_ub as i8);
                    }
                }
            }

            self.ref_buf[n] = if self.buffer[LB_START * BLKSZ + n].re <= 0.0 { 0 } else { 1 };
        }
        self.dump_ref();

        self.fine_feedback(partitions, fb);
    }

    fn dump_ref(&self) {
        let mut value = self.ref_buf[0] as u32;
        for i in 1..BLKSZ {
            value = (value << 1) | (self.ref_buf[i - 1] ^ self.ref_buf[i]) as u32;
        }
        debug!("REF {:08X}", value);
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[derive(Default)]
    pub struct NullSink {
        pub pm_bits: usize,
        pub px1_bits: usize,
        pub block_val: usize,
        pub resets: usize,
        pub last_pm: i8,
    }

    impl SoftBitSink for NullSink {
        fn push_pm(&mut self, bit: i8) {
            self.pm_bits += 1;
            self.last_pm = bit;
        }
        fn push_px1(&mut self, _bit: i8) {
            self.px1_bits += 1;
        }
        fn block(&self) -> usize {
            self.block_val
        }
        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    /// Absolute pilot bits whose differential decode reproduces the block
    /// needle (block zero, PSMI in bits 25..31).
    fn reference_bits(psmi: u8) -> [u8; BLKSZ] {
        let mut diffs = [0u8; BLKSZ];
        for (i, want) in BLOCK_NEEDLE.iter().enumerate() {
            diffs[i] = if *want > 0 { 1 } else { 0 };
        }
        for bit in 0..6 {
            diffs[25 + bit] = (psmi >> (5 - bit)) & 1;
        }
        let mut bits = [0u8; BLKSZ];
        let mut prev = 0u8;
        for n in 0..BLKSZ {
            bits[n] = prev ^ diffs[n];
            prev = bits[n];
        }
        bits
    }

    fn fill_block(sync: &mut Sync, psmi: u8) {
        let bits = reference_bits(psmi);
        for bin in 0..FFT_FM {
            let in_lower = (LB_START..=LB_START + 190).contains(&bin);
            let in_upper = (UB_END - 190..=UB_END).contains(&bin);
            if !in_lower && !in_upper {
                continue;
            }
            let offset = if in_lower { bin - LB_START } else { UB_END - bin };
            for n in 0..BLKSZ {
                sync.buffer[bin * BLKSZ + n] = if offset % PARTITION_WIDTH == 0 {
                    Complex32::new(if bits[n] == 1 { 1.0 } else { -1.0 }, 0.0)
                } else {
                    Complex32::new(1.0, 0.0)
                };
            }
        }
    }

    #[test]
    fn clean_block_zero_synchronizes_and_demodulates() {
        let mut sync = Sync::new();
        let mut state = SyncState::Coarse;
        let mut fb = SyncFeedback::default();
        let mut sink = NullSink::default();

        fill_block(&mut sync, 1);
        sync.process(&mut state, &mut fb, &mut sink);

        assert_eq!(state, SyncState::Fine);
        assert!(sync.is_ready());
        assert_eq!(sync.psmi(), 1);
        assert_eq!(sink.resets, 1);
        let events = sync.take_events();
        assert!(events.contains(&SyncEvent::Synced { psmi: 1 }));
        // Ten partitions per sideband, 18 data bins each, two soft bits per
        // QPSK symbol, for every symbol of the block.
        assert_eq!(sink.pm_bits, 2 * 10 * 18 * 2 * BLKSZ);
        assert_eq!(sink.px1_bits, 0);
        // A noiseless constellation saturates the confidence scale.
        assert_eq!(sink.last_pm.abs(), 127);
    }

    #[test]
    fn block_offset_requests_sample_skip() {
        let mut sync = Sync::new();
        let mut state = SyncState::Coarse;
        let mut fb = SyncFeedback::default();
        let mut sink = NullSink::default();

        fill_block(&mut sync, 1);
        // Rotate every reference column by three symbols so block zero sits
        // at offset 29.
        for bin in 0..FFT_FM {
            let col = &mut sync.buffer[bin * BLKSZ..(bin + 1) * BLKSZ];
            col.rotate_left(3);
        }
        sync.process(&mut state, &mut fb, &mut sink);

        assert!(!sync.is_ready());
        assert_eq!(fb.skip_samples, 29 * FFTCP_FM);
    }

    #[test]
    fn loss_of_sync_clears_tracker_state() {
        let mut sync = Sync::new();
        let mut state = SyncState::Coarse;
        let mut fb = SyncFeedback::default();
        let mut sink = NullSink::default();

        fill_block(&mut sync, 1);
        sync.process(&mut state, &mut fb, &mut sink);
        assert!(sync.is_ready());
        sync.take_events();

        // Feed garbage at block zero on both sidebands.
        for x in sync.buffer.iter_mut() {
            *x = Complex32::new(0.001, 0.0);
        }
        sink.block_val = 0;
        sync.process(&mut state, &mut fb, &mut sink);

        assert!(!sync.is_ready());
        assert!(sync.take_events().contains(&SyncEvent::LostSync));
    }

    #[test]
    fn psmi_three_feeds_the_p3_stream() {
        let mut sync = Sync::new();
        let mut state = SyncState::Coarse;
        let mut fb = SyncFeedback::default();
        let mut sink = NullSink::default();

        // PSMI 3 widens each sideband to 12 partitions; populate the
        // extended region too.
        let bits = reference_bits(3);
        for bin in 0..FFT_FM {
            let lb_ext = LB_START..=LB_START + 12 * PARTITION_WIDTH;
            let ub_ext = UB_END - 12 * PARTITION_WIDTH..=UB_END;
            if !lb_ext.contains(&bin) && !ub_ext.contains(&bin) {
                continue;
            }
            let offset = if lb_ext.contains(&bin) { bin - LB_START } else { UB_END - bin };
            for n in 0..BLKSZ {
                sync.buffer[bin * BLKSZ + n] = if offset % PARTITION_WIDTH == 0 {
                    Complex32::new(if bits[n] == 1 { 1.0 } else { -1.0 }, 0.0)
                } else {
                    Complex32::new(1.0, 0.0)
                };
            }
        }
        sync.process(&mut state, &mut fb, &mut sink);

        assert!(sync.is_ready());
        assert_eq!(sync.psmi(), 3);
        // Two extended partitions per sideband carry the P3 soft bits.
        assert_eq!(sink.px1_bits, 2 * 2 * 18 * 2 * BLKSZ);
    }

    #[test]
    fn timing_drift_trims_the_resampler() {
        let mut sync = Sync::new();
        let mut fb = SyncFeedback::default();
        for _ in 0..TIMING_HISTORY {
            sync.adjust_timing(8, &mut fb);
        }
        assert!(fb.rate_adjust > 0.0);
        let expected = 8.0 / (ACQUIRE_SYMBOLS * FFTCP_FM) as f32 * RATE_GAIN;
        assert!((fb.rate_adjust - expected).abs() < 1e-9);
    }
}
