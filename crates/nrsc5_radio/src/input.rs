//! Sample intake and the DSP worker's processing pipeline.
//!
//! Producers (the caller's thread or the internal reader) convert raw IQ
//! through the front-end filters into the shared sample ring; the DSP
//! worker drains one symbol period per iteration through acquisition,
//! tracking, channel decoding and the transport parsers, dispatching
//! events synchronously as it goes.

use crate::events::Event;
use crate::frame::{FrameDecoder, L2Output};
use crate::output::{route_aas, AasRoute};
use crate::pids::PidsDecoder;
use log::{debug, error};
use nrsc5_core::nrsc5_mode::Mode;
use nrsc5_core::nrsc5_parameters::*;
use nrsc5_dsp::acquire::{Acquire, FILTER_TAPS_AM};
use nrsc5_dsp::cint16::CInt16;
use nrsc5_dsp::firdecim::FirDecimQ15;
use nrsc5_dsp::resamp::ResampQ15;
use nrsc5_dsp::sync::{Sync, SoftBitSink, SyncEvent, SyncFeedback, SyncState};
use nrsc5_fec::interleave::{Channel, ChannelDecoder};
use num::complex::Complex32;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Half-band front-end decimation filter for the FM path.
const INPUT_TAPS_FM: [f32; 32] = [
    -0.006910541036924275,
    -0.013268228805145532,
    -0.006644557670245421,
    0.018375039238181595,
    0.04259143500924495,
    0.03712705276833042,
    0.0017215227032129474,
    -0.024593813581821018,
    -0.009907236685353248,
    0.01767132823382834,
    -0.008287758762202712,
    -0.10098124598840287,
    -0.17157955612468512,
    -0.10926609589776617,
    0.08158909906685183,
    0.25361698433482543,
    0.25361698433482543,
    0.08158909906685183,
    -0.10926609589776617,
    -0.17157955612468512,
    -0.10098124598840287,
    -0.008287758762202712,
    0.01767132823382834,
    -0.009907236685353248,
    -0.024593813581821018,
    0.0017215227032129474,
    0.03712705276833042,
    0.04259143500924495,
    0.018375039238181595,
    -0.006644557670245421,
    -0.013268228805145532,
    -0.006910541036924275,
];

/// Producer backpressure threshold, in baseband samples.
const BACKPRESSURE_LEN: usize = 256 * FFTCP_FM;
/// Raw IQ chunks retained for worker-side IQ event dispatch.
const IQ_QUEUE_LEN: usize = 4;

struct RingState {
    buffer: Vec<CInt16>,
    avail: usize,
    used: usize,
    skip: usize,
    resamp_rate: f32,
    reset_pipeline: bool,
    mode: Mode,
    closed: bool,
    lost_device: bool,
    iq_pending: VecDeque<Vec<u8>>,
}

/// The shared baseband sample ring: producers append resampled samples,
/// the DSP worker consumes them one symbol period at a time.
pub struct SampleRing {
    state: Mutex<RingState>,
    cond: Condvar,
}

impl SampleRing {
    pub fn new(mode: Mode) -> Self {
        Self {
            state: Mutex::new(RingState {
                buffer: vec![CInt16::default(); INPUT_BUF_LEN],
                avail: 0,
                used: 0,
                skip: 0,
                resamp_rate: 1.0,
                reset_pipeline: false,
                mode,
                closed: false,
                lost_device: false,
                iq_pending: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Appends converted samples, blocking while the ring is saturated.
    fn push(&self, samples: &[Complex32], raw_iq: Option<&[u8]>) {
        let mut state = self.state.lock().unwrap();

        while state.avail - state.used > BACKPRESSURE_LEN && !state.closed {
            state = self.cond.wait(state).unwrap();
        }
        if state.closed {
            return;
        }

        if state.avail + samples.len() > INPUT_BUF_LEN {
            if state.avail > state.used {
                let (used, avail) = (state.used, state.avail);
                state.buffer.copy_within(used..avail, 0);
                state.avail -= used;
                state.used = 0;
            } else {
                state.avail = 0;
                state.used = 0;
            }
            if state.avail + samples.len() > INPUT_BUF_LEN {
                error!("input buffer overflow");
                state.avail = 0;
                state.used = 0;
            }
        }

        let avail = state.avail;
        for (slot, x) in state.buffer[avail..avail + samples.len()]
            .iter_mut()
            .zip(samples)
        {
            *slot = CInt16::from_cf(*x);
        }
        state.avail += samples.len();

        if let Some(raw) = raw_iq {
            if state.iq_pending.len() == IQ_QUEUE_LEN {
                state.iq_pending.pop_front();
            }
            state.iq_pending.push_back(raw.to_vec());
        }

        drop(state);
        self.cond.notify_all();
    }

    fn resamp_rate(&self) -> f32 {
        self.state.lock().unwrap().resamp_rate
    }

    pub fn rate_adjust(&self, adjustment: f32) {
        self.state.lock().unwrap().resamp_rate += adjustment;
    }

    pub fn add_skip(&self, samples: usize) {
        self.state.lock().unwrap().skip += samples;
    }

    /// Discards buffered samples and schedules a pipeline reset; used by
    /// frequency and mode changes.
    pub fn reset(&self, mode: Mode) {
        let mut state = self.state.lock().unwrap();
        state.avail = 0;
        state.used = 0;
        state.skip = 0;
        state.resamp_rate = 1.0;
        state.reset_pipeline = true;
        state.mode = mode;
        state.iq_pending.clear();
        drop(state);
        self.cond.notify_all();
    }

    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }

    /// Marks the sample source as gone; the DSP worker reports it on its
    /// own thread.
    pub fn flag_lost_device(&self) {
        self.state.lock().unwrap().lost_device = true;
        self.cond.notify_all();
    }
}

/// Raw IQ conversion ahead of the ring: Q15 FIR decimation (by two for FM,
/// by 32 for AM) and the drift-absorbing rate converter.
pub struct FrontEnd {
    mode: Mode,
    decim_fm: FirDecimQ15,
    decim_am: FirDecimQ15,
    resamp: ResampQ15,
    scratch: Vec<Complex32>,
}

impl FrontEnd {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            decim_fm: FirDecimQ15::new(DECIMATION_FACTOR_FM, &INPUT_TAPS_FM),
            decim_am: FirDecimQ15::new(DECIMATION_FACTOR_AM, &FILTER_TAPS_AM),
            resamp: ResampQ15::new(8, 0.45, 60.0, 16),
            scratch: Vec::new(),
        }
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn reset(&mut self) {
        self.decim_fm.reset();
        self.decim_am.reset();
        self.resamp.reset();
    }

    fn decimate(&mut self, x: CInt16) -> Option<CInt16> {
        match self.mode {
            Mode::Fm => self.decim_fm.execute(x),
            Mode::Am => self.decim_am.execute(x),
        }
    }

    /// Unsigned 8-bit IQ at the device rate; `data` holds whole sample
    /// pairs (four bytes each).
    pub fn push_cu8(&mut self, data: &[u8], ring: &SampleRing) {
        debug_assert!(data.len() % 4 == 0);
        self.resamp.set_rate(ring.resamp_rate());
        self.scratch.clear();

        for group in data.chunks_exact(4) {
            for pair in group.chunks_exact(2) {
                let x = CInt16::from_cu8(pair[0], pair[1]);
                if let Some(y) = self.decimate(x) {
                    self.resamp.execute(y, &mut self.scratch);
                }
            }
        }
        ring.push(&self.scratch, Some(data));
    }

    /// Signed 16-bit IQ already at the baseband rate.
    pub fn push_cs16(&mut self, samples: &[i16], ring: &SampleRing) {
        debug_assert!(samples.len() % 2 == 0);
        self.resamp.set_rate(ring.resamp_rate());
        self.scratch.clear();

        for pair in samples.chunks_exact(2) {
            let x = CInt16::new(pair[0], pair[1]);
            self.resamp.execute(x, &mut self.scratch);
        }
        ring.push(&self.scratch, None);
    }
}

/// Everything the DSP worker owns: the full receive chain and its state.
pub struct Pipeline {
    acquire: Acquire,
    sync: Sync,
    decoder: ChannelDecoder,
    frame: FrameDecoder,
    pids: PidsDecoder,
    state: SyncState,
    fb: SyncFeedback,
}

impl Pipeline {
    pub fn new(mode: Mode) -> Self {
        Self {
            acquire: Acquire::new(mode),
            sync: Sync::new(),
            decoder: ChannelDecoder::new(),
            frame: FrameDecoder::new(),
            pids: PidsDecoder::new(),
            state: SyncState::None,
            fb: SyncFeedback::default(),
        }
    }

    fn reset(&mut self, mode: Mode) {
        self.acquire.reset();
        self.acquire.set_mode(mode);
        self.sync.reset();
        self.decoder.reset();
        self.frame.reset();
        self.pids = PidsDecoder::new();
        self.state = SyncState::None;
        self.fb = SyncFeedback::default();
    }

    /// One worker iteration: waits for a symbol period of samples, runs
    /// the chain, applies feedback, and dispatches the resulting events.
    /// Returns false once the ring is closed.
    pub fn iteration(&mut self, ring: &SampleRing, emit: &mut dyn FnMut(&Event<'_>)) -> bool {
        let mut iq_chunks = Vec::new();
        {
            let mut state = ring.state.lock().unwrap();
            loop {
                if state.closed {
                    return false;
                }
                if state.lost_device {
                    state.lost_device = false;
                    drop(state);
                    emit(&Event::LostDevice);
                    state = ring.state.lock().unwrap();
                    continue;
                }
                if state.reset_pipeline {
                    let mode = state.mode;
                    state.reset_pipeline = false;
                    drop(state);
                    self.reset(mode);
                    state = ring.state.lock().unwrap();
                    continue;
                }
                if state.avail - state.used >= FFTCP_FM {
                    break;
                }
                state = ring.cond.wait(state).unwrap();
            }

            if state.skip > 0 {
                let pending = state.avail - state.used;
                if state.skip > pending {
                    state.skip -= pending;
                    state.used = state.avail;
                } else {
                    state.used += state.skip;
                    state.skip = 0;
                }
            }

            let consumed = self
                .acquire
                .push(&state.buffer[state.used..state.avail]);
            state.used += consumed;

            while let Some(chunk) = state.iq_pending.pop_front() {
                iq_chunks.push(chunk);
            }
        }
        ring.cond.notify_all();

        for chunk in &iq_chunks {
            emit(&Event::Iq { data: chunk });
        }

        self.acquire
            .process(&mut self.state, &mut self.fb, &mut self.sync, &mut self.decoder);

        // Apply the tracker's backward control edge.
        if self.fb.cfo_bins != 0 {
            self.acquire.cfo_adjust(self.fb.cfo_bins);
            self.fb.cfo_bins = 0;
        }
        if self.fb.skip_samples > 0 {
            ring.add_skip(self.fb.skip_samples);
            self.fb.skip_samples = 0;
        }
        if self.fb.rate_adjust != 0.0 {
            ring.rate_adjust(self.fb.rate_adjust);
            self.fb.rate_adjust = 0.0;
        }

        let mut lost_sync = false;
        for event in self.sync.take_events() {
            match event {
                SyncEvent::Synced { psmi } => emit(&Event::Sync { psmi }),
                SyncEvent::LostSync => lost_sync = true,
                SyncEvent::Mer { lower_db, upper_db } => {
                    emit(&Event::Mer { lower_db, upper_db })
                }
                SyncEvent::Psmi { psmi } => emit(&Event::Psmi { psmi }),
            }
        }

        for decoded in self.decoder.take_frames() {
            match decoded.channel {
                Channel::P1 | Channel::P3 => {
                    if let Some(cber) = decoded.cber {
                        emit(&Event::Ber { cber });
                    }
                    for output in self.frame.push(&decoded.bits) {
                        match output {
                            L2Output::Pdu { program, stream_id, data } => {
                                if stream_id == 0 {
                                    emit(&Event::Hdc { program, data: &data });
                                } else {
                                    debug!(
                                        "pdu for program {} stream {} ({} bytes)",
                                        program,
                                        stream_id,
                                        data.len()
                                    );
                                }
                            }
                            L2Output::Aas { data } => match route_aas(&data) {
                                AasRoute::Id3 { program, start } => emit(&Event::Id3 {
                                    program,
                                    data: &data[start..],
                                }),
                                AasRoute::Packet { port, seq, start } => emit(&Event::Packet {
                                    port,
                                    seq,
                                    data: &data[start..],
                                }),
                                AasRoute::Invalid => {}
                            },
                            L2Output::Resync => {
                                self.state = SyncState::None;
                            }
                        }
                    }
                }
                Channel::Pids => {
                    if let Some(info) = self.pids.frame_push(&decoded.bits) {
                        emit(&Event::Sis { info: &info });
                    }
                }
            }
        }

        // Loss of sync is delivered after everything decoded up to the
        // point of loss.
        if lost_sync {
            emit(&Event::LostSync);
        }

        true
    }
}
