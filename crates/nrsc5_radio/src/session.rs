//! The receiver session: sample sources, worker threads, configuration,
//! and event dispatch.
//!
//! A session always owns the DSP worker. File and rtl_tcp sessions also
//! own a reader thread that honors the start/stop handshake; pipe sessions
//! are fed by the caller through `pipe_samples_cu8` / `pipe_samples_cs16`.

use crate::error::{Error, Result};
use crate::events::{Event, OwnedEvent};
use crate::input::{FrontEnd, Pipeline, SampleRing};
use crate::rtltcp::RtlTcp;
use log::{debug, error};
use nrsc5_core::nrsc5_mode::Mode;
use nrsc5_core::nrsc5_parameters::SAMPLE_RATE_CU8;
use std::fs::File;
use std::io::Read;
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

pub type EventCallback = Box<dyn FnMut(&Event<'_>) + Send + 'static>;

const READ_CHUNK: usize = 128 * 256;

struct Control {
    stopped: bool,
    worker_stopped: bool,
    closed: bool,
    frequency: f64,
    gain: f32,
    auto_gain: bool,
    mode: Mode,
}

struct Shared {
    ring: SampleRing,
    control: Mutex<Control>,
    control_cond: Condvar,
    callback: Mutex<Option<EventCallback>>,
}

impl Shared {
    fn dispatch(&self, event: &Event<'_>) {
        if let Some(callback) = self.callback.lock().unwrap().as_mut() {
            callback(event);
        }
    }
}

enum ReaderSource {
    File(File),
    Tcp(Arc<Mutex<RtlTcp>>),
}

/// An NRSC-5 receiver session.
pub struct Receiver {
    shared: Arc<Shared>,
    frontend: Arc<Mutex<FrontEnd>>,
    rtltcp: Option<Arc<Mutex<RtlTcp>>>,
    dsp_worker: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    leftover_u8: [u8; 4],
    leftover_u8_len: usize,
    leftover_s16: [i16; 2],
    leftover_s16_len: usize,
}

impl Receiver {
    fn new(source: Option<ReaderSource>) -> Self {
        let mode = Mode::Fm;
        let shared = Arc::new(Shared {
            ring: SampleRing::new(mode),
            control: Mutex::new(Control {
                stopped: true,
                worker_stopped: true,
                closed: false,
                frequency: 0.0,
                gain: -1.0,
                auto_gain: true,
                mode,
            }),
            control_cond: Condvar::new(),
            callback: Mutex::new(None),
        });
        let frontend = Arc::new(Mutex::new(FrontEnd::new(mode)));

        let dsp_worker = std::thread::spawn({
            let shared = shared.clone();
            move || {
                let mut pipeline = Pipeline::new(mode);
                let shared_ref = &*shared;
                let mut emit = |event: &Event<'_>| shared_ref.dispatch(event);
                while pipeline.iteration(&shared.ring, &mut emit) {}
            }
        });

        let reader = source.map(|source| {
            std::thread::spawn({
                let shared = shared.clone();
                let frontend = frontend.clone();
                move || reader_thread(source, shared, frontend)
            })
        });

        Self {
            shared,
            frontend,
            rtltcp: None,
            dsp_worker: Some(dsp_worker),
            reader,
            leftover_u8: [0; 4],
            leftover_u8_len: 0,
            leftover_s16: [0; 2],
            leftover_s16_len: 0,
        }
    }

    /// A session the caller feeds through the `pipe_samples` functions.
    pub fn open_pipe() -> Self {
        Self::new(None)
    }

    /// A session reading unsigned 8-bit IQ sample pairs from a file.
    pub fn open_file(file: File) -> Self {
        Self::new(Some(ReaderSource::File(file)))
    }

    /// A session reading from a connected rtl_tcp server.
    pub fn open_rtltcp(stream: TcpStream) -> Result<Self> {
        let mut rtl = RtlTcp::open(stream)?;
        rtl.set_sample_rate(SAMPLE_RATE_CU8 as u32)?;
        rtl.set_tuner_gain_mode(1)?;
        rtl.set_offset_tuning(1)?;

        let rtl = Arc::new(Mutex::new(rtl));
        let mut receiver = Self::new(Some(ReaderSource::Tcp(rtl.clone())));
        receiver.rtltcp = Some(rtl);
        Ok(receiver)
    }

    /// Installs the event callback. Invoked synchronously on the DSP
    /// worker thread; payload references are valid only during the call.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(&Event<'_>) + Send + 'static,
    {
        *self.shared.callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Replaces the callback with an adapter that clones events into owned
    /// form over a channel, for callers that prefer draining a queue.
    pub fn event_channel(&self) -> crossbeam_channel::Receiver<OwnedEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.set_callback(move |event| {
            let _ = tx.send(event.to_owned());
        });
        rx
    }

    /// Signals the workers to start demodulating.
    pub fn start(&self) {
        let mut control = self.shared.control.lock().unwrap();
        control.stopped = false;
        drop(control);
        self.shared.control_cond.notify_all();
    }

    /// Signals the workers to stop, and waits until the reader has parked.
    pub fn stop(&self) {
        let mut control = self.shared.control.lock().unwrap();
        control.stopped = true;
        self.shared.control_cond.notify_all();

        if self.reader.is_some() {
            while !control.worker_stopped {
                control = self.shared.control_cond.wait(control).unwrap();
            }
        }
    }

    fn with_stopped<R>(&self, f: impl FnOnce(&mut Control) -> Result<R>) -> Result<R> {
        let mut control = self.shared.control.lock().unwrap();
        if !control.stopped {
            return Err(Error::ConfigRejected);
        }
        f(&mut control)
    }

    /// Tunes the source. Legal only while stopped; resets the pipeline.
    pub fn set_frequency(&self, frequency: f64) -> Result<()> {
        self.with_stopped(|control| {
            if control.frequency == frequency {
                return Ok(());
            }
            if let Some(rtl) = &self.rtltcp {
                rtl.lock().unwrap().set_center_freq(frequency as u32)?;
            }
            if control.auto_gain {
                control.gain = -1.0;
            }
            control.frequency = frequency;
            self.shared.ring.reset(control.mode);
            self.frontend.lock().unwrap().reset();
            Ok(())
        })
    }

    pub fn frequency(&self) -> f64 {
        self.shared.control.lock().unwrap().frequency
    }

    /// Selects the FM or AM waveform. Legal only while stopped.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.with_stopped(|control| {
            control.mode = mode;
            self.shared.ring.reset(mode);
            let mut frontend = self.frontend.lock().unwrap();
            frontend.set_mode(mode);
            frontend.reset();
            Ok(())
        })
    }

    /// Sets the tuner gain in dB. Legal only while stopped.
    pub fn set_gain(&self, gain: f32) -> Result<()> {
        self.with_stopped(|control| {
            if control.gain == gain {
                return Ok(());
            }
            if let Some(rtl) = &self.rtltcp {
                rtl.lock().unwrap().set_tuner_gain((gain * 10.0) as u32)?;
            }
            control.gain = gain;
            Ok(())
        })
    }

    pub fn gain(&self) -> f32 {
        self.shared.control.lock().unwrap().gain
    }

    pub fn set_auto_gain(&self, enabled: bool) {
        let mut control = self.shared.control.lock().unwrap();
        control.auto_gain = enabled;
        control.gain = -1.0;
    }

    pub fn set_bias_tee(&self, on: bool) -> Result<()> {
        if let Some(rtl) = &self.rtltcp {
            rtl.lock().unwrap().set_bias_tee(on as u32)?;
        }
        Ok(())
    }

    pub fn set_direct_sampling(&self, on: bool) -> Result<()> {
        if let Some(rtl) = &self.rtltcp {
            rtl.lock().unwrap().set_direct_sampling(on as u32)?;
        }
        Ok(())
    }

    pub fn set_freq_correction(&self, ppm: i32) -> Result<()> {
        if let Some(rtl) = &self.rtltcp {
            rtl.lock().unwrap().set_freq_correction(ppm)?;
        }
        Ok(())
    }

    /// Pushes unsigned 8-bit IQ samples; partial four-byte groups are
    /// buffered until completed by a later call.
    pub fn pipe_samples_cu8(&mut self, mut samples: &[u8]) {
        if self.leftover_u8_len > 0 {
            while self.leftover_u8_len < 4 && !samples.is_empty() {
                self.leftover_u8[self.leftover_u8_len] = samples[0];
                self.leftover_u8_len += 1;
                samples = &samples[1..];
            }
            if self.leftover_u8_len == 4 {
                let group = self.leftover_u8;
                self.frontend.lock().unwrap().push_cu8(&group, &self.shared.ring);
                self.leftover_u8_len = 0;
            }
        }

        let whole = samples.len() & !3;
        if whole > 0 {
            self.frontend
                .lock()
                .unwrap()
                .push_cu8(&samples[..whole], &self.shared.ring);
        }

        for &byte in &samples[whole..] {
            self.leftover_u8[self.leftover_u8_len] = byte;
            self.leftover_u8_len += 1;
        }
    }

    /// Pushes signed 16-bit IQ samples; a dangling component is buffered
    /// until its pair arrives.
    pub fn pipe_samples_cs16(&mut self, mut samples: &[i16]) {
        if self.leftover_s16_len == 1 && !samples.is_empty() {
            self.leftover_s16[1] = samples[0];
            samples = &samples[1..];
            let pair = self.leftover_s16;
            self.frontend.lock().unwrap().push_cs16(&pair, &self.shared.ring);
            self.leftover_s16_len = 0;
        }

        let whole = samples.len() & !1;
        if whole > 0 {
            self.frontend
                .lock()
                .unwrap()
                .push_cs16(&samples[..whole], &self.shared.ring);
        }

        if samples.len() > whole {
            self.leftover_s16[0] = samples[whole];
            self.leftover_s16_len = 1;
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        {
            let mut control = self.shared.control.lock().unwrap();
            control.closed = true;
            control.stopped = true;
        }
        self.shared.control_cond.notify_all();
        self.shared.ring.close();

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(worker) = self.dsp_worker.take() {
            let _ = worker.join();
        }
    }
}

/// Binary search over the tuner gain list for a peak-to-peak amplitude
/// nearest -6 dBFS.
fn do_auto_gain(rtl: &Mutex<RtlTcp>) -> Result<f32> {
    const TARGET_DB: f32 = -6.0;

    let mut rtl = rtl.lock().unwrap();
    let gains: Vec<i32> = rtl.tuner_gains().to_vec();
    if gains.is_empty() {
        return Err(Error::NoTunerGains);
    }

    let mut buf = vec![0u8; READ_CHUNK];
    let mut low = 0i32;
    let mut high = gains.len() as i32 - 1;
    let mut best_gain = gains[0];
    let mut best_diff = f32::INFINITY;

    while low <= high {
        let mid = (low + high) / 2;
        let gain = gains[mid as usize];

        rtl.set_tuner_gain(gain as u32)?;
        // There is no good way to wait for samples after the new gain was
        // applied; dump 250 ms of samples and hope for the best.
        rtl.reset_buffer((SAMPLE_RATE_CU8 as usize / 4) * 2)?;
        if rtl.read(&mut buf)? != buf.len() {
            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }

        let mut min = 255u8;
        let mut max = 0u8;
        for &b in &buf {
            min = min.min(b);
            max = max.max(b);
        }
        let amplitude_db = 20.0 * ((max.saturating_sub(min)) as f32 / 255.0).log10();
        let diff = (amplitude_db - TARGET_DB).abs();
        if diff < best_diff {
            best_diff = diff;
            best_gain = gain;
        }

        if amplitude_db > TARGET_DB {
            high = mid - 1;
        } else {
            low = mid + 1;
        }
    }

    debug!("best gain: {:.1} dB", best_gain as f32 / 10.0);
    rtl.set_tuner_gain(best_gain as u32)?;
    Ok(best_gain as f32 / 10.0)
}

fn reader_thread(source: ReaderSource, shared: Arc<Shared>, frontend: Arc<Mutex<FrontEnd>>) {
    let mut source = source;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut carry = 0usize;

    loop {
        {
            let mut control = shared.control.lock().unwrap();
            loop {
                if control.closed {
                    return;
                }
                if control.stopped && !control.worker_stopped {
                    control.worker_stopped = true;
                    shared.control_cond.notify_all();
                }
                if !control.stopped && control.worker_stopped {
                    control.worker_stopped = false;
                    shared.control_cond.notify_all();

                    if control.auto_gain && control.gain < 0.0 {
                        if let ReaderSource::Tcp(rtl) = &source {
                            match do_auto_gain(rtl) {
                                Ok(gain) => control.gain = gain,
                                Err(err) => {
                                    error!("auto gain failed: {}", err);
                                    control.stopped = true;
                                    continue;
                                }
                            }
                        }
                    }
                }
                if control.stopped {
                    control = shared.control_cond.wait(control).unwrap();
                    continue;
                }
                break;
            }
        }

        // Read outside the control lock; a short or failed read stops the
        // session and reports the device lost.
        let read = match &mut source {
            ReaderSource::File(file) => file.read(&mut buf[carry..]).unwrap_or(0),
            ReaderSource::Tcp(rtl) => {
                let mut rtl = rtl.lock().unwrap();
                rtl.read(&mut buf[carry..]).unwrap_or(0)
            }
        };

        if read == 0 {
            let mut control = shared.control.lock().unwrap();
            control.stopped = true;
            drop(control);
            shared.ring.flag_lost_device();
            continue;
        }

        let total = carry + read;
        let whole = total & !3;
        frontend.lock().unwrap().push_cu8(&buf[..whole], &shared.ring);
        buf.copy_within(whole..total, 0);
        carry = total - whole;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_is_rejected_while_running() {
        let receiver = Receiver::open_pipe();
        receiver.start();
        assert!(matches!(
            receiver.set_frequency(88_500_000.0),
            Err(Error::ConfigRejected)
        ));
        assert!(matches!(receiver.set_mode(Mode::Am), Err(Error::ConfigRejected)));
        assert!(matches!(receiver.set_gain(20.0), Err(Error::ConfigRejected)));

        receiver.stop();
        assert!(receiver.set_frequency(88_500_000.0).is_ok());
        assert_eq!(receiver.frequency(), 88_500_000.0);
    }

    #[test]
    fn leftover_cu8_bytes_carry_across_calls() {
        let mut receiver = Receiver::open_pipe();
        // Seven bytes: one whole group plus three spare.
        receiver.pipe_samples_cu8(&[127, 127, 127, 127, 127, 127, 127]);
        assert_eq!(receiver.leftover_u8_len, 3);
        // One more byte completes the buffered group.
        receiver.pipe_samples_cu8(&[127]);
        assert_eq!(receiver.leftover_u8_len, 0);
    }

    #[test]
    fn leftover_cs16_sample_carries_across_calls() {
        let mut receiver = Receiver::open_pipe();
        receiver.pipe_samples_cs16(&[0, 0, 0]);
        assert_eq!(receiver.leftover_s16_len, 1);
        receiver.pipe_samples_cs16(&[0]);
        assert_eq!(receiver.leftover_s16_len, 0);
    }

    #[test]
    fn events_flow_through_the_channel_adapter() {
        let receiver = Receiver::open_pipe();
        let events = receiver.event_channel();
        receiver.shared.dispatch(&Event::Sync { psmi: 1 });
        match events.recv().unwrap() {
            OwnedEvent::Sync { psmi } => assert_eq!(psmi, 1),
            other => panic!("unexpected {:?}", other),
        }
    }
}
