//! Decoded-output plumbing: AAS port routing, ADTS framing for dumped HDC
//! packets, and the bounded PCM queue drained by the sink worker.

use log::debug;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// AAS ports 0x5100..0x5107 carry per-program ID3 tags.
const PORT_ID3_BASE: u16 = 0x5100;

/// Where an AAS payload should be delivered.
#[derive(Debug, PartialEq, Eq)]
pub enum AasRoute {
    Id3 { program: u32, start: usize },
    Packet { port: u16, seq: u16, start: usize },
    Invalid,
}

/// Classifies one AAS payload by its little-endian port and sequence
/// header. `start` is the offset of the payload body.
pub fn route_aas(data: &[u8]) -> AasRoute {
    if data.len() < 4 {
        debug!("short AAS payload ({} bytes)", data.len());
        return AasRoute::Invalid;
    }
    let port = u16::from_le_bytes([data[0], data[1]]);
    let seq = u16::from_le_bytes([data[2], data[3]]);

    if (PORT_ID3_BASE..PORT_ID3_BASE + 8).contains(&port) {
        AasRoute::Id3 {
            program: (port - PORT_ID3_BASE) as u32,
            start: 4,
        }
    } else {
        AasRoute::Packet { port, seq, start: 4 }
    }
}

/// Writes HDC packets as an ADTS elementary stream: a seven-byte header
/// per packet signalling 22050 Hz AAC-LC, two channels.
pub struct AdtsWriter<W: Write> {
    out: W,
}

struct BitWriter {
    bytes: Vec<u8>,
    byte: u32,
    bits: u32,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            byte: 0,
            bits: 0,
        }
    }

    fn add_bits(&mut self, value: u32, bits: u32) {
        for i in (0..bits).rev() {
            self.byte = (self.byte << 1) | ((value >> i) & 1);
            self.bits += 1;
            if self.bits == 8 {
                self.bytes.push(self.byte as u8);
                self.byte = 0;
                self.bits = 0;
            }
        }
    }
}

impl<W: Write> AdtsWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn push(&mut self, packet: &[u8]) -> io::Result<()> {
        let mut bw = BitWriter::new();
        bw.add_bits(0xFFF, 12); // sync word
        bw.add_bits(0, 1); // MPEG-4
        bw.add_bits(0, 2); // layer
        bw.add_bits(1, 1); // no CRC
        bw.add_bits(1, 2); // AAC-LC
        bw.add_bits(7, 4); // 22050 Hz
        bw.add_bits(0, 1); // private bit
        bw.add_bits(2, 3); // 2-channel configuration
        bw.add_bits(0, 1);
        bw.add_bits(0, 1);
        bw.add_bits(0, 1);
        bw.add_bits(0, 1);
        bw.add_bits(packet.len() as u32 + 7, 13); // frame length
        bw.add_bits(0x7FF, 11); // buffer fullness (VBR)
        bw.add_bits(0, 2); // one AAC frame per ADTS frame

        self.out.write_all(&bw.bytes)?;
        self.out.write_all(packet)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Sink for decoded stereo PCM at 44.1 kHz.
pub trait PcmSink: Send {
    fn play(&mut self, samples: &[i16]) -> io::Result<()>;
}

const PCM_BUFFER_COUNT: usize = 32;
/// 8192 bytes of 16-bit samples per buffer.
const PCM_BUFFER_SAMPLES: usize = 4096;

struct PcmShared {
    free: Vec<Vec<i16>>,
    queue: VecDeque<Vec<i16>>,
    closed: bool,
}

/// Bounded hand-off between the decoder and the audio sink. Producers
/// block when all buffers are in flight; the worker blocks when the queue
/// is empty. Buffers recycle through a free list, so the steady state
/// allocates nothing.
pub struct PcmQueue {
    shared: Arc<(Mutex<PcmShared>, Condvar)>,
    worker: Option<JoinHandle<()>>,
}

impl PcmQueue {
    pub fn new(mut sink: Box<dyn PcmSink>) -> Self {
        let shared = Arc::new((
            Mutex::new(PcmShared {
                free: (0..PCM_BUFFER_COUNT)
                    .map(|_| Vec::with_capacity(PCM_BUFFER_SAMPLES))
                    .collect(),
                queue: VecDeque::new(),
                closed: false,
            }),
            Condvar::new(),
        ));

        let worker = std::thread::spawn({
            let shared = shared.clone();
            move || loop {
                let buffer = {
                    let (lock, cond) = &*shared;
                    let mut state = lock.lock().unwrap();
                    loop {
                        if let Some(buffer) = state.queue.pop_front() {
                            break buffer;
                        }
                        if state.closed {
                            return;
                        }
                        state = cond.wait(state).unwrap();
                    }
                };

                if sink.play(&buffer).is_err() {
                    debug!("pcm sink failed, dropping audio");
                }

                let (lock, cond) = &*shared;
                let mut state = lock.lock().unwrap();
                let mut buffer = buffer;
                buffer.clear();
                state.free.push(buffer);
                cond.notify_all();
            }
        });

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Queues one frame of samples, blocking while every buffer is in
    /// flight.
    pub fn push(&self, samples: &[i16]) {
        for chunk in samples.chunks(PCM_BUFFER_SAMPLES) {
            let (lock, cond) = &*self.shared;
            let mut state = lock.lock().unwrap();
            let mut buffer = loop {
                if state.closed {
                    return;
                }
                if let Some(buffer) = state.free.pop() {
                    break buffer;
                }
                state = cond.wait(state).unwrap();
            };
            buffer.extend_from_slice(chunk);
            state.queue.push_back(buffer);
            cond.notify_all();
        }
    }
}

impl Drop for PcmQueue {
    fn drop(&mut self) {
        {
            let (lock, cond) = &*self.shared;
            lock.lock().unwrap().closed = true;
            cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn adts_header_carries_sync_and_length() {
        let mut writer = AdtsWriter::new(Vec::new());
        let packet = vec![0xABu8; 100];
        writer.push(&packet).unwrap();
        let out = writer.into_inner();

        assert_eq!(out.len(), 7 + 100);
        assert_eq!(out[0], 0xFF);
        assert_eq!(out[1] & 0xF0, 0xF0);
        // 13-bit frame length straddles bytes 3..6.
        let len = (((out[3] & 0x3) as usize) << 11)
            | ((out[4] as usize) << 3)
            | ((out[5] as usize) >> 5);
        assert_eq!(len, 107);
        assert_eq!(&out[7..], &packet[..]);
    }

    #[test]
    fn id3_ports_route_to_their_program() {
        let mut data = vec![0x03, 0x51, 0x07, 0x00];
        data.extend_from_slice(b"ID3...");
        assert_eq!(route_aas(&data), AasRoute::Id3 { program: 3, start: 4 });

        let other = [0x34, 0x12, 0x01, 0x00, 0xAA];
        assert_eq!(
            route_aas(&other),
            AasRoute::Packet { port: 0x1234, seq: 1, start: 4 }
        );
        assert_eq!(route_aas(&[0x00]), AasRoute::Invalid);
    }

    struct CountingSink(Arc<AtomicUsize>);

    impl PcmSink for CountingSink {
        fn play(&mut self, samples: &[i16]) -> io::Result<()> {
            self.0.fetch_add(samples.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn pcm_queue_delivers_all_samples() {
        let total = Arc::new(AtomicUsize::new(0));
        let queue = PcmQueue::new(Box::new(CountingSink(total.clone())));

        let frame = vec![0i16; 2048];
        for _ in 0..100 {
            queue.push(&frame);
        }
        drop(queue);

        assert_eq!(total.load(Ordering::SeqCst), 2048 * 100);
    }
}
