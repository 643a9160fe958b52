//! Minimal rtl_tcp client: the twelve-byte dongle-info handshake, the
//! fixed command set, and blocking full reads of the sample stream.

use crate::error::{Error, Result};
use log::error;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

// Tuner identifiers from librtlsdr.
const TUNER_E4000: u32 = 1;
const TUNER_FC0012: u32 = 2;
const TUNER_FC0013: u32 = 3;
const TUNER_FC2580: u32 = 4;
const TUNER_R820T: u32 = 5;
const TUNER_R828D: u32 = 6;

#[derive(Clone, Copy)]
#[repr(u8)]
enum Command {
    SetCenterFreq = 0x01,
    SetSampleRate = 0x02,
    SetTunerGainMode = 0x03,
    SetTunerGain = 0x04,
    SetFreqCorrection = 0x05,
    SetDirectSampling = 0x09,
    SetOffsetTuning = 0x0a,
    SetBiasTee = 0x0e,
}

pub struct RtlTcp {
    stream: TcpStream,
    tuner_type: u32,
}

impl RtlTcp {
    /// Validates the dongle-info header on an already connected stream.
    pub fn open(stream: TcpStream) -> Result<Self> {
        let mut client = Self {
            stream,
            tuner_type: 0,
        };

        let mut info = [0u8; 12];
        if client.read(&mut info)? != info.len() {
            return Err(Error::BadDongleHeader);
        }
        if &info[0..4] != b"RTL0" {
            return Err(Error::BadDongleHeader);
        }
        client.tuner_type = u32::from_be_bytes([info[4], info[5], info[6], info[7]]);

        Ok(client)
    }

    fn command(&mut self, cmd: Command, param: u32) -> Result<()> {
        let mut packet = [0u8; 5];
        packet[0] = cmd as u8;
        packet[1..5].copy_from_slice(&param.to_be_bytes());
        self.stream.write_all(&packet)?;
        Ok(())
    }

    pub fn set_center_freq(&mut self, freq: u32) -> Result<()> {
        self.command(Command::SetCenterFreq, freq)
    }

    pub fn set_sample_rate(&mut self, rate: u32) -> Result<()> {
        self.command(Command::SetSampleRate, rate)
    }

    pub fn set_tuner_gain_mode(&mut self, manual: u32) -> Result<()> {
        self.command(Command::SetTunerGainMode, manual)
    }

    pub fn set_tuner_gain(&mut self, gain: u32) -> Result<()> {
        self.command(Command::SetTunerGain, gain)
    }

    pub fn set_freq_correction(&mut self, ppm: i32) -> Result<()> {
        self.command(Command::SetFreqCorrection, ppm as u32)
    }

    pub fn set_direct_sampling(&mut self, on: u32) -> Result<()> {
        self.command(Command::SetDirectSampling, on)
    }

    pub fn set_offset_tuning(&mut self, on: u32) -> Result<()> {
        self.command(Command::SetOffsetTuning, on)
    }

    pub fn set_bias_tee(&mut self, on: u32) -> Result<()> {
        self.command(Command::SetBiasTee, on)
    }

    /// Reads until `buf` is full or the peer closes; returns the byte
    /// count, which is short only at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.stream.read(&mut buf[offset..]) {
                Ok(0) => break,
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(offset)
    }

    /// Discards pending samples plus `count` fresh bytes, keeping IQ pair
    /// alignment. Used after gain changes.
    pub fn reset_buffer(&mut self, count: usize) -> Result<()> {
        let mut scratch = [0u8; 1024];
        let mut received = 0usize;

        self.stream.set_nonblocking(true)?;
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.stream.set_nonblocking(false)?;
                    return Err(err.into());
                }
            }
        }
        self.stream.set_nonblocking(false)?;

        if received & 1 != 0 {
            self.read(&mut scratch[..1])?;
        }

        let mut remaining = count;
        while remaining > 0 {
            let want = remaining.min(scratch.len());
            let got = self.read(&mut scratch[..want])?;
            if got == 0 {
                return Err(Error::Io(std::io::Error::from(ErrorKind::UnexpectedEof)));
            }
            remaining -= got;
        }
        Ok(())
    }

    /// Per-tuner gain tables in tenths of a dB, from librtlsdr.
    pub fn tuner_gains(&self) -> &'static [i32] {
        const E4K: &[i32] = &[-10, 15, 40, 65, 90, 115, 140, 165, 190, 215, 240, 290, 340, 420];
        const FC0012: &[i32] = &[-99, -40, 71, 179, 192];
        const FC0013: &[i32] = &[
            -99, -73, -65, -63, -60, -58, -54, 58, 61, 63, 65, 67, 68, 70, 71, 179, 181, 182,
            184, 186, 188, 191, 197,
        ];
        const FC2580: &[i32] = &[];
        const R82XX: &[i32] = &[
            0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328,
            338, 364, 372, 386, 402, 421, 434, 439, 445, 480, 496,
        ];

        match self.tuner_type {
            TUNER_E4000 => E4K,
            TUNER_FC0012 => FC0012,
            TUNER_FC0013 => FC0013,
            TUNER_FC2580 => FC2580,
            TUNER_R820T | TUNER_R828D => R82XX,
            other => {
                error!("Unknown tuner type: {}", other);
                &[]
            }
        }
    }
}
