//! Station Information Service parser.
//!
//! Every PIDS frame carries 80 bits: a CRC-12 over the leading 68, then up
//! to two payloads of bit-packed fields. Multi-frame texts (long name,
//! message, slogan, alert) are reassembled with per-sequence bitmaps and
//! reported exactly once when complete.

use crate::events::{SisAudioService, SisDataService, SisInfo};
use crate::text::decode_text;
use log::{debug, error, warn};
use nrsc5_core::nrsc5_parameters::PIDS_FRAME_LEN;
use nrsc5_fec::crc::check_crc12;

const CHARS5: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ ?-*$ ";

const MAX_AUDIO_SERVICES: usize = 8;
const MAX_DATA_SERVICES: usize = 16;
const NUM_PARAMETERS: usize = 64;

const LONG_NAME_FRAMES: usize = 8;
const MESSAGE_FRAMES: usize = 32;
const SLOGAN_FRAMES: usize = 16;
const ALERT_FRAMES: usize = 64;

struct BitCursor<'a> {
    bits: &'a [u8],
    off: usize,
}

impl<'a> BitCursor<'a> {
    fn new(bits: &'a [u8], off: usize) -> Self {
        Self { bits, off }
    }

    fn int(&mut self, length: usize) -> u32 {
        let mut result = 0;
        for _ in 0..length {
            result = (result << 1) | self.bits[self.off] as u32;
            self.off += 1;
        }
        result
    }

    fn signed_int(&mut self, length: usize) -> i32 {
        let result = self.int(length) as i32;
        if result & (1 << (length - 1)) != 0 {
            result - (1 << length)
        } else {
            result
        }
    }

    fn char5(&mut self) -> char {
        CHARS5[self.int(5) as usize] as char
    }

    fn char7(&mut self) -> u8 {
        self.int(7) as u8
    }

    fn skip(&mut self, length: usize) {
        self.off += length;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct AudioServiceSlot {
    access: u32,
    service_type: u32,
    sound_exp: u32,
}

pub struct PidsDecoder {
    country_code: Option<String>,
    fcc_facility_id: Option<u32>,
    short_name: Option<String>,

    long_name: [u8; LONG_NAME_FRAMES * 7],
    long_name_have: [bool; LONG_NAME_FRAMES],
    long_name_seq: i32,
    long_name_displayed: bool,

    latitude: Option<f32>,
    longitude: Option<f32>,
    altitude: u32,

    message: [u8; 4 + (MESSAGE_FRAMES - 1) * 6],
    message_have: [bool; MESSAGE_FRAMES],
    message_seq: i32,
    message_priority: u8,
    message_encoding: u32,
    message_len: i32,
    message_displayed: bool,

    slogan: [u8; 5 + (SLOGAN_FRAMES - 1) * 6],
    slogan_have: [bool; SLOGAN_FRAMES],
    slogan_encoding: u32,
    slogan_len: i32,
    slogan_displayed: bool,

    alert: [u8; 3 + (ALERT_FRAMES - 1) * 6],
    alert_have: [bool; ALERT_FRAMES],
    alert_seq: i32,
    alert_encoding: u32,
    alert_len: i32,
    alert_cnt_len: usize,
    alert_displayed: bool,

    audio_services: [Option<AudioServiceSlot>; MAX_AUDIO_SERVICES],
    data_services: [Option<SisDataService>; MAX_DATA_SERVICES],
    parameters: [i32; NUM_PARAMETERS],
}

impl PidsDecoder {
    pub fn new() -> Self {
        Self {
            country_code: None,
            fcc_facility_id: None,
            short_name: None,
            long_name: [0; LONG_NAME_FRAMES * 7],
            long_name_have: [false; LONG_NAME_FRAMES],
            long_name_seq: -1,
            long_name_displayed: false,
            latitude: None,
            longitude: None,
            altitude: 0,
            message: [0; 4 + (MESSAGE_FRAMES - 1) * 6],
            message_have: [false; MESSAGE_FRAMES],
            message_seq: -1,
            message_priority: 0,
            message_encoding: 0,
            message_len: -1,
            message_displayed: false,
            slogan: [0; 5 + (SLOGAN_FRAMES - 1) * 6],
            slogan_have: [false; SLOGAN_FRAMES],
            slogan_encoding: 0,
            slogan_len: -1,
            slogan_displayed: false,
            alert: [0; 3 + (ALERT_FRAMES - 1) * 6],
            alert_have: [false; ALERT_FRAMES],
            alert_seq: -1,
            alert_encoding: 0,
            alert_len: -1,
            alert_cnt_len: 0,
            alert_displayed: false,
            audio_services: [None; MAX_AUDIO_SERVICES],
            data_services: Default::default(),
            parameters: [-1; NUM_PARAMETERS],
        }
    }

    /// Accepts one descrambled 80-bit PIDS frame (one bit per byte, as
    /// decoded). Returns a fresh station-information snapshot whenever a
    /// field changed.
    pub fn frame_push(&mut self, bits: &[u8]) -> Option<SisInfo> {
        debug_assert_eq!(bits.len(), PIDS_FRAME_LEN);

        // Swap the bit order within each group of eight.
        let mut reversed = [0u8; PIDS_FRAME_LEN];
        for (i, r) in reversed.iter_mut().enumerate() {
            *r = bits[((i >> 3) << 3) + 7 - (i & 7)];
        }

        if !check_crc12(&reversed) {
            return None;
        }
        self.decode_sis(&reversed)
    }

    fn decode_sis(&mut self, bits: &[u8]) -> Option<SisInfo> {
        if bits[0] != 0 {
            return None;
        }
        let payloads = bits[1] + 1;
        let mut cur = BitCursor::new(bits, 2);
        let mut updated = false;

        for _ in 0..payloads {
            if cur.off > 60 {
                break;
            }
            let msg_id = cur.int(4);

            match msg_id {
                0 => {
                    if cur.off > 64 - 32 {
                        break;
                    }
                    let country: String = (0..2).map(|_| cur.char5()).collect();
                    cur.skip(3); // reserved
                    let fcc_facility_id = cur.int(19);

                    if self.country_code.as_deref() != Some(country.as_str())
                        || self.fcc_facility_id != Some(fcc_facility_id)
                    {
                        self.country_code = Some(country);
                        self.fcc_facility_id = Some(fcc_facility_id);
                        updated = true;
                    }
                }
                1 => {
                    if cur.off > 64 - 22 {
                        break;
                    }
                    let mut name: String = (0..4).map(|_| cur.char5()).collect();
                    if bits[cur.off] == 0 && bits[cur.off + 1] == 1 {
                        name.push_str("-FM");
                    }
                    cur.skip(2);

                    if self.short_name.as_deref() != Some(name.as_str()) {
                        self.short_name = Some(name);
                        updated = true;
                    }
                }
                2 => {
                    if cur.off > 64 - 58 {
                        break;
                    }
                    let seq = {
                        let mut peek = BitCursor::new(bits, cur.off + 55);
                        peek.int(3) as i32
                    };
                    let last_frame = cur.int(3) as usize;
                    let current_frame = cur.int(3) as usize;

                    if current_frame == 0 && seq != self.long_name_seq {
                        self.long_name.fill(0);
                        self.long_name_have.fill(false);
                        self.long_name_seq = seq;
                        self.long_name_displayed = false;
                    }

                    for j in 0..7 {
                        self.long_name[current_frame * 7 + j] = cur.char7();
                    }
                    self.long_name_have[current_frame] = true;

                    if self.long_name_seq >= 0 && !self.long_name_displayed {
                        let complete =
                            self.long_name_have[..=last_frame].iter().all(|&have| have);
                        if complete {
                            self.long_name_displayed = true;
                            updated = true;
                        }
                    }

                    cur.skip(3); // sequence, already read
                }
                3 => {
                    cur.skip(32); // reserved
                }
                4 => {
                    if cur.off > 64 - 27 {
                        break;
                    }
                    let is_latitude = bits[cur.off] != 0;
                    cur.skip(1);
                    let coord = cur.signed_int(22) as f32 / 8192.0;
                    if is_latitude {
                        self.altitude = (self.altitude & 0x0f0) | (cur.int(4) << 8);
                        if self.latitude != Some(coord) {
                            self.latitude = Some(coord);
                            if self.longitude.is_some() {
                                updated = true;
                            }
                        }
                    } else {
                        self.altitude = (self.altitude & 0xf00) | (cur.int(4) << 4);
                        if self.longitude != Some(coord) {
                            self.longitude = Some(coord);
                            if self.latitude.is_some() {
                                updated = true;
                            }
                        }
                    }
                }
                5 => {
                    if cur.off > 64 - 58 {
                        break;
                    }
                    let current_frame = cur.int(5) as usize;
                    let seq = cur.int(2) as i32;

                    if current_frame == 0 {
                        if seq != self.message_seq {
                            self.message.fill(0);
                            self.message_have.fill(false);
                            self.message_seq = seq;
                            self.message_displayed = false;
                        }
                        self.message_priority = bits[cur.off];
                        cur.skip(1);
                        self.message_encoding = cur.int(3);
                        self.message_len = cur.int(8) as i32;
                        cur.skip(7); // checksum
                        for j in 0..4 {
                            self.message[j] = cur.int(8) as u8;
                        }
                    } else {
                        cur.skip(3); // reserved
                        for j in 0..6 {
                            self.message[current_frame * 6 - 2 + j] = cur.int(8) as u8;
                        }
                    }
                    self.message_have[current_frame] = true;

                    if self.message_seq >= 0 && !self.message_displayed {
                        let frames = (self.message_len + 7) / 6;
                        let complete =
                            (0..frames as usize).all(|j| self.message_have[j]);
                        if complete {
                            self.message_displayed = true;
                            updated = true;
                        }
                    }
                }
                6 => {
                    if cur.off > 64 - 27 {
                        break;
                    }
                    let category = cur.int(2);
                    match category {
                        0 => {
                            let access = cur.int(1);
                            let prog_num = cur.int(6) as usize;
                            let service_type = cur.int(8);
                            cur.skip(5); // reserved
                            let sound_exp = cur.int(5);

                            if prog_num >= MAX_AUDIO_SERVICES {
                                warn!("Invalid program number: {}", prog_num);
                                continue;
                            }

                            let slot = AudioServiceSlot { access, service_type, sound_exp };
                            if self.audio_services[prog_num] != Some(slot) {
                                self.audio_services[prog_num] = Some(slot);
                                updated = true;
                            }
                        }
                        1 => {
                            let access = cur.int(1);
                            let service_type = cur.int(9);
                            cur.skip(3); // reserved
                            let mime_type = cur.int(12);

                            let service = SisDataService { access, service_type, mime_type };
                            for slot in self.data_services.iter_mut() {
                                match slot {
                                    Some(existing) if *existing == service => break,
                                    Some(_) => continue,
                                    None => {
                                        *slot = Some(service);
                                        updated = true;
                                        break;
                                    }
                                }
                            }
                        }
                        _ => warn!("Unknown service category identifier: {}", category),
                    }
                }
                7 => {
                    if cur.off > 64 - 22 {
                        break;
                    }
                    let index = cur.int(6) as usize;
                    let parameter = cur.int(16) as i32;
                    if index >= NUM_PARAMETERS {
                        warn!("Invalid parameter index: {}", index);
                        continue;
                    }
                    if self.parameters[index] != parameter {
                        self.parameters[index] = parameter;
                        self.log_parameter(index, parameter);
                    }
                }
                8 => {
                    if cur.off > 64 - 58 {
                        break;
                    }
                    let current_frame = cur.int(4) as usize;
                    let extended = bits[cur.off] != 0;
                    cur.skip(1);
                    if !extended {
                        // Universal short station name, not implemented.
                        cur.skip(53);
                    } else {
                        if current_frame == 0 {
                            self.slogan_encoding = cur.int(3);
                            cur.skip(3); // reserved
                            self.slogan_len = cur.int(7) as i32;
                            for j in 0..5 {
                                self.slogan[j] = cur.int(8) as u8;
                            }
                        } else {
                            cur.skip(5); // reserved
                            for j in 0..6 {
                                self.slogan[current_frame * 6 - 1 + j] = cur.int(8) as u8;
                            }
                        }
                        self.slogan_have[current_frame] = true;

                        if self.slogan_len >= 0 && !self.slogan_displayed {
                            let frames = (self.slogan_len + 6) / 6;
                            let complete =
                                (0..frames as usize).all(|j| self.slogan_have[j]);
                            if complete {
                                self.slogan_displayed = true;
                                updated = true;
                            }
                        }
                    }
                }
                9 => {
                    if cur.off > 64 - 58 {
                        break;
                    }
                    let current_frame = cur.int(6) as usize;
                    let seq = cur.int(2) as i32;
                    cur.skip(2); // reserved

                    if current_frame == 0 {
                        if seq != self.alert_seq {
                            self.alert.fill(0);
                            self.alert_have.fill(false);
                            self.alert_seq = seq;
                            self.alert_displayed = false;
                        }
                        self.alert_encoding = cur.int(3);
                        self.alert_len = cur.int(9) as i32;
                        cur.skip(7); // CRC-7 integrity check
                        self.alert_cnt_len = cur.int(5) as usize;
                        for j in 0..3 {
                            self.alert[j] = cur.int(8) as u8;
                        }
                    } else {
                        for j in 0..6 {
                            self.alert[current_frame * 6 - 3 + j] = cur.int(8) as u8;
                        }
                    }
                    self.alert_have[current_frame] = true;

                    if self.alert_len >= 0 && !self.alert_displayed {
                        let frames = (self.alert_len + 8) / 6;
                        let complete = (0..frames as usize).all(|j| self.alert_have[j]);
                        if complete {
                            self.alert_displayed = true;
                            updated = true;
                        }
                    }
                }
                _ => error!("unexpected msg_id: {}", msg_id),
            }
        }

        if updated {
            Some(self.report())
        } else {
            None
        }
    }

    fn log_parameter(&self, index: usize, parameter: i32) {
        let p = &self.parameters;
        match index {
            0 => debug!(
                "Pending leap second offset: {}, current leap second offset: {}",
                parameter >> 8,
                parameter & 0xff
            ),
            1 | 2 => {
                if p[1] >= 0 && p[2] >= 0 {
                    debug!("ALFN of pending leap second adjustment: {}", (p[2] << 16) | p[1]);
                }
            }
            3 => {
                let mut tzo = (parameter >> 5) & 0x7ff;
                if tzo > 1024 {
                    tzo -= 2048;
                }
                debug!(
                    "Local time zone offset: {} minutes, DST sched. {}, local DST? {}, regional DST? {}",
                    tzo,
                    (parameter >> 2) & 0x7,
                    if parameter & 0x2 != 0 { "yes" } else { "no" },
                    if parameter & 0x1 != 0 { "yes" } else { "no" }
                );
            }
            4..=7 => {
                if p[4] >= 0 && p[5] >= 0 && p[6] >= 0 && p[7] >= 0 {
                    debug!(
                        "Exciter manuf. \"{}{}\", core version {}.{}.{}.{}-{}, manuf. version {}.{}.{}.{}-{}",
                        (((p[4] >> 8) & 0x7f) as u8) as char,
                        ((p[4] & 0x7f) as u8) as char,
                        (p[5] >> 11) & 0x1f, (p[5] >> 6) & 0x1f, (p[5] >> 1) & 0x1f,
                        (p[7] >> 11) & 0x1f, (p[7] >> 3) & 0x7,
                        (p[6] >> 11) & 0x1f, (p[6] >> 6) & 0x1f, (p[6] >> 1) & 0x1f,
                        (p[7] >> 6) & 0x1f, p[7] & 0x7
                    );
                }
            }
            8..=11 => {
                if p[8] >= 0 && p[9] >= 0 && p[10] >= 0 && p[11] >= 0 {
                    debug!(
                        "Importer manuf. \"{}{}\", core version {}.{}.{}.{}-{}, manuf. version {}.{}.{}.{}-{}",
                        (((p[8] >> 8) & 0x7f) as u8) as char,
                        ((p[8] & 0x7f) as u8) as char,
                        (p[9] >> 11) & 0x1f, (p[9] >> 6) & 0x1f, (p[9] >> 1) & 0x1f,
                        (p[11] >> 11) & 0x1f, (p[11] >> 3) & 0x7,
                        (p[10] >> 11) & 0x1f, (p[10] >> 6) & 0x1f, (p[10] >> 1) & 0x1f,
                        (p[11] >> 6) & 0x1f, p[11] & 0x7
                    );
                }
            }
            _ => {}
        }
    }

    fn report(&self) -> SisInfo {
        let slogan = if self.slogan_displayed {
            decode_text(self.slogan_encoding, &self.slogan[..self.slogan_len as usize])
        } else if self.long_name_displayed {
            let end = self
                .long_name
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(self.long_name.len());
            Some(self.long_name[..end].iter().map(|&c| c as char).collect())
        } else {
            None
        };

        let message = if self.message_displayed {
            decode_text(self.message_encoding, &self.message[..self.message_len as usize])
        } else {
            None
        };

        let (alert, alert_control) = if self.alert_displayed {
            let cnt_bytes = 1 + 2 * self.alert_cnt_len;
            (
                decode_text(self.alert_encoding, &self.alert[cnt_bytes..self.alert_len as usize]),
                self.alert[..cnt_bytes].to_vec(),
            )
        } else {
            (None, Vec::new())
        };

        let (latitude, longitude, altitude) =
            if let (Some(lat), Some(lon)) = (self.latitude, self.longitude) {
                (Some(lat), Some(lon), self.altitude as i32)
            } else {
                (None, None, 0)
            };

        let audio_services = self
            .audio_services
            .iter()
            .enumerate()
            .filter_map(|(program, slot)| {
                slot.as_ref().map(|s| SisAudioService {
                    program: program as u32,
                    access: s.access,
                    service_type: s.service_type,
                    sound_exp: s.sound_exp,
                })
            })
            .collect();

        let data_services = self.data_services.iter().flatten().cloned().collect();

        SisInfo {
            country_code: self.country_code.clone(),
            fcc_facility_id: self.fcc_facility_id,
            name: self.short_name.clone(),
            slogan,
            message,
            alert,
            alert_control,
            latitude,
            longitude,
            altitude,
            audio_services,
            data_services,
        }
    }
}

impl Default for PidsDecoder {
    fn default() -> Self {
        Self::new()
    }
}
