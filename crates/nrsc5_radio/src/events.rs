//! Event taxonomy delivered through the session callback.
//!
//! Events are dispatched synchronously on the DSP worker thread; borrowed
//! payloads point into the worker's scratch and are valid only for the
//! duration of the callback. Callers that want to move events across
//! threads convert them with [`Event::to_owned`], or install the channel
//! adapter on the session.

/// An audio service advertised by SIS message 6, category 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SisAudioService {
    pub program: u32,
    pub access: u32,
    pub service_type: u32,
    pub sound_exp: u32,
}

/// A data service advertised by SIS message 6, category 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SisDataService {
    pub access: u32,
    pub service_type: u32,
    pub mime_type: u32,
}

/// Consolidated station information. Every field reflects the most recent
/// fully received value; `None` means not yet broadcast.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SisInfo {
    pub country_code: Option<String>,
    pub fcc_facility_id: Option<u32>,
    pub name: Option<String>,
    pub slogan: Option<String>,
    pub message: Option<String>,
    pub alert: Option<String>,
    /// Raw alert control words (category/location TLV), not decoded.
    pub alert_control: Vec<u8>,
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
    pub altitude: i32,
    pub audio_services: Vec<SisAudioService>,
    pub data_services: Vec<SisDataService>,
}

/// A single receiver event. The discriminants mirror the wire-level
/// taxonomy: device and synchronization status, link quality, decoded
/// audio and data payloads, and station metadata.
#[derive(Debug)]
pub enum Event<'a> {
    /// The sample source failed or ran dry; the session has stopped.
    LostDevice,
    /// Raw IQ bytes as pushed into the front-end.
    Iq { data: &'a [u8] },
    /// OFDM synchronization achieved.
    Sync { psmi: i32 },
    LostSync,
    /// Modulation error ratio per sideband, reported every 16 blocks.
    Mer { lower_db: f32, upper_db: f32 },
    /// P1 channel bit error rate from re-encoding the decoded frame.
    Ber { cber: f32 },
    /// One HDC audio packet.
    Hdc { program: u32, data: &'a [u8] },
    /// Decoded PCM, present when an external decoder feeds the PCM queue.
    Audio { program: u32, samples: &'a [i16] },
    /// Raw ID3 tag bytes from the program service data stream.
    Id3 { program: u32, data: &'a [u8] },
    /// Station service guide table. Populated by an external SIG builder.
    Sig { services: &'a [SigService] },
    /// Completed large-object transfer. Populated by an external assembler.
    Lot {
        port: u16,
        lot: u32,
        mime: u32,
        name: &'a str,
        data: &'a [u8],
    },
    /// Station information snapshot.
    Sis { info: &'a SisInfo },
    /// AAS stream fragment.
    Stream { port: u16, seq: u16, data: &'a [u8] },
    /// AAS packet-service payload.
    Packet { port: u16, seq: u16, data: &'a [u8] },
    /// Primary service mode changed.
    Psmi { psmi: i32 },
}

/// Service entry for [`Event::Sig`]; owned records replace the reference
/// implementation's linked lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigService {
    pub service_type: u32,
    pub number: u16,
    pub name: String,
}

/// Owned counterpart of [`Event`] for queueing across threads.
#[derive(Debug, Clone)]
pub enum OwnedEvent {
    LostDevice,
    Iq { data: Vec<u8> },
    Sync { psmi: i32 },
    LostSync,
    Mer { lower_db: f32, upper_db: f32 },
    Ber { cber: f32 },
    Hdc { program: u32, data: Vec<u8> },
    Audio { program: u32, samples: Vec<i16> },
    Id3 { program: u32, data: Vec<u8> },
    Sig { services: Vec<SigService> },
    Lot {
        port: u16,
        lot: u32,
        mime: u32,
        name: String,
        data: Vec<u8>,
    },
    Sis { info: SisInfo },
    Stream { port: u16, seq: u16, data: Vec<u8> },
    Packet { port: u16, seq: u16, data: Vec<u8> },
    Psmi { psmi: i32 },
}

impl Event<'_> {
    pub fn to_owned(&self) -> OwnedEvent {
        match self {
            Event::LostDevice => OwnedEvent::LostDevice,
            Event::Iq { data } => OwnedEvent::Iq { data: data.to_vec() },
            Event::Sync { psmi } => OwnedEvent::Sync { psmi: *psmi },
            Event::LostSync => OwnedEvent::LostSync,
            Event::Mer { lower_db, upper_db } => OwnedEvent::Mer {
                lower_db: *lower_db,
                upper_db: *upper_db,
            },
            Event::Ber { cber } => OwnedEvent::Ber { cber: *cber },
            Event::Hdc { program, data } => OwnedEvent::Hdc {
                program: *program,
                data: data.to_vec(),
            },
            Event::Audio { program, samples } => OwnedEvent::Audio {
                program: *program,
                samples: samples.to_vec(),
            },
            Event::Id3 { program, data } => OwnedEvent::Id3 {
                program: *program,
                data: data.to_vec(),
            },
            Event::Sig { services } => OwnedEvent::Sig { services: services.to_vec() },
            Event::Lot { port, lot, mime, name, data } => OwnedEvent::Lot {
                port: *port,
                lot: *lot,
                mime: *mime,
                name: name.to_string(),
                data: data.to_vec(),
            },
            Event::Sis { info } => OwnedEvent::Sis { info: (*info).clone() },
            Event::Stream { port, seq, data } => OwnedEvent::Stream {
                port: *port,
                seq: *seq,
                data: data.to_vec(),
            },
            Event::Packet { port, seq, data } => OwnedEvent::Packet {
                port: *port,
                seq: *seq,
                data: data.to_vec(),
            },
            Event::Psmi { psmi } => OwnedEvent::Psmi { psmi: *psmi },
        }
    }
}

/// Human-readable name for an SIS data service type.
pub fn service_data_type_name(service_type: u32) -> &'static str {
    match service_type {
        0 => "Non-specific",
        1 => "News",
        3 => "Sports",
        29 => "Weather",
        31 => "Emergency",
        65 => "Traffic",
        66 => "Image Maps",
        80 => "Text",
        256 => "Advertising",
        257 => "Financial",
        258 => "Stock Ticker",
        259 => "Navigation",
        260 => "Electronic Program Guide",
        261 => "Audio",
        262 => "Private Data Network",
        263 => "Service Maintenance",
        264 => "HD Radio System Services",
        265 => "Audio-Related Objects",
        511 => "Reserved for Special Tests",
        _ => "Unknown",
    }
}

/// Human-readable name for an SIS audio program type.
pub fn program_type_name(program_type: u32) -> &'static str {
    match program_type {
        0 => "None",
        1 => "News",
        2 => "Information",
        3 => "Sports",
        4 => "Talk",
        5 => "Rock",
        6 => "Classic Rock",
        7 => "Adult Hits",
        8 => "Soft Rock",
        9 => "Top 40",
        10 => "Country",
        11 => "Oldies",
        12 => "Soft",
        13 => "Nostalgia",
        14 => "Jazz",
        15 => "Classical",
        16 => "Rhythm and Blues",
        17 => "Soft Rhythm and Blues",
        18 => "Foreign Language",
        19 => "Religious Music",
        20 => "Religious Talk",
        21 => "Personality",
        22 => "Public",
        23 => "College",
        24 => "Spanish Talk",
        25 => "Spanish Music",
        26 => "Hip-Hop",
        29 => "Weather",
        30 => "Emergency Test",
        31 => "Emergency",
        65 => "Traffic",
        76 => "Special Reading Services",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrowed_events_convert_to_owned() {
        let data = [1u8, 2, 3];
        let evt = Event::Hdc { program: 2, data: &data };
        match evt.to_owned() {
            OwnedEvent::Hdc { program, data } => {
                assert_eq!(program, 2);
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn type_names_cover_common_codes() {
        assert_eq!(service_data_type_name(1), "News");
        assert_eq!(program_type_name(10), "Country");
        assert_eq!(program_type_name(999), "Unknown");
    }
}
