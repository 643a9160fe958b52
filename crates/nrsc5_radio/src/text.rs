//! Text encodings used by the Station Information Service.

use log::warn;

/// ISO-8859-1 bytes to a string; every byte maps to the same code point.
pub fn iso_8859_1(buf: &[u8]) -> String {
    buf.iter().map(|&b| b as char).collect()
}

/// UCS-2 with byte-order-mark detection; little endian when no mark is
/// present. Unpaired surrogates are replaced.
pub fn ucs_2(buf: &[u8]) -> String {
    let (big_endian, start) = match buf {
        [0xfe, 0xff, ..] => (true, 2),
        [0xff, 0xfe, ..] => (false, 2),
        _ => (false, 0),
    };

    let units: Vec<u16> = buf[start..]
        .chunks_exact(2)
        .map(|pair| {
            if big_endian {
                ((pair[0] as u16) << 8) | pair[1] as u16
            } else {
                pair[0] as u16 | ((pair[1] as u16) << 8)
            }
        })
        .collect();

    String::from_utf16_lossy(&units)
}

/// Converts an SIS text payload according to its encoding field.
/// Unknown encodings yield nothing, matching the receiver's behavior.
pub fn decode_text(encoding: u32, buf: &[u8]) -> Option<String> {
    match encoding {
        0 => Some(iso_8859_1(buf)),
        4 => Some(ucs_2(buf)),
        _ => {
            warn!("invalid encoding: {}", encoding);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_high_bytes_become_two_byte_utf8() {
        assert_eq!(iso_8859_1(b"caf\xe9"), "café");
        assert_eq!(iso_8859_1(b"plain"), "plain");
    }

    #[test]
    fn ucs2_detects_byte_order_marks() {
        // "Hi" with a big-endian mark.
        assert_eq!(ucs_2(&[0xfe, 0xff, 0x00, b'H', 0x00, b'i']), "Hi");
        // "Hi" with a little-endian mark.
        assert_eq!(ucs_2(&[0xff, 0xfe, b'H', 0x00, b'i', 0x00]), "Hi");
        // No mark defaults to little endian.
        assert_eq!(ucs_2(&[b'H', 0x00, b'i', 0x00]), "Hi");
    }

    #[test]
    fn unknown_encoding_is_dropped() {
        assert_eq!(decode_text(3, b"x"), None);
    }
}
