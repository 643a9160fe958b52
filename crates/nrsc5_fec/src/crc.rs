//! Checksums used by the transport layers: CRC-8 on audio packets, the
//! HDLC FCS-16 on PSD/AAS frames, and CRC-12 on PIDS frames.

#[rustfmt::skip]
const CRC8_TAB: [u8; 256] = [
    0x00, 0x31, 0x62, 0x53, 0xC4, 0xF5, 0xA6, 0x97, 0xB9,
    0x88, 0xDB, 0xEA, 0x7D, 0x4C, 0x1F, 0x2E, 0x43, 0x72,
    0x21, 0x10, 0x87, 0xB6, 0xE5, 0xD4, 0xFA, 0xCB, 0x98,
    0xA9, 0x3E, 0x0F, 0x5C, 0x6D, 0x86, 0xB7, 0xE4, 0xD5,
    0x42, 0x73, 0x20, 0x11, 0x3F, 0x0E, 0x5D, 0x6C, 0xFB,
    0xCA, 0x99, 0xA8, 0xC5, 0xF4, 0xA7, 0x96, 0x01, 0x30,
    0x63, 0x52, 0x7C, 0x4D, 0x1E, 0x2F, 0xB8, 0x89, 0xDA,
    0xEB, 0x3D, 0x0C, 0x5F, 0x6E, 0xF9, 0xC8, 0x9B, 0xAA,
    0x84, 0xB5, 0xE6, 0xD7, 0x40, 0x71, 0x22, 0x13, 0x7E,
    0x4F, 0x1C, 0x2D, 0xBA, 0x8B, 0xD8, 0xE9, 0xC7, 0xF6,
    0xA5, 0x94, 0x03, 0x32, 0x61, 0x50, 0xBB, 0x8A, 0xD9,
    0xE8, 0x7F, 0x4E, 0x1D, 0x2C, 0x02, 0x33, 0x60, 0x51,
    0xC6, 0xF7, 0xA4, 0x95, 0xF8, 0xC9, 0x9A, 0xAB, 0x3C,
    0x0D, 0x5E, 0x6F, 0x41, 0x70, 0x23, 0x12, 0x85, 0xB4,
    0xE7, 0xD6, 0x7A, 0x4B, 0x18, 0x29, 0xBE, 0x8F, 0xDC,
    0xED, 0xC3, 0xF2, 0xA1, 0x90, 0x07, 0x36, 0x65, 0x54,
    0x39, 0x08, 0x5B, 0x6A, 0xFD, 0xCC, 0x9F, 0xAE, 0x80,
    0xB1, 0xE2, 0xD3, 0x44, 0x75, 0x26, 0x17, 0xFC, 0xCD,
    0x9E, 0xAF, 0x38, 0x09, 0x5A, 0x6B, 0x45, 0x74, 0x27,
    0x16, 0x81, 0xB0, 0xE3, 0xD2, 0xBF, 0x8E, 0xDD, 0xEC,
    0x7B, 0x4A, 0x19, 0x28, 0x06, 0x37, 0x64, 0x55, 0xC2,
    0xF3, 0xA0, 0x91, 0x47, 0x76, 0x25, 0x14, 0x83, 0xB2,
    0xE1, 0xD0, 0xFE, 0xCF, 0x9C, 0xAD, 0x3A, 0x0B, 0x58,
    0x69, 0x04, 0x35, 0x66, 0x57, 0xC0, 0xF1, 0xA2, 0x93,
    0xBD, 0x8C, 0xDF, 0xEE, 0x79, 0x48, 0x1B, 0x2A, 0xC1,
    0xF0, 0xA3, 0x92, 0x05, 0x34, 0x67, 0x56, 0x78, 0x49,
    0x1A, 0x2B, 0xBC, 0x8D, 0xDE, 0xEF, 0x82, 0xB3, 0xE0,
    0xD1, 0x46, 0x77, 0x24, 0x15, 0x3B, 0x0A, 0x59, 0x68,
    0xFF, 0xCE, 0x9D, 0xAC,
];

#[rustfmt::skip]
const FCS_TAB: [u16; 256] = [
    0x0000, 0x1189, 0x2312, 0x329b, 0x4624, 0x57ad, 0x6536, 0x74bf,
    0x8c48, 0x9dc1, 0xaf5a, 0xbed3, 0xca6c, 0xdbe5, 0xe97e, 0xf8f7,
    0x1081, 0x0108, 0x3393, 0x221a, 0x56a5, 0x472c, 0x75b7, 0x643e,
    0x9cc9, 0x8d40, 0xbfdb, 0xae52, 0xdaed, 0xcb64, 0xf9ff, 0xe876,
    0x2102, 0x308b, 0x0210, 0x1399, 0x6726, 0x76af, 0x4434, 0x55bd,
    0xad4a, 0xbcc3, 0x8e58, 0x9fd1, 0xeb6e, 0xfae7, 0xc87c, 0xd9f5,
    0x3183, 0x200a, 0x1291, 0x0318, 0x77a7, 0x662e, 0x54b5, 0x453c,
    0xbdcb, 0xac42, 0x9ed9, 0x8f50, 0xfbef, 0xea66, 0xd8fd, 0xc974,
    0x4204, 0x538d, 0x6116, 0x709f, 0x0420, 0x15a9, 0x2732, 0x36bb,
    0xce4c, 0xdfc5, 0xed5e, 0xfcd7, 0x8868, 0x99e1, 0xab7a, 0xbaf3,
    0x5285, 0x430c, 0x7197, 0x601e, 0x14a1, 0x0528, 0x37b3, 0x263a,
    0xdecd, 0xcf44, 0xfddf, 0xec56, 0x98e9, 0x8960, 0xbbfb, 0xaa72,
    0x6306, 0x728f, 0x4014, 0x519d, 0x2522, 0x34ab, 0x0630, 0x17b9,
    0xef4e, 0xfec7, 0xcc5c, 0xddd5, 0xa96a, 0xb8e3, 0x8a78, 0x9bf1,
    0x7387, 0x620e, 0x5095, 0x411c, 0x35a3, 0x242a, 0x16b1, 0x0738,
    0xffcf, 0xee46, 0xdcdd, 0xcd54, 0xb9eb, 0xa862, 0x9af9, 0x8b70,
    0x8408, 0x9581, 0xa71a, 0xb693, 0xc22c, 0xd3a5, 0xe13e, 0xf0b7,
    0x0840, 0x19c9, 0x2b52, 0x3adb, 0x4e64, 0x5fed, 0x6d76, 0x7cff,
    0x9489, 0x8500, 0xb79b, 0xa612, 0xd2ad, 0xc324, 0xf1bf, 0xe036,
    0x18c1, 0x0948, 0x3bd3, 0x2a5a, 0x5ee5, 0x4f6c, 0x7df7, 0x6c7e,
    0xa50a, 0xb483, 0x8618, 0x9791, 0xe32e, 0xf2a7, 0xc03c, 0xd1b5,
    0x2942, 0x38cb, 0x0a50, 0x1bd9, 0x6f66, 0x7eef, 0x4c74, 0x5dfd,
    0xb58b, 0xa402, 0x9699, 0x8710, 0xf3af, 0xe226, 0xd0bd, 0xc134,
    0x39c3, 0x284a, 0x1ad1, 0x0b58, 0x7fe7, 0x6e6e, 0x5cf5, 0x4d7c,
    0xc60c, 0xd785, 0xe51e, 0xf497, 0x8028, 0x91a1, 0xa33a, 0xb2b3,
    0x4a44, 0x5bcd, 0x6956, 0x78df, 0x0c60, 0x1de9, 0x2f72, 0x3efb,
    0xd68d, 0xc704, 0xf59f, 0xe416, 0x90a9, 0x8120, 0xb3bb, 0xa232,
    0x5ac5, 0x4b4c, 0x79d7, 0x685e, 0x1ce1, 0x0d68, 0x3ff3, 0x2e7a,
    0xe70e, 0xf687, 0xc41c, 0xd595, 0xa12a, 0xb0a3, 0x8238, 0x93b1,
    0x6b46, 0x7acf, 0x4854, 0x59dd, 0x2d62, 0x3ceb, 0x0e70, 0x1ff9,
    0xf78f, 0xe606, 0xd49d, 0xc514, 0xb1ab, 0xa022, 0x92b9, 0x8330,
    0x7bc7, 0x6a4e, 0x58d5, 0x495c, 0x3de3, 0x2c6a, 0x1ef1, 0x0f78,
];

/// Residue of a well-formed HDLC frame including its trailing FCS.
pub const VALID_FCS16: u16 = 0xf0b8;

/// Audio packet CRC, initial value 0xFF. A packet including its trailing
/// CRC byte sums to zero when intact.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0xffu8;
    for &byte in data {
        crc = CRC8_TAB[(crc ^ byte) as usize];
    }
    crc
}

/// CCITT FCS-16 over an unescaped HDLC frame.
pub fn fcs16(data: &[u8]) -> u16 {
    let mut crc = 0xffffu16;
    for &byte in data {
        crc = (crc >> 8) ^ FCS_TAB[((crc ^ byte as u16) & 0xff) as usize];
    }
    crc
}

/// Computes the FCS to append to `data` so the receiver's running residue
/// comes out to `VALID_FCS16`.
pub fn fcs16_append(data: &[u8]) -> u16 {
    !fcs16(data)
}

/// PIDS CRC-12: polynomial 0xD010 run in the reverse direction over the 68
/// leading payload bits, final XOR 0x955. `bits` holds one bit per element.
pub fn crc12(bits: &[u8]) -> u16 {
    let poly: u16 = 0xd010;
    let mut reg: u16 = 0;

    for i in (0..=67).rev() {
        let lowbit = reg & 1;
        reg >>= 1;
        reg ^= (bits[i] as u16) << 15;
        if lowbit != 0 {
            reg ^= poly;
        }
    }
    for _ in 0..16 {
        let lowbit = reg & 1;
        reg >>= 1;
        if lowbit != 0 {
            reg ^= poly;
        }
    }
    (reg ^ 0x955) & 0xfff
}

/// Verifies an 80-bit PIDS frame: the last twelve bits must equal the CRC
/// of the first 68.
pub fn check_crc12(bits: &[u8]) -> bool {
    debug_assert!(bits.len() >= 80);
    let mut expected: u16 = 0;
    for &bit in &bits[68..80] {
        expected = (expected << 1) | bit as u16;
    }
    expected == crc12(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc8_of_packet_with_its_crc_is_zero() {
        let payload = [0x12u8, 0x34, 0x56, 0x78, 0x9a];
        // The table CRC has the property crc(data || crc(data)) == 0 only
        // when the trailing byte is chosen accordingly; find it by search
        // the way a transmitter table would.
        let mut tail = 0u8;
        for candidate in 0..=255u8 {
            let mut buf = payload.to_vec();
            buf.push(candidate);
            if crc8(&buf) == 0 {
                tail = candidate;
                break;
            }
        }
        let mut buf = payload.to_vec();
        buf.push(tail);
        assert_eq!(crc8(&buf), 0);

        // Any single-bit flip breaks it.
        for byte in 0..buf.len() {
            for bit in 0..8 {
                let mut bad = buf.clone();
                bad[byte] ^= 1 << bit;
                assert_ne!(crc8(&bad), 0);
            }
        }
    }

    #[test]
    fn fcs16_residue_matches_hdlc_convention() {
        let frame = [0x21u8, b'H', b'i'];
        let fcs = fcs16_append(&frame);
        let mut full = frame.to_vec();
        full.push((fcs & 0xff) as u8);
        full.push((fcs >> 8) as u8);
        assert_eq!(fcs16(&full), VALID_FCS16);
    }

    #[test]
    fn crc12_accepts_valid_and_rejects_single_bit_flips() {
        let mut bits = [0u8; 80];
        for (i, b) in bits.iter_mut().enumerate().take(68) {
            *b = ((i * 5 + 1) % 3 == 0) as u8;
        }
        let crc = crc12(&bits);
        for i in 0..12 {
            bits[68 + i] = ((crc >> (11 - i)) & 1) as u8;
        }
        assert!(check_crc12(&bits));

        for i in 0..80 {
            let mut bad = bits;
            bad[i] ^= 1;
            assert!(!check_crc12(&bad), "flip at {i} accepted");
        }
    }
}
