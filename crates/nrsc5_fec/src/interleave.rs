//! Logical-channel deinterleavers and the decoder that drives them.
//!
//! The P1, PIDS and P3 channels share one convolutional code and differ only
//! in interleaver geometry. Soft bits arrive from the tracker one block at a
//! time; deinterleaving addresses are computed on the fly, depuncture zeros
//! are inserted as the Viterbi input is assembled, and decoded frames are
//! descrambled before they leave this module.

use crate::scramble::descramble;
use crate::viterbi::{ViterbiDecoder, GENERATORS};
use log::debug;
use nrsc5_core::nrsc5_parameters::*;
use nrsc5_dsp::sync::SoftBitSink;

/// Interleaver permutation shared by P1 and PIDS.
const V_PERM: [usize; 20] = [
    10, 2, 18, 6, 14, 8, 16, 0, 12, 4,
    11, 3, 19, 7, 15, 9, 17, 1, 13, 5,
];

/// Soft bits per L1 block on the primary (PM) sidebands.
const PM_BLOCK_BITS: usize = 720 * BLKSZ;
/// Soft bits per P3 deinterleaver invocation on the extended (PX1) strips.
const PX1_CHUNK_BITS: usize = 144 * BLKSZ * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    P1,
    Pids,
    P3,
}

/// A decoded, descrambled logical frame: one bit per byte.
#[derive(Debug)]
pub struct DecodedFrame {
    pub channel: Channel,
    pub bits: Vec<u8>,
    /// Channel bit error rate, measured on P1 by re-encoding.
    pub cber: Option<f32>,
}

/// Owns the per-channel soft-bit buffers and Viterbi instances, and
/// implements the tracker's sink so soft bits stream straight in. Decoded
/// frames accumulate until the driver drains them.
pub struct ChannelDecoder {
    buffer_pm: Vec<i8>,
    idx_pm: usize,
    buffer_px1: Vec<i8>,
    idx_px1: usize,

    viterbi_in: Vec<i8>,
    decoded: Vec<u8>,

    internal_p3: Vec<i8>,
    i_p3: usize,
    pt_p3: [u32; 4],
    ready_p3: bool,

    vit_p1: ViterbiDecoder,
    vit_pids: ViterbiDecoder,
    vit_p3: ViterbiDecoder,

    frames: Vec<DecodedFrame>,
}

impl ChannelDecoder {
    pub fn new() -> Self {
        Self {
            buffer_pm: vec![0; PM_BLOCK_BITS * 16],
            idx_pm: 0,
            buffer_px1: vec![0; PX1_CHUNK_BITS],
            idx_px1: 0,
            viterbi_in: vec![0; P1_FRAME_LEN * 3],
            decoded: vec![0; P1_FRAME_LEN],
            internal_p3: vec![0; P3_INTERNAL_LEN],
            i_p3: 0,
            pt_p3: [0; 4],
            ready_p3: false,
            vit_p1: ViterbiDecoder::new(P1_FRAME_LEN),
            vit_pids: ViterbiDecoder::new(PIDS_FRAME_LEN),
            vit_p3: ViterbiDecoder::new(P3_FRAME_LEN),
            frames: Vec::new(),
        }
    }

    /// Drains the frames decoded since the last call, oldest first.
    pub fn take_frames(&mut self) -> Vec<DecodedFrame> {
        std::mem::take(&mut self.frames)
    }

    fn process_p1(&mut self) {
        const J: usize = 20;
        const B: usize = 16;
        const C: usize = 36;

        let mut out = 0;
        for i in 0..P1_FRAME_LEN_ENCODED {
            let partition = V_PERM[i % J];
            let block = ((i / J) + partition * 7) % B;
            let k = i / (J * B);
            let row = (k * 11) % 32;
            let column = (k * 11 + k / (32 * 9)) % C;
            self.viterbi_in[out] = self.buffer_pm[(block * 32 + row) * 720 + partition * C + column];
            out += 1;
            if out % 6 == 5 {
                // depuncture, [1, 1, 1, 1, 1, 0]
                self.viterbi_in[out] = 0;
                out += 1;
            }
        }

        self.vit_p1.decode(&self.viterbi_in[..P1_FRAME_LEN * 3], &mut self.decoded);
        let cber = self.calc_cber();
        descramble(&mut self.decoded[..P1_FRAME_LEN]);
        self.frames.push(DecodedFrame {
            channel: Channel::P1,
            bits: self.decoded[..P1_FRAME_LEN].to_vec(),
            cber: Some(cber),
        });
    }

    fn process_pids(&mut self) {
        const J: usize = 20;
        const B: usize = 16;
        const C: usize = 36;

        let block = self.block() - 1;
        let mut out = 0;
        for i in 0..PIDS_FRAME_LEN_ENCODED {
            let partition = V_PERM[i % J];
            let k = (i / J) % (PIDS_FRAME_LEN_ENCODED / J) + P1_FRAME_LEN_ENCODED / (J * B);
            let row = (k * 11) % 32;
            let column = (k * 11 + k / (32 * 9)) % C;
            self.viterbi_in[out] = self.buffer_pm[(block * 32 + row) * 720 + partition * C + column];
            out += 1;
            if out % 6 == 5 {
                // depuncture, [1, 1, 1, 1, 1, 0]
                self.viterbi_in[out] = 0;
                out += 1;
            }
        }

        self.vit_pids.decode(&self.viterbi_in[..PIDS_FRAME_LEN * 3], &mut self.decoded);
        descramble(&mut self.decoded[..PIDS_FRAME_LEN]);
        self.frames.push(DecodedFrame {
            channel: Channel::Pids,
            bits: self.decoded[..PIDS_FRAME_LEN].to_vec(),
            cber: None,
        });
    }

    fn process_p3(&mut self) {
        const J: u32 = 4;
        const B: u32 = 32;
        const C: u32 = 36;
        const M: u32 = 2;
        let bk_bits: u32 = 32 * C;
        let bk_adj: u32 = 32 * C - 1;

        let mut out = 0;
        for i in 0..P3_FRAME_LEN_ENCODED {
            let partition = ((self.i_p3 as u32 + 2 * (M / 4)) / M) % J;
            let pti = self.pt_p3[partition as usize];
            self.pt_p3[partition as usize] += 1;
            let block = (pti + partition * 7 - bk_adj * (pti / bk_bits)) % B;
            let row = ((11 * pti) % bk_bits) / C;
            let column = (pti * 11) % C;
            self.viterbi_in[out] = self.internal_p3
                [((block * 32 + row) * 144 + partition * C + column) as usize];
            out += 1;
            if out % 6 == 1 || out % 6 == 4 {
                // depuncture, [1, 0, 1, 1, 0, 1]
                self.viterbi_in[out] = 0;
                out += 1;
            }

            self.internal_p3[self.i_p3] = self.buffer_px1[i];
            self.i_p3 += 1;
        }

        if self.ready_p3 {
            self.vit_p3.decode(&self.viterbi_in[..P3_FRAME_LEN * 3], &mut self.decoded);
            descramble(&mut self.decoded[..P3_FRAME_LEN]);
            self.frames.push(DecodedFrame {
                channel: Channel::P3,
                bits: self.decoded[..P3_FRAME_LEN].to_vec(),
                cber: None,
            });
        }
        if self.i_p3 == P3_INTERNAL_LEN {
            self.i_p3 = 0;
            self.ready_p3 = true;
        }
    }

    /// Channel bit error rate: re-encode the decoded frame and count
    /// disagreements against the received soft bits, skipping punctured
    /// positions.
    fn calc_cber(&self) -> f32 {
        let decoded = &self.decoded[..P1_FRAME_LEN];
        let coded = &self.viterbi_in[..P1_FRAME_LEN * 3];

        let mut r: u32 = 0;
        for i in 0..6 {
            r = (r >> 1) | ((decoded[P1_FRAME_LEN - 6 + i] as u32) << 6);
        }

        let mut errors = 0usize;
        let mut j = 0usize;
        for &bit in decoded {
            r = (r >> 1) | ((bit as u32) << 6);

            for (g, gen) in GENERATORS.iter().enumerate() {
                if g == 2 && j % 6 == 5 {
                    // punctured position, nothing was transmitted
                    j += 1;
                    break;
                }
                let hard: u32 = if coded[j] > 0 { 1 } else { 0 };
                if hard != (r & gen).count_ones() & 1 {
                    errors += 1;
                }
                j += 1;
            }
        }

        errors as f32 / (2.5 * P1_FRAME_LEN as f32)
    }
}

impl Default for ChannelDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftBitSink for ChannelDecoder {
    fn push_pm(&mut self, bit: i8) {
        self.buffer_pm[self.idx_pm] = bit;
        self.idx_pm += 1;
        if self.idx_pm % PM_BLOCK_BITS == 0 {
            self.process_pids();
        }
        if self.idx_pm == PM_BLOCK_BITS * 16 {
            self.process_p1();
            self.idx_pm = 0;
        }
    }

    fn push_px1(&mut self, bit: i8) {
        self.buffer_px1[self.idx_px1] = bit;
        self.idx_px1 += 1;
        if self.idx_px1 == PX1_CHUNK_BITS {
            self.process_p3();
            self.idx_px1 = 0;
        }
    }

    fn block(&self) -> usize {
        self.idx_pm / PM_BLOCK_BITS
    }

    fn reset(&mut self) {
        debug!("decoder frame alignment reset");
        self.idx_pm = 0;
        self.idx_px1 = 0;
        self.i_p3 = 0;
        self.ready_p3 = false;
        self.pt_p3 = [0; 4];
        self.frames.clear();
    }
}

/// Forward P1/PIDS interleaver, the inverse of the address computation in
/// the decoder. Exists for the identity property tests.
#[cfg(test)]
fn interleave_pm(frame: &[i8], block_base: usize, pids: bool, out: &mut [i8]) {
    const J: usize = 20;
    const B: usize = 16;
    const C: usize = 36;
    let total = if pids { PIDS_FRAME_LEN_ENCODED } else { P1_FRAME_LEN_ENCODED };
    for i in 0..total {
        let partition = V_PERM[i % J];
        let (block, k) = if pids {
            (block_base, (i / J) % (total / J) + P1_FRAME_LEN_ENCODED / (J * B))
        } else {
            (((i / J) + partition * 7) % B, i / (J * B))
        };
        let row = (k * 11) % 32;
        let column = (k * 11 + k / (32 * 9)) % C;
        out[(block * 32 + row) * 720 + partition * C + column] = frame[i];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viterbi::conv_encode;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn push_block(dec: &mut ChannelDecoder, block: &[i8]) {
        for &b in block {
            dec.push_pm(b);
        }
    }

    #[test]
    fn pm_interleaver_roundtrips_p1() {
        let mut rng = SmallRng::seed_from_u64(7);
        let soft: Vec<i8> = (0..P1_FRAME_LEN_ENCODED)
            .map(|_| if rng.random::<bool>() { 64 } else { -64 })
            .collect();

        let mut buffer = vec![0i8; PM_BLOCK_BITS * 16];
        interleave_pm(&soft, 0, false, &mut buffer);

        // Re-run the decoder's address computation and compare.
        const J: usize = 20;
        const B: usize = 16;
        const C: usize = 36;
        for i in 0..P1_FRAME_LEN_ENCODED {
            let partition = V_PERM[i % J];
            let block = ((i / J) + partition * 7) % B;
            let k = i / (J * B);
            let row = (k * 11) % 32;
            let column = (k * 11 + k / (32 * 9)) % C;
            assert_eq!(soft[i], buffer[(block * 32 + row) * 720 + partition * C + column]);
        }
    }

    #[test]
    fn p1_frame_decodes_through_full_interleaver() {
        let mut rng = SmallRng::seed_from_u64(11);
        let mut message: Vec<u8> = (0..P1_FRAME_LEN).map(|_| rng.random_range(0..2u8)).collect();

        let mut coded = Vec::new();
        conv_encode(&message, &mut coded);

        // Puncture: drop every sixth coded bit, map to soft values.
        let punctured: Vec<i8> = coded
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 6 != 5)
            .map(|(_, &b)| if b == 1 { 100 } else { -100 })
            .collect();
        assert_eq!(punctured.len(), P1_FRAME_LEN_ENCODED);

        let mut dec = ChannelDecoder::new();
        interleave_pm(&punctured, 0, false, &mut dec.buffer_pm);
        // Stream the interleaved bits through the sink; the sixteenth block
        // completes the frame and triggers the P1 decode. The PIDS slots
        // hold zeros and decode to throwaway frames.
        let stream = dec.buffer_pm.clone();
        for &b in &stream {
            dec.push_pm(b);
        }

        let frames = dec.take_frames();
        let p1 = frames.iter().find(|f| f.channel == Channel::P1).unwrap();
        assert_eq!(p1.bits.len(), P1_FRAME_LEN);

        descramble(&mut message);
        assert_eq!(p1.bits, message);
        assert_eq!(p1.cber.unwrap(), 0.0);
    }

    #[test]
    fn pids_frame_decodes_from_one_block() {
        let mut rng = SmallRng::seed_from_u64(13);
        let mut message: Vec<u8> = (0..PIDS_FRAME_LEN).map(|_| rng.random_range(0..2u8)).collect();

        let mut coded = Vec::new();
        conv_encode(&message, &mut coded);
        let punctured: Vec<i8> = coded
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 6 != 5)
            .map(|(_, &b)| if b == 1 { 100 } else { -100 })
            .collect();
        assert_eq!(punctured.len(), PIDS_FRAME_LEN_ENCODED);

        let mut dec = ChannelDecoder::new();
        // PIDS bits for block zero live alongside the P1 payload; place them
        // with the forward interleaver, then stream one block of soft bits.
        interleave_pm(&punctured, 0, true, &mut dec.buffer_pm);
        let block: Vec<i8> = dec.buffer_pm[..PM_BLOCK_BITS].to_vec();
        push_block(&mut dec, &block);

        let frames = dec.take_frames();
        let pids = frames.iter().find(|f| f.channel == Channel::Pids).unwrap();
        descramble(&mut message);
        assert_eq!(pids.bits, message);
    }

    #[test]
    fn p3_becomes_valid_only_after_priming() {
        let mut dec = ChannelDecoder::new();
        // The internal buffer spans sixteen chunks; until it has been
        // filled once, no frames may be produced.
        for _ in 0..P3_INTERNAL_LEN / PX1_CHUNK_BITS {
            for _ in 0..PX1_CHUNK_BITS {
                dec.push_px1(1);
            }
        }
        assert!(dec.take_frames().is_empty());
        assert!(dec.ready_p3);

        for _ in 0..PX1_CHUNK_BITS {
            dec.push_px1(1);
        }
        let frames = dec.take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, Channel::P3);
        assert_eq!(frames[0].bits.len(), P3_FRAME_LEN);
    }

    #[test]
    fn block_index_follows_pm_fill() {
        let mut dec = ChannelDecoder::new();
        assert_eq!(dec.block(), 0);
        push_block(&mut dec, &vec![1i8; PM_BLOCK_BITS]);
        assert_eq!(dec.block(), 1);
        assert_eq!(dec.take_frames().len(), 1); // one PIDS frame per block
    }
}
