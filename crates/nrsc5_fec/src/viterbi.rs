//! Soft-decision Viterbi decoder for the rate-1/3, K=7 tail-biting
//! convolutional code shared by every logical channel.

/// Generator polynomials, octal 133/171/165.
pub const GENERATORS: [u32; 3] = [0o133, 0o171, 0o165];
pub const CONSTRAINT: usize = 7;
pub const RATE: usize = 3;

const NUM_STATES: usize = 64;
const STATE_MASK: u32 = 0x3e;

fn parity(x: u32) -> u8 {
    (x.count_ones() & 1) as u8
}

/// Left shift and mask for finding the previous state.
fn state_lshift(reg: u32, val: u32) -> u32 {
    ((reg << 1) & STATE_MASK) | val
}

/// 64-state trellis with per-step path selections.
///
/// Path selections are stored as -1 and 0 rather than 0 and 1, preserving
/// the packed-compare convention the reference decoder inherited from its
/// SIMD variants; the scalar forward recursion here is the normative path.
pub struct ViterbiDecoder {
    len: usize,
    /// Normalization interval for the accumulated path metrics.
    intrvl: usize,
    sums: [i16; NUM_STATES],
    /// Trellis outputs, three per state.
    outputs: [[i16; RATE]; NUM_STATES],
    /// Input value that led to each state.
    vals: [u8; NUM_STATES],
    paths: Vec<i16>,
}

impl ViterbiDecoder {
    /// Creates a decoder for tail-biting frames of `len` information bits.
    pub fn new(len: usize) -> Self {
        let mut outputs = [[0i16; RATE]; NUM_STATES];
        let mut vals = [0u8; NUM_STATES];

        for reg in 0..NUM_STATES as u32 {
            // Previous '0' state, with the driving input bit restored at
            // the top of the register.
            let val = (reg >> (CONSTRAINT - 2)) & 0x01;
            let prev = state_lshift(reg, 0) | (val << (CONSTRAINT - 1));
            vals[reg as usize] = val as u8;
            for (i, gen) in GENERATORS.iter().enumerate() {
                outputs[reg as usize][i] = (parity(prev & gen) as i16) * 2 - 1;
            }
        }

        let intrvl = (i16::MAX as usize) / (RATE * i8::MAX as usize) - CONSTRAINT;

        Self {
            len,
            intrvl,
            sums: [0; NUM_STATES],
            outputs,
            vals,
            paths: vec![0; len * NUM_STATES],
        }
    }

    fn step(&mut self, seq: &[i8], step: usize, norm: bool) {
        let mut metrics = [0i16; NUM_STATES / 2];
        for (i, m) in metrics.iter_mut().enumerate() {
            *m = seq[0] as i16 * self.outputs[i][0]
                + seq[1] as i16 * self.outputs[i][1]
                + seq[2] as i16 * self.outputs[i][2];
        }

        let mut new_sums = [0i16; NUM_STATES];
        let paths = &mut self.paths[step * NUM_STATES..(step + 1) * NUM_STATES];
        for i in 0..NUM_STATES / 2 {
            // Add-compare-select butterfly over the paired source states.
            let state0 = self.sums[2 * i];
            let state1 = self.sums[2 * i + 1];
            let metric = metrics[i];

            let (sum, path) = if state0 + metric > state1 - metric {
                (state0 + metric, -1)
            } else {
                (state1 - metric, 0)
            };
            new_sums[i] = sum;
            paths[i] = path;

            let (sum, path) = if state0 - metric > state1 + metric {
                (state0 - metric, -1)
            } else {
                (state1 + metric, 0)
            };
            new_sums[i + NUM_STATES / 2] = sum;
            paths[i + NUM_STATES / 2] = path;
        }

        if norm {
            let min = *new_sums.iter().min().unwrap();
            for s in new_sums.iter_mut() {
                *s -= min;
            }
        }
        self.sums = new_sums;
    }

    fn forward(&mut self, input: &[i8]) {
        for i in 0..self.len {
            self.step(&input[RATE * i..], i, i % self.intrvl == 0);
        }
    }

    fn traceback(&self, mut state: u32, out: &mut [u8]) -> u32 {
        for i in (0..self.len).rev() {
            let path = (self.paths[i * NUM_STATES + state as usize] + 1) as u32;
            out[i] = self.vals[state as usize];
            state = state_lshift(state, path);
        }
        state
    }

    /// Decodes `3 * len` soft bits into `len` information bits.
    ///
    /// The trellis is propagated twice over the same input so the survivor
    /// metrics wrap around the tail-biting boundary, then traced back from
    /// the best final state.
    pub fn decode(&mut self, input: &[i8], out: &mut [u8]) {
        assert!(input.len() >= RATE * self.len);
        assert!(out.len() >= self.len);

        self.sums = [0; NUM_STATES];
        self.forward(input);
        self.forward(input);

        let state = self
            .sums
            .iter()
            .enumerate()
            .max_by_key(|(_, sum)| **sum)
            .map(|(i, _)| i as u32)
            .unwrap();

        let state = self.traceback(state, out);
        self.traceback(state, out);
    }
}

/// Tail-biting convolutional encoder, used for channel BER measurement and
/// round-trip tests. Produces three NRZ bits per information bit.
pub fn conv_encode(bits: &[u8], out: &mut Vec<u8>) {
    let len = bits.len();
    let mut r: u32 = 0;
    for i in 0..CONSTRAINT - 1 {
        r = (r >> 1) | ((bits[len - (CONSTRAINT - 1) + i] as u32) << (CONSTRAINT - 1));
    }
    out.clear();
    for &bit in bits {
        r = (r >> 1) | ((bit as u32) << (CONSTRAINT - 1));
        for gen in GENERATORS {
            out.push(parity(r & gen));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn roundtrip(len: usize, noise: i8, seed: u64) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let bits: Vec<u8> = (0..len).map(|_| rng.random_range(0..2u8)).collect();

        let mut coded = Vec::new();
        conv_encode(&bits, &mut coded);

        let soft: Vec<i8> = coded
            .iter()
            .map(|&b| {
                let clean: i16 = if b == 1 { 100 } else { -100 };
                let jitter: i16 = rng.random_range(-(noise as i16)..=noise as i16);
                (clean + jitter).clamp(-127, 127) as i8
            })
            .collect();

        let mut decoder = ViterbiDecoder::new(len);
        let mut out = vec![0u8; len];
        decoder.decode(&soft, &mut out);
        assert_eq!(out, bits);
    }

    #[test]
    fn noiseless_roundtrip_is_exact() {
        roundtrip(80, 0, 1);
        roundtrip(600, 0, 2);
    }

    #[test]
    fn roundtrip_survives_moderate_noise() {
        roundtrip(600, 60, 3);
        roundtrip(1200, 60, 4);
    }

    #[test]
    fn encoder_register_wraps_tail() {
        // With an all-zero frame every output bit is zero regardless of
        // where the tail-biting register starts.
        let bits = vec![0u8; 64];
        let mut coded = Vec::new();
        conv_encode(&bits, &mut coded);
        assert_eq!(coded.len(), 64 * RATE);
        assert!(coded.iter().all(|&b| b == 0));
    }

    #[test]
    fn normalization_interval_matches_metric_headroom() {
        let dec = ViterbiDecoder::new(80);
        assert_eq!(dec.intrvl, i16::MAX as usize / (RATE * i8::MAX as usize) - CONSTRAINT);
    }
}
