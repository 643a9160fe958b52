//! Shortened RS(96,80) decoder protecting the layer-2 audio header.
//!
//! The code is RS(255,239) over GF(2^8)/0x11D with fcr=1 and t=8, shortened
//! by treating the leading 159 symbols as zero. The header arrives mirror
//! ordered from the frame parser; the caller is responsible for that
//! reversal and for rejecting codewords whose corrections land in the
//! virtual padding.

use crate::galois::{GaloisField, GF_N};

pub const RS_BLOCK_LEN: usize = 255;
pub const RS_CODEWORD_LEN: usize = 96;
pub const RS_PARITY_LEN: usize = 16;
/// First consecutive root of the generator polynomial.
const FCR: usize = 1;

pub struct ReedSolomon {
    gf: GaloisField,
    /// Generator polynomial coefficients, ascending degree; genpoly[16] = 1.
    genpoly: [u8; RS_PARITY_LEN + 1],
}

impl ReedSolomon {
    pub fn new() -> Self {
        let gf = GaloisField::new();

        let mut genpoly = [0u8; RS_PARITY_LEN + 1];
        genpoly[0] = 1;
        for j in 0..RS_PARITY_LEN {
            // Multiply the running product by (x + alpha^(fcr + j)).
            let root = gf.alpha_pow(FCR + j);
            let mut next = [0u8; RS_PARITY_LEN + 1];
            for (i, &coef) in genpoly.iter().enumerate() {
                if coef == 0 {
                    continue;
                }
                next[i] ^= gf.mul(coef, root);
                if i + 1 <= RS_PARITY_LEN {
                    next[i + 1] ^= coef;
                }
            }
            genpoly = next;
        }

        Self { gf, genpoly }
    }

    /// Appends the sixteen parity symbols for an 80-symbol message.
    /// `block` holds coefficients highest degree first.
    pub fn encode(&self, message: &[u8], parity: &mut [u8; RS_PARITY_LEN]) {
        assert!(message.len() <= RS_BLOCK_LEN - RS_PARITY_LEN);
        parity.fill(0);
        for &m in message {
            let fb = m ^ parity[0];
            for j in 0..RS_PARITY_LEN - 1 {
                parity[j] = parity[j + 1] ^ self.gf.mul(fb, self.genpoly[RS_PARITY_LEN - 1 - j]);
            }
            parity[RS_PARITY_LEN - 1] = self.gf.mul(fb, self.genpoly[0]);
        }
    }

    fn syndromes(&self, block: &[u8; RS_BLOCK_LEN]) -> ([u8; RS_PARITY_LEN], bool) {
        let mut syn = [0u8; RS_PARITY_LEN];
        let mut nonzero = false;
        for (j, s) in syn.iter_mut().enumerate() {
            let root = self.gf.alpha_pow(FCR + j);
            let mut acc = 0u8;
            for &sym in block.iter() {
                acc = self.gf.mul(acc, root) ^ sym;
            }
            *s = acc;
            nonzero |= acc != 0;
        }
        (syn, nonzero)
    }

    /// Corrects up to eight symbol errors in a 255-symbol block laid out
    /// highest degree first. Returns the number of corrections, or `None`
    /// when the block is uncorrectable.
    pub fn decode(&self, block: &mut [u8; RS_BLOCK_LEN]) -> Option<usize> {
        let (syn, nonzero) = self.syndromes(block);
        if !nonzero {
            return Some(0);
        }

        // Berlekamp-Massey: find the error locator polynomial.
        let mut lambda = [0u8; RS_PARITY_LEN + 1];
        let mut prev = [0u8; RS_PARITY_LEN + 1];
        lambda[0] = 1;
        prev[0] = 1;
        let mut l = 0usize;
        let mut m = 1usize;
        let mut b = 1u8;

        for n in 0..RS_PARITY_LEN {
            let mut delta = syn[n];
            for i in 1..=l {
                delta ^= self.gf.mul(lambda[i], syn[n - i]);
            }

            if delta == 0 {
                m += 1;
            } else if 2 * l <= n {
                let t = lambda;
                let coef = self.gf.div(delta, b);
                for i in 0..=RS_PARITY_LEN - m {
                    lambda[i + m] ^= self.gf.mul(coef, prev[i]);
                }
                l = n + 1 - l;
                prev = t;
                b = delta;
                m = 1;
            } else {
                let coef = self.gf.div(delta, b);
                for i in 0..=RS_PARITY_LEN - m {
                    lambda[i + m] ^= self.gf.mul(coef, prev[i]);
                }
                m += 1;
            }
        }

        if l > RS_PARITY_LEN / 2 {
            return None;
        }

        // Chien search: roots of lambda give the error positions.
        let mut positions = [0usize; RS_PARITY_LEN / 2];
        let mut roots = [0usize; RS_PARITY_LEN / 2];
        let mut count = 0usize;
        for p in 0..GF_N {
            let x = self.gf.alpha_pow(p);
            let mut acc = 0u8;
            let mut xp = 1u8;
            for &coef in lambda.iter().take(l + 1) {
                acc ^= self.gf.mul(coef, xp);
                xp = self.gf.mul(xp, x);
            }
            if acc == 0 {
                if count == RS_PARITY_LEN / 2 {
                    return None;
                }
                // A root at alpha^p marks an error in block index p - 1.
                positions[count] = (p + GF_N - 1) % GF_N;
                roots[count] = p;
                count += 1;
            }
        }
        if count != l {
            return None;
        }

        // Forney: error magnitudes from the evaluator polynomial
        // omega = syn * lambda mod x^16.
        let mut omega = [0u8; RS_PARITY_LEN];
        for (i, o) in omega.iter_mut().enumerate() {
            let mut acc = 0u8;
            for j in 0..=i.min(l) {
                acc ^= self.gf.mul(lambda[j], syn[i - j]);
            }
            *o = acc;
        }

        for e in 0..count {
            let xinv = self.gf.alpha_pow(roots[e]);

            let mut num = 0u8;
            let mut xp = 1u8;
            for &coef in omega.iter() {
                num ^= self.gf.mul(coef, xp);
                xp = self.gf.mul(xp, xinv);
            }

            // Formal derivative of lambda evaluated at the root.
            let mut den = 0u8;
            let mut i = 1;
            while i <= l {
                let mut xp = 1u8;
                for _ in 0..i - 1 {
                    xp = self.gf.mul(xp, xinv);
                }
                den ^= self.gf.mul(lambda[i], xp);
                i += 2;
            }
            if den == 0 {
                return None;
            }

            // fcr = 1 leaves no extra position factor.
            let magnitude = self.gf.div(num, den);
            block[positions[e]] ^= magnitude;
        }

        // Reject miscorrections outright.
        let (_, still_bad) = self.syndromes(block);
        if still_bad {
            return None;
        }

        Some(count)
    }
}

impl Default for ReedSolomon {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn encode_block(rs: &ReedSolomon, message: &[u8; 239]) -> [u8; RS_BLOCK_LEN] {
        let mut parity = [0u8; RS_PARITY_LEN];
        rs.encode(message, &mut parity);
        let mut block = [0u8; RS_BLOCK_LEN];
        block[..239].copy_from_slice(message);
        block[239..].copy_from_slice(&parity);
        block
    }

    #[test]
    fn clean_codeword_decodes_with_no_corrections() {
        let rs = ReedSolomon::new();
        let mut rng = SmallRng::seed_from_u64(5);
        let mut message = [0u8; 239];
        for m in message.iter_mut().skip(159) {
            *m = rng.random();
        }
        let mut block = encode_block(&rs, &message);
        assert_eq!(rs.decode(&mut block), Some(0));
    }

    #[test]
    fn corrects_up_to_eight_symbol_errors() {
        let rs = ReedSolomon::new();
        let mut rng = SmallRng::seed_from_u64(17);

        for errors in 1..=8usize {
            let mut message = [0u8; 239];
            // Shortened code: only the trailing 80 message symbols are real.
            for m in message.iter_mut().skip(159) {
                *m = rng.random();
            }
            let clean = encode_block(&rs, &message);

            let mut corrupted = clean;
            let mut hit = std::collections::HashSet::new();
            while hit.len() < errors {
                // Corrupt only transmitted symbols.
                let pos = rng.random_range(159..RS_BLOCK_LEN);
                if hit.insert(pos) {
                    corrupted[pos] ^= rng.random_range(1..=255u8);
                }
            }

            let corrections = rs.decode(&mut corrupted);
            assert_eq!(corrections, Some(errors), "with {errors} errors");
            assert_eq!(corrupted, clean);
        }
    }

    #[test]
    fn parity_is_a_linear_function_of_the_message() {
        let rs = ReedSolomon::new();
        let mut a = [0u8; 239];
        let mut b = [0u8; 239];
        a[200] = 0x5a;
        b[231] = 0xc3;

        let mut pa = [0u8; RS_PARITY_LEN];
        let mut pb = [0u8; RS_PARITY_LEN];
        let mut pab = [0u8; RS_PARITY_LEN];
        rs.encode(&a, &mut pa);
        rs.encode(&b, &mut pb);
        let ab: Vec<u8> = a.iter().zip(&b).map(|(x, y)| x ^ y).collect();
        rs.encode(&ab, &mut pab);

        for i in 0..RS_PARITY_LEN {
            assert_eq!(pab[i], pa[i] ^ pb[i]);
        }
    }
}
