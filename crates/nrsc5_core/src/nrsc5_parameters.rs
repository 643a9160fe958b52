use crate::nrsc5_mode::Mode;

// OFDM geometry for the FM hybrid waveform.
pub const FFT_FM: usize = 2048;
pub const CP_FM: usize = 112;
pub const FFTCP_FM: usize = FFT_FM + CP_FM;

// OFDM geometry for the AM hybrid waveform.
pub const FFT_AM: usize = 256;
pub const CP_AM: usize = 28;
pub const FFTCP_AM: usize = FFT_AM + CP_AM;
pub const CENTER_AM: usize = FFT_AM / 2;
/// Outermost PIDS subcarrier offset searched during the AM integer CFO scan.
pub const PIDS_OUTER_INDEX_AM: usize = 27;

/// OFDM symbols per L1 block.
pub const BLKSZ: usize = 32;
/// Symbols consumed by one acquire pass (two L1 blocks).
pub const ACQUIRE_SYMBOLS: usize = 2 * BLKSZ;
/// Frequency-domain block buffers between acquire and sync.
pub const BUFS: usize = 4;

/// Baseband sample buffer capacity, in complex samples.
pub const INPUT_BUF_LEN: usize = FFTCP_FM * 512;

/// Group delay of the 32-tap acquisition filters.
pub const FILTER_DELAY: usize = 15;
pub const DECIMATION_FACTOR_FM: usize = 2;
pub const DECIMATION_FACTOR_AM: usize = 32;

/// Device sample rate for unsigned 8-bit IQ.
pub const SAMPLE_RATE_CU8: f64 = 1_488_375.0;
/// Baseband sample rate for signed 16-bit IQ (and after FM decimation).
pub const SAMPLE_RATE_CS16: f64 = 744_187.5;

// FM subcarrier layout. References sit every 19th bin within each sideband;
// a partition is 1 reference plus 18 data bins, with one extra reference
// closing the band.
pub const REF_PER_BAND: usize = 11;
pub const DATA_PER_BAND: usize = 180;
pub const PARTITION_WIDTH: usize = 19;
pub const BAND_LENGTH: usize = 10 * PARTITION_WIDTH + 1;
pub const LB_START: usize = FFT_FM / 2 - 546;
pub const UB_START: usize = FFT_FM / 2 + 356;
pub const UB_END: usize = FFT_FM / 2 + 546;

// Logical channel frame lengths, in bits. The `_ENCODED` lengths count the
// punctured soft bits collected from the subcarriers; depuncturing expands
// them by 6/5 (P1, PIDS) or 6/4 (P3) before the rate-1/3 Viterbi.
pub const P1_FRAME_LEN: usize = 146_176;
pub const P1_FRAME_LEN_ENCODED: usize = 365_440;
pub const PIDS_FRAME_LEN: usize = 80;
pub const PIDS_FRAME_LEN_ENCODED: usize = 200;
pub const P3_FRAME_LEN: usize = 4_608;
pub const P3_FRAME_LEN_ENCODED: usize = 9_216;
/// P3 interleaver span; the deinterleaver output is valid once this many
/// soft bits have been buffered.
pub const P3_INTERNAL_LEN: usize = 147_456;

// Descrambled frame lengths seen by the layer-2 parser, in bits.
pub const P1_FRAME_LEN_FM: usize = P1_FRAME_LEN;
pub const P3_FRAME_LEN_FM: usize = P3_FRAME_LEN;
pub const P1_FRAME_LEN_AM: usize = 3_750;
pub const P3_FRAME_LEN_AM: usize = 24_000;

/// Full-P1 PDU sizes in bytes, after PCI extraction and byte packing. A
/// header failure at the start of one of these drops back to coarse sync.
pub const MAX_PDU_LEN: usize = (P1_FRAME_LEN_FM - 24) / 8;
pub const P1_PDU_LEN_AM: usize = (P1_FRAME_LEN_AM - 22) / 8;

/// Sideband partition count selected by the primary service mode indicator.
/// Modes other than the tabulated ones use the hybrid default of 10.
pub fn partitions_per_band(psmi: i32) -> usize {
    match psmi {
        2 => 11,
        3 => 12,
        5 | 6 | 11 => 14,
        _ => 10,
    }
}

/// Per-mode OFDM geometry for the acquisition and tracking stages.
#[derive(Debug, Clone, Copy)]
pub struct WaveformParams {
    pub mode: Mode,
    /// FFT length of one OFDM symbol.
    pub fft: usize,
    /// Cyclic prefix length.
    pub cp: usize,
    /// Full symbol period, FFT plus cyclic prefix.
    pub fftcp: usize,
    /// Decimation applied by the sample front-end ahead of acquisition.
    pub decimation: usize,
}

impl WaveformParams {
    pub fn new(mode: Mode) -> Self {
        let params = match mode {
            Mode::Fm => Self {
                mode,
                fft: FFT_FM,
                cp: CP_FM,
                fftcp: FFTCP_FM,
                decimation: DECIMATION_FACTOR_FM,
            },
            Mode::Am => Self {
                mode,
                fft: FFT_AM,
                cp: CP_AM,
                fftcp: FFTCP_AM,
                decimation: DECIMATION_FACTOR_AM,
            },
        };

        assert!(params.fftcp == params.fft + params.cp, "Symbol period must equal FFT length plus cyclic prefix");
        assert!(params.fft.is_power_of_two(), "FFT length must be a power of two");

        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_lengths_match_code_rates() {
        // Depuncturing [1,1,1,1,1,0] expands five collected bits into six
        // coded bits, which the rate-1/3 decoder folds down by three.
        assert_eq!(P1_FRAME_LEN_ENCODED * 6 / 5, P1_FRAME_LEN * 3);
        assert_eq!(PIDS_FRAME_LEN_ENCODED * 6 / 5, PIDS_FRAME_LEN * 3);
        // P3 uses [1,0,1,1,0,1]: four collected bits per six coded bits.
        assert_eq!(P3_FRAME_LEN_ENCODED * 6 / 4, P3_FRAME_LEN * 3);
    }

    #[test]
    fn band_layout_is_consistent() {
        assert_eq!(UB_END - LB_START, 1092);
        assert_eq!(BAND_LENGTH, REF_PER_BAND + DATA_PER_BAND);
        // Ten partitions of soft bits per sideband feed P1.
        assert_eq!(10 * (PARTITION_WIDTH - 1) * 2 * BLKSZ * 2, 720 * BLKSZ * 2);
    }

    #[test]
    fn psmi_partition_table() {
        assert_eq!(partitions_per_band(2), 11);
        assert_eq!(partitions_per_band(3), 12);
        for psmi in [5, 6, 11] {
            assert_eq!(partitions_per_band(psmi), 14);
        }
        for psmi in [0, 1, 4, 7, 10, 63, -1] {
            assert_eq!(partitions_per_band(psmi), 10);
        }
    }
}
