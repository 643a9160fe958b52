/// The two hybrid waveforms an NRSC-5 station can transmit.
/// The mode selects the FFT/cyclic-prefix geometry and the front-end filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Fm,
    Am,
}
