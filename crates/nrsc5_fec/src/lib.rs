pub mod crc;
pub mod galois;
pub mod interleave;
pub mod reed_solomon;
pub mod scramble;
pub mod viterbi;
