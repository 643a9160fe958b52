pub mod acquire;
pub mod cint16;
pub mod firdecim;
pub mod firdes;
pub mod resamp;
pub mod sync;
