pub mod error;
pub mod events;
pub mod frame;
pub mod input;
pub mod output;
pub mod pids;
pub mod rtltcp;
pub mod session;
pub mod text;

pub use error::Error;
pub use events::{Event, OwnedEvent, SisInfo};
pub use session::Receiver;
