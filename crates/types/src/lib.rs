pub mod events;
pub mod types;

pub use crossbeam_channel as channel;
pub use events::*;
pub use types::*;
