mod bounds;
mod message;

pub use bounds::*;
pub use message::*;
