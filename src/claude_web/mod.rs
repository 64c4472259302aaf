mod client;
mod merge;
mod session;

pub use client::*;
pub use merge::*;
pub use session::*;
