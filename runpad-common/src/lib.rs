pub mod encoding;
pub mod protocol;

pub use encoding::*;
pub use protocol::*;
