pub mod base;
pub mod logging;
pub mod voice;

pub use base::*;
pub use logging::*;
pub use voice::*;
