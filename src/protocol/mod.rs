pub mod events;
pub mod gateway;
pub mod models;
pub mod opcodes;

pub use events::*;
pub use gateway::*;
pub use models::*;
