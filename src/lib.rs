pub mod common;
pub mod configs;
pub mod gateway;
pub mod protocol;
pub mod voice;
