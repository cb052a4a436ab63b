pub mod buffer;
pub mod config;
#[cfg(feature = "http")]
pub mod lookup;
pub mod simulate;
