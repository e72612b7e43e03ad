pub mod config;
pub mod detection;
pub mod entity;
pub mod error;
pub mod kv;

pub use config::DispatcherConfig;
pub use detection::*;
pub use entity::*;
pub use error::*;
pub use kv::*;
