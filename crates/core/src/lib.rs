pub mod config;
pub mod error;
pub mod flags;

pub use config::{load_dotenv, PoolConfig, RespawnPolicy};
pub use error::ConfigError;
pub use flags::RuntimeFlags;
