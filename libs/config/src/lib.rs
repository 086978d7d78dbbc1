//! # Streaming Runtime Configuration
//!
//! Configuration loading and logging setup for the streaming runtime.
//!
//! ## Features
//!
//! - **Stream settings**: initial demand, batch sizing, failure grace period
//! - **Endpoint settings**: frame limits, read buffering, deficit weights
//! - **Logging**: `tracing-subscriber` initialisation, plain or JSON
//!
//! Runtime components take the plain settings structs, never the loader, so
//! tests build them directly with `Default` and struct update syntax.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use streaming_config::{init_logging, StreamingConfig};
//!
//! let config = StreamingConfig::load(None, Some("production")).unwrap();
//! init_logging(&config.logging);
//! println!("grace period: {:?}", config.stream.failure_grace_period());
//! ```

pub mod logging;
pub mod settings;

pub use logging::init_logging;
pub use settings::{
    load_config, EndpointSettings, LoggingSettings, StreamSettings, StreamingConfig,
};
