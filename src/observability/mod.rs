//! Observability: structured logging setup and circuit state notifications.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use integrations_resilience::observability::{LogFormat, LogLevel, LoggingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! LoggingConfig::new()
//!     .with_level(LogLevel::Info)
//!     .with_format(LogFormat::Json)
//!     .init()?;
//! # Ok(())
//! # }
//! ```

mod events;
mod logging;

pub use events::{CircuitStateObserver, CompositeObserver, TracingObserver};
pub use logging::{LogFormat, LogLevel, LoggingConfig};
