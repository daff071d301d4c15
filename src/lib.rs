//! RTC Gateway Library (lib.rs)
//!
//! WebRTC signaling hub with a built-in STUN/TURN relay and time-limited
//! TURN credentials.

#![warn(clippy::all)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod signaling;
pub mod stun;
pub mod turn;

// Re-export main types
pub use config::{GeneralConfig, ServerConfig, TurnConfig};
pub use credentials::{CredentialIssuer, TurnCredential};
pub use error::{CredentialError, GatewayError, GatewayResult, SignalingError, StunError, TurnError};
pub use http::AppState;
pub use signaling::SignalingHub;
pub use turn::{AllocationManager, TurnServer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error), overridden by `RUST_LOG`
///
/// # Example
/// ```no_run
/// rtc_gateway::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Reduce verbosity of some dependencies
    for directive in ["tokio=warn", "runtime=warn", "hyper=warn", "tower_http=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(filter)
        .init();
}
