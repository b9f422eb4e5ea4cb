use std::time::Duration;

/// Default deadline (seconds) for spawning a backend and completing its handshake.
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;

/// Default idle period (seconds) after which a streamable HTTP session is closed.
pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECS: u64 = 1800;

/// Deadline for the re-sent request on the schema-bypass path.
pub const BYPASS_TIMEOUT: Duration = Duration::from_secs(30);

/// Keep-alive interval for long-lived SSE streams.
pub const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);
