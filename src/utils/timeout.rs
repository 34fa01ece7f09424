//! Default durations and timeout helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ConduitError, Result};

/// Bounded wait applied to every accept attempt
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Tick of the per-connection heartbeat monitor
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Idle time after which a connection is considered dead
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Upper bound used by [`Server::stop_timeout`](crate::transport::server::Server::stop_timeout)
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Await `fut`, replacing an expired deadline with `on_elapsed`.
pub async fn with_timeout_error<F, T>(
    fut: F,
    duration: Duration,
    on_elapsed: ConduitError,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_elapsed),
    }
}
