//! Triggers for output rotation.
//!
//! Both helpers only call [`ConnectorHandle::cut`]; the connector applies
//! the cut between blocks on its own threads. Run them on a tokio runtime
//! next to the thread that drives `transfer`.
//!
//! ```no_run
//! # async fn demo(handle: stream_connector::ConnectorHandle) -> std::io::Result<()> {
//! use stream_connector::rotation;
//! use tokio::signal::unix::SignalKind;
//!
//! tokio::spawn(rotation::cut_on_signal(handle.clone(), SignalKind::user_defined1())?);
//! tokio::spawn(rotation::cut_every(handle, std::time::Duration::from_secs(3600)));
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::ConnectorHandle;

/// Installs a handler for `kind` and returns a future that requests a cut
/// each time the signal arrives.
///
/// The handler is registered before this returns, so signals sent after
/// the call are not lost even if the future is polled later. Must be called
/// from within a tokio runtime.
///
/// # Errors
///
/// Returns the OS error if the handler cannot be installed.
#[cfg(unix)]
pub fn cut_on_signal(
    handle: ConnectorHandle,
    kind: tokio::signal::unix::SignalKind,
) -> std::io::Result<impl std::future::Future<Output = ()>> {
    let mut signals = tokio::signal::unix::signal(kind)?;
    tracing::info!(signal = kind.as_raw_value(), "rotation signal handler installed");
    Ok(async move {
        while signals.recv().await.is_some() {
            tracing::info!(signal = kind.as_raw_value(), "signal received, cutting");
            handle.cut();
        }
    })
}

/// Requests a cut every `period`, starting one period from now.
///
/// Runs until the task is dropped. A zero period returns immediately.
pub async fn cut_every(handle: ConnectorHandle, period: Duration) {
    if period.is_zero() {
        tracing::warn!("rotation period is zero, timed rotation disabled");
        return;
    }
    let mut ticker = interval_at(Instant::now() + period, period);
    // A stalled runtime should not produce a burst of cuts
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        tracing::debug!(period = ?period, "timed rotation");
        handle.cut();
    }
}
