//! Event-loop readiness watches.
//!
//! A watch is a runtime task that checks a [`ReadinessSource`] once per
//! quantum with a zero timeout and hands any ready condition to the caller's
//! callback. Checking through the source rather than the raw descriptor is
//! what lets buffered TLS data wake a watch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::base::neterror::NetError;
use crate::socket::connection::Connection;
use crate::socket::readiness::{Condition, ReadinessSource};
use crate::socket::registry::{runtime, EngineShared, WatchId};

/// Register `callback` for `cond` on `conn`, replacing any earlier watch.
///
/// The callback receives the ready subset of `cond` (plus `ERROR`/`HANGUP`)
/// and returns `false` to remove the watch.
pub fn add_watch<F>(conn: &mut Connection, cond: Condition, callback: F) -> Result<WatchId, NetError>
where
    F: FnMut(Condition) -> bool + Send + 'static,
{
    let source = conn.readiness_source().ok_or(NetError::NotConnected)?;
    let handle = runtime()?;
    let shared = conn.shared().clone();

    let id = spawn_watch(&handle, &shared, source, cond, callback);
    if let Some(old) = conn.replace_watch(Some(id)) {
        shared.remove_watch(old);
    }
    tracing::debug!(host = %conn.hostname(), watch = id, ?cond, "watch added");
    Ok(id)
}

/// Remove the watch registered on `conn`, if any.
pub fn clear_watch(conn: &mut Connection) -> bool {
    match conn.replace_watch(None) {
        Some(id) => conn.shared().remove_watch(id),
        None => false,
    }
}

fn spawn_watch<F>(
    handle: &tokio::runtime::Handle,
    shared: &Arc<EngineShared>,
    source: ReadinessSource,
    cond: Condition,
    mut callback: F,
) -> WatchId
where
    F: FnMut(Condition) -> bool + Send + 'static,
{
    let id = shared.next_id();
    let alive = Arc::new(AtomicBool::new(true));
    shared.insert_watch(id, alive.clone());

    let quantum = shared.config().watch_quantum();
    let registry = Arc::downgrade(shared);
    let task = handle.spawn(async move {
        let mut ticker = tokio::time::interval(quantum);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !alive.load(Ordering::Acquire) {
                return;
            }
            let fired = match source.poll(cond, Some(Duration::ZERO)) {
                Ok(ready) => ready & (cond | Condition::ERROR | Condition::HANGUP),
                Err(e) => {
                    tracing::debug!(fd = source.fd(), error = %e, "watch poll failed");
                    Condition::ERROR
                }
            };
            if fired.is_empty() {
                continue;
            }
            tracing::trace!(watch = id, ?fired, "watch fired");
            if !alive.load(Ordering::Acquire) || !callback(fired) {
                break;
            }
        }
        alive.store(false, Ordering::Release);
        if let Some(shared) = registry.upgrade() {
            shared.forget_watch(id);
        }
    });
    shared.attach_watch_task(id, task.abort_handle());
    id
}
