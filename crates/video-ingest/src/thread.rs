//! Thread helpers shared by ingestors, detector workers, and the orchestrator.

use std::{
    io, thread,
    time::{Duration, Instant},
};

use tracing::warn;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Spawn a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

/// Join `handle` if it finishes within `timeout`; otherwise abandon it.
///
/// Returns `None` when the thread was abandoned. A panicked thread is
/// reported as `Some(Err(..))`.
pub fn join_with_timeout<T>(
    handle: thread::JoinHandle<T>,
    timeout: Duration,
) -> Option<thread::Result<T>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
            warn!("thread {name} did not stop within {timeout:?}; abandoning it");
            return None;
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
    Some(handle.join())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_finished_thread() {
        let handle = spawn_thread("quick", || 7).unwrap();
        let joined = join_with_timeout(handle, Duration::from_secs(1));
        assert_eq!(joined.map(|r| r.unwrap()), Some(7));
    }

    #[test]
    fn abandons_stuck_thread() {
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let handle = spawn_thread("stuck", move || {
            let _ = rx.recv();
        })
        .unwrap();
        let start = Instant::now();
        assert!(join_with_timeout(handle, Duration::from_millis(30)).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
        drop(tx);
    }

    #[test]
    fn spawned_thread_carries_name() {
        let handle = spawn_thread("detector-3", || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("detector-3"));
    }
}
