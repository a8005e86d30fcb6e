// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-handle notification watcher.
//!
//! A [`NotificationWatcher`] subscribes once to the host for one handle and
//! turns each watched notification kind into a single-assignment
//! [`Completion`] that any number of callers can wait on, either by awaiting
//! it or by blocking with a timeout.
//!
//! Dispatch rules, in priority order:
//! 1. A service disconnect fails every pending completion with `E_ABORT`.
//! 2. A system exit fails a pending start completion with `UNEXPECTED_EXIT`.
//! 3. A watched kind resolves its own completion, failed when the status is.
//!
//! A completion resolves at most once. Later notifications for it are dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::{ComputeError, ComputeResult, HcsError, ResultCode};
use crate::hcs::{HandleKind, Hcs, NotificationCallback};
use crate::types::{CallbackHandle, Handle};

/// Mask for the flag bits the host may set on a notification type.
const NOTIFICATION_FLAGS_MASK: u32 = 0xF000_0000;

/// Notification classes delivered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NotificationKind {
    SystemExited = 0x0000_0001,
    SystemCreated = 0x0000_0002,
    SystemStarted = 0x0000_0003,
    ProcessExited = 0x0001_0000,
    ServiceDisconnected = 0x0100_0000,
}

impl NotificationKind {
    /// Decode a raw notification type, ignoring flag bits.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw & !NOTIFICATION_FLAGS_MASK {
            0x0000_0001 => Some(Self::SystemExited),
            0x0000_0002 => Some(Self::SystemCreated),
            0x0000_0003 => Some(Self::SystemStarted),
            0x0001_0000 => Some(Self::ProcessExited),
            0x0100_0000 => Some(Self::ServiceDisconnected),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::SystemExited => "system-exited",
            Self::SystemCreated => "system-created",
            Self::SystemStarted => "system-started",
            Self::ProcessExited => "process-exited",
            Self::ServiceDisconnected => "service-disconnected",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Successful resolution of a completion: the host status plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationResult {
    pub status: ResultCode,
    pub data: Option<String>,
}

type Outcome = Result<NotificationResult, HcsError>;

/// How a wait on a completion ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Resolved(Outcome),
    /// The owning watcher was disposed before resolution.
    Closed,
}

#[derive(Debug, Default)]
struct Slot {
    outcome: Option<Outcome>,
    closed: bool,
}

/// Single-assignment result cell with fan-out to any number of waiters.
///
/// Blocking waiters park on a condition variable, async waiters on a
/// [`Notify`]; both are woken by the one resolving write.
#[derive(Debug, Default)]
pub struct Completion {
    slot: Mutex<Slot>,
    resolved: Condvar,
    notify: Notify,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_all(&self) {
        self.resolved.notify_all();
        self.notify.notify_waiters();
    }

    /// Resolve the cell. Returns false if it was already resolved or closed.
    pub fn resolve(&self, outcome: Outcome) -> bool {
        {
            let mut slot = self.lock();
            if slot.outcome.is_some() || slot.closed {
                return false;
            }
            slot.outcome = Some(outcome);
        }
        self.wake_all();
        true
    }

    /// Current outcome, if resolved.
    pub fn peek(&self) -> Option<Outcome> {
        self.lock().outcome.clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.lock().outcome.is_some()
    }

    /// Clear a resolved cell so the event can be awaited again.
    fn rearm(&self) {
        let mut slot = self.lock();
        if !slot.closed {
            slot.outcome = None;
        }
    }

    /// Wake every waiter without resolving. Pending waits end as [`Settled::Closed`].
    fn close(&self) {
        self.lock().closed = true;
        self.wake_all();
    }

    /// Block up to `timeout` (forever if `None`, or if the deadline is past
    /// what `Instant` can represent). Returns `None` on timeout; the cell
    /// stays resolvable.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> Option<Settled> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut slot = self.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return Some(Settled::Resolved(outcome.clone()));
            }
            if slot.closed {
                return Some(Settled::Closed);
            }
            match deadline {
                None => {
                    slot = self
                        .resolved
                        .wait(slot)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .resolved
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    slot = guard;
                }
            }
        }
    }

    /// Suspend until resolved or closed.
    pub async fn wait(&self) -> Settled {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a resolve in between is not lost.
            notified.as_mut().enable();
            {
                let slot = self.lock();
                if let Some(outcome) = &slot.outcome {
                    return Settled::Resolved(outcome.clone());
                }
                if slot.closed {
                    return Settled::Closed;
                }
            }
            notified.await;
        }
    }
}

/// State shared between the watcher and the callback held by the host.
struct WatcherShared {
    target: Handle,
    completions: HashMap<NotificationKind, Completion>,
    closed: AtomicBool,
}

impl WatcherShared {
    fn dispatch(&self, kind: NotificationKind, status: ResultCode, data: Option<String>) {
        tracing::trace!(handle = %self.target, kind = %kind, status = %status, "Notification");

        if self.closed.load(Ordering::Acquire) {
            return;
        }

        if kind == NotificationKind::ServiceDisconnected {
            let mut aborted = 0;
            for completion in self.completions.values() {
                if completion.resolve(Err(HcsError::aborted())) {
                    aborted += 1;
                }
            }
            tracing::warn!(
                handle = %self.target,
                aborted,
                "Host service disconnected; failing pending waits"
            );
            return;
        }

        if kind == NotificationKind::SystemExited {
            if let Some(start) = self.completions.get(&NotificationKind::SystemStarted) {
                if start.resolve(Err(HcsError::unexpected_exit())) {
                    tracing::info!(handle = %self.target, "System exited while starting");
                }
            }
        }

        let Some(completion) = self.completions.get(&kind) else {
            return;
        };

        let outcome = if status.failed() {
            Err(HcsError::new(status, data))
        } else {
            Ok(NotificationResult { status, data })
        };

        if !completion.resolve(outcome) {
            tracing::debug!(
                handle = %self.target,
                kind = %kind,
                "Ignoring notification for an already resolved completion"
            );
        }
    }
}

/// Live subscription. The callback is held here as long as the host may call it.
struct Registration {
    token: CallbackHandle,
    _callback: NotificationCallback,
}

/// Correlates host notifications for one handle with awaitable completions.
pub struct NotificationWatcher {
    hcs: Arc<dyn Hcs>,
    scope: HandleKind,
    shared: Arc<WatcherShared>,
    registration: Mutex<Option<Registration>>,
}

impl NotificationWatcher {
    /// Allocate one completion per kind and register a single callback for `target`.
    pub fn new(
        hcs: Arc<dyn Hcs>,
        scope: HandleKind,
        target: Handle,
        kinds: &[NotificationKind],
    ) -> Result<Self, HcsError> {
        let shared = Arc::new(WatcherShared {
            target,
            completions: kinds.iter().map(|k| (*k, Completion::new())).collect(),
            closed: AtomicBool::new(false),
        });

        let dispatch_target = Arc::clone(&shared);
        let callback: NotificationCallback = Arc::new(
            move |kind: NotificationKind, status: ResultCode, data: Option<String>| {
                dispatch_target.dispatch(kind, status, data)
            },
        );

        let token = hcs.register_callback(scope, target, Arc::clone(&callback))?;

        tracing::debug!(
            handle = %target,
            scope = %scope,
            token = %token,
            kinds = ?kinds,
            "Registered notification callback"
        );

        Ok(Self {
            hcs,
            scope,
            shared,
            registration: Mutex::new(Some(Registration {
                token,
                _callback: callback,
            })),
        })
    }

    pub fn target(&self) -> Handle {
        self.shared.target
    }

    pub fn watches(&self, kind: NotificationKind) -> bool {
        self.shared.completions.contains_key(&kind)
    }

    fn completion(&self, kind: NotificationKind) -> ComputeResult<&Completion> {
        self.shared
            .completions
            .get(&kind)
            .ok_or_else(|| ComputeError::InvalidState {
                operation: "watch",
                reason: format!("{} is not watched on handle {}", kind, self.shared.target),
            })
    }

    /// Suspend until `kind` resolves. A disposed watcher yields `E_ABORT`.
    pub async fn watch(&self, kind: NotificationKind) -> ComputeResult<NotificationResult> {
        match self.completion(kind)?.wait().await {
            Settled::Resolved(outcome) => Ok(outcome?),
            Settled::Closed => Err(HcsError::aborted().into()),
        }
    }

    /// Block up to `timeout` for `kind`. Returns whether it resolved in time,
    /// regardless of success. Timing out does not cancel anything.
    pub fn wait(&self, kind: NotificationKind, timeout: Option<Duration>) -> bool {
        match self.completion(kind) {
            Ok(completion) => matches!(
                completion.wait_blocking(timeout),
                Some(Settled::Resolved(_))
            ),
            Err(_) => false,
        }
    }

    /// Block up to `timeout` for `kind` and surface its outcome.
    /// `Ok(None)` means the wait timed out.
    pub fn wait_for(
        &self,
        kind: NotificationKind,
        timeout: Option<Duration>,
    ) -> ComputeResult<Option<NotificationResult>> {
        match self.completion(kind)?.wait_blocking(timeout) {
            Some(Settled::Resolved(outcome)) => Ok(Some(outcome?)),
            Some(Settled::Closed) => Err(HcsError::aborted().into()),
            None => Ok(None),
        }
    }

    /// Outcome of `kind` if it has already resolved.
    pub fn outcome(&self, kind: NotificationKind) -> Option<Result<NotificationResult, HcsError>> {
        self.shared.completions.get(&kind).and_then(Completion::peek)
    }

    /// Make a resolved `kind` awaitable again before re-issuing its request.
    pub fn rearm(&self, kind: NotificationKind) {
        if let Some(completion) = self.shared.completions.get(&kind) {
            completion.rearm();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Unregister from the host exactly once. Later calls do nothing.
    ///
    /// Pending completions are left unresolved; anyone still waiting is woken
    /// and observes an abort.
    pub fn dispose(&self) {
        let registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(registration) = registration else {
            return;
        };

        self.shared.closed.store(true, Ordering::Release);

        if let Err(e) = self.hcs.unregister_callback(self.scope, registration.token) {
            tracing::warn!(
                handle = %self.shared.target,
                token = %registration.token,
                error = %e,
                "Failed to unregister notification callback"
            );
        }
        // The host has returned from unregistration; the callback may go.
        drop(registration);

        for completion in self.shared.completions.values() {
            completion.close();
        }

        tracing::debug!(handle = %self.shared.target, "Notification watcher disposed");
    }
}

impl Drop for NotificationWatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for NotificationWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationWatcher")
            .field("target", &self.shared.target)
            .field("scope", &self.scope)
            .field("kinds", &self.shared.completions.keys().collect::<Vec<_>>())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ok(status: i32) -> Outcome {
        Ok(NotificationResult {
            status: ResultCode(status),
            data: None,
        })
    }

    #[test]
    fn test_kind_from_raw_ignores_flags() {
        assert_eq!(
            NotificationKind::from_raw(0x8000_0001),
            Some(NotificationKind::SystemExited)
        );
        assert_eq!(
            NotificationKind::from_raw(0x0001_0000),
            Some(NotificationKind::ProcessExited)
        );
        assert_eq!(NotificationKind::from_raw(0), None);
        assert_eq!(NotificationKind::ServiceDisconnected.raw(), 0x0100_0000);
    }

    #[test]
    fn test_completion_resolves_once() {
        let completion = Completion::new();
        assert!(completion.resolve(ok(0)));
        assert!(!completion.resolve(Err(HcsError::aborted())));
        assert_eq!(completion.peek(), Some(ok(0)));
    }

    #[test]
    fn test_blocking_wait_times_out_and_stays_resolvable() {
        let completion = Completion::new();
        assert_eq!(completion.wait_blocking(Some(Duration::from_millis(10))), None);
        assert!(completion.resolve(ok(0)));
        assert_eq!(
            completion.wait_blocking(Some(Duration::from_millis(10))),
            Some(Settled::Resolved(ok(0)))
        );
    }

    #[test]
    fn test_fan_out_to_blocked_threads() {
        let completion = Arc::new(Completion::new());
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&completion);
                thread::spawn(move || c.wait_blocking(Some(Duration::from_secs(5))))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        completion.resolve(Err(HcsError::unexpected_exit()));

        for waiter in waiters {
            assert_eq!(
                waiter.join().unwrap(),
                Some(Settled::Resolved(Err(HcsError::unexpected_exit())))
            );
        }
    }

    #[test]
    fn test_close_wakes_waiters_without_resolving() {
        let completion = Arc::new(Completion::new());
        let c = Arc::clone(&completion);
        let waiter = thread::spawn(move || c.wait_blocking(None));

        thread::sleep(Duration::from_millis(20));
        completion.close();

        assert_eq!(waiter.join().unwrap(), Some(Settled::Closed));
        assert!(!completion.is_resolved());
        assert!(!completion.resolve(ok(0)));
    }

    #[tokio::test]
    async fn test_async_wait_resolved_from_foreign_thread() {
        let completion = Arc::new(Completion::new());
        let c = Arc::clone(&completion);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c.resolve(ok(0));
        });

        let settled = tokio::time::timeout(Duration::from_secs(5), completion.wait())
            .await
            .expect("completion never resolved");
        assert_eq!(settled, Settled::Resolved(ok(0)));
    }

    #[test]
    fn test_rearm_clears_outcome() {
        let completion = Completion::new();
        completion.resolve(Err(HcsError::new(ResultCode(-1), None)));
        completion.rearm();
        assert!(!completion.is_resolved());
        assert!(completion.resolve(ok(0)));
    }
}
