//! Quit and reload flags driven by OS signals.
//!
//! Handlers only flip flags and wake waiters; every decision is taken by the
//! loop that observes them.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Quit,
    Reload,
}

#[derive(Clone, Default)]
pub struct LifecycleSignals {
    inner: Arc<SignalsInner>,
}

#[derive(Default)]
struct SignalsInner {
    quit: AtomicBool,
    reload: AtomicBool,
    notify: Notify,
    quit_token: CancellationToken,
}

impl LifecycleSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wires SIGINT and SIGTERM to quit and SIGHUP to reload.
    pub fn install(&self) -> Result<JoinHandle<()>> {
        let mut interrupt =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

        let signals = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = interrupt.recv() => {
                        if received.is_none() { break; }
                        tracing::info!(signal = "SIGINT", "quit requested");
                        signals.request_quit();
                    }
                    received = terminate.recv() => {
                        if received.is_none() { break; }
                        tracing::info!(signal = "SIGTERM", "quit requested");
                        signals.request_quit();
                    }
                    received = hangup.recv() => {
                        if received.is_none() { break; }
                        tracing::info!(signal = "SIGHUP", "reload requested");
                        signals.request_reload();
                    }
                }
            }
        }))
    }

    pub fn request_quit(&self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        self.inner.quit_token.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn request_reload(&self) {
        self.inner.reload.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Token cancelled by the first quit request.
    pub fn quit_token(&self) -> CancellationToken {
        self.inner.quit_token.clone()
    }

    pub fn quit_requested(&self) -> bool {
        self.inner.quit.load(Ordering::SeqCst)
    }

    pub fn reload_requested(&self) -> bool {
        self.inner.reload.load(Ordering::SeqCst)
    }

    /// Clears and returns the reload flag.
    pub fn take_reload(&self) -> bool {
        self.inner.reload.swap(false, Ordering::SeqCst)
    }

    /// Pending event, quit first. Does not clear anything.
    pub fn pending(&self) -> Option<LifecycleEvent> {
        if self.quit_requested() {
            Some(LifecycleEvent::Quit)
        } else if self.reload_requested() {
            Some(LifecycleEvent::Reload)
        } else {
            None
        }
    }

    /// Resolves once quit or reload is pending.
    pub async fn wait(&self) -> LifecycleEvent {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(event) = self.pending() {
                return event;
            }
            notified.await;
        }
    }

    /// Sleeps for `delay` unless quit is requested first. Returns `true` when quitting.
    pub async fn sleep_or_quit(&self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.quit_requested() {
                return true;
            }
            tokio::select! {
                _ = &mut sleep => return self.quit_requested(),
                _ = notified => {}
            }
        }
    }
}
