//! Process lifecycle plumbing.
//!
//! [`Teardown`] records a release step for every resource as it comes up and
//! runs them in reverse on the way down. [`FatalSignal`] lets a listener task
//! that dies while serving wake the orchestrator.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ReleaseError;

mod signals;

pub use signals::shutdown_signal;

type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, Vec<ReleaseError>> + Send>;

/// Stack of release steps, unwound last-in first-out.
#[derive(Default)]
pub struct Teardown {
    steps: Vec<(&'static str, ReleaseFn)>,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how to release the resource that just came up.
    pub fn push<F, Fut>(&mut self, label: &'static str, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Vec<ReleaseError>> + Send + 'static,
    {
        self.steps.push((label, Box::new(move || release().boxed())));
    }

    /// Labels of the pending steps, in acquisition order.
    pub fn labels(&self) -> Vec<&'static str> {
        self.steps.iter().map(|(label, _)| *label).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every pending step in reverse order.
    ///
    /// A failing step never prevents the steps after it. Unwinding an empty
    /// stack yields an empty, clean report, so a second call is harmless.
    pub async fn unwind(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        while let Some((label, release)) = self.steps.pop() {
            info!(step = %label, "Releasing");
            let errors = release().await;
            for error in errors {
                warn!(step = %label, error = %error, "Release failed");
                report.errors.push((label, error));
            }
            report.steps.push(label);
        }
        report
    }
}

/// Outcome of an unwind.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Steps that ran, in the order they ran.
    pub steps: Vec<&'static str>,
    /// Release failures, labelled with the step that produced them.
    pub errors: Vec<(&'static str, ReleaseError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One-shot trip wire raised when a listener fails after startup.
///
/// The first trip's reason is kept; later trips only re-cancel.
#[derive(Clone, Default)]
pub struct FatalSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<(&'static str, String)>>>,
}

impl FatalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self, listener: &'static str, message: impl Into<String>) {
        if let Ok(mut reason) = self.reason.lock() {
            if reason.is_none() {
                *reason = Some((listener, message.into()));
            }
        }
        self.token.cancel();
    }

    pub fn is_tripped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once tripped.
    pub async fn tripped(&self) {
        self.token.cancelled().await
    }

    /// Listener and message of the first trip.
    pub fn reason(&self) -> Option<(&'static str, String)> {
        self.reason.lock().ok().and_then(|reason| reason.clone())
    }
}
