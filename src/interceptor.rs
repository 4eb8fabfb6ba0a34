//! Call interceptors.
//!
//! Interceptors run around every [`RpcClient::call`](crate::RpcClient::call)
//! in a fixed order: `before_call` in registration order, then the call,
//! then `after_call` in reverse registration order. Only interceptors whose
//! `before_call` ran get an `after_call`, and they get it even if the caller
//! abandons the call future midway (the outcome is then
//! [`RpcError::Cancelled`]).
//!
//! An interceptor may reject a call from `before_call`; the call is then
//! never published and the rejection is returned to the caller.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{EntitySpan, PredictRequest, Result, RpcError};

/// What an interceptor sees about one call.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Per-client sequence number, starting at 0.
    pub call_seq: u64,
    /// Length of the request input in characters.
    pub input_chars: usize,
    /// Deadline applied to this call.
    pub timeout: Duration,
    pub started_at: Instant,
}

impl CallContext {
    pub(crate) fn new(call_seq: u64, req: &PredictRequest, timeout: Duration) -> Self {
        Self {
            call_seq,
            input_chars: req.input.chars().count(),
            timeout,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Hook invoked around each call.
pub trait Interceptor: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Runs before the request is published. Returning an error rejects the
    /// call.
    fn before_call(&self, _ctx: &CallContext) -> Result<()> {
        Ok(())
    }

    /// Runs once the call has an outcome.
    fn after_call(&self, _ctx: &CallContext, _outcome: &Result<Vec<EntitySpan>>) {}
}

/// Ordered list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run `call` wrapped by every interceptor.
    pub(crate) async fn run<F, Fut>(&self, ctx: &CallContext, call: F) -> Result<Vec<EntitySpan>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<EntitySpan>>>,
    {
        // ---
        let mut guard = AfterGuard {
            entered: &[],
            ctx,
            outcome: None,
        };

        let mut rejection = None;
        for (idx, interceptor) in self.interceptors.iter().enumerate() {
            if let Err(err) = interceptor.before_call(ctx) {
                crate::log_debug!("call {} rejected by {}: {err}", ctx.call_seq, interceptor.name());
                rejection = Some(err);
                break;
            }
            guard.entered = &self.interceptors[..=idx];
        }

        let outcome = match rejection {
            Some(err) => Err(err),
            None => call().await,
        };

        guard.finish(outcome)
    }
}

/// Runs `after_call` for entered interceptors, including on cancellation.
struct AfterGuard<'a> {
    entered: &'a [Arc<dyn Interceptor>],
    ctx: &'a CallContext,
    outcome: Option<Result<Vec<EntitySpan>>>,
}

impl AfterGuard<'_> {
    fn finish(mut self, outcome: Result<Vec<EntitySpan>>) -> Result<Vec<EntitySpan>> {
        self.outcome = Some(outcome);
        self.notify();
        self.entered = &[];
        self.outcome.take().unwrap_or_else(|| Err(RpcError::Cancelled))
    }

    fn notify(&self) {
        let cancelled = Err(RpcError::Cancelled);
        let outcome = self.outcome.as_ref().unwrap_or(&cancelled);
        for interceptor in self.entered.iter().rev() {
            interceptor.after_call(self.ctx, outcome);
        }
    }
}

impl Drop for AfterGuard<'_> {
    fn drop(&mut self) {
        if !self.entered.is_empty() {
            self.notify();
        }
    }
}

/// Logs every call's outcome and processing time.
#[derive(Debug, Default)]
pub struct TimingInterceptor;

impl Interceptor for TimingInterceptor {
    fn name(&self) -> &'static str {
        "timing"
    }

    fn after_call(&self, ctx: &CallContext, outcome: &Result<Vec<EntitySpan>>) {
        let _elapsed = ctx.elapsed();
        match outcome {
            Ok(_spans) => crate::log_info!(
                "call {} ok: {} spans in {:.6}s",
                ctx.call_seq,
                _spans.len(),
                _elapsed.as_secs_f64()
            ),
            Err(_err) => crate::log_warn!(
                "call {} failed after {:.6}s: {_err}",
                ctx.call_seq,
                _elapsed.as_secs_f64()
            ),
        }
    }
}

/// Caps the number of calls in flight through one client.
///
/// The pending registry itself is unbounded; install this when unresponsive
/// workers under sustained load must not grow it without limit.
#[derive(Debug)]
pub struct InFlightLimit {
    limit: usize,
    in_flight: AtomicUsize,
}

impl InFlightLimit {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Interceptor for InFlightLimit {
    fn name(&self) -> &'static str {
        "in-flight-limit"
    }

    fn before_call(&self, _ctx: &CallContext) -> Result<()> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| RpcError::Overloaded { limit: self.limit })
    }

    fn after_call(&self, _ctx: &CallContext, _outcome: &Result<Vec<EntitySpan>>) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
