//! Sandboxed script execution and the completion poller.

use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use boa_engine::{Context, JsError, JsString, JsValue, Source};
use futures::FutureExt as _;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::error::Error;
use crate::globals::{self, Dispatchers, HostEnvironment};
use crate::network::{self, Completion, NetworkConfig, NetworkShim};
use crate::profile::{EnvironmentProfile, ProfileInputs, RefererLocation};
use crate::store::BrowserState;
use crate::timers::TimerQueue;

/// Default overall deadline for a run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default delay between two probes of the completion accessor.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default dotted path of the completion accessor.
pub const DEFAULT_ACCESSOR: &str = "SMSdk.getDeviceId";

/// Runs one fingerprinting script per call and extracts its device id.
///
/// Every run gets a fresh engine context, a fresh storage and cookie jar, and
/// its own request and timer bookkeeping. Nothing survives between runs.
///
/// The returned futures are not `Send`: drive them on a current-thread
/// runtime or with `block_on`.
#[derive(Debug, Clone)]
pub struct Sandbox {
    profile_inputs: ProfileInputs,
    service: ServiceConfig,
    network: NetworkConfig,
    resource_limits: ResourceLimits,
    timeout: Duration,
    poll_interval: Duration,
    accessor: String,
}

impl Sandbox {
    /// Create a sandbox builder.
    #[must_use]
    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::new()
    }

    /// Overall deadline of a run.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Load the script at `path` and run it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingInput`] if the file cannot be read; nothing
    /// else is set up in that case. Otherwise see [`Sandbox::run_source`].
    pub async fn run_file(&self, path: &Path) -> Result<String, Error> {
        let source = std::fs::read_to_string(path).map_err(|e| Error::MissingInput {
            path: path.to_path_buf(),
            source: (e.kind() != std::io::ErrorKind::NotFound).then_some(e),
        })?;
        tracing::debug!(path = %path.display(), bytes = source.len(), "loaded script");
        self.run_source(&source).await
    }

    /// Inject `source` into a fresh environment and poll for the device id.
    ///
    /// # Errors
    ///
    /// - [`Error::Environment`] if the global scope cannot be built
    /// - [`Error::Injection`] if evaluating the script throws
    /// - [`Error::Fatal`] if a timer or request callback throws, or the host
    ///   panics
    /// - [`Error::Timeout`] if no id appears before the deadline
    pub async fn run_source(&self, source: &str) -> Result<String, Error> {
        let started = Instant::now();
        let result = AssertUnwindSafe(self.run(source))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(Error::Fatal {
                    message: panic_message(payload.as_ref()),
                    trace: None,
                })
            });

        match &result {
            Ok(id) => tracing::info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                id_len = id.len(),
                "device id obtained"
            ),
            Err(e) => tracing::warn!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "run failed"
            ),
        }
        result
    }

    async fn run(&self, source: &str) -> Result<String, Error> {
        let profile = EnvironmentProfile::derive(&self.profile_inputs);
        let location = RefererLocation::parse(self.profile_inputs.referer.as_deref());
        tracing::debug!(
            device_class = ?profile.device_class,
            platform = %profile.platform,
            origin = %location.origin,
            "derived environment profile"
        );

        let (tx, mut completions) = mpsc::unbounded_channel();
        let network = Rc::new(RefCell::new(NetworkShim::new(
            self.network.clone(),
            &profile.user_agent,
            tx,
        )));
        let timers = Rc::new(RefCell::new(TimerQueue::new()));
        let env = HostEnvironment {
            profile,
            location,
            service: self.service.clone(),
            state: BrowserState::new(),
            network: network.clone(),
            timers: timers.clone(),
        };

        let mut context = Context::default();
        self.resource_limits.apply(&mut context);
        let dispatchers = globals::install(&mut context, &env)?;

        // Injection runs synchronously, so the deadline is fixed before it
        // starts and the expiry task only observes it afterwards.
        let deadline_at = tokio::time::Instant::now() + self.timeout;
        let deadline = CancellationToken::new();
        let expiry = tokio::spawn({
            let deadline = deadline.clone();
            async move {
                tokio::time::sleep_until(deadline_at).await;
                deadline.cancel();
            }
        });

        let result = match context.eval(Source::from_bytes(source)) {
            Ok(_) => {
                context.run_jobs();
                tracing::debug!("script injected; polling for device id");
                let mut run = Run {
                    context: &mut context,
                    dispatchers: &dispatchers,
                    network: &network,
                    timers: &timers,
                };
                self.drive(&mut run, &mut completions, &deadline, deadline_at)
                    .await
            }
            Err(err) => {
                let (message, trace) = describe(&err, &mut context);
                Err(Error::Injection { message, trace })
            }
        };
        expiry.abort();
        result
    }

    async fn drive(
        &self,
        run: &mut Run<'_>,
        completions: &mut mpsc::UnboundedReceiver<Completion>,
        deadline: &CancellationToken,
        deadline_at: tokio::time::Instant,
    ) -> Result<String, Error> {
        let mut poll = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_timer = run.timers.borrow().next_deadline();
            if tokio::time::Instant::now() >= deadline_at {
                deadline.cancel();
            }
            tokio::select! {
                biased;
                () = deadline.cancelled() => {
                    return Err(Error::Timeout { timeout: self.timeout });
                }
                Some(completion) = completions.recv() => run.deliver(completion)?,
                () = sleep_until(next_timer) => run.fire_due_timers()?,
                _ = poll.tick() => {
                    if let Some(id) = run.probe(&self.accessor) {
                        return Ok(id);
                    }
                }
            }
        }
    }
}

/// Borrowed state of one run while the poll loop is active.
struct Run<'a> {
    context: &'a mut Context,
    dispatchers: &'a Dispatchers,
    network: &'a Rc<RefCell<NetworkShim>>,
    timers: &'a Rc<RefCell<TimerQueue>>,
}

impl Run<'_> {
    fn deliver(&mut self, completion: Completion) -> Result<(), Error> {
        let id = completion.id;
        let result = {
            let mut shim = self.network.borrow_mut();
            let Some(request) = shim.complete(completion) else {
                tracing::debug!(id, "dropping completion for unknown request");
                return Ok(());
            };
            let value = network::completion_value(request, self.context);
            shim.release(id);
            value
        };
        let result = result.map_err(|e| self.fatal(&e))?;

        self.dispatchers
            .complete_request(id, result, self.context)
            .map_err(|e| self.fatal(&e))?;
        self.context.run_jobs();
        Ok(())
    }

    fn fire_due_timers(&mut self) -> Result<(), Error> {
        let now = Instant::now();
        loop {
            let Some(id) = self.timers.borrow_mut().pop_due(now) else {
                return Ok(());
            };
            tracing::trace!(id, "timer fired");
            self.dispatchers
                .fire_timer(id, self.context)
                .map_err(|e| self.fatal(&e))?;
            self.context.run_jobs();
        }
    }

    /// Call the accessor once. Anything but a non-empty string means "not
    /// ready yet", including exceptions.
    fn probe(&mut self, accessor: &str) -> Option<String> {
        let outcome = call_accessor(accessor, self.context);
        self.context.run_jobs();
        match outcome {
            Ok(id) => id,
            Err(e) => {
                tracing::trace!(error = %e, "accessor threw; not ready");
                None
            }
        }
    }

    fn fatal(&mut self, err: &JsError) -> Error {
        let (message, trace) = describe(err, self.context);
        Error::Fatal { message, trace }
    }
}

fn call_accessor(path: &str, context: &mut Context) -> boa_engine::JsResult<Option<String>> {
    let mut this = JsValue::undefined();
    let mut value: JsValue = context.global_object().into();
    for segment in path.split('.') {
        let next = match value.as_object() {
            Some(object) => object.get(JsString::from(segment), context)?,
            None => return Ok(None),
        };
        this = std::mem::replace(&mut value, next);
    }

    let Some(function) = value.as_callable() else {
        return Ok(None);
    };
    let result = function.call(&this, &[], context)?;
    Ok(result
        .as_string()
        .map(JsString::to_std_string_escaped)
        .filter(|id| !id.is_empty()))
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Render an engine exception as a message and an optional stack trace.
fn describe(err: &JsError, context: &mut Context) -> (String, Option<String>) {
    let trace = err
        .as_opaque()
        .and_then(JsValue::as_object)
        .and_then(|object| object.get(JsString::from("stack"), context).ok())
        .and_then(|stack| stack.as_string().map(JsString::to_std_string_escaped))
        .filter(|stack| !stack.is_empty());
    let message = match err.try_native(context) {
        Ok(native) => native.to_string(),
        Err(_) => err.to_string(),
    };
    (message, trace)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "host panicked".to_string())
}

/// Builder for constructing a [`Sandbox`].
#[derive(Debug, Clone)]
pub struct SandboxBuilder {
    profile_inputs: ProfileInputs,
    service: ServiceConfig,
    network: NetworkConfig,
    resource_limits: ResourceLimits,
    timeout: Duration,
    poll_interval: Duration,
    accessor: String,
}

impl Default for SandboxBuilder {
    fn default() -> Self {
        Self {
            profile_inputs: ProfileInputs::default(),
            service: ServiceConfig::default(),
            network: NetworkConfig::default(),
            resource_limits: ResourceLimits::default(),
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            accessor: DEFAULT_ACCESSOR.to_string(),
        }
    }
}

impl SandboxBuilder {
    /// Create a new sandbox builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the identity, language, referer and platform inputs.
    #[must_use]
    pub fn with_profile_inputs(mut self, inputs: ProfileInputs) -> Self {
        self.profile_inputs = inputs;
        self
    }

    /// Replace the `_smConf` record.
    #[must_use]
    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }

    /// Configure outbound requests.
    #[must_use]
    pub fn with_network(mut self, config: NetworkConfig) -> Self {
        self.network = config;
        self
    }

    /// Set engine resource limits.
    #[must_use]
    pub const fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    /// Set the overall deadline, measured from just before injection.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the delay between probes. Zero is raised to one millisecond.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set the dotted path of the completion accessor, e.g. `SMSdk.getDeviceId`.
    #[must_use]
    pub fn with_accessor(mut self, path: impl Into<String>) -> Self {
        self.accessor = path.into();
        self
    }

    /// Build the sandbox.
    #[must_use]
    pub fn build(self) -> Sandbox {
        Sandbox {
            profile_inputs: self.profile_inputs,
            service: self.service,
            network: self.network,
            resource_limits: self.resource_limits,
            timeout: self.timeout,
            poll_interval: self.poll_interval,
            accessor: self.accessor,
        }
    }
}

/// Engine limits applied to each run. `None` keeps the engine default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum iterations of a single loop.
    pub loop_iteration_limit: Option<u64>,
    /// Maximum call depth.
    pub recursion_limit: Option<usize>,
    /// Maximum VM stack size.
    pub stack_size_limit: Option<usize>,
}

impl ResourceLimits {
    fn apply(&self, context: &mut Context) {
        let limits = context.runtime_limits_mut();
        if let Some(limit) = self.loop_iteration_limit {
            limits.set_loop_iteration_limit(limit);
        }
        if let Some(limit) = self.recursion_limit {
            limits.set_recursion_limit(limit);
        }
        if let Some(limit) = self.stack_size_limit {
            limits.set_stack_size_limit(limit);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn eval(context: &mut Context, code: &str) {
        context.eval(Source::from_bytes(code)).unwrap();
    }

    #[test]
    fn test_call_accessor_resolves_dotted_path() {
        let mut context = Context::default();
        eval(
            &mut context,
            "var SMSdk = { prefix: 'B', getDeviceId: function () { return this.prefix + 'xyz'; } };",
        );
        assert_eq!(
            call_accessor("SMSdk.getDeviceId", &mut context).unwrap(),
            Some("Bxyz".to_string())
        );
    }

    #[test]
    fn test_call_accessor_not_ready() {
        let mut context = Context::default();
        assert_eq!(call_accessor("SMSdk.getDeviceId", &mut context).unwrap(), None);

        eval(&mut context, "var SMSdk = { getDeviceId: function () { return ''; } };");
        assert_eq!(call_accessor("SMSdk.getDeviceId", &mut context).unwrap(), None);

        eval(&mut context, "SMSdk.getDeviceId = function () { return 42; };");
        assert_eq!(call_accessor("SMSdk.getDeviceId", &mut context).unwrap(), None);

        eval(&mut context, "SMSdk.getDeviceId = 'not callable';");
        assert_eq!(call_accessor("SMSdk.getDeviceId", &mut context).unwrap(), None);

        eval(&mut context, "SMSdk.getDeviceId = function () { throw new Error('x'); };");
        assert!(call_accessor("SMSdk.getDeviceId", &mut context).is_err());
    }

    #[test]
    fn test_describe_renders_thrown_values() {
        let mut context = Context::default();
        let err = context
            .eval(Source::from_bytes("throw new TypeError('bad input')"))
            .unwrap_err();
        let (message, _) = describe(&err, &mut context);
        assert!(message.contains("bad input"), "{message}");

        let err = context
            .eval(Source::from_bytes("throw 'plain string'"))
            .unwrap_err();
        let (message, trace) = describe(&err, &mut context);
        assert!(message.contains("plain string"), "{message}");
        assert_eq!(trace, None);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "host panicked");
    }

    #[test]
    fn test_builder_defaults() {
        let sandbox = Sandbox::builder().build();
        assert_eq!(sandbox.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(sandbox.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(sandbox.accessor, DEFAULT_ACCESSOR);
        assert_eq!(sandbox.resource_limits, ResourceLimits::default());

        let sandbox = Sandbox::builder()
            .with_poll_interval(Duration::ZERO)
            .with_accessor("fp.id")
            .build();
        assert_eq!(sandbox.poll_interval, Duration::from_millis(1));
        assert_eq!(sandbox.accessor, "fp.id");
    }
}
