//! Request object backing the script's `XMLHttpRequest`.
//!
//! The script drives a small state machine (`Unsent → Opened → Done`) through
//! the constructor installed by the global graph. Each [`PendingRequest`] is
//! owned here; the script only ever sees snapshots of it.
//!
//! Sending a request spawns the real HTTP call on the Tokio runtime. The
//! result comes back as a [`Completion`] over an unbounded channel, which the
//! sandbox loop applies with [`NetworkShim::complete`] before handing the
//! outcome to the script's handlers. Failures that happen while preparing a
//! request take the same route, so `send` never throws into the script.
//!
//! # Example
//!
//! ```rust,ignore
//! use devid::{NetworkConfig, Sandbox};
//! use std::time::Duration;
//!
//! let sandbox = Sandbox::builder()
//!     .with_network(
//!         NetworkConfig::builder()
//!             .allowed_hosts(vec!["*.portal101.cn"])
//!             .timeout(Duration::from_secs(10))
//!             .build(),
//!     )
//!     .build();
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::{Context, JsArgs, JsNativeError, JsResult, JsString, JsValue};
use tokio::sync::mpsc;

use crate::globals::host_fn;

/// Observable request states. The intermediate states 2 and 3 of the
/// browser model are never reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Created, not yet opened.
    Unsent = 0,
    /// `open` was called.
    Opened = 1,
    /// A response or a failure was recorded.
    Done = 4,
}

/// Connection type selected from the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// `http://`
    Plaintext,
    /// `https://`
    Tls,
}

impl Transport {
    /// Transport for a URL scheme, if supported.
    #[must_use]
    pub fn for_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Self::Plaintext),
            "https" => Some(Self::Tls),
            _ => None,
        }
    }
}

/// Configuration for outbound requests made by the script.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Allowed host patterns (supports wildcards like "*.example.com").
    /// An empty list blocks all hosts. Use `["*"]` to allow all hosts.
    pub allowed_hosts: Vec<String>,
    /// Request timeout.
    pub timeout: Duration,
    /// Maximum response size in bytes.
    pub max_response_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: vec!["*".to_string()],
            timeout: Duration::from_secs(10),
            max_response_bytes: 4 * 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    /// Create a new builder for NetworkConfig.
    #[must_use]
    pub fn builder() -> NetworkConfigBuilder {
        NetworkConfigBuilder::default()
    }

    fn is_host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts
            .iter()
            .any(|pattern| host_matches_pattern(host, pattern))
    }
}

/// Builder for [`NetworkConfig`].
#[derive(Debug, Clone, Default)]
pub struct NetworkConfigBuilder {
    allowed_hosts: Option<Vec<String>>,
    timeout: Option<Duration>,
    max_response_bytes: Option<usize>,
}

impl NetworkConfigBuilder {
    /// Set allowed host patterns.
    #[must_use]
    pub fn allowed_hosts(mut self, hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_hosts = Some(hosts.into_iter().map(Into::into).collect());
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the maximum response size in bytes.
    #[must_use]
    pub fn max_response_bytes(mut self, max_bytes: usize) -> Self {
        self.max_response_bytes = Some(max_bytes);
        self
    }

    /// Build the NetworkConfig.
    #[must_use]
    pub fn build(self) -> NetworkConfig {
        let default = NetworkConfig::default();
        NetworkConfig {
            allowed_hosts: self.allowed_hosts.unwrap_or(default.allowed_hosts),
            timeout: self.timeout.unwrap_or(default.timeout),
            max_response_bytes: self.max_response_bytes.unwrap_or(default.max_response_bytes),
        }
    }
}

/// Why a request produced no response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request was used out of order.
    #[error("request is not in a sendable state")]
    InvalidState,
    /// The URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// The method is not a valid HTTP token.
    #[error("invalid method: {0}")]
    InvalidMethod(String),
    /// Neither `http` nor `https`.
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    /// The host is outside the allowed list.
    #[error("host '{0}' is not in the allowed list")]
    NotPermitted(String),
    /// The HTTP client could not be constructed.
    #[error("HTTP client unavailable: {0}")]
    Client(String),
    /// The request timed out.
    #[error("timed out")]
    TimedOut,
    /// The body exceeded the configured limit.
    #[error("response too large: {actual} bytes (max: {max} bytes)")]
    ResponseTooLarge {
        /// Bytes received or announced.
        actual: u64,
        /// Configured maximum.
        max: usize,
    },
    /// Connection, TLS or protocol failure.
    #[error("HTTP request failed: {0}")]
    Http(String),
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// Final URL after redirects.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// Canonical reason phrase.
    pub status_text: String,
    /// Response headers with lower-cased names.
    pub headers: Vec<(String, String)>,
    /// Body decoded as UTF-8 (lossy).
    pub body: String,
}

/// Outcome of one request, sent back to the sandbox loop.
#[derive(Debug)]
pub struct Completion {
    /// Request id.
    pub id: u32,
    /// Response or failure.
    pub outcome: Result<TransportResponse, TransportError>,
}

/// One network call initiated by the script.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    /// HTTP method as given to `open`.
    pub method: String,
    /// URL as given to `open`.
    pub url: String,
    /// Request headers; a repeated name replaces the earlier value in place.
    pub headers: Vec<(String, String)>,
    /// Request body passed to `send`.
    pub body: Option<String>,
    /// Current state.
    pub state: ReadyState,
    /// Whether `send` was called.
    pub sent: bool,
    /// HTTP status, `0` until done or on failure.
    pub status: u16,
    /// Reason phrase.
    pub status_text: String,
    /// Final URL of the response.
    pub response_url: String,
    /// Response headers.
    pub response_headers: Vec<(String, String)>,
    /// Raw response body.
    pub response_text: String,
    /// Body parsed as JSON; `None` if it is not valid JSON.
    pub parsed_response: Option<serde_json::Value>,
    /// Transport failure message.
    pub error: Option<String>,
}

impl PendingRequest {
    fn new() -> Self {
        Self {
            method: String::new(),
            url: String::new(),
            headers: Vec::new(),
            body: None,
            state: ReadyState::Unsent,
            sent: false,
            status: 0,
            status_text: String::new(),
            response_url: String::new(),
            response_headers: Vec::new(),
            response_text: String::new(),
            parsed_response: None,
            error: None,
        }
    }

    fn set_header(&mut self, name: String, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name, value)),
        }
    }
}

/// Owner of every request made during a run.
#[derive(Debug)]
pub struct NetworkShim {
    config: NetworkConfig,
    client: Result<reqwest::Client, String>,
    requests: HashMap<u32, PendingRequest>,
    next_id: u32,
    completions: mpsc::UnboundedSender<Completion>,
}

impl NetworkShim {
    /// Create a shim that reports completions on `completions`.
    ///
    /// `user_agent` is sent unless the script sets its own header.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        user_agent: &str,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| e.to_string());
        if let Err(e) = &client {
            tracing::warn!(error = %e, "failed to create HTTP client; requests will fail");
        }

        Self {
            config,
            client,
            requests: HashMap::new(),
            next_id: 1,
            completions,
        }
    }

    /// Allocate a new request in the `Unsent` state.
    pub fn create(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.requests.insert(id, PendingRequest::new());
        id
    }

    /// Record method and URL and move to `Opened`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidState`] for unknown or finished
    /// requests, or once the request was sent.
    pub fn open(&mut self, id: u32, method: &str, url: &str) -> Result<(), TransportError> {
        let request = self
            .requests
            .get_mut(&id)
            .filter(|r| r.state != ReadyState::Done && !r.sent)
            .ok_or(TransportError::InvalidState)?;
        request.method = method.to_string();
        request.url = url.to_string();
        request.headers.clear();
        request.state = ReadyState::Opened;
        Ok(())
    }

    /// Record a request header.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidState`] unless the request is opened
    /// and not yet sent.
    pub fn set_header(&mut self, id: u32, name: &str, value: &str) -> Result<(), TransportError> {
        let request = self
            .requests
            .get_mut(&id)
            .filter(|r| r.state == ReadyState::Opened && !r.sent)
            .ok_or(TransportError::InvalidState)?;
        request.set_header(name.to_string(), value.to_string());
        Ok(())
    }

    /// Issue the request. Never fails: problems are reported as a failed
    /// [`Completion`].
    pub fn send(&mut self, id: u32, body: Option<String>) {
        let Some(request) = self.requests.get_mut(&id) else {
            tracing::warn!(id, "send on unknown request");
            return;
        };
        if request.sent {
            tracing::warn!(id, "send called twice; ignoring");
            return;
        }
        request.sent = true;
        request.body = body;

        let prepared = if request.state == ReadyState::Opened {
            prepare(&self.config, &self.client, request)
        } else {
            Err(TransportError::InvalidState)
        };

        match prepared {
            Ok(builder) => {
                let tx = self.completions.clone();
                let max_bytes = self.config.max_response_bytes;
                tokio::spawn(async move {
                    let outcome = execute(builder, max_bytes).await;
                    let _ = tx.send(Completion { id, outcome });
                });
            }
            Err(e) => {
                tracing::debug!(id, error = %e, "request failed before dispatch");
                let _ = self.completions.send(Completion {
                    id,
                    outcome: Err(e),
                });
            }
        }
    }

    /// Apply a completion, moving the request to `Done`.
    ///
    /// Returns `None` if the request is unknown or already done.
    pub fn complete(&mut self, completion: Completion) -> Option<&PendingRequest> {
        let request = self
            .requests
            .get_mut(&completion.id)
            .filter(|r| r.state != ReadyState::Done)?;
        request.state = ReadyState::Done;

        match completion.outcome {
            Ok(response) => {
                tracing::debug!(
                    id = completion.id,
                    status = response.status,
                    bytes = response.body.len(),
                    "request completed"
                );
                // The script may pick `responseType` after `send`, so the
                // body is always parsed. Malformed JSON yields a null response.
                request.parsed_response = serde_json::from_str(&response.body).ok();
                request.status = response.status;
                request.status_text = response.status_text;
                request.response_url = response.url;
                request.response_headers = response.headers;
                request.response_text = response.body;
            }
            Err(e) => {
                tracing::debug!(id = completion.id, error = %e, "request failed");
                request.status = 0;
                request.error = Some(e.to_string());
            }
        }
        Some(request)
    }

    /// Look up a request.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&PendingRequest> {
        self.requests.get(&id)
    }

    /// Forget a finished request once its outcome was handed to the script.
    ///
    /// Requests still in flight are kept. Later calls on a released id
    /// behave as for an unknown request.
    pub fn release(&mut self, id: u32) -> Option<PendingRequest> {
        match self.requests.get(&id) {
            Some(request) if request.state == ReadyState::Done => self.requests.remove(&id),
            _ => None,
        }
    }

    /// Number of requests currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no requests are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Number of requests sent but not yet done.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.requests
            .values()
            .filter(|r| r.sent && r.state != ReadyState::Done)
            .count()
    }
}

/// Validate the request and build the outbound call.
fn prepare(
    config: &NetworkConfig,
    client: &Result<reqwest::Client, String>,
    request: &PendingRequest,
) -> Result<reqwest::RequestBuilder, TransportError> {
    let client = client.as_ref().map_err(|e| TransportError::Client(e.clone()))?;
    let url = reqwest::Url::parse(&request.url)
        .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", request.url)))?;
    let transport = Transport::for_scheme(url.scheme())
        .ok_or_else(|| TransportError::UnsupportedScheme(url.scheme().to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl(format!("{}: missing host", request.url)))?;
    if !config.is_host_allowed(host) {
        return Err(TransportError::NotPermitted(host.to_string()));
    }
    let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| TransportError::InvalidMethod(request.method.clone()))?;

    tracing::info!(url = %url, method = %method, ?transport, "sandbox request");

    let mut builder = client.request(method, url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }
    Ok(builder)
}

/// Perform the call and buffer the whole body.
async fn execute(
    builder: reqwest::RequestBuilder,
    max_bytes: usize,
) -> Result<TransportResponse, TransportError> {
    let response = builder.send().await.map_err(map_reqwest_error)?;

    let status = response.status();
    let url = response.url().to_string();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|val| (k.as_str().to_ascii_lowercase(), val.to_string()))
        })
        .collect();

    if let Some(content_length) = response.content_length()
        && content_length > max_bytes as u64
    {
        return Err(TransportError::ResponseTooLarge {
            actual: content_length,
            max: max_bytes,
        });
    }

    let body = response.bytes().await.map_err(map_reqwest_error)?;
    if body.len() > max_bytes {
        return Err(TransportError::ResponseTooLarge {
            actual: body.len() as u64,
            max: max_bytes,
        });
    }

    Ok(TransportResponse {
        url,
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::TimedOut
    } else {
        TransportError::Http(e.to_string())
    }
}

/// Match `host` against an allow-list entry, ignoring ASCII case.
///
/// `*` alone allows every host. Otherwise each `*` stands for any run of
/// characters: the text before the first `*` must be a prefix of the host,
/// the text after the last `*` a suffix, and the pieces in between must
/// appear in order in what remains.
fn host_matches_pattern(host: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();

    let pieces: Vec<&str> = pattern.split('*').collect();
    let [first, middle @ .., last] = pieces.as_slice() else {
        return host == pattern;
    };
    if host.len() < first.len() + last.len() || !host.starts_with(first) || !host.ends_with(last) {
        return false;
    }

    let mut rest = &host[first.len()..host.len() - last.len()];
    for piece in middle.iter().filter(|p| !p.is_empty()) {
        match rest.find(piece) {
            Some(at) => rest = &rest[at + piece.len()..],
            None => return false,
        }
    }
    true
}

/// Add the request natives to the host binding object handed to the prelude.
pub(crate) fn register_bindings(init: &mut ObjectInitializer<'_>, shim: &Rc<RefCell<NetworkShim>>) {
    let create = {
        let shim = shim.clone();
        host_fn(move |_this, _args, _ctx| Ok(shim.borrow_mut().create().into()))
    };
    let open = {
        let shim = shim.clone();
        host_fn(move |_this, args, ctx| {
            let id = args.get_or_undefined(0).to_u32(ctx)?;
            let method = string_arg(args, 1, ctx)?;
            let url = string_arg(args, 2, ctx)?;
            shim.borrow_mut()
                .open(id, &method, &url)
                .map_err(invalid_state)?;
            Ok(JsValue::undefined())
        })
    };
    let set_header = {
        let shim = shim.clone();
        host_fn(move |_this, args, ctx| {
            let id = args.get_or_undefined(0).to_u32(ctx)?;
            let name = string_arg(args, 1, ctx)?;
            let value = string_arg(args, 2, ctx)?;
            shim.borrow_mut()
                .set_header(id, &name, &value)
                .map_err(invalid_state)?;
            Ok(JsValue::undefined())
        })
    };
    let send = {
        let shim = shim.clone();
        host_fn(move |_this, args, ctx| {
            let id = args.get_or_undefined(0).to_u32(ctx)?;
            let body = match args.get_or_undefined(1) {
                v if v.is_null_or_undefined() => None,
                v => Some(v.to_string(ctx)?.to_std_string_escaped()),
            };
            shim.borrow_mut().send(id, body);
            Ok(JsValue::undefined())
        })
    };

    init.function(create, JsString::from("createRequest"), 0)
        .function(open, JsString::from("open"), 3)
        .function(set_header, JsString::from("setHeader"), 3)
        .function(send, JsString::from("send"), 2);
}

/// Snapshot of a finished request in the shape the prelude expects.
pub(crate) fn completion_value(request: &PendingRequest, ctx: &mut Context) -> JsResult<JsValue> {
    let json = match &request.parsed_response {
        Some(value) => JsValue::from_json(value, ctx)?,
        None => JsValue::null(),
    };
    let error = request
        .error
        .as_deref()
        .map_or(JsValue::null(), |e| JsString::from(e).into());

    let mut headers = ObjectInitializer::new(ctx);
    for (name, value) in &request.response_headers {
        headers.property(
            JsString::from(name.as_str()),
            JsString::from(value.as_str()),
            Attribute::all(),
        );
    }
    let headers = headers.build();

    let result = ObjectInitializer::new(ctx)
        .property(JsString::from("status"), request.status, Attribute::all())
        .property(
            JsString::from("statusText"),
            JsString::from(request.status_text.as_str()),
            Attribute::all(),
        )
        .property(
            JsString::from("url"),
            JsString::from(request.response_url.as_str()),
            Attribute::all(),
        )
        .property(
            JsString::from("text"),
            JsString::from(request.response_text.as_str()),
            Attribute::all(),
        )
        .property(JsString::from("headers"), headers, Attribute::all())
        .property(JsString::from("json"), json, Attribute::all())
        .property(JsString::from("error"), error, Attribute::all())
        .build();
    Ok(result.into())
}

fn string_arg(args: &[JsValue], index: usize, ctx: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(ctx)?
        .to_std_string_escaped())
}

fn invalid_state(e: TransportError) -> boa_engine::JsError {
    JsNativeError::error()
        .with_message(format!("InvalidStateError: {e}"))
        .into()
}
