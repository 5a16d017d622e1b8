//! Request accessor consumed from the routing layer.

use std::net::SocketAddr;
use tokio::sync::OnceCell;

use super::limiter::Decision;

/// Read access to the parts of an inbound request the rate limiter needs.
///
/// The host's routing layer implements this for its own request type. The
/// body must be re-readable: the limiter only borrows it, business logic reads
/// it afterwards.
pub trait RequestAccessor: Send + Sync {
    /// Transport-level peer address, if known.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Header value by case-insensitive name.
    fn header(&self, name: &str) -> Option<&str>;

    /// Route/path parameter captured by the router.
    fn path_param(&self, name: &str) -> Option<&str>;

    /// Raw request body, if any.
    fn body(&self) -> Option<&[u8]>;

    /// Per-request marker holding the rate limit decision once computed.
    fn evaluation(&self) -> &EvaluationMarker;
}

/// Records the decision for one request so it is computed at most once.
#[derive(Debug, Default)]
pub struct EvaluationMarker {
    decision: OnceCell<Decision>,
}

impl EvaluationMarker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The decision, if this request was already evaluated.
    pub fn decision(&self) -> Option<&Decision> {
        self.decision.get()
    }

    /// Whether a decision has been recorded.
    pub fn is_evaluated(&self) -> bool {
        self.decision.initialized()
    }

    pub(crate) fn cell(&self) -> &OnceCell<Decision> {
        &self.decision
    }
}

/// Owned request parts, for hosts without their own request type and for tests.
#[derive(Debug, Default)]
pub struct RequestParts {
    peer_addr: Option<SocketAddr>,
    headers: Vec<(String, String)>,
    path_params: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    evaluation: EvaluationMarker,
}

impl RequestParts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transport peer address.
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Add a header. Later duplicates are ignored on lookup.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add a captured path parameter.
    pub fn with_path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.push((name.into(), value.into()));
        self
    }

    /// Set the body bytes.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A clone is a new request: it carries the same parts but starts unevaluated.
impl Clone for RequestParts {
    fn clone(&self) -> Self {
        Self {
            peer_addr: self.peer_addr,
            headers: self.headers.clone(),
            path_params: self.path_params.clone(),
            body: self.body.clone(),
            evaluation: EvaluationMarker::new(),
        }
    }
}

impl RequestAccessor for RequestParts {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    fn evaluation(&self) -> &EvaluationMarker {
        &self.evaluation
    }
}
