//! Per-request limiting identity.

use std::net::{IpAddr, SocketAddr};

/// Sentinel identity used when a call cannot be attributed to anyone.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Header carrying the client address chain set by proxies.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Who a call is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Known(String),
    /// No usable identity; such calls are never rate limited, so one
    /// unidentified caller cannot exhaust a quota shared by all of them.
    Unknown,
}

impl Identity {
    /// `Known` for a non-blank value, `Unknown` otherwise.
    ///
    /// A caller-supplied value equal to [`UNKNOWN_IDENTITY`] is still
    /// `Known`; only a missing identity escapes limiting.
    pub fn from_value(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            Identity::Unknown
        } else {
            Identity::Known(value)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Identity::Known(value) => value,
            Identity::Unknown => UNKNOWN_IDENTITY,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Identity::Unknown)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request metadata the limiter needs from the hosting framework.
pub trait RequestMeta {
    /// HTTP method, e.g. `GET`.
    fn request_method(&self) -> &str;

    /// Request path without the query string.
    fn request_path(&self) -> &str;

    /// Identifier of the authenticated principal, if authentication ran.
    fn principal_id(&self) -> Option<&str>;

    /// Raw value of the forwarded-address header.
    fn forwarded_for(&self) -> Option<&str>;

    /// Address of the directly connected peer.
    fn peer_ip(&self) -> Option<IpAddr>;
}

/// Authenticated principal, stored in request extensions by the
/// authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

/// Directly connected peer, stored in request extensions by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

impl<B> RequestMeta for http::Request<B> {
    fn request_method(&self) -> &str {
        self.method().as_str()
    }

    fn request_path(&self) -> &str {
        self.uri().path()
    }

    fn principal_id(&self) -> Option<&str> {
        self.extensions().get::<Principal>().map(|p| p.0.as_str())
    }

    fn forwarded_for(&self) -> Option<&str> {
        self.headers()
            .get(FORWARDED_FOR_HEADER)
            .and_then(|value| value.to_str().ok())
    }

    fn peer_ip(&self) -> Option<IpAddr> {
        self.extensions()
            .get::<PeerAddr>()
            .map(|peer| peer.0.ip())
            .or_else(|| self.extensions().get::<SocketAddr>().map(SocketAddr::ip))
    }
}

/// Owned snapshot of request metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub principal: Option<String>,
    pub forwarded_for: Option<String>,
    pub peer: Option<IpAddr>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }

    pub fn with_peer(mut self, peer: IpAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Copy everything the limiter reads out of `meta`.
    pub fn capture<M: RequestMeta + ?Sized>(meta: &M) -> Self {
        Self {
            method: meta.request_method().to_string(),
            path: meta.request_path().to_string(),
            principal: meta.principal_id().map(str::to_string),
            forwarded_for: meta.forwarded_for().map(str::to_string),
            peer: meta.peer_ip(),
        }
    }
}

impl RequestMeta for RequestInfo {
    fn request_method(&self) -> &str {
        &self.method
    }

    fn request_path(&self) -> &str {
        &self.path
    }

    fn principal_id(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    fn forwarded_for(&self) -> Option<&str> {
        self.forwarded_for.as_deref()
    }

    fn peer_ip(&self) -> Option<IpAddr> {
        self.peer
    }
}

/// Identity of the client: the first forwarded address, else the peer
/// address, else [`Identity::Unknown`].
pub fn client_address<M: RequestMeta + ?Sized>(meta: &M) -> Identity {
    let forwarded = meta
        .forwarded_for()
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty());

    match (forwarded, meta.peer_ip()) {
        (Some(first), _) => Identity::from_value(first),
        (None, Some(peer)) => Identity::Known(peer.to_string()),
        (None, None) => Identity::Unknown,
    }
}

/// Identity of the authenticated principal, or [`Identity::Unknown`] when
/// the call is anonymous.
pub fn principal<M: RequestMeta + ?Sized>(meta: &M) -> Identity {
    meta.principal_id()
        .map(Identity::from_value)
        .unwrap_or(Identity::Unknown)
}
