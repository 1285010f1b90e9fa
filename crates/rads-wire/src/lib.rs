// Wire contracts for the agent's JetStream request/reply subjects.
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

pub mod validate;

pub const EVENT_TLS_CERTIFICATE_UPSERT: &str = "v1.tls_certificate.upsert";
pub const EVENT_TLS_CERTIFICATE_DELETE: &str = "v1.tls_certificate.delete";
pub const EVENT_INGRESS_RULE_UPSERT: &str = "v1.ingress_rule.upsert";
pub const EVENT_INGRESS_RULE_DELETE: &str = "v1.ingress_rule.delete";
pub const EVENT_HTTP_REDIRECT_RULE_UPSERT: &str = "v1.http_redirect_rule.upsert";
pub const EVENT_HTTP_REDIRECT_RULE_DELETE: &str = "v1.http_redirect_rule.delete";

/// Every event this agent understands, in registry order.
pub const KNOWN_EVENTS: [&str; 6] = [
    EVENT_TLS_CERTIFICATE_UPSERT,
    EVENT_TLS_CERTIFICATE_DELETE,
    EVENT_INGRESS_RULE_UPSERT,
    EVENT_INGRESS_RULE_DELETE,
    EVENT_HTTP_REDIRECT_RULE_UPSERT,
    EVENT_HTTP_REDIRECT_RULE_DELETE,
];

// Subject layout: proxy.<agent>.request.<event> inbound,
// proxy.<agent>.reply.<event> outbound. The durable consumer name is
// derived from the agent id so broker-side cursor state survives restarts.

pub fn request_filter(agent_id: &str) -> String {
    format!("proxy.{agent_id}.request.>")
}

pub fn request_prefix(agent_id: &str) -> String {
    format!("proxy.{agent_id}.request.")
}

pub fn reply_subject(agent_id: &str, event: &str) -> String {
    format!("proxy.{agent_id}.reply.{event}")
}

pub fn durable_name(agent_id: &str) -> String {
    format!("proxy-{agent_id}")
}

/// Strips the request prefix from a delivered subject, yielding the event
/// name. `None` means the subject does not belong to this agent's request
/// namespace and the message must be dropped.
pub fn event_from_subject<'a>(subject: &'a str, prefix: &str) -> Option<&'a str> {
    subject
        .strip_prefix(prefix)
        .filter(|event| !event.is_empty())
}

pub type Result<T> = std::result::Result<T, DecodeError>;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("malformed {event} payload: {source}")]
    Payload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing or empty request_id")]
    MissingRequestId,
    #[error("missing or zero requested_at")]
    MissingRequestedAt,
}

/// Listener protocol. Serialized lowercase on the wire and in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Tcp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// How a backend resolves its upstream hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendResolver {
    #[default]
    Static,
    Dns,
}

impl BackendResolver {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendResolver::Static => "static",
            BackendResolver::Dns => "dns",
        }
    }
}

impl fmt::Display for BackendResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendResolver {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "static" => Ok(BackendResolver::Static),
            "dns" => Ok(BackendResolver::Dns),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Returned when a stored enum string no longer matches a known variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

/// Fields every request payload carries. `requested_at` is client-supplied
/// and required; absent or null reads as `None` and is rejected at decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsCertificateUpsert {
    #[serde(flatten)]
    pub meta: RequestMeta,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub is_wildcard: bool,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsCertificateDelete {
    #[serde(flatten)]
    pub meta: RequestMeta,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub is_wildcard: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressRuleUpsert {
    #[serde(flatten)]
    pub meta: RequestMeta,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub bind_ip: String,
    #[serde(default)]
    pub port: i64,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub is_tls: bool,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub route_prefix: String,
    #[serde(default)]
    pub allowed_cidrs: Vec<String>,
    #[serde(default)]
    pub denied_cidrs: Vec<String>,
    #[serde(default)]
    pub backend_resolver: BackendResolver,
    #[serde(default)]
    pub backend_dns_resolver: String,
    #[serde(default)]
    pub backend_hosts: Vec<String>,
    #[serde(default)]
    pub backend_port: i64,
    #[serde(default)]
    pub backend_is_tls: bool,
    #[serde(default)]
    pub backend_sni_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressRuleDelete {
    #[serde(flatten)]
    pub meta: RequestMeta,
    #[serde(default)]
    pub bind_ip: String,
    #[serde(default)]
    pub port: i64,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub route_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRedirectRuleUpsert {
    #[serde(flatten)]
    pub meta: RequestMeta,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub bind_ip: String,
    #[serde(default)]
    pub port: i64,
    #[serde(default)]
    pub is_tls: bool,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub route_prefix: String,
    #[serde(default)]
    pub is_https_redirect: bool,
    #[serde(default)]
    pub scheme_redirect: String,
    #[serde(default)]
    pub host_redirect: String,
    #[serde(default)]
    pub path_redirect: String,
    #[serde(default)]
    pub status_code: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRedirectRuleDelete {
    #[serde(flatten)]
    pub meta: RequestMeta,
    #[serde(default)]
    pub bind_ip: String,
    #[serde(default)]
    pub port: i64,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub route_prefix: String,
    #[serde(default)]
    pub is_https_redirect: bool,
    #[serde(default)]
    pub scheme_redirect: String,
    #[serde(default)]
    pub host_redirect: String,
    #[serde(default)]
    pub path_redirect: String,
    #[serde(default)]
    pub status_code: i64,
}

/// A fully decoded inbound request, one variant per registered event.
///
/// ```
/// use rads_wire::{Request, EVENT_TLS_CERTIFICATE_DELETE};
///
/// let payload = br#"{"request_id":"r1","requested_at":"2026-01-01T00:00:00Z","domain":"example.com"}"#;
/// let request = Request::decode(EVENT_TLS_CERTIFICATE_DELETE, payload).expect("decode");
/// assert_eq!(request.event(), EVENT_TLS_CERTIFICATE_DELETE);
/// assert_eq!(request.meta().request_id, "r1");
/// ```
#[derive(Debug, Clone)]
pub enum Request {
    TlsCertificateUpsert(TlsCertificateUpsert),
    TlsCertificateDelete(TlsCertificateDelete),
    IngressRuleUpsert(IngressRuleUpsert),
    IngressRuleDelete(IngressRuleDelete),
    HttpRedirectRuleUpsert(HttpRedirectRuleUpsert),
    HttpRedirectRuleDelete(HttpRedirectRuleDelete),
}

fn decode_payload<T: DeserializeOwned>(event: &'static str, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|source| DecodeError::Payload { event, source })
}

impl Request {
    /// Decodes a payload for the given event name.
    ///
    /// An event name outside the registry is an `UnknownEvent` miss, not a
    /// parse failure; callers treat the two differently. A decoded payload
    /// with an empty `request_id` or an absent `requested_at` is rejected
    /// here so the ingest path never persists it.
    pub fn decode(event: &str, payload: &[u8]) -> Result<Self> {
        let request = match event {
            EVENT_TLS_CERTIFICATE_UPSERT => {
                Request::TlsCertificateUpsert(decode_payload(EVENT_TLS_CERTIFICATE_UPSERT, payload)?)
            }
            EVENT_TLS_CERTIFICATE_DELETE => {
                Request::TlsCertificateDelete(decode_payload(EVENT_TLS_CERTIFICATE_DELETE, payload)?)
            }
            EVENT_INGRESS_RULE_UPSERT => {
                Request::IngressRuleUpsert(decode_payload(EVENT_INGRESS_RULE_UPSERT, payload)?)
            }
            EVENT_INGRESS_RULE_DELETE => {
                Request::IngressRuleDelete(decode_payload(EVENT_INGRESS_RULE_DELETE, payload)?)
            }
            EVENT_HTTP_REDIRECT_RULE_UPSERT => Request::HttpRedirectRuleUpsert(decode_payload(
                EVENT_HTTP_REDIRECT_RULE_UPSERT,
                payload,
            )?),
            EVENT_HTTP_REDIRECT_RULE_DELETE => Request::HttpRedirectRuleDelete(decode_payload(
                EVENT_HTTP_REDIRECT_RULE_DELETE,
                payload,
            )?),
            _ => return Err(DecodeError::UnknownEvent(event.to_string())),
        };

        let meta = request.meta();
        if meta.request_id.is_empty() {
            return Err(DecodeError::MissingRequestId);
        }
        if meta.requested_at.is_none() {
            return Err(DecodeError::MissingRequestedAt);
        }
        Ok(request)
    }

    pub fn event(&self) -> &'static str {
        match self {
            Request::TlsCertificateUpsert(_) => EVENT_TLS_CERTIFICATE_UPSERT,
            Request::TlsCertificateDelete(_) => EVENT_TLS_CERTIFICATE_DELETE,
            Request::IngressRuleUpsert(_) => EVENT_INGRESS_RULE_UPSERT,
            Request::IngressRuleDelete(_) => EVENT_INGRESS_RULE_DELETE,
            Request::HttpRedirectRuleUpsert(_) => EVENT_HTTP_REDIRECT_RULE_UPSERT,
            Request::HttpRedirectRuleDelete(_) => EVENT_HTTP_REDIRECT_RULE_DELETE,
        }
    }

    pub fn meta(&self) -> &RequestMeta {
        match self {
            Request::TlsCertificateUpsert(r) => &r.meta,
            Request::TlsCertificateDelete(r) => &r.meta,
            Request::IngressRuleUpsert(r) => &r.meta,
            Request::IngressRuleDelete(r) => &r.meta,
            Request::HttpRedirectRuleUpsert(r) => &r.meta,
            Request::HttpRedirectRuleDelete(r) => &r.meta,
        }
    }

    /// Re-serializes the decoded payload. The ledger stores this canonical
    /// form rather than the raw delivery bytes, so absent fields are pinned
    /// to their defaults before processing.
    pub fn canonical_json(&self) -> serde_json::Result<String> {
        match self {
            Request::TlsCertificateUpsert(r) => serde_json::to_string(r),
            Request::TlsCertificateDelete(r) => serde_json::to_string(r),
            Request::IngressRuleUpsert(r) => serde_json::to_string(r),
            Request::IngressRuleDelete(r) => serde_json::to_string(r),
            Request::HttpRedirectRuleUpsert(r) => serde_json::to_string(r),
            Request::HttpRedirectRuleDelete(r) => serde_json::to_string(r),
        }
    }
}

/// Outbound reply envelope, published on `proxy.<agent>.reply.<event>`.
///
/// `data` passes the stored response payload through as raw JSON; it is
/// never re-parsed on the way out.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub request_id: String,
    pub requested_at: DateTime<Utc>,
    pub success: bool,
    pub data: Box<RawValue>,
    pub error_message: String,
    pub processed_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
}

impl ReplyEnvelope {
    // Replies are published indented; they are low-volume and read by humans
    // during operations as often as by machines.
    pub fn to_pretty_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}
