// Entity model for the proxy configuration store, plus the identity
// derivation rules that make every mutation idempotent.
use chrono::{DateTime, Utc};
use rads_wire::{BackendResolver, Protocol};
use serde::Serialize;
use sqlx::FromRow;

use crate::StoreError;

/// One row of the pipeline ledger.
///
/// Immutable once inserted except for the processing bookkeeping fields
/// (`response_payload`, `error_message`, `success`, `processed`, `replied`,
/// `processed_at`). `replied = true` is terminal.
#[derive(Debug, Clone, FromRow)]
pub struct Message {
    pub id: i64,
    pub event: String,
    pub request_id: String,
    pub request_payload: String,
    pub response_payload: String,
    pub error_message: String,
    pub success: bool,
    pub processed: bool,
    pub replied: bool,
    pub requested_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Ledger insert payload built by the ingest worker.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub event: String,
    pub request_id: String,
    pub request_payload: String,
    pub requested_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
}

/// Stored TLS certificate. The private key never leaves the store through
/// JSON serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsCertificate {
    pub id: String,
    pub domain: String,
    pub is_wildcard: bool,
    pub cert: String,
    #[serde(skip_serializing)]
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

/// An `(ip, port)` endpoint a downstream proxy binds. `protocol` and
/// `is_tls` are sticky: once a listener exists they may not change without
/// releasing it first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub id: String,
    pub protocol: Protocol,
    pub ip: String,
    pub port: i64,
    pub is_tls: bool,
}

/// A resolvable upstream. `hosts` is kept sorted so structurally equal
/// backends collapse onto a single row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backend {
    pub id: String,
    pub resolver_type: BackendResolver,
    pub dns_resolver: String,
    pub hosts: Vec<String>,
    pub port: i64,
    pub is_tls: bool,
    pub sni_domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngressRule {
    pub id: String,
    pub priority: i64,
    pub listener_id: String,
    pub backend_id: String,
    pub domain: String,
    pub route_prefix: String,
    pub allowed_cidrs: Vec<String>,
    pub denied_cidrs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct HttpRedirectRule {
    pub id: String,
    pub priority: i64,
    pub listener_id: String,
    pub domain: String,
    pub path_prefix: String,
    pub is_https_redirect: bool,
    pub scheme_redirect: String,
    pub host_redirect: String,
    pub path_redirect: String,
    pub status_code: i64,
}

// Identity derivation. These are the dedup keys the at-least-once pipeline
// leans on; changing any of them invalidates existing stores.

pub fn tls_certificate_id(domain: &str, is_wildcard: bool) -> String {
    if is_wildcard {
        format!("*.{domain}")
    } else {
        domain.to_string()
    }
}

pub fn listener_id(ip: &str, port: i64) -> String {
    format!("{ip}:{port}")
}

pub fn ingress_rule_id(
    protocol: Protocol,
    listener_id: &str,
    domain: &str,
    route_prefix: &str,
) -> String {
    match protocol {
        Protocol::Tcp => format!("tcp:{listener_id}"),
        Protocol::Http => format!("http:{listener_id}:{domain}:{route_prefix}"),
    }
}

pub fn redirect_rule_id(
    listener_id: &str,
    domain: &str,
    route_prefix: &str,
    is_https_redirect: bool,
) -> String {
    let kind = if is_https_redirect { "https" } else { "other" };
    format!("http:{listener_id}:{domain}:{route_prefix}:{kind}")
}

/// Sorts a string list into its stored order.
pub(crate) fn sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items
}

/// JSON text form of a sorted string list, as stored in TEXT columns.
pub(crate) fn sorted_json(items: &[String]) -> serde_json::Result<String> {
    serde_json::to_string(&sorted(items.to_vec()))
}

pub(crate) fn list_from_json(column: &str, text: &str) -> Result<Vec<String>, StoreError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let items: Vec<String> = serde_json::from_str(text)
        .map_err(|err| StoreError::Malformed(format!("{column}: {err}")))?;
    Ok(sorted(items))
}

// DB-facing row shapes. Kept separate from the domain types so enum parsing
// and list decoding stay localized (stored strings are untrusted on read).

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ListenerRow {
    pub id: String,
    pub protocol: String,
    pub ip: String,
    pub port: i64,
    pub is_tls: bool,
}

impl TryFrom<ListenerRow> for Listener {
    type Error = StoreError;

    fn try_from(row: ListenerRow) -> Result<Self, Self::Error> {
        let protocol = row
            .protocol
            .parse::<Protocol>()
            .map_err(|err| StoreError::Malformed(format!("listener {}: {err}", row.id)))?;
        Ok(Listener {
            id: row.id,
            protocol,
            ip: row.ip,
            port: row.port,
            is_tls: row.is_tls,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct BackendRow {
    pub id: String,
    pub resolver_type: String,
    pub dns_resolver: String,
    pub hosts: String,
    pub port: i64,
    pub is_tls: bool,
    pub sni_domain: String,
}

impl TryFrom<BackendRow> for Backend {
    type Error = StoreError;

    fn try_from(row: BackendRow) -> Result<Self, Self::Error> {
        let resolver_type = row
            .resolver_type
            .parse::<BackendResolver>()
            .map_err(|err| StoreError::Malformed(format!("backend {}: {err}", row.id)))?;
        let hosts = list_from_json("backends.hosts", &row.hosts)?;
        Ok(Backend {
            id: row.id,
            resolver_type,
            dns_resolver: row.dns_resolver,
            hosts,
            port: row.port,
            is_tls: row.is_tls,
            sni_domain: row.sni_domain,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct IngressRuleRow {
    pub id: String,
    pub priority: i64,
    pub listener_id: String,
    pub backend_id: String,
    pub domain: String,
    pub route_prefix: String,
    pub allowed_cidrs: String,
    pub denied_cidrs: String,
}

impl TryFrom<IngressRuleRow> for IngressRule {
    type Error = StoreError;

    fn try_from(row: IngressRuleRow) -> Result<Self, Self::Error> {
        let allowed_cidrs = list_from_json("ingress_rules.allowed_cidrs", &row.allowed_cidrs)?;
        let denied_cidrs = list_from_json("ingress_rules.denied_cidrs", &row.denied_cidrs)?;
        Ok(IngressRule {
            id: row.id,
            priority: row.priority,
            listener_id: row.listener_id,
            backend_id: row.backend_id,
            domain: row.domain,
            route_prefix: row.route_prefix,
            allowed_cidrs,
            denied_cidrs,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct TlsCertificateRow {
    pub id: String,
    pub domain: String,
    pub is_wildcard: bool,
    pub cert: String,
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

impl From<TlsCertificateRow> for TlsCertificate {
    fn from(row: TlsCertificateRow) -> Self {
        TlsCertificate {
            id: row.id,
            domain: row.domain,
            is_wildcard: row.is_wildcard,
            cert: row.cert,
            key: row.key,
            expires_at: row.expires_at,
        }
    }
}
