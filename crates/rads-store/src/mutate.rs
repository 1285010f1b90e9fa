//! Transactional mutation handlers for inbound configuration requests.
//!
//! Every handler is idempotent over its derived identity and validates the
//! full payload before touching a table. The enclosing batch transaction is
//! not rolled back when a handler fails; the processor wraps each call in a
//! savepoint, so a failing handler must only guarantee that its error is
//! descriptive, not that it left no writes behind.
use sqlx::SqliteConnection;
use std::collections::HashSet;
use uuid::Uuid;

use rads_wire::validate::{is_valid_cidr, validate_domain};
use rads_wire::{
    BackendResolver, HttpRedirectRuleDelete, HttpRedirectRuleUpsert, IngressRuleDelete,
    IngressRuleUpsert, Protocol, Request, TlsCertificateDelete, TlsCertificateUpsert,
};

use crate::model::{
    Backend, BackendRow, HttpRedirectRule, IngressRule, Listener, ListenerRow, TlsCertificate,
    ingress_rule_id, listener_id, redirect_rule_id, sorted, sorted_json, tls_certificate_id,
};
use crate::{StoreError, StoreResult, tls};

const VALID_REDIRECT_STATUS: [i64; 4] = [301, 302, 307, 308];

pub type MutationResult<T> = std::result::Result<T, MutationError>;

/// Handler failure, reported back to the client on the reply subject.
/// `Invalid` and `Conflict` are request problems; the rest are local faults.
#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Malformed(String),
}

impl From<StoreError> for MutationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Db(err) => MutationError::Db(err),
            StoreError::Json(err) => MutationError::Json(err),
            StoreError::Malformed(msg) => MutationError::Malformed(msg),
            StoreError::Migrate(err) => MutationError::Malformed(err.to_string()),
        }
    }
}

fn invalid(msg: impl Into<String>) -> MutationError {
    MutationError::Invalid(msg.into())
}

/// Applies one decoded request to the configuration model. Upserts return
/// the stored entity as JSON for the reply payload; deletes return nothing.
pub async fn apply(
    conn: &mut SqliteConnection,
    request: &Request,
) -> MutationResult<Option<serde_json::Value>> {
    match request {
        Request::TlsCertificateUpsert(r) => upsert_tls_certificate(conn, r).await.map(Some),
        Request::TlsCertificateDelete(r) => delete_tls_certificate(conn, r).await.map(|()| None),
        Request::IngressRuleUpsert(r) => upsert_ingress_rule(conn, r).await.map(Some),
        Request::IngressRuleDelete(r) => delete_ingress_rule(conn, r).await.map(|()| None),
        Request::HttpRedirectRuleUpsert(r) => upsert_redirect_rule(conn, r).await.map(Some),
        Request::HttpRedirectRuleDelete(r) => delete_redirect_rule(conn, r).await.map(|()| None),
    }
}

async fn upsert_tls_certificate(
    conn: &mut SqliteConnection,
    r: &TlsCertificateUpsert,
) -> MutationResult<serde_json::Value> {
    if r.domain.is_empty() {
        return Err(invalid("domain is required"));
    }
    if r.cert.is_empty() || r.key.is_empty() {
        return Err(invalid("cert and key are required"));
    }

    let cert = tls::normalize_pem(&r.cert);
    let key = tls::normalize_pem(&r.key);
    tls::validate_cert_and_key(&cert, &key).map_err(|err| invalid(err.to_string()))?;
    let expires_at = tls::certificate_expiry(&cert).map_err(|err| invalid(err.to_string()))?;

    let record = TlsCertificate {
        id: tls_certificate_id(&r.domain, r.is_wildcard),
        domain: r.domain.clone(),
        is_wildcard: r.is_wildcard,
        cert,
        key,
        expires_at,
    };

    sqlx::query(
        "INSERT INTO tls_certificates (id, domain, is_wildcard, cert, key, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (id) DO UPDATE SET domain = excluded.domain, \
         is_wildcard = excluded.is_wildcard, cert = excluded.cert, key = excluded.key, \
         expires_at = excluded.expires_at",
    )
    .bind(&record.id)
    .bind(&record.domain)
    .bind(record.is_wildcard)
    .bind(&record.cert)
    .bind(&record.key)
    .bind(record.expires_at)
    .execute(conn)
    .await?;

    Ok(serde_json::to_value(&record)?)
}

async fn delete_tls_certificate(
    conn: &mut SqliteConnection,
    r: &TlsCertificateDelete,
) -> MutationResult<()> {
    let id = tls_certificate_id(&r.domain, r.is_wildcard);
    // Deleting an absent certificate is a success.
    sqlx::query("DELETE FROM tls_certificates WHERE id = ?")
        .bind(&id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn upsert_ingress_rule(
    conn: &mut SqliteConnection,
    r: &IngressRuleUpsert,
) -> MutationResult<serde_json::Value> {
    validate_bind(&r.bind_ip, r.port)?;

    let needs_domain = r.protocol == Protocol::Http || r.is_tls;
    if needs_domain {
        if r.domain.is_empty() {
            return Err(invalid("domain is required for HTTP protocol"));
        }
        validate_domain(&r.domain).map_err(|err| invalid(format!("invalid domain: {err}")))?;
    }

    let route_prefix = if r.protocol == Protocol::Http && r.route_prefix.is_empty() {
        "/"
    } else {
        r.route_prefix.as_str()
    };

    if r.backend_hosts.is_empty() {
        return Err(invalid("at least one backend host is required"));
    }
    if r.backend_resolver == BackendResolver::Dns && r.backend_dns_resolver.is_empty() {
        return Err(invalid("backend_dns_resolver is required for DNS resolver"));
    }
    for cidr in &r.allowed_cidrs {
        if !is_valid_cidr(cidr) {
            return Err(invalid(format!("invalid cidr: {cidr} in allowed_cidrs list")));
        }
    }
    for cidr in &r.denied_cidrs {
        if !is_valid_cidr(cidr) {
            return Err(invalid(format!("invalid cidr: {cidr} in denied_cidrs list")));
        }
    }

    let listener = upsert_listener(conn, &r.bind_ip, r.port, r.protocol, r.is_tls).await?;
    let backend = upsert_backend(
        conn,
        r.backend_resolver,
        &r.backend_dns_resolver,
        &r.backend_hosts,
        r.backend_port,
        r.backend_is_tls,
        &r.backend_sni_domain,
    )
    .await?;

    let rule = IngressRule {
        id: ingress_rule_id(r.protocol, &listener.id, &r.domain, route_prefix),
        priority: r.priority,
        listener_id: listener.id,
        backend_id: backend.id,
        domain: r.domain.clone(),
        route_prefix: route_prefix.to_string(),
        allowed_cidrs: sorted(r.allowed_cidrs.clone()),
        denied_cidrs: sorted(r.denied_cidrs.clone()),
    };

    sqlx::query(
        "INSERT INTO ingress_rules \
         (id, priority, listener_id, backend_id, domain, route_prefix, allowed_cidrs, denied_cidrs) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (id) DO UPDATE SET priority = excluded.priority, \
         backend_id = excluded.backend_id, allowed_cidrs = excluded.allowed_cidrs, \
         denied_cidrs = excluded.denied_cidrs",
    )
    .bind(&rule.id)
    .bind(rule.priority)
    .bind(&rule.listener_id)
    .bind(&rule.backend_id)
    .bind(&rule.domain)
    .bind(&rule.route_prefix)
    .bind(sorted_json(&rule.allowed_cidrs)?)
    .bind(sorted_json(&rule.denied_cidrs)?)
    .execute(conn)
    .await?;

    Ok(serde_json::to_value(&rule)?)
}

async fn delete_ingress_rule(
    conn: &mut SqliteConnection,
    r: &IngressRuleDelete,
) -> MutationResult<()> {
    validate_bind(&r.bind_ip, r.port)?;
    if r.protocol == Protocol::Http {
        validate_domain(&r.domain).map_err(|err| invalid(format!("invalid domain: {err}")))?;
    }
    let route_prefix = if r.protocol == Protocol::Http && r.route_prefix.is_empty() {
        "/"
    } else {
        r.route_prefix.as_str()
    };

    let id = ingress_rule_id(
        r.protocol,
        &listener_id(&r.bind_ip, r.port),
        &r.domain,
        route_prefix,
    );
    sqlx::query("DELETE FROM ingress_rules WHERE id = ?")
        .bind(&id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn upsert_redirect_rule(
    conn: &mut SqliteConnection,
    r: &HttpRedirectRuleUpsert,
) -> MutationResult<serde_json::Value> {
    validate_bind(&r.bind_ip, r.port)?;
    validate_domain(&r.domain).map_err(|err| invalid(format!("invalid domain: {err}")))?;

    let route_prefix = if r.route_prefix.is_empty() {
        "/"
    } else {
        r.route_prefix.as_str()
    };
    let status_code = if r.status_code == 0 { 301 } else { r.status_code };
    if !VALID_REDIRECT_STATUS.contains(&status_code) {
        return Err(invalid("status_code must be one of 301, 302, 307, 308"));
    }

    let listener = upsert_listener(conn, &r.bind_ip, r.port, Protocol::Http, r.is_tls).await?;

    let rule = HttpRedirectRule {
        id: redirect_rule_id(&listener.id, &r.domain, route_prefix, r.is_https_redirect),
        priority: r.priority,
        listener_id: listener.id,
        domain: r.domain.clone(),
        path_prefix: route_prefix.to_string(),
        is_https_redirect: r.is_https_redirect,
        scheme_redirect: r.scheme_redirect.clone(),
        host_redirect: r.host_redirect.clone(),
        path_redirect: r.path_redirect.clone(),
        status_code,
    };

    sqlx::query(
        "INSERT INTO http_redirect_rules \
         (id, priority, listener_id, domain, path_prefix, is_https_redirect, \
          scheme_redirect, host_redirect, path_redirect, status_code) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (id) DO UPDATE SET priority = excluded.priority, \
         scheme_redirect = excluded.scheme_redirect, host_redirect = excluded.host_redirect, \
         path_redirect = excluded.path_redirect, status_code = excluded.status_code",
    )
    .bind(&rule.id)
    .bind(rule.priority)
    .bind(&rule.listener_id)
    .bind(&rule.domain)
    .bind(&rule.path_prefix)
    .bind(rule.is_https_redirect)
    .bind(&rule.scheme_redirect)
    .bind(&rule.host_redirect)
    .bind(&rule.path_redirect)
    .bind(rule.status_code)
    .execute(conn)
    .await?;

    Ok(serde_json::to_value(&rule)?)
}

async fn delete_redirect_rule(
    conn: &mut SqliteConnection,
    r: &HttpRedirectRuleDelete,
) -> MutationResult<()> {
    validate_bind(&r.bind_ip, r.port)?;
    validate_domain(&r.domain).map_err(|err| invalid(format!("invalid domain: {err}")))?;
    let route_prefix = if r.route_prefix.is_empty() {
        "/"
    } else {
        r.route_prefix.as_str()
    };

    let id = redirect_rule_id(
        &listener_id(&r.bind_ip, r.port),
        &r.domain,
        route_prefix,
        r.is_https_redirect,
    );
    sqlx::query("DELETE FROM http_redirect_rules WHERE id = ?")
        .bind(&id)
        .execute(conn)
        .await?;
    Ok(())
}

fn validate_bind(bind_ip: &str, port: i64) -> MutationResult<()> {
    if bind_ip != "0.0.0.0" {
        return Err(invalid("currently only 0.0.0.0 is supported for bind_ip"));
    }
    if !(1..=65535).contains(&port) {
        return Err(invalid("port is required and must be between 1 and 65535"));
    }
    Ok(())
}

/// Creates the listener or returns the existing one. Protocol and TLS mode
/// are sticky: a mismatch is a conflict the operator must resolve by
/// removing the rules holding the listener.
async fn upsert_listener(
    conn: &mut SqliteConnection,
    ip: &str,
    port: i64,
    protocol: Protocol,
    is_tls: bool,
) -> MutationResult<Listener> {
    let id = listener_id(ip, port);
    let existing = sqlx::query_as::<_, ListenerRow>(
        "SELECT id, protocol, ip, port, is_tls FROM listeners WHERE id = ?",
    )
    .bind(&id)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = existing {
        let listener = Listener::try_from(row)?;
        if listener.protocol != protocol {
            return Err(MutationError::Conflict(format!(
                "listener registered on {id} is using {} protocol, but currently requesting \
                 the same listener for {protocol} protocol. remove existing ingress / redirect \
                 rules to release the listener",
                listener.protocol
            )));
        }
        if listener.is_tls != is_tls {
            let (have, want) = if listener.is_tls {
                ("TLS", "non-TLS")
            } else {
                ("non-TLS", "TLS")
            };
            return Err(MutationError::Conflict(format!(
                "listener registered on {id} is using {have}, but currently requesting the \
                 same listener for {want}. remove existing ingress / redirect rules to \
                 release the listener"
            )));
        }
        return Ok(listener);
    }

    let listener = Listener {
        id,
        protocol,
        ip: ip.to_string(),
        port,
        is_tls,
    };
    sqlx::query("INSERT INTO listeners (id, protocol, ip, port, is_tls) VALUES (?, ?, ?, ?, ?)")
        .bind(&listener.id)
        .bind(listener.protocol.as_str())
        .bind(&listener.ip)
        .bind(listener.port)
        .bind(listener.is_tls)
        .execute(conn)
        .await?;
    Ok(listener)
}

/// Structural dedup: a backend is identified by its full resolved tuple with
/// hosts in sorted order, so host-order permutations land on one row.
async fn upsert_backend(
    conn: &mut SqliteConnection,
    resolver_type: BackendResolver,
    dns_resolver: &str,
    hosts: &[String],
    port: i64,
    is_tls: bool,
    sni_domain: &str,
) -> MutationResult<Backend> {
    let hosts = sorted(hosts.to_vec());
    let hosts_json = sorted_json(&hosts)?;

    let existing = sqlx::query_as::<_, BackendRow>(
        "SELECT id, resolver_type, dns_resolver, hosts, port, is_tls, sni_domain FROM backends \
         WHERE resolver_type = ? AND dns_resolver = ? AND hosts = ? AND port = ? \
         AND is_tls = ? AND sni_domain = ?",
    )
    .bind(resolver_type.as_str())
    .bind(dns_resolver)
    .bind(&hosts_json)
    .bind(port)
    .bind(is_tls)
    .bind(sni_domain)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = existing {
        return Ok(Backend::try_from(row)?);
    }

    let backend = Backend {
        id: Uuid::new_v4().to_string(),
        resolver_type,
        dns_resolver: dns_resolver.to_string(),
        hosts,
        port,
        is_tls,
        sni_domain: sni_domain.to_string(),
    };
    sqlx::query(
        "INSERT INTO backends (id, resolver_type, dns_resolver, hosts, port, is_tls, sni_domain) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&backend.id)
    .bind(backend.resolver_type.as_str())
    .bind(&backend.dns_resolver)
    .bind(&hosts_json)
    .bind(backend.port)
    .bind(backend.is_tls)
    .bind(&backend.sni_domain)
    .execute(conn)
    .await?;
    Ok(backend)
}

/// End-of-batch sweep: listeners referenced by no rule and backends
/// referenced by no ingress rule are deleted. An empty reference set skips
/// its deletion pass so a transiently empty rule table cannot wipe the
/// whole inventory.
pub async fn collect_garbage(conn: &mut SqliteConnection) -> StoreResult<()> {
    let mut referenced_listeners: HashSet<String> =
        sqlx::query_scalar("SELECT listener_id FROM ingress_rules")
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .collect();
    referenced_listeners.extend(
        sqlx::query_scalar::<_, String>("SELECT listener_id FROM http_redirect_rules")
            .fetch_all(&mut *conn)
            .await?,
    );

    let referenced_backends: HashSet<String> =
        sqlx::query_scalar("SELECT backend_id FROM ingress_rules")
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .collect();

    if !referenced_backends.is_empty() {
        let all: Vec<String> = sqlx::query_scalar("SELECT id FROM backends")
            .fetch_all(&mut *conn)
            .await?;
        for id in all.iter().filter(|id| !referenced_backends.contains(*id)) {
            sqlx::query("DELETE FROM backends WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
    }

    if !referenced_listeners.is_empty() {
        let all: Vec<String> = sqlx::query_scalar("SELECT id FROM listeners")
            .fetch_all(&mut *conn)
            .await?;
        for id in all.iter().filter(|id| !referenced_listeners.contains(*id)) {
            sqlx::query("DELETE FROM listeners WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
    }

    Ok(())
}
