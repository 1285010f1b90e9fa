// Mutation handler behavior over a real on-disk store: identity-keyed
// idempotence, listener stickiness, backend dedup, and the orphan sweep.
use chrono::{TimeZone, Utc};
use rads_store::{MutationError, Store, apply, collect_garbage};
use rads_wire::{
    BackendResolver, HttpRedirectRuleDelete, HttpRedirectRuleUpsert, IngressRuleDelete,
    IngressRuleUpsert, Protocol, Request, RequestMeta, TlsCertificateDelete, TlsCertificateUpsert,
};

async fn open_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path().join("agent.db"))
        .await
        .expect("open store");
    (dir, store)
}

fn meta(request_id: &str) -> RequestMeta {
    RequestMeta {
        request_id: request_id.to_string(),
        requested_at: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
    }
}

// Runs a request the way the processor does: apply inside a transaction,
// sweep orphans, commit. Handler errors roll the transaction back.
async fn apply_committed(
    store: &Store,
    request: &Request,
) -> Result<Option<serde_json::Value>, MutationError> {
    let mut tx = store.begin().await.expect("begin");
    let result = apply(&mut tx, request).await;
    match &result {
        Ok(_) => {
            collect_garbage(&mut tx).await.expect("gc");
            tx.commit().await.expect("commit");
        }
        Err(_) => tx.rollback().await.expect("rollback"),
    }
    result
}

fn ingress_upsert(request_id: &str, port: i64, hosts: &[&str]) -> IngressRuleUpsert {
    IngressRuleUpsert {
        meta: meta(request_id),
        priority: 10,
        bind_ip: "0.0.0.0".to_string(),
        port,
        protocol: Protocol::Http,
        is_tls: false,
        domain: "example.com".to_string(),
        route_prefix: String::new(),
        allowed_cidrs: vec![],
        denied_cidrs: vec![],
        backend_resolver: BackendResolver::Static,
        backend_dns_resolver: String::new(),
        backend_hosts: hosts.iter().map(|h| h.to_string()).collect(),
        backend_port: 8080,
        backend_is_tls: false,
        backend_sni_domain: String::new(),
    }
}

#[tokio::test]
async fn ingress_upsert_creates_listener_backend_and_rule() {
    let (_dir, store) = open_store().await;
    let request = Request::IngressRuleUpsert(ingress_upsert("r1", 80, &["10.0.0.1"]));

    let reply = apply_committed(&store, &request)
        .await
        .expect("apply")
        .expect("upsert returns the rule");
    assert_eq!(reply["id"], serde_json::json!("http:0.0.0.0:80:example.com:/"));
    assert_eq!(reply["route_prefix"], serde_json::json!("/"));

    let snapshot = store.config_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.listeners.len(), 1);
    assert_eq!(snapshot.backends.len(), 1);
    assert_eq!(snapshot.ingress_rules.len(), 1);
    assert_eq!(snapshot.listeners[0].id, "0.0.0.0:80");
    assert_eq!(snapshot.ingress_rules[0].backend_id, snapshot.backends[0].id);
}

#[tokio::test]
async fn ingress_upsert_is_idempotent() {
    let (_dir, store) = open_store().await;
    let request = Request::IngressRuleUpsert(ingress_upsert("r1", 80, &["10.0.0.1"]));

    let first = apply_committed(&store, &request).await.expect("first");
    let second = apply_committed(&store, &request).await.expect("second");
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );

    let snapshot = store.config_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.listeners.len(), 1);
    assert_eq!(snapshot.backends.len(), 1);
    assert_eq!(snapshot.ingress_rules.len(), 1);
}

#[tokio::test]
async fn listener_tls_mode_is_sticky() {
    let (_dir, store) = open_store().await;
    let mut tls_rule = ingress_upsert("r1", 443, &["10.0.0.1"]);
    tls_rule.is_tls = true;
    apply_committed(&store, &Request::IngressRuleUpsert(tls_rule))
        .await
        .expect("tls listener");

    let mut plain_rule = ingress_upsert("r2", 443, &["10.0.0.2"]);
    plain_rule.domain = "other.example.com".to_string();
    let err = apply_committed(&store, &Request::IngressRuleUpsert(plain_rule))
        .await
        .expect_err("tls mismatch");
    assert!(matches!(err, MutationError::Conflict(_)));
    assert!(err.to_string().contains("using TLS"));

    // The conflicting request must not have left anything behind.
    let snapshot = store.config_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.listeners.len(), 1);
    assert_eq!(snapshot.backends.len(), 1);
    assert_eq!(snapshot.ingress_rules.len(), 1);
}

#[tokio::test]
async fn listener_protocol_is_sticky() {
    let (_dir, store) = open_store().await;
    apply_committed(
        &store,
        &Request::IngressRuleUpsert(ingress_upsert("r1", 5432, &["10.0.0.1"])),
    )
    .await
    .expect("http listener");

    let mut tcp_rule = ingress_upsert("r2", 5432, &["10.0.0.1"]);
    tcp_rule.protocol = Protocol::Tcp;
    tcp_rule.domain = String::new();
    let err = apply_committed(&store, &Request::IngressRuleUpsert(tcp_rule))
        .await
        .expect_err("protocol mismatch");
    assert!(matches!(err, MutationError::Conflict(_)));
    assert!(err.to_string().contains("http protocol"));
}

#[tokio::test]
async fn backends_dedup_on_sorted_hosts() {
    let (_dir, store) = open_store().await;
    apply_committed(
        &store,
        &Request::IngressRuleUpsert(ingress_upsert("r1", 80, &["b", "a"])),
    )
    .await
    .expect("first");

    let mut second = ingress_upsert("r2", 81, &["a", "b"]);
    second.domain = "example.com".to_string();
    apply_committed(&store, &Request::IngressRuleUpsert(second))
        .await
        .expect("second");

    let snapshot = store.config_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.backends.len(), 1);
    assert_eq!(snapshot.backends[0].hosts, vec!["a", "b"]);
    assert_eq!(snapshot.ingress_rules.len(), 2);
    assert!(
        snapshot
            .ingress_rules
            .iter()
            .all(|rule| rule.backend_id == snapshot.backends[0].id)
    );
}

#[tokio::test]
async fn orphan_sweep_removes_released_listener_and_backend() {
    let (_dir, store) = open_store().await;
    // A second rule keeps the reference sets non-empty across the delete.
    apply_committed(
        &store,
        &Request::IngressRuleUpsert(ingress_upsert("keep", 81, &["10.0.0.9"])),
    )
    .await
    .expect("keeper rule");
    apply_committed(
        &store,
        &Request::IngressRuleUpsert(ingress_upsert("r1", 80, &["10.0.0.1"])),
    )
    .await
    .expect("target rule");

    let delete = Request::IngressRuleDelete(IngressRuleDelete {
        meta: meta("r2"),
        bind_ip: "0.0.0.0".to_string(),
        port: 80,
        protocol: Protocol::Http,
        domain: "example.com".to_string(),
        route_prefix: "/".to_string(),
    });
    apply_committed(&store, &delete).await.expect("delete");

    let snapshot = store.config_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.ingress_rules.len(), 1);
    assert_eq!(snapshot.listeners.len(), 1);
    assert_eq!(snapshot.listeners[0].id, "0.0.0.0:81");
    assert_eq!(snapshot.backends.len(), 1);
    assert_eq!(snapshot.backends[0].hosts, vec!["10.0.0.9"]);
}

#[tokio::test]
async fn orphan_sweep_skips_when_nothing_is_referenced() {
    let (_dir, store) = open_store().await;
    apply_committed(
        &store,
        &Request::IngressRuleUpsert(ingress_upsert("r1", 80, &["10.0.0.1"])),
    )
    .await
    .expect("rule");

    // Deleting the only rule empties both reference sets; the sweep must
    // leave the now-unreferenced rows alone rather than wipe the tables.
    let delete = Request::IngressRuleDelete(IngressRuleDelete {
        meta: meta("r2"),
        bind_ip: "0.0.0.0".to_string(),
        port: 80,
        protocol: Protocol::Http,
        domain: "example.com".to_string(),
        route_prefix: "/".to_string(),
    });
    apply_committed(&store, &delete).await.expect("delete");

    let snapshot = store.config_snapshot().await.expect("snapshot");
    assert!(snapshot.ingress_rules.is_empty());
    assert_eq!(snapshot.listeners.len(), 1);
    assert_eq!(snapshot.backends.len(), 1);
}

#[tokio::test]
async fn ingress_delete_is_idempotent() {
    let (_dir, store) = open_store().await;
    let delete = Request::IngressRuleDelete(IngressRuleDelete {
        meta: meta("r1"),
        bind_ip: "0.0.0.0".to_string(),
        port: 80,
        protocol: Protocol::Http,
        domain: "example.com".to_string(),
        route_prefix: "/".to_string(),
    });
    assert!(apply_committed(&store, &delete).await.expect("first").is_none());
    assert!(apply_committed(&store, &delete).await.expect("second").is_none());
}

#[tokio::test]
async fn ingress_upsert_validates_payload() {
    let (_dir, store) = open_store().await;

    let mut bad_bind = ingress_upsert("r1", 80, &["10.0.0.1"]);
    bad_bind.bind_ip = "127.0.0.1".to_string();
    let err = apply_committed(&store, &Request::IngressRuleUpsert(bad_bind))
        .await
        .expect_err("bind rejected");
    assert!(err.to_string().contains("0.0.0.0"));

    let bad_port = ingress_upsert("r2", 70000, &["10.0.0.1"]);
    let err = apply_committed(&store, &Request::IngressRuleUpsert(bad_port))
        .await
        .expect_err("port rejected");
    assert!(err.to_string().contains("between 1 and 65535"));

    let no_hosts = ingress_upsert("r3", 80, &[]);
    let err = apply_committed(&store, &Request::IngressRuleUpsert(no_hosts))
        .await
        .expect_err("hosts required");
    assert!(err.to_string().contains("backend host"));

    let mut bad_cidr = ingress_upsert("r4", 80, &["10.0.0.1"]);
    bad_cidr.allowed_cidrs = vec!["10.0.0.0".to_string()];
    let err = apply_committed(&store, &Request::IngressRuleUpsert(bad_cidr))
        .await
        .expect_err("cidr rejected");
    assert!(err.to_string().contains("allowed_cidrs"));

    let mut dns_no_resolver = ingress_upsert("r5", 80, &["10.0.0.1"]);
    dns_no_resolver.backend_resolver = BackendResolver::Dns;
    let err = apply_committed(&store, &Request::IngressRuleUpsert(dns_no_resolver))
        .await
        .expect_err("resolver required");
    assert!(err.to_string().contains("backend_dns_resolver"));

    let mut bad_domain = ingress_upsert("r6", 80, &["10.0.0.1"]);
    bad_domain.domain = "foo_bar.example.com".to_string();
    let err = apply_committed(&store, &Request::IngressRuleUpsert(bad_domain))
        .await
        .expect_err("domain rejected");
    assert!(err.to_string().contains("invalid domain"));

    // Nothing committed along the way.
    let snapshot = store.config_snapshot().await.expect("snapshot");
    assert!(snapshot.listeners.is_empty());
    assert!(snapshot.backends.is_empty());
    assert!(snapshot.ingress_rules.is_empty());
}

fn redirect_upsert(request_id: &str) -> HttpRedirectRuleUpsert {
    HttpRedirectRuleUpsert {
        meta: meta(request_id),
        priority: 0,
        bind_ip: "0.0.0.0".to_string(),
        port: 80,
        is_tls: false,
        domain: "example.com".to_string(),
        route_prefix: String::new(),
        is_https_redirect: true,
        scheme_redirect: "https".to_string(),
        host_redirect: String::new(),
        path_redirect: String::new(),
        status_code: 0,
    }
}

#[tokio::test]
async fn redirect_upsert_defaults_and_upserts() {
    let (_dir, store) = open_store().await;
    let reply = apply_committed(&store, &Request::HttpRedirectRuleUpsert(redirect_upsert("r1")))
        .await
        .expect("apply")
        .expect("reply");
    assert_eq!(
        reply["id"],
        serde_json::json!("http:0.0.0.0:80:example.com:/:https")
    );
    assert_eq!(reply["path_prefix"], serde_json::json!("/"));
    assert_eq!(reply["status_code"], serde_json::json!(301));

    // Same identity, new target: the later request wins.
    let mut updated = redirect_upsert("r2");
    updated.status_code = 308;
    updated.host_redirect = "www.example.com".to_string();
    apply_committed(&store, &Request::HttpRedirectRuleUpsert(updated))
        .await
        .expect("update");

    let snapshot = store.config_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.redirect_rules.len(), 1);
    assert_eq!(snapshot.redirect_rules[0].status_code, 308);
    assert_eq!(snapshot.redirect_rules[0].host_redirect, "www.example.com");
}

#[tokio::test]
async fn redirect_upsert_rejects_unknown_status() {
    let (_dir, store) = open_store().await;
    let mut bad = redirect_upsert("r1");
    bad.status_code = 200;
    let err = apply_committed(&store, &Request::HttpRedirectRuleUpsert(bad))
        .await
        .expect_err("status rejected");
    assert!(err.to_string().contains("status_code"));
}

#[tokio::test]
async fn redirect_delete_is_idempotent_and_releases_listener() {
    let (_dir, store) = open_store().await;
    apply_committed(&store, &Request::HttpRedirectRuleUpsert(redirect_upsert("r1")))
        .await
        .expect("create");
    // Keep the reference sets non-empty while the target rule disappears.
    let mut keeper = redirect_upsert("r2");
    keeper.port = 81;
    apply_committed(&store, &Request::HttpRedirectRuleUpsert(keeper))
        .await
        .expect("keeper");

    let delete = Request::HttpRedirectRuleDelete(HttpRedirectRuleDelete {
        meta: meta("r3"),
        bind_ip: "0.0.0.0".to_string(),
        port: 80,
        domain: "example.com".to_string(),
        route_prefix: "/".to_string(),
        is_https_redirect: true,
        scheme_redirect: String::new(),
        host_redirect: String::new(),
        path_redirect: String::new(),
        status_code: 0,
    });
    assert!(apply_committed(&store, &delete).await.expect("delete").is_none());
    assert!(apply_committed(&store, &delete).await.expect("again").is_none());

    let snapshot = store.config_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.redirect_rules.len(), 1);
    assert_eq!(snapshot.listeners.len(), 1);
    assert_eq!(snapshot.listeners[0].id, "0.0.0.0:81");
}

#[tokio::test]
async fn tls_delete_of_absent_certificate_succeeds() {
    let (_dir, store) = open_store().await;
    let delete = Request::TlsCertificateDelete(TlsCertificateDelete {
        meta: meta("r1"),
        domain: "example.com".to_string(),
        is_wildcard: false,
    });
    assert!(apply_committed(&store, &delete).await.expect("delete").is_none());
}

#[tokio::test]
async fn tls_upsert_requires_fields() {
    let (_dir, store) = open_store().await;
    let missing = Request::TlsCertificateUpsert(TlsCertificateUpsert {
        meta: meta("r1"),
        domain: String::new(),
        is_wildcard: false,
        cert: "x".to_string(),
        key: "y".to_string(),
    });
    let err = apply_committed(&store, &missing)
        .await
        .expect_err("domain required");
    assert!(err.to_string().contains("domain is required"));

    let missing_material = Request::TlsCertificateUpsert(TlsCertificateUpsert {
        meta: meta("r2"),
        domain: "example.com".to_string(),
        is_wildcard: false,
        cert: String::new(),
        key: String::new(),
    });
    let err = apply_committed(&store, &missing_material)
        .await
        .expect_err("material required");
    assert!(err.to_string().contains("cert and key are required"));
}

#[tokio::test]
async fn tls_upsert_stores_validated_pair() {
    let (_dir, store) = open_store().await;
    let (cert_pem, key_pem) = test_certs::pair();

    // Escaped newlines arrive from clients that stuffed PEM into JSON.
    let escaped_cert = cert_pem.trim_end().replace('\n', "\\n");
    let request = Request::TlsCertificateUpsert(TlsCertificateUpsert {
        meta: meta("r1"),
        domain: "example.com".to_string(),
        is_wildcard: false,
        cert: escaped_cert,
        key: key_pem.clone(),
    });

    let reply = apply_committed(&store, &request)
        .await
        .expect("apply")
        .expect("reply");
    assert_eq!(reply["id"], serde_json::json!("example.com"));
    assert_eq!(reply["expires_at"], serde_json::json!("2030-01-01T00:00:00Z"));
    assert!(reply.get("key").is_none(), "private key must be redacted");
    assert!(
        reply["cert"].as_str().unwrap().ends_with('\n'),
        "stored cert keeps its trailing newline"
    );

    // Second application is byte-identical.
    let again = apply_committed(&store, &request)
        .await
        .expect("re-apply")
        .expect("reply");
    assert_eq!(
        serde_json::to_string(&reply).unwrap(),
        serde_json::to_string(&again).unwrap()
    );

    let snapshot = store.config_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.tls_certificates.len(), 1);
    assert_eq!(snapshot.tls_certificates[0].key, key_pem);
}

#[tokio::test]
async fn tls_upsert_rejects_mismatched_key() {
    let (_dir, store) = open_store().await;
    let (cert_pem, _) = test_certs::pair();
    let other_key = test_certs::other_key();

    let request = Request::TlsCertificateUpsert(TlsCertificateUpsert {
        meta: meta("r1"),
        domain: "example.com".to_string(),
        is_wildcard: false,
        cert: cert_pem,
        key: other_key,
    });
    let err = apply_committed(&store, &request)
        .await
        .expect_err("mismatch rejected");
    assert!(err.to_string().contains("do not match"));
}

mod test_certs {
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::EncodePrivateKey;
    use std::sync::OnceLock;

    static PAIR: OnceLock<(String, String)> = OnceLock::new();
    static OTHER: OnceLock<String> = OnceLock::new();

    fn generate_key_pem() -> String {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).expect("generate rsa key");
        key.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .expect("encode pkcs8")
            .to_string()
    }

    pub fn pair() -> (String, String) {
        PAIR.get_or_init(|| {
            let key_pem = generate_key_pem();
            let key_pair = rcgen::KeyPair::from_pem(&key_pem).expect("load key pair");
            let mut params = rcgen::CertificateParams::new(vec!["example.com".to_string()]);
            params.alg = &rcgen::PKCS_RSA_SHA256;
            params.key_pair = Some(key_pair);
            params.not_after = rcgen::date_time_ymd(2030, 1, 1);
            let cert = rcgen::Certificate::from_params(params).expect("self-sign");
            (cert.serialize_pem().expect("cert pem"), key_pem)
        })
        .clone()
    }

    pub fn other_key() -> String {
        OTHER.get_or_init(generate_key_pem).clone()
    }
}
