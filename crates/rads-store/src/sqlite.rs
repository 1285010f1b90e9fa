// Store handle: one database file, a single-connection write pool and a
// wide read-only pool, migrated unconditionally at open.
use serde::Serialize;
use sqlx::ConnectOptions;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::time::Duration;

use crate::model::{
    Backend, BackendRow, HttpRedirectRule, IngressRule, IngressRuleRow, Listener, ListenerRow,
    TlsCertificate, TlsCertificateRow,
};
use crate::StoreResult;

// The writer waits out ledger bursts rather than failing the batch.
const WRITE_BUSY_TIMEOUT: Duration = Duration::from_secs(60);
const READ_POOL_MAX: u32 = 1000;

#[derive(Debug, Clone)]
pub struct Store {
    pub(crate) read: SqlitePool,
    pub(crate) write: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) and migrates the database, then attaches
    /// the read-only pool. The write pool must exist first so the file and
    /// schema are in place before a read-only connection touches it.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();

        let write_options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(WRITE_BUSY_TIMEOUT)
            .foreign_keys(true)
            .log_statements(log::LevelFilter::Debug);
        let write = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_options)
            .await?;

        sqlx::migrate!("./migrations").run(&write).await?;

        let read_options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);
        let read = SqlitePoolOptions::new()
            .max_connections(READ_POOL_MAX)
            .connect_with(read_options)
            .await?;

        Ok(Store { read, write })
    }

    /// Begins the processor's batch write transaction. The write pool has a
    /// single connection, so concurrent calls queue here instead of racing
    /// for the SQLite write lock.
    pub async fn begin(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        Ok(self.write.begin().await?)
    }

    pub async fn close(&self) {
        self.read.close().await;
        self.write.close().await;
    }

    /// Read-only view of the whole proxy configuration, the unit a
    /// downstream loader pulls after observing the change signal.
    pub async fn config_snapshot(&self) -> StoreResult<ConfigSnapshot> {
        let listeners = sqlx::query_as::<_, ListenerRow>(
            "SELECT id, protocol, ip, port, is_tls FROM listeners ORDER BY id",
        )
        .fetch_all(&self.read)
        .await?
        .into_iter()
        .map(Listener::try_from)
        .collect::<Result<Vec<_>, _>>()?;

        let backends = sqlx::query_as::<_, BackendRow>(
            "SELECT id, resolver_type, dns_resolver, hosts, port, is_tls, sni_domain \
             FROM backends ORDER BY id",
        )
        .fetch_all(&self.read)
        .await?
        .into_iter()
        .map(Backend::try_from)
        .collect::<Result<Vec<_>, _>>()?;

        let ingress_rules = sqlx::query_as::<_, IngressRuleRow>(
            "SELECT id, priority, listener_id, backend_id, domain, route_prefix, \
             allowed_cidrs, denied_cidrs FROM ingress_rules ORDER BY id",
        )
        .fetch_all(&self.read)
        .await?
        .into_iter()
        .map(IngressRule::try_from)
        .collect::<Result<Vec<_>, _>>()?;

        let redirect_rules = sqlx::query_as::<_, HttpRedirectRule>(
            "SELECT id, priority, listener_id, domain, path_prefix, is_https_redirect, \
             scheme_redirect, host_redirect, path_redirect, status_code \
             FROM http_redirect_rules ORDER BY id",
        )
        .fetch_all(&self.read)
        .await?;

        let tls_certificates = sqlx::query_as::<_, TlsCertificateRow>(
            "SELECT id, domain, is_wildcard, cert, key, expires_at \
             FROM tls_certificates ORDER BY id",
        )
        .fetch_all(&self.read)
        .await?
        .into_iter()
        .map(TlsCertificate::from)
        .collect();

        Ok(ConfigSnapshot {
            listeners,
            backends,
            ingress_rules,
            redirect_rules,
            tls_certificates,
        })
    }
}

/// Everything a proxy needs to configure itself. Serializing this snapshot
/// redacts private keys; consumers needing key material read the fields
/// directly.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub listeners: Vec<Listener>,
    pub backends: Vec<Backend>,
    pub ingress_rules: Vec<IngressRule>,
    pub redirect_rules: Vec<HttpRedirectRule>,
    pub tls_certificates: Vec<TlsCertificate>,
}
