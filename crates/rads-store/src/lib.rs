//! Embedded SQLite store for the agent's proxy configuration.
//!
//! # Purpose
//! This crate owns the authoritative local view of the ingress/redirect
//! configuration: the pipeline ledger (`messages`), the configuration
//! entities (certificates, listeners, backends, rules), the transactional
//! mutation handlers, and the end-of-batch orphan sweep.
//!
//! # Concurrency model
//! Two pools over one database file. The write pool is capped at a single
//! connection, so every write transaction is serialized; the read pool is
//! wide and read-only. WAL journaling gives readers a consistent snapshot
//! while the writer makes progress. There is exactly one writer in the
//! process (the request processor plus the ingest insert path).
//!
//! # Durability semantics
//! `synchronous = NORMAL` under WAL: committed batches survive process
//! crashes; an OS crash may lose the tail of the WAL, which the
//! at-least-once delivery upstream re-fills.
pub mod messages;
pub mod model;
pub mod mutate;
pub mod sqlite;
pub mod tls;

pub use model::{
    Backend, HttpRedirectRule, IngressRule, Listener, Message, NewMessage, TlsCertificate,
    ingress_rule_id, listener_id, redirect_rule_id, tls_certificate_id,
};
pub use mutate::{MutationError, apply, collect_garbage};
pub use sqlite::{ConfigSnapshot, Store};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("malformed row: {0}")]
    Malformed(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
