//! Small functional utilities for ergonomic error/result handling
//!
//! Overview
//! --------
//! Helpers to reduce boilerplate around pooled-connection usage and stream
//! appends (dead-letter records, alerts). Crate-local building blocks used by
//! the Redis transport and the emit layer.
//!
//! Notes
//! -----
//! - Keep this module dependency-light.
//! - Use at module edges to keep orchestration code concise.

use crate::errors::ConsumerError;
use deadpool_redis::{redis::cmd, Pool};

// ========= Connection helper =========

/// Borrow a pooled Redis connection and run the provided async action.
/// Maps pool errors into `ConsumerError` at the edge.
pub async fn with_conn<T, F, Fut>(pool: &Pool, f: F) -> Result<T, ConsumerError>
where
    F: FnOnce(deadpool_redis::Connection) -> Fut,
    Fut: std::future::Future<Output = Result<T, ConsumerError>>,
{
    let conn = pool
        .get()
        .await
        .map_err(|e| ConsumerError::Transport(format!("redis pool: {e}")))?;
    f(conn).await
}

// ========= Stream append =========

/// `XADD <stream> * k1 v1 k2 v2 ...`; returns the new entry id.
#[tracing::instrument(skip(pool, fields))]
pub async fn append_entry(
    pool: &Pool,
    stream: &str,
    fields: &[(&str, &[u8])],
) -> Result<String, ConsumerError> {
    with_conn(pool, |mut c| async move {
        let mut x = cmd("XADD");
        x.arg(stream).arg("*");
        for (k, v) in fields {
            x.arg(*k).arg(*v);
        }
        x.query_async::<_, String>(&mut c)
            .await
            .map_err(|e| ConsumerError::Transport(e.to_string()))
    })
    .await
}
