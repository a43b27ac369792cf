//! Shared utility functions.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run blocking work (SQLite calls) on the blocking pool.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Comma-join at most `limit` items, noting how many were left out.
pub fn join_preview<I, S>(items: I, limit: usize) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut shown = Vec::new();
    let mut hidden = 0usize;
    for item in items {
        if shown.len() < limit {
            shown.push(item.as_ref().to_string());
        } else {
            hidden += 1;
        }
    }
    let mut out = shown.join(", ");
    if hidden > 0 {
        out.push_str(&format!(" (+{} more)", hidden));
    }
    out
}
