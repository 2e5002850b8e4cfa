//! Logging scope for connector operations
//!
//! The library never installs a global subscriber. A connector may carry its
//! own [`Dispatch`]; its operations then log there instead of to whatever
//! subscriber the caller has active.

use crate::error::{Error, Result};
use std::future::Future;
use std::io;
use tracing::instrument::WithSubscriber;
use tracing::{dispatcher, Dispatch};

/// Run `fut` under `dispatch` when one is given
pub(crate) async fn scoped<F>(dispatch: Option<&Dispatch>, fut: F) -> F::Output
where
    F: Future,
{
    match dispatch {
        Some(dispatch) => fut.with_subscriber(dispatch.clone()).await,
        None => fut.await,
    }
}

/// Run blocking device I/O on tokio's blocking pool
///
/// The closure logs to the dispatch active at the call site.
pub(crate) async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let dispatch = dispatcher::get_default(Dispatch::clone);
    tokio::task::spawn_blocking(move || dispatcher::with_default(&dispatch, f))
        .await
        .map_err(|e| {
            Error::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("blocking device task failed: {}", e),
            ))
        })?
}
