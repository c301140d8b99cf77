//! Request cancellation.
//!
//! A cancel is an out-of-band packet written through the connection's shared
//! write half, so it can be sent from another task while the owner is
//! blocked reading a reply:
//!
//! ```rust,ignore
//! let cancel = client.cancel_handle();
//! tokio::spawn(async move {
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     let _ = cancel.cancel().await;
//! });
//!
//! client.submit_sql("WAITFOR DELAY '00:01:00'").await?;
//! let err = client.drain().await.unwrap_err();
//! assert!(err.is_cancelled());
//! ```
//!
//! Cancellation is cooperative: the reader keeps consuming tokens until the
//! server acknowledges the cancel with a Done token, and the connection
//! stays usable afterwards.

use tds_codec::CancelHandle as CodecCancelHandle;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Handle for cancelling the outstanding request on a connection.
///
/// Cloneable and `Send + Sync`; obtain one with
/// [`Client::cancel_handle`](crate::Client::cancel_handle).
#[derive(Clone, Debug)]
pub struct CancelHandle {
    inner: CodecCancelHandle<Transport>,
}

impl CancelHandle {
    pub(crate) fn new(inner: CodecCancelHandle<Transport>) -> Self {
        Self { inner }
    }

    /// Send a cancel for the outstanding request.
    ///
    /// Returns `Ok(true)` if a cancel packet was written, `Ok(false)` if one
    /// is already waiting for its acknowledgement.
    ///
    /// # Errors
    ///
    /// [`Error::Sequence`] when no request is in flight, or a transport
    /// error if the packet could not be written.
    pub async fn cancel(&self) -> Result<bool> {
        if !self.inner.is_in_flight() {
            return Err(Error::Sequence("no request in flight to cancel"));
        }
        Ok(self.inner.cancel().await?)
    }

    /// Check if a cancel is waiting for its acknowledgement.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.is_pending()
    }

    /// Check if a request is outstanding.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.inner.is_in_flight()
    }
}
