//! Per-connection serialized write path.
//!
//! Every outbound byte for a connection goes through one [`ConnWriter`].
//! Writes are serialized behind a per-connection lock (FIFO for callers),
//! bounded by a write timeout, and retried on transient I/O errors with
//! exponential back-off. Permanent errors propagate to the caller.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

/// First back-off delay after a transient write failure.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Back-off multiplier.
const BACKOFF_FACTOR: f64 = 1.5;
/// Back-off ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(5);
/// Total attempts (first try included).
const MAX_ATTEMPTS: u32 = 5;

type SharedSink = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Cloneable handle to a connection's serialized writer.
#[derive(Clone)]
pub struct ConnWriter {
    sink: SharedSink,
    write_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("write retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: std::io::Error },
}

impl ConnWriter {
    pub fn new(sink: impl AsyncWrite + Send + Unpin + 'static, write_timeout: Duration) -> Self {
        ConnWriter {
            sink: Arc::new(Mutex::new(Box::new(sink))),
            write_timeout,
        }
    }

    /// Write `bytes` in full, holding the connection lock for the whole
    /// attempt sequence so concurrent callers cannot interleave frames.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        let mut sink = self.sink.lock().await;
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err: Option<std::io::Error> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let result = tokio::time::timeout(self.write_timeout, async {
                sink.write_all(bytes).await?;
                sink.flush().await
            })
            .await;

            let err = match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if is_transient(&e) => e,
                Ok(Err(e)) => return Err(WriteError::Io(e)),
                Err(_elapsed) if attempt < MAX_ATTEMPTS => {
                    std::io::Error::new(ErrorKind::TimedOut, "write timeout")
                }
                Err(_elapsed) => return Err(WriteError::Timeout(self.write_timeout)),
            };

            warn!(attempt, error = %err, "transient write error, backing off");
            last_err = Some(err);
            tokio::time::sleep(backoff).await;
            backoff = backoff.mul_f64(BACKOFF_FACTOR).min(MAX_BACKOFF);
        }

        Err(WriteError::Exhausted {
            attempts: MAX_ATTEMPTS,
            last: last_err.unwrap_or_else(|| ErrorKind::Other.into()),
        })
    }
}

/// Transient kinds are retried; everything else is permanent.
fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}
