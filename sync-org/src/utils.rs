use anyhow::Context;
use reqwest::blocking::Response;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Labels forge responses with the operation that produced them, so a
/// failure in the middle of a long reconcile cycle names the exact REST
/// endpoint or GraphQL operation in its error instead of a bare status.
pub(crate) trait ForgeResponse {
    /// Fails on an error status, quoting `operation` and an excerpt of
    /// the error body the forge sent back.
    fn forge_error_for_status(self, operation: &str) -> anyhow::Result<Response>;

    /// Decodes the body, annotating a decode failure with `operation`,
    /// the expected type and the offending payload.
    fn forge_json<T: DeserializeOwned>(self, operation: &str) -> anyhow::Result<T>;
}

impl ForgeResponse for Response {
    fn forge_error_for_status(self, operation: &str) -> anyhow::Result<Response> {
        match self.error_for_status_ref() {
            Ok(_) => Ok(self),
            Err(err) => {
                let body = self.text().unwrap_or_default();
                Err(err).with_context(|| {
                    format!("{operation} rejected by the forge: {}", excerpt(&body))
                })
            }
        }
    }

    fn forge_json<T: DeserializeOwned>(self, operation: &str) -> anyhow::Result<T> {
        let text = self
            .text()
            .with_context(|| format!("failed to read the body returned by {operation}"))?;
        serde_json::from_str::<T>(&text).with_context(|| {
            format!(
                "{operation} returned a body that does not decode as `{}`: {}",
                std::any::type_name::<T>(),
                excerpt(&text)
            )
        })
    }
}

/// Keeps error payloads readable in the logs. Forge error bodies are JSON
/// with the message up front, so the head of the payload is the useful
/// part.
fn excerpt(body: &str) -> String {
    const LIMIT: usize = 256;
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "(empty body)".to_string();
    }
    if trimmed.len() <= LIMIT {
        return trimmed.to_string();
    }
    let mut cut = LIMIT;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... ({} bytes total)", &trimmed[..cut], trimmed.len())
}

/// Cooperative cancellation handle threaded through a reconcile cycle.
/// The orchestrator arms it with the cycle deadline and may also cancel
/// it explicitly on shutdown; the reconciler polls it between events.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        CancelToken {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                deadline: Some(deadline),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match self.inner.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    pub fn ensure_active(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            anyhow::bail!("the reconcile cycle was cancelled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn excerpt_keeps_short_bodies_whole() {
        assert_eq!(excerpt("  {\"message\":\"Not Found\"}  "), "{\"message\":\"Not Found\"}");
        assert_eq!(excerpt("   "), "(empty body)");
    }

    #[test]
    fn excerpt_truncates_on_a_char_boundary() {
        let body = "é".repeat(300);
        let cut = excerpt(&body);
        assert!(cut.ends_with("(600 bytes total)"));
        assert!(cut.len() < body.len());
    }

    #[test]
    fn token_cancels_explicitly() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.ensure_active().is_err());
    }

    #[test]
    fn token_expires_at_deadline() {
        let token = CancelToken::with_deadline(Instant::now() - Duration::from_secs(1));
        assert!(token.is_cancelled());
    }
}
