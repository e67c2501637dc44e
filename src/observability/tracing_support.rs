//! Spans for the agent and collector hot paths.

use crate::fingerprint::Fingerprint;
use tracing::{Level, Span, span};

/// Span covering one resolve of a tensor.
///
/// ```rust,ignore
/// let _guard = span_resolve("bert", fp).entered();
/// ```
#[inline]
pub fn span_resolve(model: &str, fingerprint: Fingerprint) -> Span {
    span!(Level::DEBUG, "resolve", model = %model, fingerprint = ?fingerprint)
}

/// Span covering one release of a tensor reference.
#[inline]
pub fn span_release(model: &str, fingerprint: Fingerprint) -> Span {
    span!(Level::DEBUG, "release", model = %model, fingerprint = ?fingerprint)
}

/// Span covering one collector tick.
#[inline]
pub fn span_scan(node: &str) -> Span {
    span!(Level::INFO, "scan", node = %node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_creation() {
        // These should not panic without a subscriber
        let fp = Fingerprint::of_content(b"x");
        let _span = span_resolve("m", fp);
        let _span = span_release("m", fp);
        let _guard = span_scan("node-a").entered();
    }
}
