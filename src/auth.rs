//! Bearer-token credentials for remote processor targets.

use std::sync::{Arc, RwLock};

/// A shared, refreshable bearer token.
///
/// Clones share the same slot, so writing a new value with
/// [`set`](BearerToken::set) rotates the credential for every processor
/// holding a clone, on its next call, without rebuilding clients. An empty
/// token sends no `authorization` header.
///
/// # Panics
///
/// Reads and writes panic if the inner lock is poisoned, which only
/// happens if a writer panicked mid-update.
#[derive(Clone, Default)]
pub struct BearerToken {
    inner: Arc<RwLock<String>>,
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

impl BearerToken {
    /// Create a token slot holding `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(token.into())),
        }
    }

    /// Replace the token.
    pub fn set(&self, token: impl Into<String>) {
        *self.inner.write().expect("bearer token lock poisoned") = token.into();
    }

    /// The `authorization` header value, or `None` for an empty token.
    pub(crate) fn header_value(&self) -> Option<String> {
        let token = self.inner.read().expect("bearer token lock poisoned");
        (!token.is_empty()).then(|| format!("Bearer {token}"))
    }
}

/// gRPC interceptor adding the bearer token, if any, to every call.
#[derive(Clone, Debug, Default)]
pub(crate) struct BearerInterceptor {
    pub(crate) token: Option<BearerToken>,
}

impl tonic::service::Interceptor for BearerInterceptor {
    fn call(&mut self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        if let Some(header) = self.token.as_ref().and_then(BearerToken::header_value) {
            let value = header
                .parse::<tonic::metadata::MetadataValue<_>>()
                .map_err(|_| tonic::Status::internal("invalid token characters"))?;
            req.metadata_mut().insert("authorization", value);
        }
        Ok(req)
    }
}
