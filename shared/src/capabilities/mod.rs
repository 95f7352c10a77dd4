mod http;
mod memory;
mod rest;
mod store;

pub use self::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpTransport,
    ReqwestTransport, ValidatedUrl,
};
pub use self::memory::{InMemoryStore, StoreOp};
pub use self::rest::RestStore;
pub use self::store::{ChangeFeed, ChangeNotice, RemoteStore, StoreError};

use std::sync::Arc;

use crate::config::Config;
use crate::AppError;

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<CapabilityError> for AppError {
    fn from(e: CapabilityError) -> Self {
        match e {
            CapabilityError::Http(e) => e.into(),
            CapabilityError::Store(e) => e.into(),
        }
    }
}

/// Outbound I/O seams shared by every component of a session.
#[derive(Clone)]
pub struct Capabilities {
    pub http: Arc<dyn HttpTransport>,
    pub store: Arc<dyn RemoteStore>,
}

impl Capabilities {
    /// Real network transport; the store is remote only when credentials are configured.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let http: Arc<dyn HttpTransport> =
            Arc::new(ReqwestTransport::new(&config.user_agent).map_err(CapabilityError::from)?);
        let store: Arc<dyn RemoteStore> = if config.uses_real_store() {
            Arc::new(RestStore::new(http.clone(), config)?)
        } else {
            tracing::warn!("no store credentials configured, running against demo data");
            Arc::new(InMemoryStore::seeded())
        };
        Ok(Self { http, store })
    }

    #[must_use]
    pub fn new(http: Arc<dyn HttpTransport>, store: Arc<dyn RemoteStore>) -> Self {
        Self { http, store }
    }
}

/// Test doubles for hosts and integration tests.
pub mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport that answers from a queue and records every request.
    #[derive(Default)]
    pub struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub fn reply_json(&self, status: u16, body: &serde_json::Value) {
            let response = HttpResponse::new(
                status,
                HttpHeaders::new(),
                body.to_string().into_bytes(),
                "scripted",
                1,
            );
            self.lock_replies().push_back(Ok(response));
        }

        pub fn reply_error(&self, error: HttpError) {
            self.lock_replies().push_back(Err(error));
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.seen
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }

        fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<HttpResponse, HttpError>>> {
            self.replies
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            let host = request.url().host().to_owned();
            self.seen
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(request);
            self.lock_replies().pop_front().unwrap_or(Err(HttpError::Connection {
                host,
                message: "no scripted reply".to_owned(),
            }))
        }
    }

    pub fn demo_capabilities(http: Arc<ScriptedTransport>) -> Capabilities {
        Capabilities::new(http, Arc::new(InMemoryStore::seeded()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn demo_mode_without_credentials() {
        let caps = Capabilities::from_config(&Config::default());
        assert!(caps.is_ok());
    }

    #[test]
    fn store_errors_map_to_network_kind() {
        let err: AppError = CapabilityError::from(StoreError::Unavailable("down".into())).into();
        assert_eq!(err.kind, ErrorKind::Network);
    }
}
