//! The network boundary.
//!
//! The load engine never talks to the network itself; it hands each
//! [`ResolvedRequest`] to a [`Transport`] and records what comes back.

use async_trait::async_trait;
use serde_json::Value;

use crate::{metric::Outcome, session::ResolvedRequest};

/// What a transport observed for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub outcome: Outcome,
    /// Parsed JSON body, when the request asked for it and the body was JSON.
    pub body: Option<Value>,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            outcome: Outcome::Status(status),
            body: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure(reason.into()),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Sends a request and reports the outcome. Transport errors are outcomes, not
/// `Err`s: a refused connection is a failed sample like any other.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: &ResolvedRequest) -> Reply;
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use reqwest::{Client, Method, RequestBuilder};

    use super::*;
    use crate::error::ExecutorError;

    /// [`Transport`] over a shared `reqwest` client.
    ///
    /// Build it once per run; the client pools connections for every virtual user.
    #[derive(Debug, Clone)]
    pub struct HttpTransport {
        client: Client,
        host: String,
    }

    impl HttpTransport {
        pub fn new(host: impl Into<String>) -> Result<Self, ExecutorError> {
            let client = Client::builder()
                .build()
                .map_err(|e| ExecutorError::Transport(e.to_string()))?;
            Ok(Self {
                client,
                host: host.into().trim_end_matches('/').to_string(),
            })
        }

        pub fn url(&self, path: &str) -> String {
            if path.starts_with("http://") || path.starts_with("https://") {
                path.to_string()
            } else if path.starts_with('/') {
                format!("{}{path}", self.host)
            } else {
                format!("{}/{path}", self.host)
            }
        }

        /// A `json` body wins over form `data`; the compiler never lets both through.
        fn prepare(&self, request: &ResolvedRequest) -> Result<RequestBuilder, Reply> {
            let method = Method::from_bytes(request.method.as_bytes())
                .map_err(|e| Reply::failure(format!("invalid method: {e}")))?;

            let mut builder = self.client.request(method, self.url(&request.path));
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let Some(body) = &request.json {
                builder = builder.json(body);
            } else if let Some(form) = &request.data {
                builder = builder.form(form);
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }
            Ok(builder)
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn send(&self, request: &ResolvedRequest) -> Reply {
            let builder = match self.prepare(request) {
                Ok(builder) => builder,
                Err(reply) => return reply,
            };

            match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if request.wants_body {
                        let body = response.json::<Value>().await.ok();
                        Reply {
                            outcome: Outcome::Status(status),
                            body,
                        }
                    } else {
                        // read the body so the connection can be reused
                        let _ = response.bytes().await;
                        Reply::status(status)
                    }
                }
                Err(e) if e.is_timeout() => Reply::failure("timeout"),
                Err(e) if e.is_connect() => Reply::failure(format!("connection error: {e}")),
                Err(e) => Reply::failure(e.to_string()),
            }
        }
    }

}
