use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};

use crate::config::{ClientSection, EfsSection};
use crate::error::{Error, Result};

/// Status and body of one HTTP exchange. Non-2xx statuses are returned here,
/// not as errors; only failures to complete the exchange are `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Posts a rendered envelope to the service endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, action: &str, body: String) -> Result<TransportResponse>;
}

pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(efs: &EfsSection, client: &ClientSection) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/xml; charset=utf-8"),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("text/xml"));

        if !client.verify_ssl {
            log::warn!("TLS certificate verification is disabled");
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("fuelsync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(client.connect_timeout())
            .read_timeout(client.read_timeout())
            .danger_accept_invalid_certs(!client.verify_ssl)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: efs.endpoint_url.clone(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, action: &str, body: String) -> Result<TransportResponse> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("SOAPAction", action)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Transport(describe(&e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(describe(&e)))?;
        Ok(TransportResponse { status, body })
    }
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}
