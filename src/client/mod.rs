pub mod envelope;
pub mod transport;

use chrono::{DateTime, Utc};

use crate::config::FuelSyncConfig;
use crate::error::{Error, Result};
use crate::soap;
use crate::sync::rate_limit::{backoff_sleep, RetryPolicy};

pub use envelope::{EnvelopeRenderer, LoginRequest, LogoutRequest, ProtocolRequest, TransactionsRequest};
pub use transport::{HttpTransport, Transport, TransportResponse};

/// Longest response excerpt carried in an `Error::Http`.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Unopened,
    Open {
        token: String,
        opened_at: DateTime<Utc>,
    },
    Closed,
}

/// One authenticated session against the EFS card-management service.
///
/// The session moves `Unopened -> Open -> Closed` and never reopens.
/// Requests are only valid while open and are retried on transient
/// failures according to the configured [`RetryPolicy`].
pub struct SessionClient<T: Transport = HttpTransport> {
    transport: T,
    renderer: EnvelopeRenderer,
    username: String,
    password: String,
    policy: RetryPolicy,
    state: SessionState,
    attempts: u64,
}

impl SessionClient<HttpTransport> {
    pub fn from_config(config: &FuelSyncConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.efs, &config.client)?;
        Self::new(transport, config)
    }
}

impl<T: Transport> SessionClient<T> {
    pub fn new(transport: T, config: &FuelSyncConfig) -> Result<Self> {
        Ok(Self {
            transport,
            renderer: EnvelopeRenderer::new()?,
            username: config.efs.username.clone(),
            password: config.efs.password.clone(),
            policy: RetryPolicy::from_config(&config.client),
            state: SessionState::Unopened,
            attempts: 0,
        })
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// When the current session was established, if open.
    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            SessionState::Open { opened_at, .. } => Some(*opened_at),
            _ => None,
        }
    }

    /// HTTP attempts made so far, including retries and login/logout.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Authenticate and store the session token.
    pub async fn open(&mut self) -> Result<()> {
        match self.state {
            SessionState::Unopened => {}
            SessionState::Open { .. } => return Err(Error::Session("session is already open".into())),
            SessionState::Closed => return Err(Error::Session("session has been closed".into())),
        }

        let request = LoginRequest {
            username: &self.username,
            password: &self.password,
        };
        let operation = request.operation_name();
        let envelope = self.renderer.render(&request, None)?;
        let body = self
            .send_with_retry(operation, envelope)
            .await
            .map_err(|e| match e {
                Error::OperationFault { code, message } => {
                    Error::Authentication(format!("{message} ({code})"))
                }
                Error::Http { status, body } if status == 401 || status == 403 => {
                    Error::Authentication(format!("HTTP {status}: {body}"))
                }
                other => other,
            })?;
        let token = soap::login_token(&body)?;

        log::info!("Logged in to EFS as {}", self.username);
        self.state = SessionState::Open {
            token,
            opened_at: Utc::now(),
        };
        Ok(())
    }

    /// Execute one operation and return the raw response body.
    pub async fn execute<R: ProtocolRequest + ?Sized>(&mut self, request: &R) -> Result<String> {
        let token = match &self.state {
            SessionState::Open { token, .. } => token.clone(),
            SessionState::Unopened => return Err(Error::Session("session is not open".into())),
            SessionState::Closed => return Err(Error::Session("session has been closed".into())),
        };
        let envelope = self.renderer.render(request, Some(&token))?;
        self.send_with_retry(request.operation_name(), envelope).await
    }

    /// Log out. Always leaves the session closed; a logout failure is still
    /// returned to the caller. A no-op unless the session is open.
    pub async fn close(&mut self) -> Result<()> {
        let token = match &self.state {
            SessionState::Open { token, .. } => token.clone(),
            SessionState::Unopened | SessionState::Closed => return Ok(()),
        };
        self.state = SessionState::Closed;

        let envelope = self.renderer.render(&LogoutRequest, Some(&token))?;
        match self.send_with_retry(LogoutRequest.operation_name(), envelope).await {
            Ok(_) => {
                log::info!("Logged out of EFS");
                Ok(())
            }
            Err(e) => {
                log::warn!("Logout failed: {e}");
                Err(e)
            }
        }
    }

    async fn send_with_retry(&mut self, operation: &str, envelope: String) -> Result<String> {
        let max_attempts = self.policy.max_attempts();
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            self.attempts += 1;
            let err = match self.transport.post(operation, envelope.clone()).await {
                Ok(response) => {
                    if let Some(fault) = soap::fault_in(&response.body) {
                        log::error!("{operation} returned a SOAP fault: {}", fault.message);
                        return Err(fault.into());
                    }
                    if response.is_success() {
                        log::debug!("{operation} succeeded on attempt {}", attempt + 1);
                        return Ok(response.body);
                    }
                    Error::Http {
                        status: response.status,
                        body: excerpt(&response.body),
                    }
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(err);
            }
            last_error = err.to_string();
            if attempt + 1 < max_attempts {
                backoff_sleep(&self.policy, operation, attempt, &last_error).await;
            }
        }

        log::error!("{operation} gave up after {max_attempts} attempt(s): {last_error}");
        Err(Error::RetriesExhausted {
            operation: operation.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}

impl<T: Transport> Drop for SessionClient<T> {
    fn drop(&mut self) {
        if self.is_open() {
            log::warn!("EFS session dropped without logout; the server will expire it");
        }
    }
}

fn excerpt(body: &str) -> String {
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
