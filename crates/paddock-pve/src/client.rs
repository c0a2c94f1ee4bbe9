//! Control-plane client.
//!
//! [`ControlPlane`] is the seam every higher layer talks through. The
//! production implementation is [`PveClient`], a ticket-authenticated
//! HTTPS client for the hypervisor REST API; tests use
//! [`MockControlPlane`](crate::MockControlPlane).

use crate::error::{PveError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP method of a control-plane request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// True for methods that need the CSRF token.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Method::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Raw access to a hypervisor control plane.
///
/// `path` is relative to the API root (e.g. `/cluster/sdn/zones`) and may
/// carry a query string. Implementations return the unwrapped `data`
/// member of the response envelope.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// API root this client talks to, used in log fields.
    fn base_url(&self) -> &str;

    /// Issue a request and return its `data` payload.
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value>;
}

/// Typed convenience wrapper over a shared [`ControlPlane`].
#[derive(Clone)]
pub struct Api {
    inner: Arc<dyn ControlPlane>,
}

impl Api {
    pub fn new(inner: Arc<dyn ControlPlane>) -> Self {
        Self { inner }
    }

    pub fn base_url(&self) -> &str {
        self.inner.base_url()
    }

    /// GET and decode into `T`.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.inner.request(Method::Get, path, None).await?;
        serde_json::from_value(value).map_err(|source| PveError::Decode {
            path: path.to_string(),
            source,
        })
    }

    /// GET returning the raw payload.
    pub async fn get_value(&self, path: &str) -> Result<Value> {
        self.inner.request(Method::Get, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.inner.request(Method::Post, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: Option<Value>) -> Result<Value> {
        self.inner.request(Method::Put, path, body).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.inner.request(Method::Delete, path, None).await
    }
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("base_url", &self.inner.base_url())
            .finish()
    }
}

#[derive(Clone)]
struct Session {
    ticket: String,
    csrf: String,
}

#[derive(Deserialize)]
struct TicketEnvelope {
    data: Option<TicketData>,
}

#[derive(Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf: String,
}

/// Ticket-authenticated client for the hypervisor REST API.
///
/// Logs in lazily on the first request and once more if the ticket is
/// rejected with a 401.
pub struct PveClient {
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
    session: Mutex<Option<Session>>,
}

impl PveClient {
    /// Build a client for `https://{host}:{port}/api2/json`.
    ///
    /// `verify_tls = false` accepts self-signed certificates, which is how
    /// a freshly installed node ships.
    pub fn new(
        host: &str,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        verify_tls: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: format!("https://{host}:{port}/api2/json"),
            username: username.into(),
            password: password.into(),
            http,
            session: Mutex::new(None),
        })
    }

    async fn login(&self) -> Result<Session> {
        let url = format!("{}/access/ticket", self.base_url);
        tracing::debug!(base_url = %self.base_url, user = %self.username, "Requesting ticket");

        let resp = self
            .http
            .post(&url)
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PveError::Login(format!("{status}: {body}")));
        }

        let envelope: TicketEnvelope = resp.json().await?;
        let data = envelope
            .data
            .ok_or_else(|| PveError::Login("ticket response carried no data".into()))?;

        tracing::info!(base_url = %self.base_url, user = %self.username, "Logged in");
        Ok(Session {
            ticket: data.ticket,
            csrf: data.csrf,
        })
    }

    async fn session(&self, refresh: bool) -> Result<Session> {
        let mut guard = self.session.lock().await;
        if !refresh {
            if let Some(session) = guard.as_ref() {
                return Ok(session.clone());
            }
        }
        let session = self.login().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn send(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method.into(), &url)
            .header("Cookie", format!("PVEAuthCookie={}", session.ticket));
        if method.is_mutation() {
            req = req.header("CSRFPreventionToken", &session.csrf);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }
}

#[async_trait]
impl ControlPlane for PveClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        tracing::trace!(%method, path, "Control-plane request");

        let session = self.session(false).await?;
        let mut resp = self.send(&session, method, path, body.as_ref()).await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::debug!(path, "Ticket rejected, logging in again");
            let session = self.session(true).await?;
            resp = self.send(&session, method, path, body.as_ref()).await?;
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PveError::Api {
                method,
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        let mut envelope: Value =
            serde_json::from_str(&text).map_err(|source| PveError::Decode {
                path: path.to_string(),
                source,
            })?;
        Ok(envelope
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

impl fmt::Debug for PveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PveClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_mutation() {
        assert!(!Method::Get.is_mutation());
        assert!(Method::Post.is_mutation());
        assert!(Method::Put.is_mutation());
        assert!(Method::Delete.is_mutation());
    }

    #[test]
    fn test_client_base_url() {
        let client = PveClient::new("10.0.0.5", 8006, "root@pam", "secret", false).unwrap();
        assert_eq!(client.base_url(), "https://10.0.0.5:8006/api2/json");
    }

    #[test]
    fn test_client_debug_hides_password() {
        let client = PveClient::new("10.0.0.5", 8006, "root@pam", "hunter2", true).unwrap();
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("root@pam"));
    }
}
