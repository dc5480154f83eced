//! targetd JSON-RPC transport
//!
//! Sends one request per call over HTTP(S) with basic auth. There are no
//! retries and no client-side timeout; the caller owns both.

use super::types::{Request, Response};
use crate::config::TargetdOptions;
use crate::error::{Error, Result};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Client for a single targetd endpoint
#[derive(Debug, Clone)]
pub struct TargetdClient {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    strict_errors: bool,
}

impl TargetdClient {
    /// Create a client for the daemon described by `options`
    pub fn new(options: &TargetdOptions) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;

        Ok(Self {
            http,
            endpoint: options.endpoint(),
            username: options.username.clone(),
            password: options.password.clone(),
            strict_errors: options.strict_errors,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Invoke `method` and decode its `result` member into `R`
    pub async fn call<P, R>(&self, method: &str, params: Option<&P>) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.send(method, params).await?;
        let envelope: Response = serde_json::from_slice(&response)?;
        self.check(method, &envelope)?;

        let result = envelope.result.unwrap_or_default();
        Ok(serde_json::from_value(result)?)
    }

    /// Invoke `method` for its side effect only
    pub async fn invoke<P>(&self, method: &str, params: Option<&P>) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        let response = self.send(method, params).await?;

        // Legacy daemons are trusted once the status is OK
        if !self.strict_errors {
            return Ok(());
        }

        let envelope: Response = serde_json::from_slice(&response)?;
        self.check(method, &envelope)
    }

    async fn send<P>(&self, method: &str, params: Option<&P>) -> Result<Vec<u8>>
    where
        P: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(&Request::new(method, params))?;
        debug!("targetd call {} ({} bytes)", method, body.len());

        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, "")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Protocol {
                status: status.to_string(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }

    fn check(&self, method: &str, envelope: &Response) -> Result<()> {
        match &envelope.error {
            Some(error) if self.strict_errors => {
                debug!(
                    "targetd call {} failed with code {}: {}",
                    method, error.code, error.message
                );
                Err(Error::Rpc {
                    code: error.code,
                    message: error.message.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}
