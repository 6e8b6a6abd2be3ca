use std::time::Duration;

use log::warn;
use reqwest::{Client, RequestBuilder};

use crate::auth::Token;
use crate::error::{CulpritError, Result};

/// Prefix Google APIs put in front of JSON bodies to defeat XSSI.
const XSSI_PREFIX: &str = ")]}'";

/// HTTP client that retries connection failures, rate limits and server
/// errors a bounded number of times.
pub struct RetryingClient {
    client: Client,
    token: Option<Token>,
    max_retries: u32,
    retry_delay: Duration,
}

impl RetryingClient {
    pub fn new(token: Option<Token>, max_retries: u32, retry_delay: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("culprit-finder/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CulpritError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            token,
            max_retries,
            retry_delay,
        })
    }

    fn auth_request(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token.as_str())
        } else {
            request
        }
    }

    /// Sends the request built by `build_request`, retrying where it makes
    /// sense, and returns the body with any XSSI prefix removed.
    pub async fn send<F>(&self, build_request: F) -> Result<String>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut retry_count = 0;
        loop {
            let request = self.auth_request(build_request(&self.client));

            let response = match request.send().await {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    if retry_count >= self.max_retries {
                        return Err(e.into());
                    }
                    warn!(
                        "Network error ({}), retrying in {}s ({}/{})...",
                        e,
                        self.retry_delay.as_secs(),
                        retry_count + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();

            if status == 429 || status.is_server_error() {
                if retry_count >= self.max_retries {
                    return Err(CulpritError::ApiAfterRetries {
                        status: status.as_u16(),
                        retries: self.max_retries,
                    });
                }

                warn!(
                    "API error (status {status}). Waiting {} seconds before retry {}/{}...",
                    self.retry_delay.as_secs(),
                    retry_count + 1,
                    self.max_retries
                );

                tokio::time::sleep(self.retry_delay).await;
                retry_count += 1;
                continue;
            }

            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read error response".to_string());
                return Err(CulpritError::Api {
                    status: status.as_u16(),
                    message: error_text,
                });
            }

            let body = response.text().await?;
            return Ok(strip_xssi_prefix(&body).to_string());
        }
    }
}

fn strip_xssi_prefix(body: &str) -> &str {
    body.strip_prefix(XSSI_PREFIX)
        .map_or(body, str::trim_start)
}
