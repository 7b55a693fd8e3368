use std::io::Write;
use std::time::Duration;

use reqwest::StatusCode;

use super::retry::TransferError;
use crate::error::{Error, Result};

/// Streams the body at `url` into `out`, returning the byte count.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str, out: &mut dyn Write) -> std::result::Result<u64, TransferError>;
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        // Only connecting is bounded; large tarballs may legitimately take a long time.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(None::<Duration>)
            .user_agent(concat!("tcb/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, out: &mut dyn Write) -> std::result::Result<u64, TransferError> {
        let mut res = self
            .client
            .get(url)
            .send()
            .map_err(|e| TransferError::retryable(format!("request failed: {e}")))?;
        let status = res.status();
        if !status.is_success() {
            let message = format!("HTTP status {status}");
            return Err(if status_is_retryable(status) {
                TransferError::retryable(message)
            } else {
                TransferError::fatal(message)
            });
        }
        res.copy_to(out)
            .map_err(|e| TransferError::retryable(format!("HTTP body read failed: {e}")))
    }
}

/// Client errors are permanent except for timeouts and rate limiting.
pub fn status_is_retryable(status: StatusCode) -> bool {
    if status.is_client_error() {
        return status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retried() {
        assert!(!status_is_retryable(StatusCode::NOT_FOUND));
        assert!(!status_is_retryable(StatusCode::FORBIDDEN));
        assert!(status_is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(status_is_retryable(StatusCode::REQUEST_TIMEOUT));
        assert!(status_is_retryable(StatusCode::BAD_GATEWAY));
        assert!(status_is_retryable(StatusCode::SERVICE_UNAVAILABLE));
    }
}
