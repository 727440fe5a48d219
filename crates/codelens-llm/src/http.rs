//! Shared HTTP client construction for consistent timeout and TLS configuration.

use std::time::Duration;

use crate::error::LlmError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the HTTP client used by providers.
///
/// Config: 10s connect timeout, caller-supplied request timeout, rustls TLS,
/// `codelens/{version}` user-agent, redirect limit 10.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub(crate) fn build_client(request_timeout: Duration) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .user_agent(concat!("codelens/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(LlmError::Http)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_short_timeout() {
        assert!(build_client(Duration::from_millis(50)).is_ok());
    }
}
