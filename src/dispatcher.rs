//! Reload dispatcher (spec.md §4.5): calls the proxy's reload endpoint with
//! a bounded timeout and classifies the outcome.

use std::time::Duration;

use crate::err::DispatchError;

const RELOAD_PATH: &str = "/.varnish-ghost/reload";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const GHOST_ERROR_HEADER: &str = "x-ghost-error";

/// HTTP client reused across reload calls, as spec.md §5 requires.
#[derive(Clone)]
pub struct ReloadDispatcher {
    client: reqwest::Client,
}

impl ReloadDispatcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reload dispatcher HTTP client configuration is valid");
        ReloadDispatcher { client }
    }

    /// Send `GET http://{proxy_addr}/.varnish-ghost/reload`. HTTP 200 is
    /// success; any other status is a failure whose message comes from the
    /// `x-ghost-error` response header when present. Connection errors,
    /// timeouts, and caller cancellation are also failures.
    pub async fn dispatch(
        &self,
        proxy_addr: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), DispatchError> {
        let url = format!("http://{proxy_addr}{RELOAD_PATH}");
        let request = self.client.get(url).send();

        let response = tokio::select! {
            result = request => result?,
            () = cancel.cancelled() => return Err(DispatchError::Cancelled),
        };

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status().as_u16();
        let message = response
            .headers()
            .get(GHOST_ERROR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| format!("proxy returned status {status}"));
        Err(DispatchError::NonSuccess { status, message })
    }
}

impl Default for ReloadDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
