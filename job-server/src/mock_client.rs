use std::time::Duration;

use termination::{TerminationRequest, Trigger};
use tracing::{error, info};

/// Simulates one caller followed by an operator asking the server to stop: wait, send a
/// request, wait again, then fire the termination trigger.
pub struct MockClient {
    url: String,
    request_delay: Duration,
    trigger_delay: Duration,
    trigger: Trigger,
}

impl MockClient {
    pub fn new(
        url: String,
        request_delay: Duration,
        trigger_delay: Duration,
        trigger: Trigger,
    ) -> Self {
        Self {
            url,
            request_delay,
            trigger_delay,
            trigger,
        }
    }

    /// A failed request is logged and the trigger still fires, so the demo always ends.
    pub async fn run(self) {
        tokio::time::sleep(self.request_delay).await;

        info!(role = "client", url = %self.url, "sending request");
        match self.request().await {
            Ok(body) => info!(role = "client", %body, "received response"),
            Err(e) => error!(role = "client", error = %e, "request failed"),
        }

        tokio::time::sleep(self.trigger_delay).await;

        info!(role = "client", "requesting termination");
        self.trigger.fire(TerminationRequest::Programmatic);
    }

    async fn request(&self) -> Result<String, reqwest::Error> {
        reqwest::get(&self.url)
            .await?
            .error_for_status()?
            .text()
            .await
    }
}
