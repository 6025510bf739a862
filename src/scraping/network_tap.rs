//! Passive capture of the record-listing endpoint's response bodies.

use crate::sync::network::{NetworkBuffer, RawResponse};
use anyhow::{anyhow, Result};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFinished, EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use regex::Regex;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn short_url(raw: &str) -> String {
    url::Url::parse(raw)
        .map(|u| format!("{}{}", u.host_str().unwrap_or_default(), u.path()))
        .unwrap_or_else(|_| raw.to_string())
}

pub struct NetworkTap {
    buffer: NetworkBuffer,
    task: JoinHandle<()>,
}

impl NetworkTap {
    /// Enable the Network domain and start buffering bodies of responses
    /// whose URL matches `pattern`.
    pub async fn attach(page: &Page, pattern: Regex, buffer: NetworkBuffer) -> Result<Self> {
        page.execute(EnableParams::default())
            .await
            .map_err(|e| anyhow!("Failed to enable Network domain: {}", e))?;
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| anyhow!("Failed to listen for responses: {}", e))?;
        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(|e| anyhow!("Failed to listen for loading events: {}", e))?;

        info!("network tap on /{}/", pattern.as_str());
        let page = page.clone();
        let sink = buffer.clone();
        let task = tokio::spawn(async move {
            // Body is only retrievable once loading finished.
            let mut pending: HashMap<String, String> = HashMap::new();
            loop {
                tokio::select! {
                    Some(event) = responses.next() => {
                        if pattern.is_match(&event.response.url) {
                            pending.insert(event.request_id.inner().clone(), event.response.url.clone());
                        }
                    }
                    Some(event) = finished.next() => {
                        let Some(url) = pending.remove(event.request_id.inner()) else {
                            continue;
                        };
                        match page.execute(GetResponseBodyParams::new(event.request_id.clone())).await {
                            Ok(body) => {
                                debug!("captured {} ({} bytes)", short_url(&url), body.result.body.len());
                                sink.push(RawResponse {
                                    url,
                                    body: body.result.body.clone(),
                                    base64_encoded: body.result.base64_encoded,
                                    received_at: chrono::Utc::now().timestamp_millis(),
                                });
                            }
                            Err(e) => warn!("body of {} unavailable: {}", short_url(&url), e),
                        }
                    }
                    else => break,
                }
            }
        });

        Ok(Self { buffer, task })
    }

    pub fn buffer(&self) -> &NetworkBuffer {
        &self.buffer
    }

    pub fn detach(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_url() {
        assert_eq!(
            short_url("https://api.example.com/v1/inbox/messages?cursor=abc"),
            "api.example.com/v1/inbox/messages"
        );
        assert_eq!(short_url("not a url"), "not a url");
    }
}
