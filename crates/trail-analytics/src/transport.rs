// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivery of batches to the collection endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info, warn};
use trail_analytics_core::{BatchPayload, BeaconPayload, EnrichedEvent, EventKind};
use url::Url;

use crate::error::{AnalyticsError, Result};

/// Sends one batch. Any error sends the batch down the retry path.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn send(&self, payload: &BatchPayload) -> Result<()>;
}

/// POSTs batches as JSON.
pub struct HttpTransport {
	client: reqwest::Client,
	endpoint: Url,
}

impl HttpTransport {
	pub fn new(client: reqwest::Client, endpoint: &str) -> Result<Self> {
		let endpoint = Url::parse(endpoint)
			.map_err(|e| AnalyticsError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
		Ok(Self { client, endpoint })
	}

	pub fn endpoint(&self) -> &Url {
		&self.endpoint
	}
}

#[async_trait]
impl Transport for HttpTransport {
	async fn send(&self, payload: &BatchPayload) -> Result<()> {
		debug!(
			endpoint = %self.endpoint,
			events = payload.events.len(),
			"sending analytics batch"
		);

		let response = self
			.client
			.post(self.endpoint.clone())
			.json(payload)
			.send()
			.await?;

		let status = response.status();
		if status.is_success() {
			return Ok(());
		}

		if status == StatusCode::TOO_MANY_REQUESTS {
			let retry_after_secs = response
				.headers()
				.get(reqwest::header::RETRY_AFTER)
				.and_then(|v| v.to_str().ok())
				.and_then(|v| v.parse().ok());
			return Err(AnalyticsError::RateLimited { retry_after_secs });
		}

		let message = response.text().await.unwrap_or_default();
		Err(AnalyticsError::ServerError {
			status: status.as_u16(),
			message,
		})
	}
}

/// Logs batches instead of sending them. Used when no endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
	async fn send(&self, payload: &BatchPayload) -> Result<()> {
		info!(
			session_id = %payload.session_id,
			events = payload.events.len(),
			sent_events = payload.metadata.sent_events,
			"analytics batch"
		);
		for event in &payload.events {
			debug!(event = event.name(), summary = %event_summary(event), "batched event");
		}
		Ok(())
	}
}

/// One-line human description of an event, for logs.
pub fn event_summary(event: &EnrichedEvent) -> String {
	match &event.record.kind {
		EventKind::PageLoad { load_time, .. } => match load_time {
			Some(ms) => format!("{ms}ms"),
			None => "load time unavailable".to_string(),
		},
		EventKind::SectionChange {
			from_section,
			to_section,
			..
		} => format!(
			"{} → {to_section}",
			from_section.as_deref().unwrap_or("none")
		),
		EventKind::ScrollDepth {
			threshold,
			actual_depth,
			..
		} => format!("{threshold}% ({actual_depth}%)"),
		EventKind::Click { element, .. } => format!("clicked <{}>", element.tag_name),
		EventKind::LinkClick { text, href, .. } => {
			format!("{text} ({})", href.as_deref().unwrap_or(""))
		}
		EventKind::NavigationClick { text, target, .. } => {
			format!("{text} → {}", target.as_deref().unwrap_or(""))
		}
		EventKind::PageFocus { inactive_time } => format!("focus after {inactive_time}ms away"),
		EventKind::PageBlur { active_time } => format!("blur after {active_time}ms active"),
		EventKind::MouseActive { inactive_time } => format!("active after {inactive_time}ms idle"),
		EventKind::KeyPress { key, .. } => format!("key {key}"),
		EventKind::Error { message, .. } => format!("error: {message}"),
		EventKind::PageUnload { time_on_page } => format!("unload after {time_on_page}ms"),
		EventKind::SessionEnd { total_duration, .. } => {
			format!("Duration: {}s", total_duration / 1000)
		}
		EventKind::Custom { event_name, .. } => format!("custom: {event_name}"),
	}
}

/// Fire-and-forget delivery used while the page is torn down.
pub trait Beacon: Send + Sync {
	/// Queues `payload`; `false` means it was not accepted.
	fn send_beacon(&self, payload: &BeaconPayload) -> bool;
}

/// POSTs the beacon payload on a detached task.
pub struct HttpBeacon {
	client: reqwest::Client,
	url: Url,
}

impl HttpBeacon {
	pub fn new(client: reqwest::Client, url: &str) -> Result<Self> {
		let url =
			Url::parse(url).map_err(|e| AnalyticsError::InvalidEndpoint(format!("{url}: {e}")))?;
		Ok(Self { client, url })
	}
}

impl Beacon for HttpBeacon {
	fn send_beacon(&self, payload: &BeaconPayload) -> bool {
		let Ok(handle) = tokio::runtime::Handle::try_current() else {
			warn!("no runtime available for beacon");
			return false;
		};
		let body = match serde_json::to_vec(payload) {
			Ok(body) => body,
			Err(e) => {
				warn!(error = %e, "failed to encode beacon payload");
				return false;
			}
		};

		let request = self
			.client
			.post(self.url.clone())
			.header(reqwest::header::CONTENT_TYPE, "application/json")
			.body(body);
		let events = payload.events.len();
		handle.spawn(async move {
			match request.send().await {
				Ok(resp) if resp.status().is_success() => debug!(events, "beacon delivered"),
				Ok(resp) => warn!(status = %resp.status(), "beacon rejected"),
				Err(e) => warn!(error = %e, "beacon failed"),
			}
		});
		true
	}
}
