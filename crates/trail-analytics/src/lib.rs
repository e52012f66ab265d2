// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Visit telemetry pipeline for Trail.
//!
//! This crate provides:
//! - [`Collector`]: visitor, device, geolocation and session snapshots
//! - [`Tracker`]: section dwell time, scroll depth, clicks and activity
//! - [`Sender`]: buffering, batching, retry with backoff and offline storage
//! - [`Analytics`]: the facade that wires them together for one visit
//! - [`Ga4Adapter`]: a Google Analytics 4 sink fed from the same event bus
//!
//! # Example
//!
//! ```no_run
//! use trail_analytics::{Analytics, HostSignal};
//! use trail_analytics_core::{AnalyticsConfigLayer, PageContext};
//!
//! # async fn run() -> Result<(), trail_analytics::AnalyticsError> {
//! let analytics = Analytics::builder(AnalyticsConfigLayer::default().finalize()).build()?;
//! let page = PageContext::new("https://example.org/").with_title("Home");
//!
//! analytics.init(&page).await;
//! analytics.track_section_change("publications");
//! analytics.handle_signal(HostSignal::BeforeUnload).await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod clock;
pub mod collector;
pub mod controller;
pub mod error;
pub mod ga4;
pub mod gate;
pub mod geo;
pub mod offline;
pub mod properties;
pub mod sender;
pub mod storage;
pub mod tracker;
pub mod transport;

pub use bus::{EventBus, EventSubscriber, SectionTransition};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use collector::Collector;
pub use controller::{Analytics, AnalyticsBuilder, HostSignal, SessionStats};
pub use error::{AnalyticsError, Result, StorageError};
pub use ga4::{Ga4Adapter, Ga4Event, Ga4Request, Ga4SessionStats, Ga4Sink, MeasurementProtocolSink};
pub use gate::{GateOutcome, InteractionGate};
pub use geo::{GeoFix, GeoLocator, GeoProvider, GeoService, HttpGeoProvider};
pub use offline::OfflineStore;
pub use properties::Properties;
pub use sender::{Sender, SenderConfig, SenderDeps, SenderStats};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use tracker::{Tracker, TrackerConfig, TrackingState};
pub use transport::{Beacon, HttpBeacon, HttpTransport, LogTransport, Transport};

#[cfg(test)]
pub(crate) mod test_support {
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
	use std::sync::Mutex;
	use std::time::Duration;

	use async_trait::async_trait;
	use trail_analytics_core::{
		BatchPayload, BeaconPayload, EnrichedEvent, EventId, EventKind, EventRecord, PageInfo,
		SessionId, Viewport,
	};

	use crate::bus::{EventSubscriber, SectionTransition};
	use crate::error::{AnalyticsError, Result};
	use crate::transport::{Beacon, Transport};

	pub fn custom_event(name: &str) -> EnrichedEvent {
		EnrichedEvent {
			record: EventRecord::new(
				EventKind::Custom {
					event_name: name.to_string(),
					properties: serde_json::json!({}),
				},
				1_700_000_000_000,
			),
			session_id: SessionId::from("session_1700000000000_test00000"),
			url: "https://example.org/".to_string(),
			user_agent: "Mozilla/5.0".to_string(),
			event_id: EventId::new(),
			page_info: PageInfo {
				title: "Home".to_string(),
				url: "https://example.org/".to_string(),
				referrer: String::new(),
				viewport: Viewport {
					width: 1280,
					height: 800,
				},
			},
			performance: None,
		}
	}

	/// Collects everything published on a bus.
	#[derive(Default)]
	pub struct RecordingSubscriber {
		events: Mutex<Vec<EventRecord>>,
		transitions: Mutex<Vec<SectionTransition>>,
	}

	impl RecordingSubscriber {
		pub fn events(&self) -> Vec<EventRecord> {
			self.events.lock().unwrap().clone()
		}

		pub fn names(&self) -> Vec<String> {
			self.events().iter().map(|e| e.name().to_string()).collect()
		}

		pub fn transitions(&self) -> Vec<SectionTransition> {
			self.transitions.lock().unwrap().clone()
		}
	}

	impl EventSubscriber for RecordingSubscriber {
		fn on_event(&self, event: &EventRecord) {
			self.events.lock().unwrap().push(event.clone());
		}

		fn on_section_change(&self, transition: &SectionTransition) {
			self.transitions.lock().unwrap().push(transition.clone());
		}
	}

	/// Records delivered batches; fails every send while `should_fail` is set.
	#[derive(Default)]
	pub struct MockTransport {
		batches: Mutex<Vec<BatchPayload>>,
		attempts: AtomicUsize,
		should_fail: AtomicBool,
		latency: Option<Duration>,
	}

	impl MockTransport {
		/// A transport whose sends take `latency` to complete.
		pub fn slow(latency: Duration) -> Self {
			Self {
				latency: Some(latency),
				..Default::default()
			}
		}

		pub fn set_should_fail(&self, fail: bool) {
			self.should_fail.store(fail, Ordering::SeqCst);
		}

		/// Successfully delivered batches.
		pub fn batches(&self) -> Vec<BatchPayload> {
			self.batches.lock().unwrap().clone()
		}

		pub fn attempts(&self) -> usize {
			self.attempts.load(Ordering::SeqCst)
		}
	}

	#[async_trait]
	impl Transport for MockTransport {
		async fn send(&self, payload: &BatchPayload) -> Result<()> {
			self.attempts.fetch_add(1, Ordering::SeqCst);
			if let Some(latency) = self.latency {
				tokio::time::sleep(latency).await;
			}
			if self.should_fail.load(Ordering::SeqCst) {
				return Err(AnalyticsError::ServerError {
					status: 500,
					message: "mock failure".to_string(),
				});
			}
			self.batches.lock().unwrap().push(payload.clone());
			Ok(())
		}
	}

	pub struct MockBeacon {
		accept: bool,
		payloads: Mutex<Vec<BeaconPayload>>,
	}

	impl MockBeacon {
		pub fn accepting() -> Self {
			Self {
				accept: true,
				payloads: Mutex::new(Vec::new()),
			}
		}

		pub fn refusing() -> Self {
			Self {
				accept: false,
				payloads: Mutex::new(Vec::new()),
			}
		}

		/// Payloads the beacon accepted.
		pub fn payloads(&self) -> Vec<BeaconPayload> {
			self.payloads.lock().unwrap().clone()
		}
	}

	impl Beacon for MockBeacon {
		fn send_beacon(&self, payload: &BeaconPayload) -> bool {
			if self.accept {
				self.payloads.lock().unwrap().push(payload.clone());
			}
			self.accept
		}
	}
}
