// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Drives the pipeline through one simulated visit.
//!
//! ```sh
//! RUST_LOG=debug cargo run -p trail-analytics --example simulate_visit -- trail.toml
//! ```
//!
//! Without an `endpoint` in the config, batches are written to the log.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trail_analytics::{
	Analytics, FileStore, Ga4Adapter, HostSignal, KeyValueStore, MeasurementProtocolSink,
	MemoryStore, Properties, SystemClock,
};
use trail_analytics_core::{
	load_config, ClickEvent, ElementDescriptor, KeyEvent, LayoutSnapshot, PageContext,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let config_path = std::env::args().nth(1).map(PathBuf::from);
	let config = load_config(config_path.as_deref())?;

	let store: Arc<dyn KeyValueStore> = match FileStore::from_xdg() {
		Ok(store) => {
			info!(path = %store.path().display(), "using file store");
			Arc::new(store)
		}
		Err(e) => {
			warn!(error = %e, "falling back to in-memory store");
			Arc::new(MemoryStore::new())
		}
	};

	let client = trail_common_http::new_client_with_timeout(config.analytics.request_timeout())?;
	let analytics = Analytics::builder(config.analytics.clone())
		.store(store)
		.http_client(client.clone())
		.build()?;

	let layout = LayoutSnapshot::new(0.0, 900.0, 5200.0)
		.with_section("page-top", 0.0)
		.with_section("publications", 1100.0)
		.with_section("awards", 3000.0)
		.with_section("service", 4200.0);
	let page = PageContext::new("https://example.org/")
		.with_title("Homepage")
		.with_user_agent("Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0")
		.with_screen(1920, 1080)
		.with_timezone("Asia/Shanghai", 480)
		.with_layout(layout.clone());

	let ga4 = if config.ga4.enabled {
		let sink = MeasurementProtocolSink::new(client, &config.ga4)?;
		let ga4 = Ga4Adapter::new(config.ga4.clone(), Arc::new(sink), Arc::new(SystemClock));
		ga4.init(&page);
		analytics.bus().subscribe(Arc::new(ga4.clone()));
		Some(ga4)
	} else {
		None
	};

	let click = ClickEvent::on(ElementDescriptor::new("a").with_class("nav-link").with_href("#publications"))
		.at(640.0, 32.0);
	let init = {
		let analytics = analytics.clone();
		let page = page.clone();
		tokio::spawn(async move { analytics.init(&page).await })
	};
	analytics.handle_signal(HostSignal::Click(click)).await;
	if !init.await? {
		info!("analytics disabled, nothing to simulate");
		return Ok(());
	}

	for scroll_y in [600.0, 1400.0, 2600.0, 3400.0] {
		tokio::time::sleep(Duration::from_millis(600)).await;
		analytics
			.handle_signal(HostSignal::Scroll(layout.scrolled_to(scroll_y)))
			.await;
	}

	analytics.handle_signal(HostSignal::KeyDown(KeyEvent::new("End"))).await;
	analytics.track_link_click("https://arxiv.org/abs/2401.00001", "Preprint", Some("publication"));
	analytics.track_custom_event(
		"cv_download",
		Properties::new().insert("format", "pdf"),
	)?;
	analytics.track_section_change("service");

	if let Some(stats) = analytics.session_stats() {
		info!(
			session_id = %stats.session_id,
			duration_ms = stats.duration,
			total_events = stats.total_events,
			sections = ?stats.section_times,
			"session stats"
		);
	}

	analytics.handle_signal(HostSignal::BeforeUnload).await;
	analytics.destroy();
	if let Some(ga4) = ga4 {
		ga4.destroy().await;
	}
	tokio::time::sleep(Duration::from_millis(200)).await;
	Ok(())
}
