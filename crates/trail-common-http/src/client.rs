// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! The reqwest client shared by the collection transport, the beacon, the
//! geolocation providers and the GA4 sink.

use reqwest::{Client, ClientBuilder};
use std::time::Duration;

const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A builder preloaded with the Trail User-Agent,
/// `trail/{os}-{arch}/{version}`.
///
/// # Example
/// ```ignore
/// let client = trail_common_http::builder()
///     .timeout(Duration::from_secs(3))
///     .build()?;
/// ```
pub fn builder() -> ClientBuilder {
	Client::builder().user_agent(user_agent())
}

/// The pipeline's default client: Trail User-Agent plus a whole-request
/// timeout.
pub fn new_client_with_timeout(timeout: Duration) -> reqwest::Result<Client> {
	builder().timeout(timeout).build()
}

pub fn user_agent() -> String {
	format!(
		"trail/{}-{}/{}",
		std::env::consts::OS,
		std::env::consts::ARCH,
		CRATE_VERSION
	)
}
