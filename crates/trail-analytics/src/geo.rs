// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Approximate visitor geolocation.
//!
//! Public IP geolocation services are tried one after another, each under its
//! own timeout. When every provider fails the location is inferred from the
//! visitor's timezone name. Either way the answer is cached for the lifetime
//! of the [`GeoLocator`], so a page load costs at most one round of lookups.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use trail_analytics_core::{Location, LocationAccuracy, Timestamp};

use crate::error::{AnalyticsError, Result};

pub const TIMEZONE_FALLBACK_SOURCE: &str = "timezone_fallback";

const UNKNOWN: &str = "Unknown";

/// What a provider knows about the requesting IP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoFix {
	pub ip: Option<String>,
	pub country: Option<String>,
	pub country_code: Option<String>,
	pub region: Option<String>,
	pub city: Option<String>,
	pub latitude: Option<f64>,
	pub longitude: Option<f64>,
	pub timezone: Option<String>,
	pub isp: Option<String>,
}

#[async_trait]
pub trait GeoProvider: Send + Sync {
	fn name(&self) -> &str;

	async fn lookup(&self) -> Result<GeoFix>;
}

/// The public lookup services with known response shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoService {
	IpApiCo,
	IpApiCom,
	IpInfo,
}

impl GeoService {
	pub fn name(&self) -> &'static str {
		match self {
			GeoService::IpApiCo => "ipapi.co",
			GeoService::IpApiCom => "ip-api.com",
			GeoService::IpInfo => "ipinfo.io",
		}
	}

	pub fn default_url(&self) -> &'static str {
		match self {
			GeoService::IpApiCo => "https://ipapi.co/json/",
			GeoService::IpApiCom => "http://ip-api.com/json/",
			GeoService::IpInfo => "https://ipinfo.io/json",
		}
	}

	pub fn parse(&self, body: &str) -> Result<GeoFix> {
		let fix = match self {
			GeoService::IpApiCo => serde_json::from_str::<IpApiCoResponse>(body)?.into(),
			GeoService::IpApiCom => {
				let resp: IpApiComResponse = serde_json::from_str(body)?;
				if resp.status.as_deref() == Some("fail") {
					return Err(AnalyticsError::GeoLookup {
						provider: self.name().to_string(),
						message: resp.message.unwrap_or_else(|| "lookup failed".to_string()),
					});
				}
				resp.into()
			}
			GeoService::IpInfo => serde_json::from_str::<IpInfoResponse>(body)?.into(),
		};
		Ok(fix)
	}
}

#[derive(Debug, Deserialize)]
struct IpApiCoResponse {
	ip: Option<String>,
	country_name: Option<String>,
	country_code: Option<String>,
	region: Option<String>,
	city: Option<String>,
	latitude: Option<f64>,
	longitude: Option<f64>,
	timezone: Option<String>,
	org: Option<String>,
}

impl From<IpApiCoResponse> for GeoFix {
	fn from(r: IpApiCoResponse) -> Self {
		Self {
			ip: r.ip,
			country: r.country_name,
			country_code: r.country_code,
			region: r.region,
			city: r.city,
			latitude: r.latitude,
			longitude: r.longitude,
			timezone: r.timezone,
			isp: r.org,
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiComResponse {
	status: Option<String>,
	message: Option<String>,
	query: Option<String>,
	country: Option<String>,
	country_code: Option<String>,
	region_name: Option<String>,
	city: Option<String>,
	lat: Option<f64>,
	lon: Option<f64>,
	timezone: Option<String>,
	isp: Option<String>,
}

impl From<IpApiComResponse> for GeoFix {
	fn from(r: IpApiComResponse) -> Self {
		Self {
			ip: r.query,
			country: r.country,
			country_code: r.country_code,
			region: r.region_name,
			city: r.city,
			latitude: r.lat,
			longitude: r.lon,
			timezone: r.timezone,
			isp: r.isp,
		}
	}
}

#[derive(Debug, Deserialize)]
struct IpInfoResponse {
	ip: Option<String>,
	country: Option<String>,
	region: Option<String>,
	city: Option<String>,
	loc: Option<String>,
	timezone: Option<String>,
	org: Option<String>,
}

impl From<IpInfoResponse> for GeoFix {
	fn from(r: IpInfoResponse) -> Self {
		let (latitude, longitude) = r
			.loc
			.as_deref()
			.and_then(|loc| loc.split_once(','))
			.map(|(lat, lon)| (lat.trim().parse().ok(), lon.trim().parse().ok()))
			.unwrap_or((None, None));

		Self {
			ip: r.ip,
			// ipinfo only reports the ISO code
			country_code: r.country.clone(),
			country: r.country,
			region: r.region,
			city: r.city,
			latitude,
			longitude,
			timezone: r.timezone,
			isp: r.org,
		}
	}
}

/// A [`GeoService`] queried over HTTP.
pub struct HttpGeoProvider {
	service: GeoService,
	url: String,
	client: reqwest::Client,
}

impl HttpGeoProvider {
	pub fn new(service: GeoService, client: reqwest::Client) -> Self {
		Self::with_url(service, service.default_url(), client)
	}

	pub fn with_url(service: GeoService, url: impl Into<String>, client: reqwest::Client) -> Self {
		Self {
			service,
			url: url.into(),
			client,
		}
	}
}

#[async_trait]
impl GeoProvider for HttpGeoProvider {
	fn name(&self) -> &str {
		self.service.name()
	}

	async fn lookup(&self) -> Result<GeoFix> {
		let response = self.client.get(&self.url).send().await?;
		let status = response.status();
		if !status.is_success() {
			return Err(AnalyticsError::GeoLookup {
				provider: self.name().to_string(),
				message: format!("HTTP {status}"),
			});
		}

		let body = response.text().await?;
		self.service.parse(&body)
	}
}

/// The standard provider chain, in lookup order.
pub fn default_providers(client: reqwest::Client) -> Vec<Arc<dyn GeoProvider>> {
	[GeoService::IpApiCo, GeoService::IpApiCom, GeoService::IpInfo]
		.into_iter()
		.map(|service| Arc::new(HttpGeoProvider::new(service, client.clone())) as Arc<dyn GeoProvider>)
		.collect()
}

/// Resolves and caches the visitor's location.
pub struct GeoLocator {
	providers: Vec<Arc<dyn GeoProvider>>,
	timeout: Duration,
	anonymize_ip: bool,
	cache: Mutex<Option<Location>>,
}

impl GeoLocator {
	pub fn new(providers: Vec<Arc<dyn GeoProvider>>, timeout: Duration) -> Self {
		Self {
			providers,
			timeout,
			anonymize_ip: false,
			cache: Mutex::new(None),
		}
	}

	pub fn with_anonymize_ip(mut self, anonymize_ip: bool) -> Self {
		self.anonymize_ip = anonymize_ip;
		self
	}

	/// Always yields a location; falls back to the timezone table when every
	/// provider fails or times out.
	pub async fn locate(&self, timezone_name: &str, now: Timestamp) -> Location {
		let mut cache = self.cache.lock().await;
		if let Some(location) = cache.as_ref() {
			return location.clone();
		}

		let location = match self.lookup_providers(now).await {
			Some(location) => location,
			None => {
				debug!(timezone = timezone_name, "all geolocation providers failed, using timezone");
				fallback_from_timezone(timezone_name, now)
			}
		};

		*cache = Some(location.clone());
		location
	}

	async fn lookup_providers(&self, now: Timestamp) -> Option<Location> {
		for provider in &self.providers {
			match self.lookup_bounded(provider.as_ref()).await {
				Ok(fix) => {
					info!(provider = provider.name(), "location resolved");
					return Some(self.location_from(provider.name(), fix, now));
				}
				Err(e) => {
					warn!(provider = provider.name(), error = %e, "geolocation provider failed");
				}
			}
		}
		None
	}

	async fn lookup_bounded(&self, provider: &dyn GeoProvider) -> Result<GeoFix> {
		tokio::time::timeout(self.timeout, provider.lookup())
			.await
			.map_err(|_| AnalyticsError::Timeout {
				operation: format!("{} lookup", provider.name()),
				timeout_ms: self.timeout.as_millis() as u64,
			})?
	}

	fn location_from(&self, source: &str, fix: GeoFix, now: Timestamp) -> Location {
		let ip = match fix.ip {
			Some(ip) if self.anonymize_ip => Some(mask_ip(&ip)),
			other => other,
		};

		Location {
			ip,
			country: fix.country,
			country_code: fix.country_code,
			region: fix.region,
			city: fix.city,
			latitude: fix.latitude,
			longitude: fix.longitude,
			timezone: fix.timezone,
			isp: fix.isp,
			source: source.to_string(),
			accuracy: LocationAccuracy::City,
			timestamp: now,
		}
	}
}

/// Coarse location implied by a timezone name.
pub fn fallback_from_timezone(timezone_name: &str, now: Timestamp) -> Location {
	let (country, region, city) = match timezone_name {
		"Asia/Shanghai" => ("China", "Asia", "Shanghai"),
		"Asia/Beijing" => ("China", "Asia", "Beijing"),
		"America/New_York" => ("United States", "North America", "New York"),
		"America/Los_Angeles" => ("United States", "North America", "Los Angeles"),
		"Europe/London" => ("United Kingdom", "Europe", "London"),
		"Europe/Paris" => ("France", "Europe", "Paris"),
		"Asia/Tokyo" => ("Japan", "Asia", "Tokyo"),
		"Asia/Seoul" => ("South Korea", "Asia", "Seoul"),
		_ => (UNKNOWN, UNKNOWN, UNKNOWN),
	};

	Location {
		ip: None,
		country: Some(country.to_string()),
		country_code: None,
		region: Some(region.to_string()),
		city: Some(city.to_string()),
		latitude: None,
		longitude: None,
		timezone: Some(timezone_name.to_string()),
		isp: None,
		source: TIMEZONE_FALLBACK_SOURCE.to_string(),
		accuracy: LocationAccuracy::Timezone,
		timestamp: now,
	}
}

/// Drops the host part of an IP address.
///
/// IPv4 keeps three octets (`a.b.c.xxx`); IPv6 keeps four groups
/// (`a:b:c:d::xxxx`). Anything else is returned unchanged.
pub fn mask_ip(ip: &str) -> String {
	if ip.contains('.') {
		let parts: Vec<&str> = ip.split('.').collect();
		if parts.len() == 4 {
			return format!("{}.{}.{}.xxx", parts[0], parts[1], parts[2]);
		}
	}

	if ip.contains(':') {
		let parts: Vec<&str> = ip.split(':').collect();
		if parts.len() > 4 {
			return format!("{}::xxxx", parts[..4].join(":"));
		}
	}

	ip.to_string()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	struct StaticProvider {
		name: &'static str,
		delay: Duration,
		fix: Option<GeoFix>,
		calls: AtomicUsize,
	}

	impl StaticProvider {
		fn ok(name: &'static str, city: &str) -> Self {
			Self {
				name,
				delay: Duration::ZERO,
				fix: Some(GeoFix {
					ip: Some("203.0.113.7".into()),
					city: Some(city.into()),
					..Default::default()
				}),
				calls: AtomicUsize::new(0),
			}
		}

		fn failing(name: &'static str) -> Self {
			Self {
				name,
				delay: Duration::ZERO,
				fix: None,
				calls: AtomicUsize::new(0),
			}
		}

		fn hanging(name: &'static str) -> Self {
			Self {
				name,
				delay: Duration::from_secs(60),
				fix: None,
				calls: AtomicUsize::new(0),
			}
		}
	}

	#[async_trait]
	impl GeoProvider for StaticProvider {
		fn name(&self) -> &str {
			self.name
		}

		async fn lookup(&self) -> Result<GeoFix> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			tokio::time::sleep(self.delay).await;
			self.fix.clone().ok_or_else(|| AnalyticsError::GeoLookup {
				provider: self.name.to_string(),
				message: "unavailable".to_string(),
			})
		}
	}

	#[tokio::test]
	async fn falls_through_to_next_provider() {
		let first = Arc::new(StaticProvider::failing("first"));
		let second = Arc::new(StaticProvider::ok("second", "Lisbon"));
		let locator = GeoLocator::new(vec![first.clone(), second.clone()], Duration::from_secs(3));

		let location = locator.locate("Europe/Lisbon", 10).await;
		assert_eq!(location.source, "second");
		assert_eq!(location.city.as_deref(), Some("Lisbon"));
		assert_eq!(location.accuracy, LocationAccuracy::City);
		assert_eq!(first.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn hanging_provider_reports_timeout() {
		let locator = GeoLocator::new(Vec::new(), Duration::from_secs(3));
		let err = locator
			.lookup_bounded(&StaticProvider::hanging("slow"))
			.await
			.unwrap_err();
		assert!(matches!(
			err,
			AnalyticsError::Timeout { ref operation, timeout_ms: 3_000 } if operation == "slow lookup"
		));
	}

	#[tokio::test]
	async fn result_is_cached() {
		let provider = Arc::new(StaticProvider::ok("only", "Oslo"));
		let locator = GeoLocator::new(vec![provider.clone()], Duration::from_secs(3));

		let a = locator.locate("Europe/Oslo", 1).await;
		let b = locator.locate("Europe/Oslo", 2).await;
		assert_eq!(a, b);
		assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn all_timeouts_fall_back_within_bound() {
		let providers: Vec<Arc<dyn GeoProvider>> = vec![
			Arc::new(StaticProvider::hanging("a")),
			Arc::new(StaticProvider::hanging("b")),
			Arc::new(StaticProvider::hanging("c")),
		];
		let locator = GeoLocator::new(providers, Duration::from_secs(3));

		let started = tokio::time::Instant::now();
		let location = locator.locate("Asia/Tokyo", 5).await;
		let elapsed = started.elapsed();

		assert!(location.is_fallback());
		assert_eq!(location.source, TIMEZONE_FALLBACK_SOURCE);
		assert_eq!(location.country.as_deref(), Some("Japan"));
		assert!(elapsed >= Duration::from_secs(9));
		assert!(elapsed < Duration::from_millis(9_500));
	}

	#[tokio::test]
	async fn fallback_is_cached_too() {
		let provider = Arc::new(StaticProvider::failing("down"));
		let locator = GeoLocator::new(vec![provider.clone()], Duration::from_secs(1));

		locator.locate("Mars/Base", 1).await;
		let location = locator.locate("Mars/Base", 2).await;
		assert_eq!(location.city.as_deref(), Some("Unknown"));
		assert_eq!(location.timestamp, 1);
		assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn anonymize_masks_resolved_ip() {
		let locator = GeoLocator::new(
			vec![Arc::new(StaticProvider::ok("p", "Paris"))],
			Duration::from_secs(3),
		)
		.with_anonymize_ip(true);

		let location = locator.locate("Europe/Paris", 1).await;
		assert_eq!(location.ip.as_deref(), Some("203.0.113.xxx"));
	}

	#[test]
	fn fallback_table_covers_known_zones() {
		let loc = fallback_from_timezone("America/New_York", 0);
		assert_eq!(loc.country.as_deref(), Some("United States"));
		assert_eq!(loc.region.as_deref(), Some("North America"));
		assert_eq!(loc.city.as_deref(), Some("New York"));
		assert_eq!(loc.timezone.as_deref(), Some("America/New_York"));
		assert!(loc.is_fallback());
	}

	#[test]
	fn mask_ip_variants() {
		assert_eq!(mask_ip("192.168.1.42"), "192.168.1.xxx");
		assert_eq!(mask_ip("2001:db8:85a3:0:0:8a2e:370:7334"), "2001:db8:85a3:0::xxxx");
		assert_eq!(mask_ip("::1"), "::1");
		assert_eq!(mask_ip("not-an-ip"), "not-an-ip");
	}

	#[test]
	fn ipinfo_splits_loc() {
		let fix = GeoService::IpInfo
			.parse(r#"{"ip":"1.2.3.4","country":"DE","city":"Berlin","loc":"52.52,13.40","org":"AS1 Example"}"#)
			.unwrap();
		assert_eq!(fix.country_code.as_deref(), Some("DE"));
		assert_eq!(fix.latitude, Some(52.52));
		assert_eq!(fix.longitude, Some(13.40));
		assert_eq!(fix.isp.as_deref(), Some("AS1 Example"));
	}

	#[test]
	fn ip_api_com_failure_status_is_an_error() {
		let err = GeoService::IpApiCom
			.parse(r#"{"status":"fail","message":"reserved range"}"#)
			.unwrap_err();
		assert!(matches!(err, AnalyticsError::GeoLookup { ref message, .. } if message == "reserved range"));
	}

	#[tokio::test]
	async fn http_provider_parses_ipapi_co() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/json/"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"ip": "198.51.100.10",
				"country_name": "Canada",
				"country_code": "CA",
				"region": "Ontario",
				"city": "Toronto",
				"latitude": 43.65,
				"longitude": -79.38,
				"timezone": "America/Toronto",
				"org": "Example ISP"
			})))
			.mount(&server)
			.await;

		let provider = HttpGeoProvider::with_url(
			GeoService::IpApiCo,
			format!("{}/json/", server.uri()),
			reqwest::Client::new(),
		);
		let fix = provider.lookup().await.unwrap();
		assert_eq!(fix.country.as_deref(), Some("Canada"));
		assert_eq!(fix.city.as_deref(), Some("Toronto"));
		assert_eq!(fix.isp.as_deref(), Some("Example ISP"));
	}

	#[tokio::test]
	async fn http_provider_rejects_error_status() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(503))
			.mount(&server)
			.await;

		let provider =
			HttpGeoProvider::with_url(GeoService::IpInfo, server.uri(), reqwest::Client::new());
		assert!(matches!(
			provider.lookup().await,
			Err(AnalyticsError::GeoLookup { .. })
		));
	}
}
