// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Trail visit analytics pipeline.
//!
//! This crate holds the plain data shared by every pipeline component and by
//! anything that receives the pipeline's output:
//! - Events: [`EventRecord`], the tagged [`EventKind`] union, and the
//!   [`EnrichedEvent`] form that goes over the wire
//! - Sessions: [`SessionId`], [`Session`], [`SessionInfo`]
//! - Visitor snapshots: [`UserInfo`], [`Location`], [`DeviceType`]
//! - Host snapshots: [`PageContext`], [`LayoutSnapshot`], [`ClickEvent`], ...
//! - Host [`Capabilities`], resolved once at startup
//! - Layered configuration ([`AnalyticsConfig`], [`Ga4Config`])
//!
//! # Example
//!
//! ```
//! use trail_analytics_core::{EventKind, EventRecord};
//!
//! let record = EventRecord::new(
//!     EventKind::ScrollDepth { threshold: 50, actual_depth: 53, user_interacted: true },
//!     1_700_000_000_000,
//! )
//! .with_section(Some("publications".to_string()));
//!
//! assert_eq!(record.name(), "scroll_depth");
//! ```

pub mod capability;
pub mod config;
pub mod error;
pub mod event;
pub mod page;
pub mod payload;
pub mod session;
pub mod user;

pub use capability::{BasicCapabilities, Capabilities, Capability, CapabilityProbe};
pub use config::{
	env_layer, load_config, load_config_file, AnalyticsConfig, AnalyticsConfigLayer, Ga4Config,
	Ga4ConfigLayer, TrailConfig, TrailConfigLayer,
};
pub use error::{ConfigError, CoreError, Result};
pub use event::{
	validate_event_name, validate_properties_size, Coordinates, ElementInfo, EnrichedEvent,
	EventId, EventKind, EventRecord, MemoryInfo, PageInfo, PerformanceSnapshot, Timestamp,
	Viewport, MAX_EVENT_NAME_LENGTH, MAX_PROPERTIES_SIZE,
};
pub use page::{
	ClickEvent, ElementDescriptor, ErrorReport, KeyEvent, LayoutSnapshot, NavigationTiming,
	PageContext, PerformanceSummary, ScreenSize, SectionBounds, VisibilityInfo,
};
pub use payload::{BatchMetadata, BatchPayload, BeaconKind, BeaconMetadata, BeaconPayload};
pub use session::{Session, SessionId, SessionInfo};
pub use user::{
	ConnectionInfo, DeviceType, Location, LocationAccuracy, Timezone, UserInfo, UtmParams,
};
