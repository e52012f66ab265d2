// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wire payloads sent to the collection endpoint.

use serde::{Deserialize, Serialize};

use crate::event::{EnrichedEvent, Timestamp};
use crate::session::{SessionId, SessionInfo};
use crate::user::UserInfo;

/// Delivery counters carried with every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
	pub total_events: u64,
	pub sent_events: u64,
	pub failed_events: u64,
	pub timestamp: Timestamp,
}

/// A batched POST to the collection endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
	pub session_id: SessionId,
	pub user_info: Option<UserInfo>,
	pub session_info: Option<SessionInfo>,
	pub events: Vec<EnrichedEvent>,
	pub metadata: BatchMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeaconKind {
	FinalFlush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconMetadata {
	#[serde(rename = "type")]
	pub kind: BeaconKind,
	pub timestamp: Timestamp,
}

/// The best-effort payload sent while the page is being torn down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconPayload {
	pub session_id: SessionId,
	pub events: Vec<EnrichedEvent>,
	pub metadata: BeaconMetadata,
}

impl BeaconPayload {
	pub fn final_flush(session_id: SessionId, events: Vec<EnrichedEvent>, timestamp: Timestamp) -> Self {
		Self {
			session_id,
			events,
			metadata: BeaconMetadata {
				kind: BeaconKind::FinalFlush,
				timestamp,
			},
		}
	}
}
