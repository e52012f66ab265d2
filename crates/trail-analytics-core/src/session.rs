// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Session identity and per-visit session metadata.

use serde::{Deserialize, Serialize};

use crate::event::Timestamp;
use crate::user::UserInfo;

const SESSION_PREFIX: &str = "session_";
const SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Opaque per-page-load session token.
///
/// Format: `session_<epoch-ms>_<9 base36 chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
	/// Generates a new session id for a session starting at `now_ms`.
	pub fn generate(now_ms: Timestamp) -> Self {
		let suffix: String = (0..SUFFIX_LEN)
			.map(|_| BASE36[fastrand::usize(..BASE36.len())] as char)
			.collect();
		Self(format!("{SESSION_PREFIX}{now_ms}_{suffix}"))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// The epoch-ms component, when the id was produced by [`SessionId::generate`].
	pub fn started_at(&self) -> Option<Timestamp> {
		self
			.0
			.strip_prefix(SESSION_PREFIX)?
			.split('_')
			.next()?
			.parse()
			.ok()
	}
}

impl From<&str> for SessionId {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}

impl From<String> for SessionId {
	fn from(value: String) -> Self {
		Self(value)
	}
}

impl std::fmt::Display for SessionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

/// Facts about this visit relative to earlier ones on the same origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
	pub session_id: SessionId,
	pub start_time: Timestamp,
	#[serde(rename = "startTimeISO")]
	pub start_time_iso: String,
	pub url: String,
	pub title: String,
	pub hash: String,
	pub pathname: String,
	pub search: String,
	pub is_new_session: bool,
	pub previous_session_id: Option<String>,
	pub visit_count: u64,
	pub is_returning_visitor: bool,
}

/// A page-load session. Created once, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
	pub session_id: SessionId,
	pub start_time: Timestamp,
	pub user_info: UserInfo,
	pub session_info: SessionInfo,
}

impl Session {
	pub fn duration_ms(&self, now: Timestamp) -> u64 {
		(now - self.start_time).max(0) as u64
	}
}
