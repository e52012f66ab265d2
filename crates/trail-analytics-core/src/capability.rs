// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Host capability detection.
//!
//! The host is probed once at startup. The resulting [`Capabilities`] set is
//! then consulted by every component instead of re-probing on each call.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A feature the host environment may or may not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
	LocalStorage,
	SessionStorage,
	IndexedDb,
	TouchSupport,
	SecureContext,
	Es6Modules,
	Performance,
	PerformanceMemory,
	Beacon,
	ServiceWorker,
	WebAssembly,
	WebGl,
	Canvas,
	WebRtc,
}

impl Capability {
	pub const ALL: [Capability; 14] = [
		Capability::LocalStorage,
		Capability::SessionStorage,
		Capability::IndexedDb,
		Capability::TouchSupport,
		Capability::SecureContext,
		Capability::Es6Modules,
		Capability::Performance,
		Capability::PerformanceMemory,
		Capability::Beacon,
		Capability::ServiceWorker,
		Capability::WebAssembly,
		Capability::WebGl,
		Capability::Canvas,
		Capability::WebRtc,
	];
}

/// Answers whether the host supports a capability.
pub trait CapabilityProbe {
	fn probe(&self, capability: Capability) -> bool;
}

impl<F> CapabilityProbe for F
where
	F: Fn(Capability) -> bool,
{
	fn probe(&self, capability: Capability) -> bool {
		self(capability)
	}
}

/// The resolved, static capability set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
	supported: BTreeSet<Capability>,
}

impl Capabilities {
	/// Probes every known capability exactly once.
	pub fn resolve(probe: &dyn CapabilityProbe) -> Self {
		Self {
			supported: Capability::ALL
				.into_iter()
				.filter(|c| probe.probe(*c))
				.collect(),
		}
	}

	pub fn all() -> Self {
		Self {
			supported: Capability::ALL.into_iter().collect(),
		}
	}

	pub fn none() -> Self {
		Self::default()
	}

	pub fn has(&self, capability: Capability) -> bool {
		self.supported.contains(&capability)
	}

	pub fn without(mut self, capability: Capability) -> Self {
		self.supported.remove(&capability);
		self
	}

	/// The reduced set reported in the visitor snapshot.
	pub fn basic(&self) -> BasicCapabilities {
		BasicCapabilities {
			local_storage: self.has(Capability::LocalStorage),
			session_storage: self.has(Capability::SessionStorage),
			touch_support: self.has(Capability::TouchSupport),
			is_secure_context: self.has(Capability::SecureContext),
			es6_modules: self.has(Capability::Es6Modules),
		}
	}
}

impl FromIterator<Capability> for Capabilities {
	fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
		Self {
			supported: iter.into_iter().collect(),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicCapabilities {
	pub local_storage: bool,
	pub session_storage: bool,
	pub touch_support: bool,
	pub is_secure_context: bool,
	pub es6_modules: bool,
}
