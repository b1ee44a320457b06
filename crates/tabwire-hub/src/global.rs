//! Process-wide access to the hub for code that cannot be handed one.
//!
//! Prefer passing a [`Hub`] explicitly. This exists for call sites at the
//! process boundary, such as embedding glue that only sees free functions.

use crate::Hub;
use std::sync::OnceLock;

static HUB: OnceLock<Hub> = OnceLock::new();

/// Install the process hub. Fails with the rejected hub if one is already set.
pub fn install(hub: Hub) -> Result<(), Hub> {
    HUB.set(hub)
}

pub fn get() -> Option<&'static Hub> {
    HUB.get()
}
