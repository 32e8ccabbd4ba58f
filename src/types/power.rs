//! Power state for bulb control.

use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Power state for a bulb.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Power {
    /// Turn the bulb on
    On,
    /// Turn the bulb off
    Off,
}

impl Power {
    /// The opposite power state.
    pub fn inverted(&self) -> Self {
        match self {
            Power::On => Power::Off,
            Power::Off => Power::On,
        }
    }

    /// Parse the wire representation ("on"/"off").
    pub(crate) fn from_wire(s: &str) -> Option<Self> {
        match s {
            "on" => Some(Power::On),
            "off" => Some(Power::Off),
            _ => None,
        }
    }
}
