//! Color flow (timed effect) definitions.
//!
//! A flow is an ordered sequence of transitions executed by the bulb firmware
//! itself via `start_cf`. Each transition is encoded on the wire as a
//! `duration,mode,value,brightness` tuple inside a single comma-separated
//! expression string.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Brightness, Kelvin, Rgb};

/// What a single flow transition changes.
///
/// The discriminants are the wire codes understood by the firmware.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    Color = 1,
    Temperature = 2,
    Sleep = 7,
}

/// One step of a color flow.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FlowTransition {
    pub(crate) duration: Duration,
    pub(crate) mode: FlowMode,
    pub(crate) value: u32,
    pub(crate) brightness: Brightness,
}

impl FlowTransition {
    /// Firmware rejects transitions shorter than this.
    const MIN_DURATION: Duration = Duration::from_millis(50);

    /// A transition to an RGB color.
    pub fn color(duration: Duration, color: Rgb, brightness: Brightness) -> Self {
        Self {
            duration: duration.max(Self::MIN_DURATION),
            mode: FlowMode::Color,
            value: color.packed(),
            brightness,
        }
    }

    /// A transition to a white color temperature.
    pub fn temperature(duration: Duration, kelvin: Kelvin, brightness: Brightness) -> Self {
        Self {
            duration: duration.max(Self::MIN_DURATION),
            mode: FlowMode::Temperature,
            value: kelvin.kelvin() as u32,
            brightness,
        }
    }

    /// A pause with the light unchanged.
    pub fn sleep(duration: Duration) -> Self {
        Self {
            duration: duration.max(Self::MIN_DURATION),
            mode: FlowMode::Sleep,
            value: 0,
            brightness: Brightness::clamped(0),
        }
    }
}

/// An ordered sequence of transitions with a repeat flag.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Flow {
    pub(crate) transitions: Vec<FlowTransition>,
    pub(crate) repeat: bool,
}

impl Flow {
    pub fn new(transitions: Vec<FlowTransition>, repeat: bool) -> Self {
        Self {
            transitions,
            repeat,
        }
    }

    pub fn transitions(&self) -> &[FlowTransition] {
        &self.transitions
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    /// Encode as `start_cf` parameters: `[count, action, expression]`.
    ///
    /// A repeating flow uses count 0 (loop until `stop_cf`); a one-shot flow
    /// runs each transition exactly once. Action 0 restores the state the
    /// bulb had before the flow started.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use yeelight_rs::{Brightness, Flow, FlowTransition, Rgb};
    ///
    /// let flow = Flow::new(
    ///     vec![FlowTransition::color(
    ///         Duration::from_millis(500),
    ///         Rgb::rgb(255, 0, 0),
    ///         Brightness::clamped(100),
    ///     )],
    ///     false,
    /// );
    /// assert_eq!(flow.to_params()[2], "500,1,16711680,100");
    /// ```
    pub fn to_params(&self) -> Vec<Value> {
        let count = if self.repeat {
            0
        } else {
            self.transitions.len() as u64
        };
        let expression = self
            .transitions
            .iter()
            .map(|t| {
                format!(
                    "{},{},{},{}",
                    t.duration.as_millis(),
                    t.mode as u8,
                    t.value,
                    t.brightness.value()
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        vec![json!(count), json!(0), json!(expression)]
    }
}
