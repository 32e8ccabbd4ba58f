//! Last-known bulb state.

use serde::{Deserialize, Serialize};

use super::{Brightness, Color, Power};

/// The last state observed for a bulb.
///
/// A device starts as [`DeviceState::Unknown`] when discovered and stays that
/// way until the first `props` push arrives over its control session.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    Off,
    On {
        brightness: Brightness,
        color: Color,
    },
    #[default]
    Unknown,
}

impl DeviceState {
    /// Convenience constructor for an `On` state.
    ///
    /// # Examples
    ///
    /// ```
    /// use yeelight_rs::{Brightness, Color, DeviceState, Rgb};
    ///
    /// let state = DeviceState::on(Brightness::clamped(80), Color::Rgb(Rgb::rgb(10, 20, 30)));
    /// assert_eq!(state.power(), Some(yeelight_rs::Power::On));
    /// ```
    pub fn on(brightness: Brightness, color: Color) -> Self {
        DeviceState::On { brightness, color }
    }

    /// The power component of this state, if known.
    pub fn power(&self) -> Option<Power> {
        match self {
            DeviceState::Off => Some(Power::Off),
            DeviceState::On { .. } => Some(Power::On),
            DeviceState::Unknown => None,
        }
    }

    pub fn brightness(&self) -> Option<Brightness> {
        match self {
            DeviceState::On { brightness, .. } => Some(*brightness),
            _ => None,
        }
    }

    pub fn color(&self) -> Option<Color> {
        match self {
            DeviceState::On { color, .. } => Some(*color),
            _ => None,
        }
    }
}
