//! Value types for bulb control parameters.

mod brightness;
mod color;
mod features;
mod flow;
mod kelvin;
mod power;
mod state;

pub use brightness::Brightness;
pub use color::{Color, Rgb};
pub use features::{Feature, FeatureSet};
pub use flow::{Flow, FlowMode, FlowTransition};
pub use kelvin::Kelvin;
pub use power::Power;
pub use state::DeviceState;
