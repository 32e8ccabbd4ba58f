//! Line-oriented JSON wire protocol.
//!
//! Every frame is one JSON object terminated by `\r\n`. Outgoing commands
//! carry `{"id", "method", "params"}`; the bulb answers with either
//! `{"id", "result": [...]}` or `{"id", "error": {"code", "message"}}`, and
//! pushes unsolicited state updates as
//! `{"method": "props", "params": {...}}` frames with no id.

use serde_json::{Map, Value, json};
use strum_macros::{Display, EnumIter};

use crate::errors::Error;
use crate::types::{Brightness, Color, DeviceState, Kelvin, Power, Rgb};

type Result<T> = std::result::Result<T, Error>;

/// Wire methods understood by the bulbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Method {
    SetPower,
    SetBright,
    SetRgb,
    SetCtAbx,
    StartCf,
    StopCf,
    SetName,
    GetProp,
}

/// Encode one command frame, including the terminator.
pub(crate) fn encode_command(id: u32, method: Method, params: &[Value]) -> Result<String> {
    let frame = json!({
        "id": id,
        "method": method.to_string(),
        "params": params,
    });
    let mut line = serde_json::to_string(&frame).map_err(Error::JsonDump)?;
    line.push_str("\r\n");
    Ok(line)
}

/// A decoded inbound frame.
#[derive(Debug)]
pub(crate) enum Incoming {
    /// Correlates to a pending request by id.
    Response {
        id: u32,
        result: Result<Vec<Value>>,
    },
    /// Unsolicited state push.
    Props(StateDelta),
}

/// Decode one inbound line (without its terminator).
pub(crate) fn decode_line(line: &str) -> Result<Incoming> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| Error::MalformedFrame(e.to_string()))?;

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let id = id as u32;
        if let Some(result) = value.get("result") {
            let result = result
                .as_array()
                .cloned()
                .ok_or_else(|| Error::MalformedFrame("result is not an array".to_string()))?;
            return Ok(Incoming::Response {
                id,
                result: Ok(result),
            });
        }
        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown device error");
            return Ok(Incoming::Response {
                id,
                result: Err(Error::device(code, message)),
            });
        }
        return Err(Error::MalformedFrame(
            "frame with id carries neither result nor error".to_string(),
        ));
    }

    if value.get("method").and_then(Value::as_str) == Some("props") {
        let params = value
            .get("params")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::MalformedFrame("props params is not an object".to_string()))?;
        return Ok(Incoming::Props(StateDelta::from_params(params)));
    }

    Err(Error::MalformedFrame(
        "frame is neither a response nor a props push".to_string(),
    ))
}

/// The fields of a `props` push, each optional.
///
/// Bulb firmware is inconsistent about value types (numbers arrive both as
/// JSON numbers and as strings), so every field is parsed leniently;
/// unparsable or unknown keys are skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub power: Option<Power>,
    pub brightness: Option<Brightness>,
    pub rgb: Option<Rgb>,
    pub color_temperature: Option<Kelvin>,
    pub color_mode: Option<u8>,
    pub name: Option<String>,
}

impl StateDelta {
    pub(crate) fn from_params(params: &Map<String, Value>) -> Self {
        StateDelta {
            power: params
                .get("power")
                .and_then(Value::as_str)
                .and_then(Power::from_wire),
            brightness: lenient_i64(params.get("bright")).map(Brightness::clamped),
            rgb: lenient_i64(params.get("rgb")).map(|v| Rgb::from_packed(v.clamp(0, 0xFFFFFF) as u32)),
            color_temperature: lenient_i64(params.get("ct")).map(Kelvin::clamped),
            color_mode: lenient_i64(params.get("color_mode")).map(|v| v.clamp(0, u8::MAX as i64) as u8),
            name: params
                .get("name")
                .and_then(Value::as_str)
                .map(String::from),
        }
    }

    /// The color this delta implies, if any.
    ///
    /// `color_mode` 2 is the bulb's white-temperature mode; any other mode
    /// (or no mode at all) prefers the RGB field.
    fn color(&self) -> Option<Color> {
        match self.color_mode {
            Some(2) => self
                .color_temperature
                .map(Color::Temperature)
                .or(self.rgb.map(Color::Rgb)),
            _ => self
                .rgb
                .map(Color::Rgb)
                .or(self.color_temperature.map(Color::Temperature)),
        }
    }

    /// Fold this delta into a device state.
    ///
    /// Power transitions replace the state outright; brightness/color-only
    /// deltas update an `On` state in place and are ignored while the power
    /// state is `Off` or unknown (there is nothing sound to attach them to).
    pub(crate) fn apply_to(&self, state: &mut DeviceState) {
        match self.power {
            Some(Power::Off) => *state = DeviceState::Off,
            Some(Power::On) => {
                let brightness = self
                    .brightness
                    .or(state.brightness())
                    .unwrap_or_default();
                let color = self.color().or(state.color()).unwrap_or_default();
                *state = DeviceState::on(brightness, color);
            }
            None => {
                if let DeviceState::On { brightness, color } = state {
                    if let Some(b) = self.brightness {
                        *brightness = b;
                    }
                    if let Some(c) = self.color() {
                        *color = c;
                    }
                }
            }
        }
    }
}

fn lenient_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
