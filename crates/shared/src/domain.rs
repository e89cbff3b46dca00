use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RelayError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);
    };
}

id_newtype!(DeviceId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Light,
    Heater,
    Door,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 3] = [DeviceClass::Light, DeviceClass::Heater, DeviceClass::Door];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Light => "light",
            DeviceClass::Heater => "heater",
            DeviceClass::Door => "door",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" | "lights" => Ok(DeviceClass::Light),
            "heater" | "heaters" => Ok(DeviceClass::Heater),
            "door" | "doors" => Ok(DeviceClass::Door),
            other => Err(RelayError::UnknownDevice(format!(
                "unknown device class '{other}'; expected light, heater or door"
            ))),
        }
    }
}

/// Identity of one controllable device, e.g. `light1` or `door3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKey {
    pub device_class: DeviceClass,
    pub device_id: DeviceId,
}

impl DeviceKey {
    pub fn new(device_class: DeviceClass, device_id: u32) -> Self {
        Self {
            device_class,
            device_id: DeviceId(device_id),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.device_class, self.device_id.0)
    }
}

impl FromStr for DeviceKey {
    type Err = RelayError;

    /// Parses the compact form printed by `Display`, e.g. `heater2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| RelayError::UnknownDevice(format!("missing device id in '{s}'")))?;
        let (class, id) = s.split_at(split);
        let device_id = id
            .parse::<u32>()
            .map_err(|_| RelayError::UnknownDevice(format!("invalid device id in '{s}'")))?;
        Ok(DeviceKey::new(class.parse()?, device_id))
    }
}

/// Intensity (lights, heaters) or openness (doors), always within 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Level(u8);

impl Level {
    pub const MIN: Level = Level(0);
    pub const MAX: Level = Level(100);

    pub fn new(value: i64) -> Result<Self, RelayError> {
        if (0..=100).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(RelayError::InvalidState(format!(
                "level {value} is outside the domain 0..=100"
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Level {
    type Error = RelayError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Level::new(value)
    }
}

impl From<Level> for u8 {
    fn from(value: Level) -> Self {
        value.0
    }
}

/// Validated state of a device. For doors `on` means open and `level` is the
/// openness; for lights and heaters `level` is the intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceState {
    pub on: bool,
    pub level: Level,
}

impl DeviceState {
    pub fn off() -> Self {
        Self {
            on: false,
            level: Level::MIN,
        }
    }

    pub fn on_at(level: u8) -> Result<Self, RelayError> {
        Ok(Self {
            on: true,
            level: Level::new(level.into())?,
        })
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.on {
            write!(f, "on@{}", self.level.0)
        } else {
            write!(f, "off@{}", self.level.0)
        }
    }
}

/// Unvalidated state as it arrives from a client. Accepts the field names used
/// by the first control-panel prototypes (`isOn`, `isOpen`, `intensity`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedState {
    #[serde(alias = "isOn", alias = "isOpen", alias = "open")]
    pub on: bool,
    #[serde(
        default,
        alias = "intensity",
        alias = "openness",
        skip_serializing_if = "Option::is_none"
    )]
    pub level: Option<i64>,
}

impl RequestedState {
    /// Missing levels default to full when on and zero when off; a supplied
    /// level is kept even for an off request.
    pub fn validate(self) -> Result<DeviceState, RelayError> {
        let level = match self.level {
            Some(level) => Level::new(level)?,
            None if self.on => Level::MAX,
            None => Level::MIN,
        };
        Ok(DeviceState { on: self.on, level })
    }
}

impl From<DeviceState> for RequestedState {
    fn from(value: DeviceState) -> Self {
        Self {
            on: value.on,
            level: Some(value.level.0.into()),
        }
    }
}

/// A finalized intent. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_id: Uuid,
    pub device: DeviceKey,
    pub requested_state: DeviceState,
    pub submitted_at: DateTime<Utc>,
}

impl Command {
    pub fn new(device: DeviceKey, requested_state: DeviceState) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            device,
            requested_state,
            submitted_at: Utc::now(),
        }
    }
}

/// How many devices of each class exist. Ids run from 1 to the count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub lights: u32,
    pub heaters: u32,
    pub doors: u32,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            lights: 3,
            heaters: 2,
            doors: 3,
        }
    }
}

impl Topology {
    pub fn count(&self, class: DeviceClass) -> u32 {
        match class {
            DeviceClass::Light => self.lights,
            DeviceClass::Heater => self.heaters,
            DeviceClass::Door => self.doors,
        }
    }

    pub fn devices(&self) -> Vec<DeviceKey> {
        DeviceClass::ALL
            .iter()
            .flat_map(|class| (1..=self.count(*class)).map(|id| DeviceKey::new(*class, id)))
            .collect()
    }

    pub fn contains(&self, key: DeviceKey) -> bool {
        key.device_id.0 >= 1 && key.device_id.0 <= self.count(key.device_class)
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
