use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::time;

/// One normalized reading. `value == None` means no value existed at `time`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDataPoint {
    pub time: i64,
    pub sensor: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawSensorPoint {
    time: WireTime,
    sensor: String,
    #[serde(default)]
    value: Option<WireNumber>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireTime {
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireNumber {
    Num(f64),
    Str(String),
}

impl WireNumber {
    fn to_f64(&self) -> std::result::Result<Option<f64>, String> {
        match self {
            WireNumber::Num(value) => Ok(Some(*value)),
            WireNumber::Str(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
                    return Ok(None);
                }
                trimmed
                    .parse::<f64>()
                    .map(Some)
                    .map_err(|_| format!("non-numeric value {raw:?}"))
            }
        }
    }
}

impl RawSensorPoint {
    pub(crate) fn normalize(self) -> Result<SensorDataPoint> {
        let time = match &self.time {
            WireTime::Int(ms) => *ms,
            WireTime::Float(ms) => ms.round() as i64,
            WireTime::Str(raw) => match raw.trim().parse::<i64>() {
                Ok(ms) => ms,
                Err(_) => time::parse_iso(raw, None).map_err(|_| {
                    Error::parse(format!("unparseable time {raw:?} for sensor {}", self.sensor))
                })?,
            },
        };
        if DateTime::from_timestamp_millis(time).is_none() {
            return Err(Error::parse(format!(
                "time {time} out of range for sensor {}",
                self.sensor
            )));
        }
        let value = match &self.value {
            None => None,
            Some(raw) => raw.to_f64().map_err(|reason| {
                Error::parse(format!("{reason} for sensor {} at {time}", self.sensor))
            })?,
        };
        Ok(SensorDataPoint {
            time,
            sensor: self.sensor,
            value,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorInfo {
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
    #[serde(rename = "sensorName", default)]
    pub sensor_name: Option<String>,
    #[serde(rename = "globalName", default, skip_serializing_if = "Option::is_none")]
    pub global_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationParam {
    #[serde(rename = "paramName")]
    pub name: String,
    #[serde(rename = "paramValue", default)]
    pub value: JsonValue,
}

impl CalibrationParam {
    pub fn new(name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match &self.value {
            JsonValue::Number(num) => num.as_f64(),
            JsonValue::String(raw) => raw.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|value| value.is_finite())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceMetadata {
    #[serde(rename = "devID")]
    pub dev_id: String,
    #[serde(rename = "devTypeID", default)]
    pub dev_type_id: Option<String>,
    #[serde(rename = "devName", default)]
    pub dev_name: Option<String>,
    #[serde(default)]
    pub sensors: Vec<SensorInfo>,
    #[serde(default)]
    pub params: HashMap<String, Vec<CalibrationParam>>,
    #[serde(default)]
    pub unit: HashMap<String, Vec<String>>,
    #[serde(rename = "unitSelected", default)]
    pub unit_selected: HashMap<String, String>,
    #[serde(default)]
    pub properties: JsonValue,
    #[serde(default)]
    pub custom: JsonValue,
    #[serde(flatten)]
    pub extras: Map<String, JsonValue>,
}

impl DeviceMetadata {
    pub fn sensor_ids(&self) -> Vec<String> {
        self.sensors
            .iter()
            .map(|sensor| sensor.sensor_id.clone())
            .collect()
    }

    pub fn sensor_name(&self, sensor_id: &str) -> Option<&str> {
        self.sensors
            .iter()
            .find(|sensor| sensor.sensor_id == sensor_id)
            .and_then(|sensor| sensor.sensor_name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn params_for(&self, sensor_id: &str) -> &[CalibrationParam] {
        self.params
            .get(sensor_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Unit chosen for the sensor, falling back to the first available one.
    pub fn selected_unit(&self, sensor_id: &str) -> Option<&str> {
        self.unit_selected
            .get(sensor_id)
            .map(String::as_str)
            .or_else(|| {
                self.unit
                    .get(sensor_id)
                    .and_then(|units| units.first())
                    .map(String::as_str)
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    #[serde(rename = "devID")]
    pub dev_id: String,
    #[serde(rename = "devTypeID", default)]
    pub dev_type_id: Option<String>,
    #[serde(rename = "devName", default)]
    pub dev_name: Option<String>,
    #[serde(flatten)]
    pub extras: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(alias = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub organisation: Option<JsonValue>,
    #[serde(flatten)]
    pub extras: Map<String, JsonValue>,
}

impl UserInfo {
    pub fn organisation_id(&self) -> Option<String> {
        let org = self.organisation.as_ref()?;
        let id = match org {
            JsonValue::String(id) => Some(id.as_str()),
            JsonValue::Object(fields) => fields
                .get("_id")
                .or_else(|| fields.get("id"))
                .and_then(JsonValue::as_str),
            _ => None,
        }?;
        let id = id.trim();
        (!id.is_empty()).then(|| id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevConfig {
    #[serde(rename = "devId")]
    pub dev_id: String,
    #[serde(deserialize_with = "lenient_f64", default)]
    pub percentage: f64,
    pub sensor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadEntity {
    #[serde(alias = "_id")]
    pub id: String,
    pub name: String,
    #[serde(rename = "devConfigs", default)]
    pub dev_configs: Vec<DevConfig>,
    #[serde(flatten)]
    pub extras: Map<String, JsonValue>,
}

fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<WireNumber>::deserialize(deserializer)? {
        None => Ok(0.0),
        Some(raw) => raw
            .to_f64()
            .map(|value| value.unwrap_or(0.0))
            .map_err(serde::de::Error::custom),
    }
}
