use chrono_tz::Tz;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::models::{CalibrationParam, DeviceMetadata, SensorDataPoint};
use crate::time::format_time;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Default)]
pub struct TableOptions {
    pub cal: bool,
    pub alias: bool,
    pub unix: bool,
    pub pivot_table: bool,
    pub order: SortOrder,
    pub tz: Option<Tz>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TableTime {
    Unix(i64),
    Iso(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatRecord {
    pub time: TableTime,
    pub sensor: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PivotRow {
    pub time: TableTime,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PivotTable {
    pub columns: Vec<String>,
    pub rows: Vec<PivotRow>,
}

impl PivotTable {
    /// `None` when the column does not exist; `Some(None)` for a missing reading.
    pub fn cell(&self, row: usize, column: &str) -> Option<Option<f64>> {
        let idx = self.columns.iter().position(|name| name == column)?;
        self.rows.get(row).and_then(|r| r.values.get(idx).copied())
    }
}

struct PivotRowView<'a> {
    columns: &'a [String],
    row: &'a PivotRow,
}

impl Serialize for PivotRowView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len() + 1))?;
        map.serialize_entry("time", &self.row.time)?;
        for (column, value) in self.columns.iter().zip(&self.row.values) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

impl Serialize for PivotTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.rows.iter().map(|row| PivotRowView {
            columns: &self.columns,
            row,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SensorTable {
    Flat(Vec<FlatRecord>),
    Pivot(PivotTable),
}

impl SensorTable {
    pub fn len(&self) -> usize {
        match self {
            SensorTable::Flat(records) => records.len(),
            SensorTable::Pivot(table) => table.rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_flat(&self) -> Option<&[FlatRecord]> {
        match self {
            SensorTable::Flat(records) => Some(records),
            SensorTable::Pivot(_) => None,
        }
    }

    pub fn as_pivot(&self) -> Option<&PivotTable> {
        match self {
            SensorTable::Pivot(table) => Some(table),
            SensorTable::Flat(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub m: f64,
    pub c: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Calibration {
    /// `None` when the sensor carries none of `m`, `c`, `min`, `max`.
    pub fn from_params(params: &[CalibrationParam]) -> Option<Self> {
        let lookup = |name: &str| {
            params
                .iter()
                .find(|param| param.name.trim().eq_ignore_ascii_case(name))
                .and_then(CalibrationParam::as_f64)
        };
        let (m, c, min, max) = (lookup("m"), lookup("c"), lookup("min"), lookup("max"));
        if m.is_none() && c.is_none() && min.is_none() && max.is_none() {
            return None;
        }
        Some(Self {
            m: m.unwrap_or(1.0),
            c: c.unwrap_or(0.0),
            min,
            max,
        })
    }

    pub fn apply(&self, raw: f64) -> f64 {
        let mut value = raw * self.m + self.c;
        if let Some(min) = self.min {
            value = value.max(min);
        }
        if let Some(max) = self.max {
            value = value.min(max);
        }
        value
    }
}

/// Output name per sensor id. With `alias`, names come from metadata; ids that
/// cannot be resolved keep the raw id, and duplicate names get the id appended.
pub fn column_names(
    sensors: &[String],
    metadata: Option<&DeviceMetadata>,
    alias: bool,
) -> HashMap<String, String> {
    let resolved: Vec<(String, String)> = sensors
        .iter()
        .map(|id| {
            let name = alias
                .then(|| metadata.and_then(|meta| meta.sensor_name(id)))
                .flatten()
                .map(str::to_string)
                .unwrap_or_else(|| id.clone());
            (id.clone(), name)
        })
        .collect();

    let mut uses: HashMap<&str, usize> = HashMap::new();
    for (_, name) in &resolved {
        *uses.entry(name.as_str()).or_default() += 1;
    }
    let clashing: HashSet<String> = uses
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name.to_string())
        .collect();

    resolved
        .into_iter()
        .map(|(id, name)| {
            if alias && clashing.contains(&name) && name != id {
                let disambiguated = format!("{name} ({id})");
                (id, disambiguated)
            } else {
                (id, name)
            }
        })
        .collect()
}

/// Shapes accumulated rows into the output table. Calibration happens here,
/// once per raw value.
pub fn build_table(
    mut rows: Vec<SensorDataPoint>,
    columns: &[String],
    metadata: Option<&DeviceMetadata>,
    options: &TableOptions,
) -> SensorTable {
    let mut all_columns: Vec<String> = columns.to_vec();
    let mut known: HashSet<String> = all_columns.iter().cloned().collect();
    for row in &rows {
        if known.insert(row.sensor.clone()) {
            all_columns.push(row.sensor.clone());
        }
    }
    let rank: HashMap<&str, usize> = all_columns
        .iter()
        .enumerate()
        .map(|(idx, id)| (id.as_str(), idx))
        .collect();

    if options.cal {
        if let Some(meta) = metadata {
            let calibrations: HashMap<&str, Calibration> = all_columns
                .iter()
                .filter_map(|id| {
                    Calibration::from_params(meta.params_for(id)).map(|cal| (id.as_str(), cal))
                })
                .collect();
            for row in rows.iter_mut() {
                if let (Some(cal), Some(raw)) = (calibrations.get(row.sensor.as_str()), row.value)
                {
                    row.value = Some(cal.apply(raw));
                }
            }
        }
    }

    rows.sort_by(|a, b| {
        let by_time = match options.order {
            SortOrder::Ascending => a.time.cmp(&b.time),
            SortOrder::Descending => b.time.cmp(&a.time),
        };
        by_time.then_with(|| rank[a.sensor.as_str()].cmp(&rank[b.sensor.as_str()]))
    });

    let names = column_names(&all_columns, metadata, options.alias);
    let render_time = |ms: i64| {
        if options.unix {
            TableTime::Unix(ms)
        } else {
            TableTime::Iso(format_time(ms, options.tz))
        }
    };

    if !options.pivot_table {
        let records = rows
            .into_iter()
            .map(|row| FlatRecord {
                time: render_time(row.time),
                sensor: names
                    .get(&row.sensor)
                    .cloned()
                    .unwrap_or_else(|| row.sensor.clone()),
                value: row.value,
            })
            .collect();
        return SensorTable::Flat(records);
    }

    let mut pivot_rows: Vec<PivotRow> = Vec::new();
    let mut current: Option<(i64, Vec<Option<f64>>)> = None;
    for row in rows {
        let idx = rank[row.sensor.as_str()];
        if let Some((time, values)) = current.as_mut() {
            if *time == row.time {
                values[idx] = row.value;
                continue;
            }
        }
        if let Some((time, values)) = current.take() {
            pivot_rows.push(PivotRow {
                time: render_time(time),
                values,
            });
        }
        let mut values = vec![None; all_columns.len()];
        values[idx] = row.value;
        current = Some((row.time, values));
    }
    if let Some((time, values)) = current {
        pivot_rows.push(PivotRow {
            time: render_time(time),
            values,
        });
    }

    let headers = all_columns
        .iter()
        .map(|id| names.get(id).cloned().unwrap_or_else(|| id.clone()))
        .collect();
    SensorTable::Pivot(PivotTable {
        columns: headers,
        rows: pivot_rows,
    })
}
