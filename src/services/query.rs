use chrono_tz::Tz;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::{DeviceMetadata, LoadEntity, RawSensorPoint, SensorDataPoint};
use crate::services::metadata::MetadataClient;
use crate::services::paginate::{
    take_per_sensor, walk_cursor, walk_offset, CursorPlan, Direction, PageRequest,
};
use crate::services::sensor_table::{build_table, SensorTable, SortOrder, TableOptions};
use crate::time::{normalize_time, parse_timezone, TimeInput};

const FIRST_DATA_ROUTE: &str = "getFirstDataMultipleSensors";
const LAST_DATA_ROUTE: &str = "getLimitedDataMultipleSensors";
const RANGE_DATA_ROUTE: &str = "getAllData";

/// Formatting and routing flags shared by every query mode.
#[derive(Debug, Clone, Default)]
pub struct QueryFlags {
    pub cal: bool,
    pub alias: bool,
    pub unix: bool,
    pub on_prem: bool,
    pub pivot_table: bool,
    pub tz: Option<Tz>,
    /// Pre-fetched metadata; skips the metadata request entirely.
    pub metadata: Option<DeviceMetadata>,
}

#[derive(Debug, Clone)]
pub struct FirstDpOptions {
    pub device_id: String,
    pub sensors: Option<Vec<String>>,
    pub start_time: TimeInput,
    pub n: i64,
    pub flags: QueryFlags,
}

impl FirstDpOptions {
    pub fn new(device_id: impl Into<String>, start_time: impl Into<TimeInput>) -> Self {
        Self {
            device_id: device_id.into(),
            sensors: None,
            start_time: start_time.into(),
            n: 1,
            flags: QueryFlags::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LastDpOptions {
    pub device_id: String,
    pub sensors: Option<Vec<String>>,
    pub end_time: TimeInput,
    pub n: i64,
    pub order: SortOrder,
    pub flags: QueryFlags,
}

impl LastDpOptions {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            sensors: None,
            end_time: TimeInput::Now,
            n: 1,
            order: SortOrder::Descending,
            flags: QueryFlags::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RangeQueryOptions {
    pub device_id: String,
    pub sensors: Option<Vec<String>>,
    pub start_time: TimeInput,
    pub end_time: TimeInput,
    pub flags: QueryFlags,
}

impl RangeQueryOptions {
    pub fn new(
        device_id: impl Into<String>,
        start_time: impl Into<TimeInput>,
        end_time: impl Into<TimeInput>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            sensors: None,
            start_time: start_time.into(),
            end_time: end_time.into(),
            flags: QueryFlags::default(),
        }
    }
}

struct ResolvedSensors {
    sensors: Vec<String>,
    metadata: Option<DeviceMetadata>,
}

/// Entry point for time-series queries and load-entity listing.
#[derive(Clone)]
pub struct DataAccess {
    api: ApiClient,
    metadata: MetadataClient,
    config: Arc<ClientConfig>,
    default_tz: Option<Tz>,
    cancel: CancellationToken,
}

fn validate_device(device_id: &str) -> Result<&str> {
    let device_id = device_id.trim();
    if device_id.is_empty() {
        return Err(Error::validation("device id must not be empty"));
    }
    Ok(device_id)
}

fn validate_n(n: i64) -> Result<usize> {
    if n < 1 {
        return Err(Error::validation(format!("n must be >= 1 (got {n})")));
    }
    usize::try_from(n).map_err(|_| Error::validation(format!("n is too large (got {n})")))
}

fn requested_sensors(sensors: Option<&[String]>) -> Result<Option<Vec<String>>> {
    let Some(sensors) = sensors else {
        return Ok(None);
    };
    let mut seen = HashSet::new();
    let list: Vec<String> = sensors
        .iter()
        .map(|sensor| sensor.trim())
        .filter(|sensor| !sensor.is_empty())
        .filter(|sensor| seen.insert(sensor.to_string()))
        .map(str::to_string)
        .collect();
    if list.is_empty() {
        return Err(Error::validation(
            "sensor list is empty; omit it to query all sensors",
        ));
    }
    Ok(Some(list))
}

impl DataAccess {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let default_tz = config
            .timezone
            .as_deref()
            .map(parse_timezone)
            .transpose()?;
        let api = ApiClient::new(&config)?;
        Ok(Self {
            metadata: MetadataClient::new(api.clone()),
            cancel: api.cancel_token().clone(),
            api,
            config: Arc::new(config),
            default_tz,
        })
    }

    /// Binds a cancellation token checked between pages and during backoff.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.api = self.api.with_cancellation(cancel.clone());
        self.metadata = MetadataClient::new(self.api.clone());
        self.cancel = cancel;
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.api = self.api.with_user_id(user_id);
        self.metadata = MetadataClient::new(self.api.clone());
        self
    }

    pub fn metadata(&self) -> &MetadataClient {
        &self.metadata
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn tz(&self, flags: &QueryFlags) -> Option<Tz> {
        flags.tz.or(self.default_tz)
    }

    async fn resolve_sensors(
        &self,
        device_id: &str,
        sensors: Option<Vec<String>>,
        flags: &QueryFlags,
    ) -> Result<ResolvedSensors> {
        let needs_metadata = sensors.is_none() || flags.cal || flags.alias;
        let metadata = match (&flags.metadata, needs_metadata) {
            (Some(supplied), _) => Some(supplied.clone()),
            (None, true) => Some(
                self.metadata
                    .get_device_metadata(device_id, flags.on_prem)
                    .await?,
            ),
            // Data routes may answer an empty page for foreign devices.
            (None, false) => {
                self.metadata
                    .ensure_device_listed(device_id, flags.on_prem)
                    .await?;
                None
            }
        };

        let sensors = match sensors {
            Some(list) => list,
            None => {
                let all = metadata
                    .as_ref()
                    .map(DeviceMetadata::sensor_ids)
                    .unwrap_or_default();
                if all.is_empty() {
                    return Err(Error::NoData(format!("device {device_id} has no sensors")));
                }
                all
            }
        };
        Ok(ResolvedSensors { sensors, metadata })
    }

    async fn fetch_series_page(
        &self,
        route: &str,
        device_id: &str,
        on_prem: bool,
        sensors: &[String],
        params: &[(&str, String)],
    ) -> Result<Vec<SensorDataPoint>> {
        let mut url = self.api.endpoint(on_prem, &["api", "apiLayer", route])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("device", device_id);
            query.append_pair("sensor", &sensors.join(","));
            for (key, value) in params {
                query.append_pair(key, value);
            }
            query.append_pair("cursor", "true");
        }
        let raw: Vec<RawSensorPoint> = self.api.get_data(route, url).await?.data;
        raw.into_iter().map(RawSensorPoint::normalize).collect()
    }

    fn table_options(&self, flags: &QueryFlags, order: SortOrder) -> TableOptions {
        TableOptions {
            cal: flags.cal,
            alias: flags.alias,
            unix: flags.unix,
            pivot_table: flags.pivot_table,
            order,
            tz: self.tz(flags),
        }
    }

    /// Earliest `n` readings per sensor at or after `start_time`, ascending.
    pub async fn get_first_dp(&self, options: &FirstDpOptions) -> Result<SensorTable> {
        let device_id = validate_device(&options.device_id)?;
        let n = validate_n(options.n)?;
        let flags = &options.flags;
        let start = normalize_time(&options.start_time, self.tz(flags))?;
        let sensors = requested_sensors(options.sensors.as_deref())?;
        self.api.base_url(flags.on_prem)?;

        let run = async {
            let resolved = self.resolve_sensors(device_id, sensors, flags).await?;
            let rows = self
                .walk_top_n(
                    FIRST_DATA_ROUTE,
                    "sTime",
                    Direction::Forward,
                    device_id,
                    start,
                    n,
                    &resolved.sensors,
                    flags.on_prem,
                )
                .await?;
            Ok::<_, Error>(build_table(
                rows,
                &resolved.sensors,
                resolved.metadata.as_ref(),
                &self.table_options(flags, SortOrder::Ascending),
            ))
        };
        run.await
            .map_err(|err| err.in_operation("get_first_dp", device_id))
    }

    /// Latest `n` readings per sensor at or before `end_time`.
    pub async fn get_dp(&self, options: &LastDpOptions) -> Result<SensorTable> {
        let device_id = validate_device(&options.device_id)?;
        let n = validate_n(options.n)?;
        let flags = &options.flags;
        let end = normalize_time(&options.end_time, self.tz(flags))?;
        let sensors = requested_sensors(options.sensors.as_deref())?;
        self.api.base_url(flags.on_prem)?;

        let run = async {
            let resolved = self.resolve_sensors(device_id, sensors, flags).await?;
            let rows = self
                .walk_top_n(
                    LAST_DATA_ROUTE,
                    "eTime",
                    Direction::Backward,
                    device_id,
                    end,
                    n,
                    &resolved.sensors,
                    flags.on_prem,
                )
                .await?;
            Ok::<_, Error>(build_table(
                rows,
                &resolved.sensors,
                resolved.metadata.as_ref(),
                &self.table_options(flags, options.order),
            ))
        };
        run.await
            .map_err(|err| err.in_operation("get_dp", device_id))
    }

    #[allow(clippy::too_many_arguments)]
    async fn walk_top_n(
        &self,
        route: &'static str,
        cursor_param: &'static str,
        direction: Direction,
        device_id: &str,
        origin: i64,
        n: usize,
        sensors: &[String],
        on_prem: bool,
    ) -> Result<Vec<SensorDataPoint>> {
        let limit = self
            .config
            .page_limit
            .min(n.saturating_mul(sensors.len()))
            .max(1);
        let plan = CursorPlan {
            direction,
            origin,
            stop_at: None,
            limit,
            max_pages: self.config.max_pages,
            sensors: sensors.to_vec(),
            target_per_sensor: Some(n),
        };
        let outcome = walk_cursor(&plan, &self.cancel, |req: PageRequest| async move {
            let boundary = req.cursor.end.unwrap_or(origin);
            let params = [
                (cursor_param, boundary.to_string()),
                ("lim", req.cursor.limit.unwrap_or(limit).to_string()),
            ];
            self.fetch_series_page(route, device_id, on_prem, &req.sensors, &params)
                .await
        })
        .await?;
        tracing::debug!(
            device = device_id,
            pages = outcome.pages,
            rows = outcome.rows.len(),
            end = ?outcome.end,
            "cursor walk finished"
        );
        Ok(take_per_sensor(outcome.rows, n, direction, sensors))
    }

    /// Every reading in the closed range `[start_time, end_time]`, ascending.
    pub async fn data_query(&self, options: &RangeQueryOptions) -> Result<SensorTable> {
        let device_id = validate_device(&options.device_id)?;
        let flags = &options.flags;
        let tz = self.tz(flags);
        let start = normalize_time(&options.start_time, tz)?;
        let end = normalize_time(&options.end_time, tz)?;
        if start > end {
            return Err(Error::validation(format!(
                "start time {start} is after end time {end}"
            )));
        }
        let sensors = requested_sensors(options.sensors.as_deref())?;
        self.api.base_url(flags.on_prem)?;

        let run = async {
            let resolved = self.resolve_sensors(device_id, sensors, flags).await?;
            let limit = self.config.page_limit.max(1);
            let plan = CursorPlan {
                direction: Direction::Forward,
                origin: start,
                stop_at: Some(end),
                limit,
                max_pages: self.config.max_pages,
                sensors: resolved.sensors.clone(),
                target_per_sensor: None,
            };
            let on_prem = flags.on_prem;
            let outcome = walk_cursor(&plan, &self.cancel, |req: PageRequest| async move {
                let params = [
                    ("sTime", req.cursor.end.unwrap_or(start).to_string()),
                    ("eTime", end.to_string()),
                    ("lim", req.cursor.limit.unwrap_or(limit).to_string()),
                ];
                self.fetch_series_page(RANGE_DATA_ROUTE, device_id, on_prem, &req.sensors, &params)
                    .await
            })
            .await?;
            tracing::debug!(
                device = device_id,
                pages = outcome.pages,
                rows = outcome.rows.len(),
                end = ?outcome.end,
                "range walk finished"
            );
            Ok::<_, Error>(build_table(
                outcome.rows,
                &resolved.sensors,
                resolved.metadata.as_ref(),
                &self.table_options(flags, SortOrder::Ascending),
            ))
        };
        run.await
            .map_err(|err| err.in_operation("data_query", device_id))
    }

    /// Load entities (clusters). `None` lists every cluster; `Some(names)`
    /// keeps clusters whose name or id matches an entry.
    pub async fn get_load_entities(
        &self,
        clusters: Option<&[String]>,
        on_prem: bool,
    ) -> Result<Vec<LoadEntity>> {
        let wanted: Option<HashSet<&str>> = match clusters {
            Some(names) => {
                let set: HashSet<&str> = names
                    .iter()
                    .map(|name| name.trim())
                    .filter(|name| !name.is_empty())
                    .collect();
                if set.is_empty() {
                    return Err(Error::validation("cluster list must not be empty"));
                }
                Some(set)
            }
            None => None,
        };
        self.api.base_url(on_prem)?;

        let page_size = self.config.load_entity_page_size.max(1);
        let entities = walk_offset(page_size, self.config.max_pages, &self.cancel, |page| {
            async move {
                let page_no = page.page.to_string();
                let count = page.count.to_string();
                let url = self.api.endpoint(
                    on_prem,
                    &["api", "metaData", "getAllClusterData", &page_no, &count],
                )?;
                let resp = self.api.get_data::<Vec<LoadEntity>>("load_entities", url).await?;
                tracing::debug!(
                    page = page.page,
                    skip = page.skip(),
                    entities = resp.data.len(),
                    total = ?resp.total_count,
                    "fetched load entity page"
                );
                Ok::<_, Error>(resp.data)
            }
        })
        .await?;

        Ok(match wanted {
            None => entities,
            Some(wanted) => entities
                .into_iter()
                .filter(|entity| {
                    wanted.contains(entity.name.trim()) || wanted.contains(entity.id.trim())
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests;
