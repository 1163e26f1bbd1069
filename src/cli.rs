use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::services::query::{FirstDpOptions, LastDpOptions, QueryFlags, RangeQueryOptions};
use crate::services::sensor_table::SortOrder;
use crate::time::{parse_timezone, TimeInput};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sensor-data-client",
    version,
    about = "Query time-series sensor data and device metadata"
)]
pub struct Cli {
    /// Sent as the userID header on every request.
    #[arg(long, global = true, env = "SENSOR_USER_ID")]
    pub user_id: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    pub on_prem: bool,
    #[arg(long, global = true, default_value_t = false)]
    pub cal: bool,
    #[arg(long, global = true, default_value_t = false)]
    pub alias: bool,
    #[arg(long, global = true, default_value_t = false)]
    pub unix: bool,
    #[arg(long, global = true, default_value_t = false)]
    pub pivot: bool,
    /// IANA timezone for naive inputs and formatted output (e.g. Asia/Kolkata).
    #[arg(long, global = true)]
    pub tz: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// First n readings per sensor at or after --start.
    FirstDp(FirstDpArgs),
    /// Last n readings per sensor at or before --end.
    LastDp(LastDpArgs),
    /// Every reading between --start and --end.
    Query(RangeArgs),
    LoadEntities(LoadEntitiesArgs),
    Devices,
    Metadata(DeviceArgs),
    Whoami,
    Publish(PublishArgs),
    Subscribe(SubscribeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct FirstDpArgs {
    #[arg(long)]
    pub device: String,
    /// Comma-separated sensor ids; all sensors when omitted.
    #[arg(long, value_delimiter = ',')]
    pub sensors: Vec<String>,
    #[arg(long)]
    pub start: String,
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    pub n: i64,
}

#[derive(Args, Debug, Clone)]
pub struct LastDpArgs {
    #[arg(long)]
    pub device: String,
    #[arg(long, value_delimiter = ',')]
    pub sensors: Vec<String>,
    #[arg(long, default_value = "now")]
    pub end: String,
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    pub n: i64,
    #[arg(long, default_value_t = false)]
    pub ascending: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RangeArgs {
    #[arg(long)]
    pub device: String,
    #[arg(long, value_delimiter = ',')]
    pub sensors: Vec<String>,
    #[arg(long)]
    pub start: String,
    #[arg(long, default_value = "now")]
    pub end: String,
}

#[derive(Args, Debug, Clone)]
pub struct LoadEntitiesArgs {
    /// Cluster name or id; repeat to select several. Lists all when omitted.
    #[arg(long = "cluster")]
    pub clusters: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    #[arg(long)]
    pub device: String,
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    #[arg(long)]
    pub topic: String,
    /// JSON payload.
    #[arg(long)]
    pub payload: String,
}

#[derive(Args, Debug, Clone)]
pub struct SubscribeArgs {
    #[arg(long)]
    pub topic: String,
    /// Stop after this many messages.
    #[arg(long)]
    pub count: Option<usize>,
}

fn sensor_list(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

impl Cli {
    pub fn flags(&self) -> Result<QueryFlags> {
        let tz = self
            .tz
            .as_deref()
            .map(parse_timezone)
            .transpose()
            .context("invalid --tz")?;
        Ok(QueryFlags {
            cal: self.cal,
            alias: self.alias,
            unix: self.unix,
            on_prem: self.on_prem,
            pivot_table: self.pivot,
            tz,
            metadata: None,
        })
    }
}

impl FirstDpArgs {
    pub fn options(&self, flags: QueryFlags) -> FirstDpOptions {
        FirstDpOptions {
            device_id: self.device.clone(),
            sensors: sensor_list(&self.sensors),
            start_time: TimeInput::from_arg(&self.start),
            n: self.n,
            flags,
        }
    }
}

impl LastDpArgs {
    pub fn options(&self, flags: QueryFlags) -> LastDpOptions {
        LastDpOptions {
            device_id: self.device.clone(),
            sensors: sensor_list(&self.sensors),
            end_time: TimeInput::from_arg(&self.end),
            n: self.n,
            order: if self.ascending {
                SortOrder::Ascending
            } else {
                SortOrder::Descending
            },
            flags,
        }
    }
}

impl RangeArgs {
    pub fn options(&self, flags: QueryFlags) -> RangeQueryOptions {
        RangeQueryOptions {
            device_id: self.device.clone(),
            sensors: sensor_list(&self.sensors),
            start_time: TimeInput::from_arg(&self.start),
            end_time: TimeInput::from_arg(&self.end),
            flags,
        }
    }
}

impl LoadEntitiesArgs {
    pub fn filter(&self) -> Option<&[String]> {
        (!self.clusters.is_empty()).then_some(self.clusters.as_slice())
    }
}
