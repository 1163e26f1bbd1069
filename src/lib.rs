pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod time;

#[cfg(test)]
pub mod test_support;

pub use config::ClientConfig;
pub use error::{Error, ErrorKind, Result};
pub use models::{DeviceMetadata, LoadEntity, SensorDataPoint};
pub use services::metadata::{MetadataClient, OrgIdCache};
pub use services::query::{
    DataAccess, FirstDpOptions, LastDpOptions, QueryFlags, RangeQueryOptions,
};
pub use services::sensor_table::{SensorTable, SortOrder};
pub use time::TimeInput;
