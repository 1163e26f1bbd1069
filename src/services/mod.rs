pub mod metadata;
pub mod mqtt;
pub mod paginate;
pub mod query;
pub mod retry;
pub mod sensor_table;
