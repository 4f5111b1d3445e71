pub mod config;
pub mod judger;
pub mod model;
pub mod queue;
pub mod sandbox;
pub mod service;
pub mod store;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
