pub mod app_config;
pub mod broker;
pub mod dispatcher_worker;
pub mod logging;

pub use app_config::CabbageConfig;
pub use broker::{AckMode, BrokerConfig, BrokerType};
pub use dispatcher_worker::{SchedulerConfig, WorkerConfig};
pub use logging::LoggingConfig;
