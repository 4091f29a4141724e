//! 配置管理
//!
//! 配置按以下顺序加载，后者覆盖前者：
//!
//! 1. 内置默认值
//! 2. TOML 配置文件（`config/cabbage.toml` 或显式指定的路径）
//! 3. 以 `CABBAGE_` 为前缀的环境变量，嵌套键之间用 `__` 分隔，
//!    例如 `CABBAGE_BROKER__URL=redis://localhost:6379`
//!
//! ```rust
//! use cabbage_core::config::{BrokerType, CabbageConfig};
//!
//! let config = CabbageConfig::from_toml(r#"
//! [broker]
//! type = "memory"
//! "#).unwrap();
//! assert_eq!(config.broker.r#type, BrokerType::Memory);
//! ```

pub mod models;

pub use models::*;
