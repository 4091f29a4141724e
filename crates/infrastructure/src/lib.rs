pub mod broker_factory;
pub mod in_memory_broker;
pub mod rabbitmq_broker;
pub mod redis_broker;

pub use broker_factory::*;
pub use in_memory_broker::*;
pub use rabbitmq_broker::*;
pub use redis_broker::*;
