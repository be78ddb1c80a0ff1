//! HTTP surface and process wiring for pushfan.
//!
//! The server accepts send requests, hands each one to the background
//! dispatch queue, and records the received/clicked callbacks coming back
//! from service workers.

pub mod config;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod redis_publisher;
pub mod server;
pub mod transport;

pub use config::{
    AppConfig, LoggingConfig, PushConfig, RedisConfig, ServerConfig, StorageBackend, StorageConfig,
};
pub use error::ApiError;
pub use observability::{apply_logging_level, init_tracing};
pub use redis_publisher::{RedisQueuePublisher, create_redis_pool};
pub use server::{AppState, PushfanServer, ServerBuilder, Stores, build_app};
pub use transport::UnconfiguredTokenTransport;
