//! trongate：TRON fullnode HTTP 调度核心。
//!
//! 对外只做一件事：把 `execute(method, params)` 变成一次对 fullnode 的
//! POST 请求，并在 TronGrid 按 key 限流时通过轮换 API Key 自愈重试。
//! 传输层（连接池/TLS/代理）由 reqwest 承担，JSON 由 sonic-rs 承担。

pub mod config;
pub mod error;
pub mod fullnode;
pub mod keypool;
pub mod logging;
pub mod util;

pub use config::{Config, EndpointUri};
pub use error::GatewayError;
pub use fullnode::FullnodeClient;
pub use keypool::{BoundedCounter, KeyRotator};
