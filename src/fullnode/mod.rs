//! fullnode HTTP 调度：单次逻辑调用 = 组装请求 + 附加轮换 key +
//! 限流检测与自愈重试。

mod client;

pub use client::FullnodeClient;
