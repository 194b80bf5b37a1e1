//! API Key 轮换池。
//!
//! 职责：为每个出站请求提供一个 key，把负载摊到整个池上，
//! 并避免并发调用者在同一个 key 上反复碰撞；key 被服务商限流后
//! 可以从池中移除，池的下标界与长度始终同步。

mod counter;
mod rotator;

pub use counter::BoundedCounter;
pub use rotator::KeyRotator;
