use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("fullnode 错误 {status}: {body}")]
    Http { status: u16, body: String },

    #[error("API Key 不在池中: {0}")]
    KeyNotFound(String),

    /// 限流自愈重试预算耗尽。与 Python 版本的无限递归不同，
    /// 重试次数有上限，超限后把限流暴露给调用方。
    #[error("限流重试 {attempts} 次后仍未恢复")]
    RateLimitExhausted { attempts: usize },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl GatewayError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
