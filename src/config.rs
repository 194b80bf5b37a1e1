use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;

const DEFAULT_FULLNODE_URI: &str = "https://api.trongrid.io/";
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_USER_AGENT: &str = "trongate/0.1";
const DEFAULT_RATE_LIMIT_RETRIES: usize = 10;

/// 命中该子串的端点才会启用 fallback key 池
/// （对齐 Python 版本的 `'trongrid' in endpoint_uri` 判断）。
const RECOGNIZED_PROVIDER_MARKER: &str = "trongrid";

/// 端点配置：纯字符串，或从节点映射中选取 `"fullnode"` 条目。
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EndpointUri {
    Nodes { fullnode: String },
    Plain(String),
}

impl EndpointUri {
    pub fn fullnode(&self) -> &str {
        match self {
            Self::Plain(uri) => uri,
            Self::Nodes { fullnode } => fullnode,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint_uri: EndpointUri,
    /// 单次物理请求的超时（毫秒）；限流重试会重新计时。
    pub timeout_ms: u64,
    /// 显式配置的 API Key 列表；非空即启用轮换。
    pub api_keys: Vec<String>,
    /// 未显式配置 key 时的兜底池，仅对识别的服务商端点生效。
    /// Python 版本把示例 key 硬编码在源码里；这里一律由外部配置提供。
    pub fallback_api_keys: Vec<String>,
    /// 限流自愈的重试预算上限。
    pub rate_limit_retries: usize,
    pub user_agent: String,
    pub proxy: String,
    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "FULLNODE_URI")]
    fullnode_uri: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "API_KEYS")]
    api_keys: Option<String>,
    #[serde(alias = "FALLBACK_API_KEYS")]
    fallback_api_keys: Option<String>,
    #[serde(alias = "RATE_LIMIT_RETRIES")]
    rate_limit_retries: Option<usize>,
    #[serde(alias = "USER_AGENT")]
    user_agent: Option<String>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    /// 从 `TRONGATE_` 前缀的环境变量加载配置，缺省值按常量兜底。
    pub fn load() -> Self {
        let raw = Figment::from(Env::prefixed("TRONGATE_"))
            .extract::<RawEnv>()
            .unwrap_or_default();

        Self {
            endpoint_uri: EndpointUri::Plain(
                raw.fullnode_uri
                    .unwrap_or_else(|| DEFAULT_FULLNODE_URI.to_string()),
            ),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            api_keys: parse_key_list(raw.api_keys.as_deref()),
            fallback_api_keys: parse_key_list(raw.fallback_api_keys.as_deref()),
            rate_limit_retries: raw.rate_limit_retries.unwrap_or(DEFAULT_RATE_LIMIT_RETRIES),
            user_agent: raw
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            proxy: raw.proxy.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        }
    }

    /// 实际参与轮换的 key 列表：
    /// - 显式配置的 key 对任意端点生效（也便于对本地 mock 端点启用轮换）；
    /// - 否则仅当端点命中识别的服务商域名时使用 fallback 池；
    /// - 两者皆空则关闭轮换。
    pub fn effective_api_keys(&self) -> Vec<String> {
        if !self.api_keys.is_empty() {
            return self.api_keys.clone();
        }
        if self.is_recognized_provider() {
            return self.fallback_api_keys.clone();
        }
        Vec::new()
    }

    pub fn is_recognized_provider(&self) -> bool {
        self.endpoint_uri
            .fullnode()
            .contains(RECOGNIZED_PROVIDER_MARKER)
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_uri: EndpointUri::Plain(DEFAULT_FULLNODE_URI.to_string()),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            api_keys: Vec::new(),
            fallback_api_keys: Vec::new(),
            rate_limit_retries: DEFAULT_RATE_LIMIT_RETRIES,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            proxy: String::new(),
            debug: "off".to_string(),
        }
    }
}

fn parse_key_list(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
