use crate::config::Config;
use crate::error::GatewayError;
use crate::keypool::KeyRotator;
use crate::logging;
use reqwest::Url;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use sonic_rs::Value;
use std::time::Duration;

/// 凭证头：固定的单静态头模型，不做其他鉴权方案。
const API_KEY_HEADER: &str = "Tron-Pro-Api-Key";

/// TronGrid 按 key 限流的识别特征：403 且响应体含该字面量。
const RATE_LIMIT_STATUS: u16 = 403;
const RATE_LIMIT_MARKER: &str = "Exceed the user daily usage";

/// 单 key 池触发限流时的退避时长（对齐 Python 版本的 `time.sleep(0.9)`），
/// 避免对仍在限流中的唯一 key 打出紧密重试循环。
const SINGLE_KEY_BACKOFF: Duration = Duration::from_millis(900);

/// fullnode 调度器：一次 `execute` 完成端点拼接、key 附加、限流自愈与重试。
#[derive(Debug)]
pub struct FullnodeClient {
    http: reqwest::Client,
    base: Url,
    rotator: Option<KeyRotator>,
    rate_limit_retries: usize,
    user_agent: String,
    log_level: logging::LogLevel,
}

impl FullnodeClient {
    pub fn new(cfg: &Config) -> Result<Self, GatewayError> {
        let raw_uri = cfg.endpoint_uri.fullnode();
        let base = Url::parse(raw_uri).map_err(|e| {
            GatewayError::config(format!("无法解析 fullnode 端点 {raw_uri}: {e}"))
        })?;

        let keys = cfg.effective_api_keys();
        let rotator = if keys.is_empty() {
            if cfg.is_recognized_provider() {
                tracing::warn!("未配置任何 API Key，TronGrid 端点将以匿名方式请求，容易触发限流");
            }
            None
        } else {
            Some(KeyRotator::new(keys)?)
        };

        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));
        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }
        let http = builder.build()?;

        Ok(Self {
            http,
            base,
            rotator,
            rate_limit_retries: cfg.rate_limit_retries,
            user_agent: cfg.user_agent.clone(),
            log_level: cfg.log_level(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn rotation_enabled(&self) -> bool {
        self.rotator.is_some()
    }

    /// 轮换池视图，供诊断与测试断言使用。
    pub fn rotator(&self) -> Option<&KeyRotator> {
        self.rotator.as_ref()
    }

    /// 均匀随机取一个池内 key；仅用于诊断（对齐 Python 版本的 random_api_key）。
    pub async fn random_api_key(&self) -> Option<String> {
        match &self.rotator {
            Some(r) => Some(r.random_key().await),
            None => None,
        }
    }

    /// 执行一次逻辑调用：POST `<base>/<method>`，body 为 `params`（缺省 `{}`）。
    ///
    /// 限流（403 + 特征文案）走自愈路径：告警、轮换池恢复、重试；重试预算
    /// 有上限。其余非 2xx 原样上抛，传输错误不在本层重试。
    pub async fn execute(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, GatewayError> {
        // 相对路径按 RFC 3986 拼接；method 为绝对 URI 时整体取代 base。
        let url = self.base.join(method).map_err(|e| {
            GatewayError::config(format!("无法拼接方法路径 {method}: {e}"))
        })?;
        let body = match &params {
            Some(p) => sonic_rs::to_vec(p)?,
            None => b"{}".to_vec(),
        };

        let mut rate_limited = 0usize;
        loop {
            // 本次尝试使用的 key 只存在于当前执行路径上，
            // 不经过任何共享可变头状态，因此并发调用互不干扰。
            let api_key = match &self.rotator {
                Some(r) => Some(r.current_key().await),
                None => None,
            };
            let headers = self.build_headers(api_key.as_deref());

            if self.log_level.backend_enabled() {
                if self.log_level.raw_enabled() {
                    logging::backend_request_raw("POST", url.as_str(), &headers, &body);
                } else {
                    logging::backend_request("POST", url.as_str(), &headers, &body);
                }
            }

            let start = std::time::Instant::now();
            let resp = self
                .http
                .post(url.clone())
                .headers(headers)
                .body(body.clone())
                .send()
                .await?;

            let status = resp.status();
            let bytes = resp.bytes().await?;
            if self.log_level.backend_enabled() {
                if self.log_level.raw_enabled() {
                    logging::backend_response_raw(status.as_u16(), start.elapsed(), &bytes);
                } else {
                    logging::backend_response(status.as_u16(), start.elapsed(), &bytes);
                }
            }

            if let (Some(rotator), Some(used_key)) = (&self.rotator, api_key.as_deref())
                && is_rate_limit_response(status.as_u16(), &bytes)
            {
                tracing::warn!("fullnode 限流: {}", rate_limit_message(&bytes));
                if rate_limited == self.rate_limit_retries {
                    return Err(GatewayError::RateLimitExhausted {
                        attempts: rate_limited,
                    });
                }
                rate_limited += 1;
                self.recover_rate_limit(rotator, used_key).await?;
                continue;
            }

            if !status.is_success() {
                return Err(GatewayError::Http {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }
            return Ok(sonic_rs::from_slice(&bytes)?);
        }
    }

    /// 限流自愈：池内还有多个 key 时，永久移除刚刚触发限流的那个；
    /// 只剩一个 key 时不移除（移除会让后续请求无 key 可用），
    /// 告警并短暂退避后再重试。
    async fn recover_rate_limit(
        &self,
        rotator: &KeyRotator,
        used_key: &str,
    ) -> Result<(), GatewayError> {
        if rotator.len().await > 1 {
            rotator.remove(used_key).await?;
        } else {
            tracing::warn!(
                "key 池只剩一个 API Key，请为 FullnodeClient 配置更多 key；{}ms 后重试",
                SINGLE_KEY_BACKOFF.as_millis()
            );
            tokio::time::sleep(SINGLE_KEY_BACKOFF).await;
        }
        Ok(())
    }

    fn build_headers(&self, api_key: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .unwrap_or(HeaderValue::from_static("trongate")),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            h.insert(
                API_KEY_HEADER,
                HeaderValue::from_str(key).unwrap_or(HeaderValue::from_static("")),
            );
        }
        h
    }
}

fn is_rate_limit_response(status: u16, body: &[u8]) -> bool {
    status == RATE_LIMIT_STATUS && String::from_utf8_lossy(body).contains(RATE_LIMIT_MARKER)
}

/// 提取服务商返回的 `Error` 字段；拿不到就退回通用文案
/// （对齐 Python 版本的 `resp.json().get('Error', 'rate limit!')`）。
fn rate_limit_message(body: &[u8]) -> String {
    #[derive(Debug, serde::Deserialize)]
    struct ErrBody {
        #[serde(rename = "Error", default)]
        error: Option<String>,
    }

    sonic_rs::from_slice::<ErrBody>(body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| "rate limit!".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointUri;
    use sonic_rs::{JsonContainerTrait, JsonValueTrait};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    const MARKER_BODY: &str = r#"{"Error": "Exceed the user daily usage, please upgrade"}"#;

    fn client_for(server_uri: &str, keys: &[&str], retries: usize) -> FullnodeClient {
        let cfg = Config {
            endpoint_uri: EndpointUri::Plain(format!("{server_uri}/")),
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
            rate_limit_retries: retries,
            ..Config::default()
        };
        FullnodeClient::new(&cfg).unwrap()
    }

    /// 先返回 n 次限流响应，之后一律 200。
    struct RateLimitThenOk {
        remaining: AtomicUsize,
    }

    impl RateLimitThenOk {
        fn new(n: usize) -> Self {
            Self {
                remaining: AtomicUsize::new(n),
            }
        }
    }

    impl Respond for RateLimitThenOk {
        fn respond(&self, _req: &Request) -> ResponseTemplate {
            let rate_limited = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok();
            if rate_limited {
                ResponseTemplate::new(403).set_body_string(MARKER_BODY)
            } else {
                ResponseTemplate::new(200).set_body_string(r#"{"ok": true}"#)
            }
        }
    }

    #[tokio::test]
    async fn success_returns_parsed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/wallet/getnowblock"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"result": true}"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), &[], 3);
        let v = client.execute("wallet/getnowblock", None).await.unwrap();
        assert_eq!(
            v.as_object()
                .and_then(|o| o.get(&"result"))
                .and_then(|x| x.as_bool()),
            Some(true)
        );
    }

    #[tokio::test]
    async fn params_are_posted_as_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/wallet/getblockbynum"))
            .and(body_json(serde_json::json!({"num": 100})))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), &[], 3);
        let params: Value = sonic_rs::from_str(r#"{"num": 100}"#).unwrap();
        client
            .execute("wallet/getblockbynum", Some(params))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rate_limit_removes_burned_key_and_recovers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(RateLimitThenOk::new(1))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), &["k1", "k2"], 5);
        let v = client.execute("wallet/getnowblock", None).await.unwrap();
        assert!(
            v.as_object()
                .and_then(|o| o.get(&"ok"))
                .and_then(|x| x.as_bool())
                .unwrap()
        );

        // 触发限流的 key 被永久移除，剩余的仍来自原始池。
        let rotator = client.rotator().unwrap();
        let left = rotator.keys().await;
        assert_eq!(left.len(), 1);
        assert!(["k1", "k2"].contains(&left[0].as_str()));
    }

    #[tokio::test]
    async fn single_key_is_kept_and_retried_after_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(RateLimitThenOk::new(1))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), &["only"], 5);
        let start = std::time::Instant::now();
        client.execute("wallet/getnowblock", None).await.unwrap();

        // 单 key 不移除：退避后用同一个 key 重试成功。
        assert!(start.elapsed() >= SINGLE_KEY_BACKOFF);
        assert_eq!(client.rotator().unwrap().keys().await, vec!["only"]);
    }

    #[tokio::test]
    async fn retry_budget_exhausts_into_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(RateLimitThenOk::new(usize::MAX))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), &["k1", "k2"], 1);
        let err = client.execute("wallet/getnowblock", None).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::RateLimitExhausted { attempts: 1 }
        ));
    }

    #[tokio::test]
    async fn non_403_propagates_without_retry_or_pool_mutation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), &["k1", "k2"], 5);
        let err = client.execute("wallet/getnowblock", None).await.unwrap_err();
        match err {
            GatewayError::Http { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("boom"));
            }
            other => panic!("预期 Http 错误，实际 {other:?}"),
        }
        assert_eq!(client.rotator().unwrap().len().await, 2);
    }

    #[tokio::test]
    async fn forbidden_without_marker_is_not_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Access denied"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), &["k1", "k2"], 5);
        let err = client.execute("wallet/getnowblock", None).await.unwrap_err();
        assert_eq!(err.status(), Some(403));
        assert_eq!(client.rotator().unwrap().len().await, 2);
    }

    #[tokio::test]
    async fn rotation_attaches_key_header_per_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Tron-Pro-Api-Key", "k1"))
            .and(header("User-Agent", "trongate/0.1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), &["k1"], 5);
        client.execute("wallet/getnowblock", None).await.unwrap();
    }

    /// 轮换关闭时请求不带凭证头。
    struct NoApiKeyHeader;

    impl wiremock::Match for NoApiKeyHeader {
        fn matches(&self, request: &Request) -> bool {
            !request.headers.contains_key("tron-pro-api-key")
        }
    }

    #[tokio::test]
    async fn no_rotation_sends_no_key_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(NoApiKeyHeader)
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), &[], 5);
        assert!(!client.rotation_enabled());
        client.execute("wallet/getnowblock", None).await.unwrap();
    }

    #[tokio::test]
    async fn nodes_mapping_resolves_base_url() {
        let cfg = Config {
            endpoint_uri: EndpointUri::Nodes {
                fullnode: "https://x.example/".to_string(),
            },
            ..Config::default()
        };
        let client = FullnodeClient::new(&cfg).unwrap();
        assert_eq!(client.base_url().as_str(), "https://x.example/");
    }

    #[tokio::test]
    async fn invalid_endpoint_uri_is_a_config_error() {
        let cfg = Config {
            endpoint_uri: EndpointUri::Plain("not a uri".to_string()),
            ..Config::default()
        };
        assert!(matches!(
            FullnodeClient::new(&cfg).unwrap_err(),
            GatewayError::Config(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_executes_share_one_dispatcher() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let client = Arc::new(client_for(&server.uri(), &["k1", "k2", "k3"], 5));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    client.execute("wallet/getnowblock", None).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(client.rotator().unwrap().len().await, 3);
    }
}
