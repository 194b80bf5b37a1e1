use reqwest::header::HeaderMap;
use sonic_rs::prelude::*;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// 日志等级（对齐 Python 版本"只往 stderr 打限流警告"的行为，并扩展请求日志）：
/// - off：只保留限流等 warn 级诊断
/// - backend：输出后端请求/响应（格式化/脱敏）
/// - raw：输出后端请求/响应（完全原始：不折叠/不格式化）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Backend = 1,
    Raw = 2,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "backend" | "low" | "medium" => Self::Backend,
            "raw" | "high" | "all" => Self::Raw,
            _ => Self::Off,
        }
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Backend
    }

    /// 是否启用“完全原始”日志（raw）。
    pub fn raw_enabled(self) -> bool {
        self >= Self::Raw
    }
}

/// 初始化 tracing 订阅器。依赖库日志默认压到 warn，
/// 本项目自身日志保持 info，避免环境预设的 RUST_LOG 把限流诊断过滤掉。
pub fn init_tracing(cfg: &crate::config::Config) {
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("warn")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,trongate=info")
        } else if env.contains("trongate") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},trongate=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn backend_request(method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n{}\n==========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn backend_request_raw(method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n=================== 后端请求（RAW） ===================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n[后端请求体]\n{}\n=========================================================",
        format_headers_raw(headers),
        format_bytes_raw(body),
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

pub fn backend_response_raw(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n=================== 后端响应（RAW） ===================\n[后端响应] {} {}ms\n{}\n=========================================================",
        status,
        format_duration_ms(duration),
        format_bytes_raw(body),
    );
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut obj = sonic_rs::Object::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();
        let key_lc = key.to_lowercase();

        // API Key 即凭证，脱敏输出。
        let redacted = key_lc == "tron-pro-api-key"
            || key_lc == "authorization"
            || key_lc == "proxy-authorization";

        let v = if redacted {
            sonic_rs::Value::from("***")
        } else {
            match value.to_str() {
                Ok(s) => sonic_rs::Value::from(s),
                Err(_) => sonic_rs::Value::from("<binary>"),
            }
        };

        // HeaderMap 可能存在同名多值，统一用数组输出，避免信息丢失。
        if let Some(existing) = obj.get(&key).and_then(|v| v.as_array()) {
            let mut arr = existing.to_vec();
            arr.push(v);
            obj.insert(key, arr);
        } else {
            obj.insert(key, vec![v]);
        }
    }

    format_body_value(&obj.into_value())
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    match sonic_rs::to_string_pretty(v) {
        Ok(s) => s,
        Err(_) => v.to_string(),
    }
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    // 极端大包：避免为了日志反序列化/格式化而产生巨额内存与 CPU 开销。
    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    const HEAD_TAIL: usize = 16 * 1024;

    if bytes.len() > MAX_PARSE_BYTES {
        let head_len = bytes.len().min(HEAD_TAIL);
        let tail_len = bytes.len().saturating_sub(head_len).min(HEAD_TAIL);
        let head = &bytes[..head_len];
        let tail = &bytes[bytes.len() - tail_len..];
        let head_s = String::from_utf8_lossy(head);
        let tail_s = String::from_utf8_lossy(tail);
        return format!(
            "(body too large: {} bytes, showing head/tail)\n--- head ---\n{}\n--- tail ---\n{}",
            bytes.len(),
            truncate_text_for_log(&head_s),
            truncate_text_for_log(&tail_s)
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn format_headers_raw(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or("<non-utf8>"));
        out.push('\n');
    }
    out
}

fn format_bytes_raw(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    String::from_utf8_lossy(bytes).to_string()
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out = String::with_capacity(MAX_CHARS + 64);
    for (i, ch) in s.chars().enumerate() {
        if i >= MAX_CHARS {
            break;
        }
        out.push(ch);
    }
    out.push_str("...[TRUNCATED]");
    out
}
