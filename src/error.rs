use thiserror::Error;

pub type Result<T> = std::result::Result<T, SentinelError>;

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("indexer error: {0}")]
    Indexer(#[from] IndexerError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("scan task failure: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("fork session failure: {0}")]
    Fork(String),
    #[error("unexpected call return data: {0}")]
    BadReturnData(String),
}

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("query failed after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Collapse RPC/transport error text into one log-friendly line. Raw provider
/// errors embed full response bodies and backtraces, which drown the scan log.
pub fn compact_error_message(message: &str, max_len: usize) -> String {
    let mut raw = message.to_string();
    if let Some((prefix, _)) = raw.split_once(" text: ") {
        raw = format!("{prefix} text=<omitted>");
    }
    if let Some((prefix, _)) = raw.split_once("Stack backtrace:") {
        raw = prefix.to_string();
    }

    let mut compact = String::with_capacity(raw.len().min(max_len.saturating_add(16)));
    let mut prev_ws = false;
    for ch in raw.chars() {
        if ch.is_whitespace() {
            if !prev_ws && !compact.is_empty() {
                compact.push(' ');
            }
            prev_ws = true;
            continue;
        }
        compact.push(ch);
        prev_ws = false;
        if compact.len() > max_len {
            break;
        }
    }
    if compact.len() <= max_len {
        compact
    } else {
        // Back off to a char boundary so multibyte text cannot panic.
        let mut cut = max_len;
        while cut > 0 && !compact.is_char_boundary(cut) {
            cut -= 1;
        }
        compact.truncate(cut);
        compact.push_str("...(truncated)");
        compact
    }
}
