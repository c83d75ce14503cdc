use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },

    #[error("{message} ({status}, {kind}{})", retryable_note(.retryable))]
    Api {
        status: u16,
        kind: String,
        message: String,
        retryable: bool,
    },

    #[error("unexpected response from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
}

fn retryable_note(retryable: &bool) -> &'static str {
    if *retryable {
        ", retryable"
    } else {
        ""
    }
}

pub fn get<T: DeserializeOwned>(base_uri: &str, path: &str) -> Result<T, RestError> {
    let url = format!("{}{}", base_uri.trim_end_matches('/'), path);
    let client = reqwest::blocking::Client::new();
    let res = client.get(&url).send().map_err(|source| RestError::Transport {
        url: url.clone(),
        source,
    })?;

    handle(&url, res)
}

pub fn post<B, T>(base_uri: &str, path: &str, body: Option<&B>) -> Result<T, RestError>
where
    B: Serialize,
    T: DeserializeOwned,
{
    let url = format!("{}{}", base_uri.trim_end_matches('/'), path);
    let client = reqwest::blocking::Client::new();
    let mut req = client.post(&url);
    if let Some(body) = body {
        req = req.json(body);
    }
    let res = req.send().map_err(|source| RestError::Transport {
        url: url.clone(),
        source,
    })?;

    handle(&url, res)
}

fn handle<T: DeserializeOwned>(
    url: &str,
    res: reqwest::blocking::Response,
) -> Result<T, RestError> {
    let status = res.status();
    let bytes = res.bytes().map_err(|source| RestError::Transport {
        url: url.to_owned(),
        source,
    })?;

    if !status.is_success() {
        return Err(api_error(status.as_u16(), &bytes));
    }

    serde_json::from_slice(&bytes).map_err(|source| RestError::Decode {
        url: url.to_owned(),
        source,
    })
}

/// Read a daemon error body, falling back to the raw text for anything else
pub fn api_error(status: u16, body: &[u8]) -> RestError {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let field = |name: &str| parsed.as_ref().and_then(|v| v.get(name).cloned());

    let message = match field("error").and_then(|v| v.as_str().map(str::to_owned)) {
        Some(message) => message,
        None => String::from_utf8_lossy(body).trim().to_owned(),
    };
    let kind = field("kind")
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_else(|| "unknown".to_owned());
    let retryable = field("retryable")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    RestError::Api {
        status,
        kind,
        message,
        retryable,
    }
}
