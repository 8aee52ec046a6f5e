use std::future::Future;

use anyhow::{Context, Result};
use reqwest::Response;
use serde::de::DeserializeOwned;

/// simd-json decoding for reqwest response bodies.
pub trait ResponseSimdJsonExt {
    /// Read the whole body and decode it. The future is `Send` so it can be
    /// awaited inside `#[async_trait]` provider methods.
    fn simd_json<T>(self) -> impl Future<Output = Result<T>> + Send
    where
        T: DeserializeOwned;
}

impl ResponseSimdJsonExt for Response {
    fn simd_json<T>(self) -> impl Future<Output = Result<T>> + Send
    where
        T: DeserializeOwned,
    {
        async move {
            let url = self.url().clone();
            let bytes = self
                .bytes()
                .await
                .with_context(|| format!("Failed to read response body from {url}"))?;
            let mut body = bytes.to_vec();
            parse_json_slice(&mut body)
        }
    }
}

/// Decode a JSON buffer in place; simd-json rewrites the buffer while parsing.
pub fn parse_json_slice<T>(bytes: &mut [u8]) -> Result<T>
where
    T: DeserializeOwned,
{
    simd_json::from_slice(bytes).context("Failed to parse JSON response")
}
