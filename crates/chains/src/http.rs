use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::ChainError;

pub(crate) fn client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

/// GET a JSON document. A 404 yields `Ok(None)`.
pub(crate) async fn get_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    headers: &[(&str, &str)],
) -> Result<Option<T>, ChainError> {
    let mut request = client.get(url);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }

    let response = request.send().await?;
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let body = response.error_for_status()?.json::<T>().await?;
    Ok(Some(body))
}

/// Like [`get_json`], but a missing document is an error.
pub(crate) async fn get_required<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    headers: &[(&str, &str)],
) -> Result<T, ChainError> {
    get_json(client, url, headers)
        .await?
        .ok_or_else(|| ChainError::Rpc(format!("not found: {url}")))
}
