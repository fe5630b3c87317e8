use async_trait::async_trait;
use dino_lib::{DinoError, DinoResult};
use reqwest::StatusCode;

use crate::Store;

/// A `Store` talking to a blob server over HTTP: `PUT /{hex-key}` with the
/// value as the body, `GET /{hex-key}` returning it.
pub struct HttpStore {
    address: String,
    client: reqwest::Client,
}

impl HttpStore {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url_for(&self, key: &[u8]) -> String {
        format!("http://{}/{}", self.address, hex::encode(key))
    }
}

#[async_trait]
impl Store for HttpStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> DinoResult<()> {
        let url = self.url_for(key);
        let response = self
            .client
            .put(&url)
            .body(value.to_vec())
            .send()
            .await
            .map_err(|e| DinoError::RemoteError(format!("PUT {} failed: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DinoError::RemoteError(body));
        }
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> DinoResult<Vec<u8>> {
        let url = self.url_for(key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DinoError::RemoteError(format!("GET {} failed: {}", url, e)))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DinoError::NotFound(hex::encode(key)));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| DinoError::RemoteError(format!("read response body: {}", e)))?;
        if !status.is_success() {
            return Err(DinoError::RemoteError(
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }
        Ok(body.to_vec())
    }
}
