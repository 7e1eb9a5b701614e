//! HTTP session with the console web server.

use async_trait::async_trait;
use hmibridge_core::Result;

use super::language::LocalizationTable;

/// Script files carrying the localization tables, in load order.
pub const LANGUAGE_SCRIPTS: [&str; 4] =
    ["HMILang1.js", "HMILang2.js", "HMILang3.js", "HMILang4.js"];

/// Endpoint accepting value writes.
pub const WRITE_ENDPOINT: &str = "HMIinput.cgi";

/// Access to one console.
///
/// All paths are relative to the console base URL. Callers serialize access;
/// implementations need not.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Fetch a text resource.
    async fn fetch(&self, path: &str) -> Result<String>;

    /// Fetch a resource as raw bytes.
    async fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>>;

    /// Write `value` to the point identified by `write_id`.
    async fn write(&self, write_id: &str, value: &str) -> Result<()>;
}

/// Load and merge every localization script the console serves.
///
/// Missing scripts are skipped; a console without any yields an empty table.
pub async fn build_languages(session: &dyn DeviceSession) -> LocalizationTable {
    let mut source = String::new();
    for script in LANGUAGE_SCRIPTS {
        match session.fetch(script).await {
            Ok(text) => {
                source.push_str(&text);
                source.push_str("\n\n");
            }
            Err(e) => {
                tracing::debug!(category = "config", script, error = %e, "Localization script unavailable");
            }
        }
    }

    let table = LocalizationTable::parse(&source);
    tracing::info!(category = "config", keys = table.len(), "Loaded localization table");
    table
}

#[cfg(feature = "http")]
pub use http::HmiClient;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use hmibridge_core::{BridgeConfig, Error, Result};
    use reqwest::Client;

    use super::{DeviceSession, WRITE_ENDPOINT};

    /// [`DeviceSession`] over HTTP with basic authentication.
    pub struct HmiClient {
        client: Client,
        base_url: String,
        username: String,
        password: String,
        timeout: Duration,
    }

    impl HmiClient {
        /// `base_url` gets a trailing slash if it lacks one.
        pub fn new(
            base_url: impl Into<String>,
            username: impl Into<String>,
            password: impl Into<String>,
            timeout: Duration,
        ) -> Result<Self> {
            let mut base_url = base_url.into();
            if !base_url.ends_with('/') {
                base_url.push('/');
            }

            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| Error::Configuration(format!("HTTP client: {}", e)))?;

            Ok(Self {
                client,
                base_url,
                username: username.into(),
                password: password.into(),
                timeout,
            })
        }

        pub fn from_config(config: &BridgeConfig) -> Result<Self> {
            Self::new(
                config.base_url(),
                config.username.clone(),
                config.password.clone(),
                config.http_timeout(),
            )
        }

        pub fn base_url(&self) -> &str {
            &self.base_url
        }

        fn get(&self, path: &str) -> reqwest::RequestBuilder {
            self.client
                .get(format!("{}{}", self.base_url, path))
                .basic_auth(&self.username, Some(&self.password))
                .timeout(self.timeout)
        }

        async fn send(
            &self,
            path: &str,
            request: reqwest::RequestBuilder,
        ) -> Result<reqwest::Response> {
            let response = request
                .send()
                .await
                .map_err(|e| Error::fetch(path, e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::fetch(path, format!("HTTP {}", status)));
            }
            Ok(response)
        }
    }

    #[async_trait]
    impl DeviceSession for HmiClient {
        async fn fetch(&self, path: &str) -> Result<String> {
            let bytes = self.fetch_bytes(path).await?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        async fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>> {
            let response = self.send(path, self.get(path)).await?;
            let body = response.bytes().await.map_err(|e| Error::fetch(path, e))?;
            tracing::trace!(category = "http", path, bytes = body.len(), "Fetched");
            Ok(body.to_vec())
        }

        async fn write(&self, write_id: &str, value: &str) -> Result<()> {
            let request = self.get(WRITE_ENDPOINT).query(&[(write_id, value)]);
            self.send(WRITE_ENDPOINT, request)
                .await
                .map_err(|e| Error::write(write_id, e))?;
            tracing::debug!(category = "command", write_id, value, "Value written");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_base_url_gets_trailing_slash() {
            let client =
                HmiClient::new("http://192.168.1.10", "u", "p", Duration::from_secs(10)).unwrap();
            assert_eq!(client.base_url(), "http://192.168.1.10/");
        }

        #[test]
        fn test_from_config() {
            let config = BridgeConfig::from_toml_str("device_host = \"10.0.0.5:8080\"").unwrap();
            let client = HmiClient::from_config(&config).unwrap();
            assert_eq!(client.base_url(), "http://10.0.0.5:8080/");
        }
    }
}
