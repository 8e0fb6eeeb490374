//! Feed transport.
//!
//! The engine's only contact with the network for checking: an HTTP GET of
//! the feed URL, optionally decorated with the anonymized system profile as
//! query parameters and with host-supplied headers. The response bytes go
//! straight to the raw-record parser; nothing here interprets the feed.

use reqwest::Client;

use crate::appcast::AppcastError;

/// HTTP client for feed requests.
#[derive(Debug, Clone)]
pub struct FeedClient {
    client: Client,
    user_agent: String,
    headers: Vec<(String, String)>,
}

impl FeedClient {
    /// Creates a feed client with the given user agent and extra headers.
    pub fn new(user_agent: impl Into<String>, headers: Vec<(String, String)>) -> Self {
        Self {
            client: Client::new(),
            user_agent: user_agent.into(),
            headers,
        }
    }

    /// Creates a feed client sharing an existing reqwest client.
    pub fn with_client(
        client: Client,
        user_agent: impl Into<String>,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
            headers,
        }
    }

    /// Fetches the raw feed bytes.
    ///
    /// `profile` pairs are appended as query parameters; pass an empty slice
    /// when the user has not consented to profile sending.
    pub async fn fetch(
        &self,
        url: &str,
        profile: &[(String, String)],
    ) -> Result<Vec<u8>, AppcastError> {
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, &self.user_agent);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !profile.is_empty() {
            request = request.query(profile);
        }

        tracing::debug!(url, "fetching appcast");
        let response = request.send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_sends_user_agent_and_profile() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/appcast.json")
            .match_header("user-agent", "updraft-test/1.0")
            .match_header("x-feed-token", "sesame")
            .match_query(mockito::Matcher::UrlEncoded("osVersion".into(), "14.0".into()))
            .with_body(b"[]")
            .create_async()
            .await;

        let client = FeedClient::new(
            "updraft-test/1.0",
            vec![("x-feed-token".to_string(), "sesame".to_string())],
        );
        let profile = vec![("osVersion".to_string(), "14.0".to_string())];
        let bytes = client
            .fetch(&format!("{}/appcast.json", server.url()), &profile)
            .await
            .unwrap();

        assert_eq!(bytes, b"[]");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_surfaces_http_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/appcast.json")
            .with_status(500)
            .create_async()
            .await;

        let client = FeedClient::new("updraft-test/1.0", Vec::new());
        let result = client
            .fetch(&format!("{}/appcast.json", server.url()), &[])
            .await;
        assert!(matches!(result, Err(AppcastError::Http(_))));
    }
}
