//! Client for the Strava push subscription API.
//!
//! [`SubscriptionClient`] is the seam between the reconciler and the remote
//! service. [`StravaClient`] implements it over HTTP; tests substitute
//! [`MemorySubscriptionClient`](crate::testing::MemorySubscriptionClient).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::{Credentials, ProviderConfig};
use crate::error::ClientError;

/// A push subscription as reported by Strava.
///
/// Fields absent from a response keep their default value; the create
/// endpoint only returns `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionRecord {
    /// Subscription ID.
    pub id: i64,
    /// Strava resource state of the subscription.
    pub resource_state: i64,
    /// Strava API application ID owning the subscription.
    pub application_id: i64,
    /// Address where webhook events are sent.
    pub callback_url: String,
    /// Creation timestamp.
    pub created_at: String,
    /// Last modification timestamp.
    pub updated_at: String,
}

/// Operations the reconciler needs from the remote service.
#[async_trait]
pub trait SubscriptionClient: Send + Sync {
    /// Create a subscription. Strava validates `callback_url` synchronously
    /// by echoing `verify_token` to it.
    async fn create_subscription(
        &self,
        callback_url: &str,
        verify_token: &str,
    ) -> Result<SubscriptionRecord, ClientError>;

    /// Fetch a single subscription.
    async fn get_subscription(&self, id: i64) -> Result<SubscriptionRecord, ClientError>;

    /// List every subscription visible to the credentials.
    async fn get_all_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, ClientError>;

    /// Delete a subscription.
    async fn delete_subscription(&self, id: i64) -> Result<(), ClientError>;
}

/// HTTP client for `https://www.strava.com/api/v3/push_subscriptions`.
#[derive(Debug, Clone)]
pub struct StravaClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
}

impl StravaClient {
    /// Build a client from resolved provider configuration.
    pub fn new(config: ProviderConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("hemmer-provider-strava/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url,
            credentials: config.credentials,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base_url.join(path)?)
    }

    fn auth_query(&self) -> [(&'static str, &str); 2] {
        [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ]
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(ClientError::Api {
        status: status.as_u16(),
        body: error_body(response.text().await),
    })
}

fn error_body(body: Result<String, reqwest::Error>) -> String {
    body.unwrap_or_else(|e| format!("<unreadable body: {}>", e.without_url()))
}

#[async_trait]
impl SubscriptionClient for StravaClient {
    async fn create_subscription(
        &self,
        callback_url: &str,
        verify_token: &str,
    ) -> Result<SubscriptionRecord, ClientError> {
        let url = self.endpoint("push_subscriptions")?;
        debug!(%url, callback_url, "POST push subscription");

        let response = self
            .http
            .post(url)
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("callback_url", callback_url),
                ("verify_token", verify_token),
            ])
            .send()
            .await?;

        Ok(check_status(response).await?.json().await?)
    }

    async fn get_subscription(&self, id: i64) -> Result<SubscriptionRecord, ClientError> {
        // The API has no single-subscription endpoint.
        self.get_all_subscriptions()
            .await?
            .into_iter()
            .find(|record| record.id == id)
            .ok_or(ClientError::NotFound(id))
    }

    async fn get_all_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, ClientError> {
        let url = self.endpoint("push_subscriptions")?;
        debug!(%url, "GET push subscriptions");

        let response = self.http.get(url).query(&self.auth_query()).send().await?;

        Ok(check_status(response).await?.json().await?)
    }

    async fn delete_subscription(&self, id: i64) -> Result<(), ClientError> {
        let url = self.endpoint(&format!("push_subscriptions/{}", id))?;
        debug!(%url, "DELETE push subscription");

        let response = self.http.delete(url).query(&self.auth_query()).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TIMEOUT;
    use crate::error::{Operation, Phase, ProviderError};
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> Result<StravaClient, Box<dyn std::error::Error>> {
        client_with_timeout(server, DEFAULT_TIMEOUT)
    }

    fn client_with_timeout(
        server: &MockServer,
        timeout: Duration,
    ) -> Result<StravaClient, Box<dyn std::error::Error>> {
        client_with_secret(server, timeout, "secret")
    }

    fn client_with_secret(
        server: &MockServer,
        timeout: Duration,
        client_secret: &str,
    ) -> Result<StravaClient, Box<dyn std::error::Error>> {
        let config = ProviderConfig {
            credentials: Credentials {
                client_id: "5".to_string(),
                client_secret: client_secret.to_string(),
            },
            base_url: format!("{}/api/v3/", server.uri()).parse()?,
            timeout,
        };
        Ok(StravaClient::new(config)?)
    }

    fn record_json(id: i64, callback_url: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "resource_state": 2,
            "application_id": 5,
            "callback_url": callback_url,
            "created_at": "2024-01-01T00:00:00+00:00",
            "updated_at": "2024-01-01T00:00:00+00:00"
        })
    }

    #[tokio::test]
    async fn test_create_subscription_posts_form() -> Result<(), Box<dyn std::error::Error>> {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v3/push_subscriptions"))
            .and(body_string_contains("client_id=5"))
            .and(body_string_contains("client_secret=secret"))
            .and(body_string_contains(
                "callback_url=https%3A%2F%2Fexample.com%2Fhook",
            ))
            .and(body_string_contains("verify_token=t0k3n"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": 100})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server)?;
        let record = client
            .create_subscription("https://example.com/hook", "t0k3n")
            .await?;

        assert_eq!(record.id, 100);
        assert_eq!(record.callback_url, "");
        Ok(())
    }

    #[tokio::test]
    async fn test_get_all_subscriptions() -> Result<(), Box<dyn std::error::Error>> {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v3/push_subscriptions"))
            .and(query_param("client_id", "5"))
            .and(query_param("client_secret", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                record_json(1, "https://a.example.com"),
                record_json(2, "https://b.example.com"),
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server)?;
        let records = client.get_all_subscriptions().await?;

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id, 2);
        assert_eq!(records[1].callback_url, "https://b.example.com");
        assert_eq!(records[0].resource_state, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_subscription_filters_list() -> Result<(), Box<dyn std::error::Error>> {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v3/push_subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                record_json(7, "https://example.com/hook"),
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server)?;

        let record = client.get_subscription(7).await?;
        assert_eq!(record.callback_url, "https://example.com/hook");

        let missing = client.get_subscription(8).await;
        assert!(matches!(missing, Err(ClientError::NotFound(8))));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_subscription() -> Result<(), Box<dyn std::error::Error>> {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/api/v3/push_subscriptions/100"))
            .and(query_param("client_id", "5"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server)?;
        client.delete_subscription(100).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_missing_subscription_is_error() -> Result<(), Box<dyn std::error::Error>>
    {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/api/v3/push_subscriptions/404"))
            .respond_with(
                ResponseTemplate::new(404).set_body_string(r#"{"message":"Resource Not Found"}"#),
            )
            .mount(&server)
            .await;

        let client = client_for(&server)?;
        let result = client.delete_subscription(404).await;

        match result {
            Err(ClientError::Api { status, body }) => {
                assert_eq!(status, 404);
                assert!(body.contains("Resource Not Found"));
            },
            other => panic!("expected API error, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejected_by_api() -> Result<(), Box<dyn std::error::Error>> {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v3/push_subscriptions"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"errors":[{"resource":"PushSubscription","field":"callback url","code":"GET to callback URL does not return 200"}]}"#,
            ))
            .mount(&server)
            .await;

        let client = client_for(&server)?;
        let err = client
            .create_subscription("https://example.com/hook", "t0k3n")
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("400"), "unexpected error message: {message}");
        assert!(message.contains("callback URL does not return 200"));
        Ok(())
    }

    #[tokio::test]
    async fn test_request_timeout() -> Result<(), Box<dyn std::error::Error>> {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v3/push_subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let client = client_with_timeout(&server, Duration::from_millis(100))?;
        let result = client.get_all_subscriptions().await;

        assert!(matches!(result, Err(ClientError::Http(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_transport_error_hides_client_secret() -> Result<(), Box<dyn std::error::Error>> {
        let server = MockServer::start().await;

        for verb in ["GET", "DELETE"] {
            Mock::given(method(verb))
                .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
                .mount(&server)
                .await;
        }

        let client = client_with_secret(&server, Duration::from_millis(100), "TOPSECRET123")?;

        let err = client.get_all_subscriptions().await.unwrap_err();
        let message = ProviderError::remote(Operation::List, Phase::List, err).to_string();
        assert!(message.starts_with("list failed in list phase: HTTP error"));
        assert!(!message.contains("TOPSECRET123"), "secret leaked: {message}");

        let err = client.delete_subscription(100).await.unwrap_err();
        let message = ProviderError::remote(Operation::Delete, Phase::Delete, err).to_string();
        assert!(!message.contains("TOPSECRET123"), "secret leaked: {message}");
        assert!(!message.contains("client_secret"), "query leaked: {message}");
        Ok(())
    }

    #[tokio::test]
    async fn test_unreadable_error_body_is_marked() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:1/push_subscriptions?client_secret=TOPSECRET123")
            .send()
            .await
            .unwrap_err();

        let body = error_body(Err(err));
        assert!(body.starts_with("<unreadable body: "), "unexpected body: {body}");
        assert!(!body.contains("TOPSECRET123"));
        assert_eq!(error_body(Ok("{}".to_string())), "{}");
    }
}
