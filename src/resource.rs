//! The `strava_push_subscription` resource.
//!
//! [`PushSubscriptionResource`] reconciles one remote push subscription with
//! the state the driver has cached for it. Strava offers no in-place update
//! for subscriptions, so every update is a delete followed by a create.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{SubscriptionClient, SubscriptionRecord};
use crate::error::{Operation, Phase, ProviderError};
use crate::schema::{Attribute, Schema};
use crate::types::is_unknown;
use crate::validation::validate_result;

/// Type name of the resource.
pub const RESOURCE_TYPE: &str = "strava_push_subscription";

/// Strava's limit on callback URL length.
pub const MAX_CALLBACK_URL_LENGTH: usize = 255;

/// Schema for `strava_push_subscription`.
pub fn schema() -> Schema {
    Schema::v0()
        .with_description("Manages a Strava push subscription.")
        .with_attribute(
            "id",
            Attribute::computed_int64().with_description("Push subscription ID."),
        )
        .with_attribute(
            "last_updated",
            Attribute::computed_string()
                .with_description("Timestamp of the last provider update to the push subscription."),
        )
        .with_attribute(
            "resource_state",
            Attribute::computed_int64().with_description("State of the push subscription."),
        )
        .with_attribute(
            "application_id",
            Attribute::computed_int64().with_description("Strava API application ID."),
        )
        .with_attribute(
            "callback_url",
            Attribute::required_string()
                .with_description(
                    "Address where webhook events will be sent; maximum length of 255 characters.",
                )
                .with_max_length(MAX_CALLBACK_URL_LENGTH)
                .with_force_new(),
        )
        .with_attribute(
            "verify_token",
            Attribute::required_string()
                .with_description(
                    "String chosen by the application owner for client security. Strava echoes it \
                     in the validation request sent to the callback URL.",
                )
                .sensitive()
                .with_force_new(),
        )
        .with_attribute(
            "created_at",
            Attribute::computed_string()
                .with_description("Date and time the subscription was created."),
        )
        .with_attribute(
            "updated_at",
            Attribute::computed_string()
                .with_description("Date and time the subscription was last updated."),
        )
}

/// Desired configuration of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionSpec {
    /// Address where webhook events will be sent.
    pub callback_url: String,
    /// Token Strava echoes to the callback during validation.
    pub verify_token: String,
}

impl SubscriptionSpec {
    /// Create a spec.
    pub fn new(callback_url: impl Into<String>, verify_token: impl Into<String>) -> Self {
        Self {
            callback_url: callback_url.into(),
            verify_token: verify_token.into(),
        }
    }

    /// Extract and validate the spec from a planned state.
    ///
    /// Values the driver still marks unknown are rejected.
    pub fn from_state(state: &Value) -> Result<Self, ProviderError> {
        let schema = schema();
        if let Err(diagnostics) = validate_result(&schema, state) {
            let summary = diagnostics
                .iter()
                .map(|d| match &d.detail {
                    Some(detail) => format!("{}: {}", d.summary, detail),
                    None => d.summary.clone(),
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ProviderError::Validation(summary));
        }

        let unknown: Vec<&str> = schema
            .configurable_attributes()
            .into_iter()
            .filter(|name| state.get(*name).is_some_and(is_unknown))
            .collect();
        if !unknown.is_empty() {
            return Err(ProviderError::Validation(format!(
                "value not yet known for {}",
                unknown.join(", ")
            )));
        }

        Ok(serde_json::from_value(state.clone())?)
    }
}

/// Cached state of a managed subscription: the spec, the last fetched
/// record, and when the provider last wrote it.
///
/// Every field is optional so imported and planned states, where computed
/// values are not yet known, round-trip through JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionState {
    /// Push subscription ID.
    pub id: Option<i64>,
    /// RFC 3339 time of the last successful create or update.
    pub last_updated: Option<String>,
    /// Strava resource state.
    pub resource_state: Option<i64>,
    /// Owning application.
    pub application_id: Option<i64>,
    /// Callback address, as last reported by Strava.
    pub callback_url: Option<String>,
    /// Verification token; never returned by Strava.
    pub verify_token: Option<String>,
    /// Creation timestamp.
    pub created_at: Option<String>,
    /// Last modification timestamp.
    pub updated_at: Option<String>,
}

impl SubscriptionState {
    /// Decode a state payload from the driver.
    pub fn from_value(value: Value) -> Result<Self, ProviderError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Encode for the driver.
    pub fn to_value(&self) -> Result<Value, ProviderError> {
        Ok(serde_json::to_value(self)?)
    }

    /// The subscription ID, which must be present for read, update and delete.
    pub fn require_id(&self) -> Result<i64, ProviderError> {
        self.id.ok_or_else(|| {
            ProviderError::InvalidRequest(format!("{} state has no id", RESOURCE_TYPE))
        })
    }

    /// Overlay the remote-owned fields of `record`.
    fn refresh_from(&mut self, record: SubscriptionRecord) {
        self.id = Some(record.id);
        self.resource_state = Some(record.resource_state);
        self.application_id = Some(record.application_id);
        self.callback_url = Some(record.callback_url);
        self.created_at = Some(record.created_at);
        self.updated_at = Some(record.updated_at);
    }

    fn applied(spec: &SubscriptionSpec, record: SubscriptionRecord) -> Self {
        let mut state = Self {
            verify_token: Some(spec.verify_token.clone()),
            last_updated: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            ..Default::default()
        };
        state.refresh_from(record);
        state
    }
}

/// Parse an import identifier of the form `<id>,<verify_token>`.
///
/// Everything after the first comma is the token.
pub fn parse_import_id(composite: &str) -> Result<(i64, String), ProviderError> {
    let (id, verify_token) = composite.split_once(',').ok_or_else(|| {
        ProviderError::ImportFormat(format!(
            "ID should be in the format <id>,<verify_token>, got: {}",
            composite
        ))
    })?;

    let id = id.parse::<i64>().map_err(|e| {
        ProviderError::ImportId(format!(
            "the <id> part should be an integer, got '{}': {}",
            id, e
        ))
    })?;

    Ok((id, verify_token.to_string()))
}

/// Reconciler for a single push subscription.
pub struct PushSubscriptionResource<'a> {
    client: &'a dyn SubscriptionClient,
}

impl<'a> PushSubscriptionResource<'a> {
    /// Create a reconciler issuing calls through `client`.
    pub fn new(client: &'a dyn SubscriptionClient) -> Self {
        Self { client }
    }

    /// Create a subscription, then fetch it back so computed fields are
    /// taken from Strava rather than from the create response.
    #[instrument(skip_all, fields(callback_url = %spec.callback_url))]
    pub async fn create(&self, spec: &SubscriptionSpec) -> Result<SubscriptionState, ProviderError> {
        self.create_as(Operation::Create, spec).await
    }

    async fn create_as(
        &self,
        operation: Operation,
        spec: &SubscriptionSpec,
    ) -> Result<SubscriptionState, ProviderError> {
        let created = self
            .client
            .create_subscription(&spec.callback_url, &spec.verify_token)
            .await
            .map_err(|e| ProviderError::remote(operation, Phase::Create, e))?;
        debug!(id = created.id, "Subscription created, reading it back");

        let record = self
            .client
            .get_subscription(created.id)
            .await
            .map_err(|e| ProviderError::remote(operation, Phase::Read, e))?;

        info!(id = record.id, "Push subscription created");
        Ok(SubscriptionState::applied(spec, record))
    }

    /// Refresh cached state from Strava.
    ///
    /// A subscription deleted out of band is reported as an error rather
    /// than dropped from state.
    #[instrument(skip_all, fields(id = ?cached.id))]
    pub async fn read(&self, cached: SubscriptionState) -> Result<SubscriptionState, ProviderError> {
        let id = cached.require_id()?;
        let record = self
            .client
            .get_subscription(id)
            .await
            .map_err(|e| ProviderError::remote(Operation::Read, Phase::Read, e))?;

        if cached.callback_url.as_deref().is_some_and(|url| url != record.callback_url) {
            warn!(id, "Callback URL drifted from cached state");
        }

        let mut state = cached;
        state.refresh_from(record);
        debug!(id, "Push subscription refreshed");
        Ok(state)
    }

    /// Replace the subscription at `existing_id` with one matching `spec`.
    ///
    /// Always deletes and recreates, even if nothing changed. If the delete
    /// succeeds and the create fails, the original subscription is gone; the
    /// error carries phase `create` (or `read`) so the caller knows state must
    /// be reconciled.
    #[instrument(skip(self, spec), fields(callback_url = %spec.callback_url))]
    pub async fn update(
        &self,
        existing_id: i64,
        spec: &SubscriptionSpec,
    ) -> Result<SubscriptionState, ProviderError> {
        self.client
            .delete_subscription(existing_id)
            .await
            .map_err(|e| ProviderError::remote(Operation::Update, Phase::Delete, e))?;
        debug!(existing_id, "Old subscription deleted, creating replacement");

        self.create_as(Operation::Update, spec).await.map_err(|e| {
            error!(
                existing_id,
                error = %e,
                "Subscription was deleted but its replacement failed; reconciliation required"
            );
            match e {
                ProviderError::RemoteCall {
                    operation,
                    phase,
                    message,
                } => ProviderError::RemoteCall {
                    operation,
                    phase,
                    message: format!(
                        "subscription {} was already deleted and no replacement exists, reconciliation required: {}",
                        existing_id, message
                    ),
                },
                other => other,
            }
        })
    }

    /// Delete the subscription. Deleting an absent subscription is an error.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<(), ProviderError> {
        self.client
            .delete_subscription(id)
            .await
            .map_err(|e| ProviderError::remote(Operation::Delete, Phase::Delete, e))?;
        info!(id, "Push subscription deleted");
        Ok(())
    }

    /// State for an imported subscription; the driver's next read fills the rest.
    pub fn import(composite: &str) -> Result<SubscriptionState, ProviderError> {
        let (id, verify_token) = parse_import_id(composite)?;
        Ok(SubscriptionState {
            id: Some(id),
            verify_token: Some(verify_token),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySubscriptionClient;
    use crate::types::UNKNOWN_VALUE;
    use serde_json::json;

    fn spec() -> SubscriptionSpec {
        SubscriptionSpec::new("https://example.com/hook", "t0k3n")
    }

    #[tokio::test]
    async fn test_create_reads_back_record() {
        let client = MemorySubscriptionClient::starting_at(100);
        let resource = PushSubscriptionResource::new(&client);

        let state = resource.create(&spec()).await.unwrap();

        assert_eq!(state.id, Some(100));
        assert_eq!(state.callback_url.as_deref(), Some("https://example.com/hook"));
        assert_eq!(state.verify_token.as_deref(), Some("t0k3n"));
        assert_eq!(state.resource_state, Some(2));
        assert!(state.created_at.is_some());
        assert!(state.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_create_then_read_round_trip() {
        let client = MemorySubscriptionClient::new();
        let resource = PushSubscriptionResource::new(&client);

        let created = resource.create(&spec()).await.unwrap();
        let read = resource.read(created.clone()).await.unwrap();

        assert_eq!(read.callback_url.as_deref(), Some("https://example.com/hook"));
        assert_eq!(read.verify_token, created.verify_token);
        assert_eq!(read.last_updated, created.last_updated);
    }

    #[tokio::test]
    async fn test_create_fails_without_state() {
        let client = MemorySubscriptionClient::new();
        client.fail_next(Phase::Create).await;
        let resource = PushSubscriptionResource::new(&client);

        let err = resource.create(&spec()).await.unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Create));
        assert!(client.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_read_back_failure() {
        let client = MemorySubscriptionClient::new();
        client.fail_next(Phase::Read).await;
        let resource = PushSubscriptionResource::new(&client);

        let err = resource.create(&spec()).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::RemoteCall {
                operation: Operation::Create,
                phase: Phase::Read,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_read_missing_subscription_is_error() {
        let client = MemorySubscriptionClient::new();
        let resource = PushSubscriptionResource::new(&client);

        let cached = SubscriptionState {
            id: Some(9),
            ..Default::default()
        };
        let err = resource.read(cached).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_read_without_id() {
        let client = MemorySubscriptionClient::new();
        let resource = PushSubscriptionResource::new(&client);

        let err = resource.read(SubscriptionState::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_update_always_replaces() {
        let client = MemorySubscriptionClient::new();
        let resource = PushSubscriptionResource::new(&client);

        let created = resource.create(&spec()).await.unwrap();
        let old_id = created.id.unwrap();
        let updated = resource.update(old_id, &spec()).await.unwrap();

        assert_ne!(updated.id, Some(old_id));
        let ids: Vec<i64> = client.records().await.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![updated.id.unwrap()]);
    }

    #[tokio::test]
    async fn test_update_delete_phase_failure_keeps_original() {
        let client = MemorySubscriptionClient::new();
        let resource = PushSubscriptionResource::new(&client);
        let created = resource.create(&spec()).await.unwrap();

        client.fail_next(Phase::Delete).await;
        let err = resource
            .update(created.id.unwrap(), &spec())
            .await
            .unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Delete));
        assert_eq!(client.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_create_phase_failure_reports_partial_state() {
        let client = MemorySubscriptionClient::new();
        let resource = PushSubscriptionResource::new(&client);
        let created = resource.create(&spec()).await.unwrap();
        let id = created.id.unwrap();

        client.fail_next(Phase::Create).await;
        let err = resource.update(id, &spec()).await.unwrap_err();

        assert!(matches!(
            err,
            ProviderError::RemoteCall {
                operation: Operation::Update,
                phase: Phase::Create,
                ..
            }
        ));
        assert!(err.to_string().contains("already deleted"));
        assert!(client.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_twice_errors() {
        let client = MemorySubscriptionClient::new();
        let resource = PushSubscriptionResource::new(&client);
        let id = resource.create(&spec()).await.unwrap().id.unwrap();

        resource.delete(id).await.unwrap();
        let err = resource.delete(id).await.unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Delete));
    }

    #[test]
    fn test_parse_import_id() {
        assert_eq!(
            parse_import_id("42,secretToken").unwrap(),
            (42, "secretToken".to_string())
        );
        assert_eq!(
            parse_import_id("42,with,commas").unwrap(),
            (42, "with,commas".to_string())
        );
        assert!(matches!(
            parse_import_id("42"),
            Err(ProviderError::ImportFormat(_))
        ));
        assert!(matches!(
            parse_import_id("abc,token"),
            Err(ProviderError::ImportId(_))
        ));
    }

    #[test]
    fn test_import_state() {
        let state = PushSubscriptionResource::import("42,secretToken").unwrap();
        let value = state.to_value().unwrap();
        assert_eq!(value["id"], 42);
        assert_eq!(value["verify_token"], "secretToken");
        assert!(value["callback_url"].is_null());
    }

    #[test]
    fn test_spec_from_state() {
        let spec = SubscriptionSpec::from_state(&json!({
            "callback_url": "https://example.com/hook",
            "verify_token": "t0k3n",
            "id": null
        }))
        .unwrap();
        assert_eq!(spec.callback_url, "https://example.com/hook");

        let err = SubscriptionSpec::from_state(&json!({"callback_url": "x".repeat(256)}))
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("too long"));
        assert!(message.contains("verify_token"));
    }

    #[test]
    fn test_unknown_values_not_applied() {
        let err = SubscriptionSpec::from_state(&json!({
            "callback_url": UNKNOWN_VALUE,
            "verify_token": "t0k3n"
        }))
        .unwrap_err();

        assert!(matches!(err, ProviderError::Validation(_)));
        assert_eq!(
            err.to_string(),
            "Validation error: value not yet known for callback_url"
        );
    }
}
