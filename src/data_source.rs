//! The `strava_push_subscriptions` data source.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::client::{SubscriptionClient, SubscriptionRecord};
use crate::error::{Operation, Phase, ProviderError};
use crate::schema::{Attribute, AttributeType, Schema};

/// Type name of the data source.
pub const DATA_SOURCE_TYPE: &str = "strava_push_subscriptions";

/// Identity given to every listing; the collection has no natural key.
pub const PLACEHOLDER_ID: &str = "placeholder";

/// Schema for `strava_push_subscriptions`.
pub fn schema() -> Schema {
    let subscription = AttributeType::object([
        ("id", AttributeType::Int64),
        ("resource_state", AttributeType::Int64),
        ("application_id", AttributeType::Int64),
        ("callback_url", AttributeType::String),
        ("created_at", AttributeType::String),
        ("updated_at", AttributeType::String),
    ]);

    Schema::v0()
        .with_description("Fetches the list of push subscriptions.")
        .with_attribute(
            "id",
            Attribute::computed_string().with_description("Placeholder identifier attribute."),
        )
        .with_attribute(
            "push_subscriptions",
            Attribute::computed_list(subscription).with_description("List of push subscriptions."),
        )
}

/// Result of listing subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionList {
    /// Always [`PLACEHOLDER_ID`].
    pub id: String,
    /// Every subscription visible to the credentials, in API order.
    pub push_subscriptions: Vec<SubscriptionRecord>,
}

/// Read-only view over all push subscriptions.
pub struct PushSubscriptionsDataSource<'a> {
    client: &'a dyn SubscriptionClient,
}

impl<'a> PushSubscriptionsDataSource<'a> {
    /// Create a reader issuing calls through `client`.
    pub fn new(client: &'a dyn SubscriptionClient) -> Self {
        Self { client }
    }

    /// List all subscriptions. Fails as a whole; no partial results.
    #[instrument(skip_all)]
    pub async fn read(&self) -> Result<SubscriptionList, ProviderError> {
        let push_subscriptions = self
            .client
            .get_all_subscriptions()
            .await
            .map_err(|e| ProviderError::remote(Operation::List, Phase::List, e))?;
        debug!(count = push_subscriptions.len(), "Listed push subscriptions");

        Ok(SubscriptionList {
            id: PLACEHOLDER_ID.to_string(),
            push_subscriptions,
        })
    }
}
