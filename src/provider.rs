//! The `strava` provider.

use std::sync::{Arc, OnceLock};

use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::client::{StravaClient, SubscriptionClient};
use crate::config::{self, ProviderConfig};
use crate::data_source::{self, PushSubscriptionsDataSource, DATA_SOURCE_TYPE};
use crate::error::ProviderError;
use crate::resource::{
    self, PushSubscriptionResource, SubscriptionSpec, SubscriptionState, RESOURCE_TYPE,
};
use crate::schema::{has_errors, Diagnostic, ProviderSchema, Schema};
use crate::server::ProviderService;
use crate::types::{is_unknown, AttributeChange, ImportedResource, PlanResult};
use crate::validation::validate;

/// Provider for Strava push subscriptions.
///
/// The API client is created by the first successful `configure` and never
/// replaced.
#[derive(Default)]
pub struct StravaProvider {
    client: OnceLock<Arc<dyn SubscriptionClient>>,
}

impl StravaProvider {
    /// An unconfigured provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider already configured with `client`.
    pub fn with_client(client: Arc<dyn SubscriptionClient>) -> Self {
        Self {
            client: OnceLock::from(client),
        }
    }

    /// Whether `configure` has succeeded.
    pub fn is_configured(&self) -> bool {
        self.client.get().is_some()
    }

    fn client(&self) -> Result<&dyn SubscriptionClient, ProviderError> {
        self.client.get().map(|c| c.as_ref()).ok_or_else(|| {
            ProviderError::NotConfigured(
                "the Strava API client is created by Configure, which has not succeeded".to_string(),
            )
        })
    }

    fn already_configured() -> Diagnostic {
        warn!("Configure called again; keeping the existing client");
        Diagnostic::warning("Provider Already Configured").with_detail(
            "A Strava API client was already created. The new configuration is ignored for the \
             lifetime of this provider process.",
        )
    }
}

fn check_resource_type(resource_type: &str) -> Result<(), ProviderError> {
    if resource_type == RESOURCE_TYPE {
        Ok(())
    } else {
        Err(ProviderError::UnknownResource(resource_type.to_string()))
    }
}

fn check_data_source_type(data_source_type: &str) -> Result<(), ProviderError> {
    if data_source_type == DATA_SOURCE_TYPE {
        Ok(())
    } else {
        Err(ProviderError::UnknownResource(data_source_type.to_string()))
    }
}

fn contains_unknown(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.values().any(contains_unknown),
        Value::Array(items) => items.iter().any(contains_unknown),
        other => is_unknown(other),
    }
}

/// `proposed` with every computed attribute reset to null.
fn with_unknown_computed(schema: &Schema, proposed: &Value) -> Value {
    let mut planned = proposed.as_object().cloned().unwrap_or_else(Map::new);
    for name in schema.computed_attributes() {
        planned.insert(name.to_string(), Value::Null);
    }
    Value::Object(planned)
}

fn attribute<'v>(state: &'v Value, name: &str) -> &'v Value {
    state.get(name).unwrap_or(&Value::Null)
}

/// Compute a plan for a resource described by `schema`.
pub fn plan_resource(schema: &Schema, prior_state: Option<Value>, proposed_state: Value) -> PlanResult {
    let Some(prior) = prior_state.filter(|state| !state.is_null()) else {
        let changes = schema
            .configurable_attributes()
            .into_iter()
            .map(|name| AttributeChange::added(name, attribute(&proposed_state, name).clone()))
            .collect();
        return PlanResult::with_changes(
            with_unknown_computed(schema, &proposed_state),
            changes,
            false,
        );
    };

    if proposed_state.is_null() {
        let changes = prior
            .get("id")
            .filter(|id| !id.is_null())
            .map(|id| vec![AttributeChange::removed("id", id.clone())])
            .unwrap_or_default();
        return PlanResult::with_changes(Value::Null, changes, false);
    }

    let mut changes = Vec::new();
    let mut requires_replace = false;
    for name in schema.configurable_attributes() {
        let before = attribute(&prior, name);
        let after = attribute(&proposed_state, name);
        if before != after {
            requires_replace |= schema.block.attributes[name].force_new;
            changes.push(AttributeChange::modified(name, before.clone(), after.clone()));
        }
    }

    if changes.is_empty() {
        return PlanResult::no_change(prior);
    }
    PlanResult::with_changes(
        with_unknown_computed(schema, &proposed_state),
        changes,
        requires_replace,
    )
}

#[async_trait::async_trait]
impl ProviderService for StravaProvider {
    fn schema(&self) -> ProviderSchema {
        ProviderSchema::new()
            .with_provider_config(config::schema())
            .with_resource(RESOURCE_TYPE, resource::schema())
            .with_data_source(DATA_SOURCE_TYPE, data_source::schema())
    }

    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let diagnostics = validate(&config::schema(), &config);
        if has_errors(&diagnostics) || contains_unknown(&config) {
            return Ok(diagnostics);
        }
        Ok(ProviderConfig::from_env(&config).err().unwrap_or_default())
    }

    #[instrument(skip_all)]
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        if self.is_configured() {
            return Ok(vec![Self::already_configured()]);
        }

        let resolved = match ProviderConfig::from_env(&config) {
            Ok(resolved) => resolved,
            Err(diagnostics) => return Ok(diagnostics),
        };
        let base_url = resolved.base_url.clone();

        let client = match StravaClient::new(resolved) {
            Ok(client) => client,
            Err(e) => {
                return Ok(vec![Diagnostic::error("Unable to Create Strava API Client")
                    .with_detail(format!(
                        "An unexpected error occurred when creating the Strava API client: {}",
                        e
                    ))]);
            },
        };

        if self.client.set(Arc::new(client)).is_err() {
            return Ok(vec![Self::already_configured()]);
        }
        info!(%base_url, "Configured Strava API client");
        Ok(vec![])
    }

    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        check_resource_type(resource_type)?;
        Ok(validate(&resource::schema(), &config))
    }

    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        _config: Value,
    ) -> Result<PlanResult, ProviderError> {
        check_resource_type(resource_type)?;
        Ok(plan_resource(&resource::schema(), prior_state, proposed_state))
    }

    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError> {
        check_resource_type(resource_type)?;
        let spec = SubscriptionSpec::from_state(&planned_state)?;
        let state = PushSubscriptionResource::new(self.client()?)
            .create(&spec)
            .await?;
        state.to_value()
    }

    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError> {
        check_resource_type(resource_type)?;
        let cached = SubscriptionState::from_value(current_state)?;
        let state = PushSubscriptionResource::new(self.client()?)
            .read(cached)
            .await?;
        state.to_value()
    }

    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        check_resource_type(resource_type)?;
        let existing_id = SubscriptionState::from_value(prior_state)?.require_id()?;
        let spec = SubscriptionSpec::from_state(&planned_state)?;
        let state = PushSubscriptionResource::new(self.client()?)
            .update(existing_id, &spec)
            .await?;
        state.to_value()
    }

    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        check_resource_type(resource_type)?;
        let id = SubscriptionState::from_value(current_state)?.require_id()?;
        PushSubscriptionResource::new(self.client()?).delete(id).await
    }

    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        check_resource_type(resource_type)?;
        let state = PushSubscriptionResource::import(id)?;
        Ok(vec![ImportedResource::new(RESOURCE_TYPE, state.to_value()?)])
    }

    async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        check_data_source_type(data_source_type)?;
        Ok(validate(&data_source::schema(), &config))
    }

    async fn read_data_source(
        &self,
        data_source_type: &str,
        _config: Value,
    ) -> Result<Value, ProviderError> {
        check_data_source_type(data_source_type)?;
        let list = PushSubscriptionsDataSource::new(self.client()?)
            .read()
            .await?;
        Ok(serde_json::to_value(list)?)
    }
}
