//! Testing utilities for the Strava provider.
//!
//! [`MemorySubscriptionClient`] stands in for the Strava API, with failure
//! injection per remote call. [`ProviderTester`] drives a
//! [`ProviderService`] directly, without a gRPC server.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hemmer_provider_strava::testing::{MemorySubscriptionClient, ProviderTester};
//! use hemmer_provider_strava::StravaProvider;
//! use serde_json::json;
//!
//! let client = Arc::new(MemorySubscriptionClient::new());
//! let tester = ProviderTester::new(StravaProvider::with_client(client));
//! let state = tester
//!     .lifecycle_create("strava_push_subscription", json!({
//!         "callback_url": "https://example.com/hook",
//!         "verify_token": "t0k3n"
//!     }))
//!     .await?;
//! ```

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::client::{SubscriptionClient, SubscriptionRecord};
use crate::error::{ClientError, Phase, ProviderError};
use crate::schema::{has_errors, Diagnostic, DiagnosticSeverity};
use crate::server::ProviderService;
use crate::types::{ImportedResource, PlanResult};

/// Resource state reported for every stored subscription.
pub const MEMORY_RESOURCE_STATE: i64 = 2;

/// Application ID reported for every stored subscription.
pub const MEMORY_APPLICATION_ID: i64 = 5;

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    records: BTreeMap<i64, SubscriptionRecord>,
    failures: HashSet<Phase>,
}

impl MemoryState {
    fn take_failure(&mut self, phase: Phase) -> Result<(), ClientError> {
        if self.failures.remove(&phase) {
            return Err(ClientError::Api {
                status: 500,
                body: format!("injected {} failure", phase),
            });
        }
        Ok(())
    }
}

/// An in-memory [`SubscriptionClient`].
///
/// Like Strava, create returns only the new `id`, and deleting an unknown
/// subscription fails with a 404.
#[derive(Debug)]
pub struct MemorySubscriptionClient {
    state: Mutex<MemoryState>,
}

impl MemorySubscriptionClient {
    /// Create an empty client whose first subscription gets id 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create an empty client whose first subscription gets `first_id`.
    pub fn starting_at(first_id: i64) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_id: first_id,
                ..Default::default()
            }),
        }
    }

    /// Make the next remote call of kind `phase` fail.
    pub async fn fail_next(&self, phase: Phase) {
        self.state.lock().await.failures.insert(phase);
    }

    /// Snapshot of the stored subscriptions, ordered by id.
    pub async fn records(&self) -> Vec<SubscriptionRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }
}

impl Default for MemorySubscriptionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionClient for MemorySubscriptionClient {
    async fn create_subscription(
        &self,
        callback_url: &str,
        _verify_token: &str,
    ) -> Result<SubscriptionRecord, ClientError> {
        let mut state = self.state.lock().await;
        state.take_failure(Phase::Create)?;

        let id = state.next_id;
        state.next_id += 1;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        state.records.insert(
            id,
            SubscriptionRecord {
                id,
                resource_state: MEMORY_RESOURCE_STATE,
                application_id: MEMORY_APPLICATION_ID,
                callback_url: callback_url.to_string(),
                created_at: now.clone(),
                updated_at: now,
            },
        );

        Ok(SubscriptionRecord {
            id,
            ..Default::default()
        })
    }

    async fn get_subscription(&self, id: i64) -> Result<SubscriptionRecord, ClientError> {
        let mut state = self.state.lock().await;
        state.take_failure(Phase::Read)?;
        state
            .records
            .get(&id)
            .cloned()
            .ok_or(ClientError::NotFound(id))
    }

    async fn get_all_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, ClientError> {
        let mut state = self.state.lock().await;
        state.take_failure(Phase::List)?;
        Ok(state.records.values().cloned().collect())
    }

    async fn delete_subscription(&self, id: i64) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        state.take_failure(Phase::Delete)?;
        match state.records.remove(&id) {
            Some(_) => Ok(()),
            None => Err(ClientError::Api {
                status: 404,
                body: r#"{"message":"Resource Not Found"}"#.to_string(),
            }),
        }
    }
}

/// A test harness for provider implementations.
pub struct ProviderTester<P: ProviderService> {
    provider: P,
}

impl<P: ProviderService> ProviderTester<P> {
    /// Create a new tester for the given provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Get a reference to the underlying provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Configure the provider, failing on any error diagnostic.
    pub async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, TestError> {
        let diagnostics = self.provider.configure(config).await?;
        check_diagnostics(diagnostics)
    }

    /// Validate a resource configuration, failing on any error diagnostic.
    pub async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, TestError> {
        let diagnostics = self
            .provider
            .validate_resource_config(resource_type, config)
            .await?;
        check_diagnostics(diagnostics)
    }

    /// Plan a resource creation (no prior state).
    pub async fn plan_create(
        &self,
        resource_type: &str,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, None, proposed_state.clone(), proposed_state)
            .await
    }

    /// Plan a resource update.
    pub async fn plan_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(
                resource_type,
                Some(prior_state),
                proposed_state.clone(),
                proposed_state,
            )
            .await
    }

    /// Plan a resource deletion.
    pub async fn plan_delete(
        &self,
        resource_type: &str,
        prior_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, Some(prior_state), Value::Null, Value::Null)
            .await
    }

    /// Create a new resource.
    pub async fn create(&self, resource_type: &str, planned: Value) -> Result<Value, ProviderError> {
        self.provider.create(resource_type, planned).await
    }

    /// Read the current state of a resource.
    pub async fn read(&self, resource_type: &str, current: Value) -> Result<Value, ProviderError> {
        self.provider.read(resource_type, current).await
    }

    /// Update an existing resource.
    pub async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .update(resource_type, prior_state, planned_state)
            .await
    }

    /// Delete a resource.
    pub async fn delete(&self, resource_type: &str, current: Value) -> Result<(), ProviderError> {
        self.provider.delete(resource_type, current).await
    }

    /// Import an existing resource.
    pub async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        self.provider.import_resource(resource_type, id).await
    }

    /// Read a data source.
    pub async fn read_data_source(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .read_data_source(data_source_type, config)
            .await
    }

    /// Run plan → create → read, returning the state after read.
    pub async fn lifecycle_create(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self.plan_create(resource_type, config).await?;
        let created = self.create(resource_type, plan.planned_state).await?;
        self.read(resource_type, created).await
    }

    /// Run plan → update → read, returning the state after read.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self
            .plan_update(resource_type, prior_state.clone(), proposed_state)
            .await?;
        let updated = self
            .update(resource_type, prior_state, plan.planned_state)
            .await?;
        self.read(resource_type, updated).await
    }
}

/// Error type for test operations that may fail with diagnostics.
#[derive(Debug)]
pub enum TestError {
    /// The operation failed with diagnostics.
    Diagnostics(Vec<Diagnostic>),
    /// The operation failed with a provider error.
    Provider(ProviderError),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Diagnostics(diags) => {
                writeln!(f, "Operation failed with {} diagnostic(s):", diags.len())?;
                for diag in diags {
                    write!(f, "  [{:?}] {}", diag.severity, diag.summary)?;
                    if let Some(attr) = &diag.attribute {
                        write!(f, " (at {})", attr)?;
                    }
                    writeln!(f)?;
                }
                Ok(())
            },
            TestError::Provider(e) => write!(f, "Provider error: {}", e),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ProviderError> for TestError {
    fn from(e: ProviderError) -> Self {
        TestError::Provider(e)
    }
}

/// Pass warnings through; turn any error diagnostic into a failure.
fn check_diagnostics(diagnostics: Vec<Diagnostic>) -> Result<Vec<Diagnostic>, TestError> {
    if has_errors(&diagnostics) {
        Err(TestError::Diagnostics(diagnostics))
    } else {
        Ok(diagnostics)
    }
}

/// Assert that a plan requires resource replacement.
///
/// # Panics
///
/// Panics if the plan does not require replacement.
pub fn assert_plan_replaces(plan: &PlanResult) {
    assert!(
        plan.requires_replace,
        "Expected plan to require replacement, but it does not"
    );
}

/// Assert that a plan result indicates no changes.
///
/// # Panics
///
/// Panics if the plan has any changes.
pub fn assert_plan_no_changes(plan: &PlanResult) {
    assert!(
        plan.changes.is_empty(),
        "Expected no changes, but got {} change(s): {:?}",
        plan.changes.len(),
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

/// Assert that diagnostics contain an error with the given summary substring.
///
/// # Panics
///
/// Panics if no error diagnostic contains the given substring.
pub fn assert_error_contains(diagnostics: &[Diagnostic], substring: &str) {
    let found = diagnostics
        .iter()
        .any(|d| d.severity == DiagnosticSeverity::Error && d.summary.contains(substring));

    assert!(
        found,
        "Expected an error containing '{}', but no matching error found. Errors: {:?}",
        substring,
        diagnostics.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_client_create_returns_id_only() {
        let client = MemorySubscriptionClient::starting_at(100);
        let created = client
            .create_subscription("https://example.com/hook", "t")
            .await
            .unwrap();
        assert_eq!(created.id, 100);
        assert!(created.callback_url.is_empty());

        let stored = client.get_subscription(100).await.unwrap();
        assert_eq!(stored.callback_url, "https://example.com/hook");
        assert_eq!(stored.application_id, MEMORY_APPLICATION_ID);
    }

    #[tokio::test]
    async fn test_memory_client_failure_is_one_shot() {
        let client = MemorySubscriptionClient::new();
        client.fail_next(Phase::List).await;
        assert!(client.get_all_subscriptions().await.is_err());
        assert!(client.get_all_subscriptions().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_client_delete_missing() {
        let client = MemorySubscriptionClient::new();
        let err = client.delete_subscription(1).await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_test_error_display() {
        let err = TestError::Diagnostics(vec![
            Diagnostic::error("Missing Strava API Client ID").with_attribute("client_id"),
            Diagnostic::error("Missing Strava API Client Secret"),
        ]);

        let display = format!("{}", err);
        assert!(display.contains("2 diagnostic(s)"));
        assert!(display.contains("Client ID"));
        assert!(display.contains("(at client_id)"));
    }

    #[test]
    #[should_panic(expected = "Expected an error containing")]
    fn test_assert_error_contains_fails() {
        assert_error_contains(&[Diagnostic::warning("Missing thing")], "Missing");
    }
}
