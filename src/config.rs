//! Provider configuration: Strava API credentials and client settings.
//!
//! Credentials come from the provider configuration sent by the driver, with
//! environment variables as defaults. An explicit value always wins, even an
//! empty one. Every attribute is checked before reporting, so the operator
//! sees all problems at once.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::schema::{Attribute, Diagnostic, Schema};
use crate::types::is_unknown;

/// Environment variable supplying the default `client_id`.
pub const CLIENT_ID_ENV: &str = "STRAVA_CLIENT_ID";

/// Environment variable supplying the default `client_secret`.
pub const CLIENT_SECRET_ENV: &str = "STRAVA_CLIENT_SECRET";

/// Strava API root used when `base_url` is not configured.
pub const DEFAULT_BASE_URL: &str = "https://www.strava.com/api/v3/";

/// Request timeout for the Strava HTTP client.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

struct CredentialField {
    attribute: &'static str,
    env: &'static str,
    label: &'static str,
}

const CLIENT_ID: CredentialField = CredentialField {
    attribute: "client_id",
    env: CLIENT_ID_ENV,
    label: "Client ID",
};

const CLIENT_SECRET: CredentialField = CredentialField {
    attribute: "client_secret",
    env: CLIENT_SECRET_ENV,
    label: "Client Secret",
};

/// Schema for the provider configuration block.
pub fn schema() -> Schema {
    Schema::v0()
        .with_description("Interact with Strava.")
        .with_attribute(
            CLIENT_ID.attribute,
            Attribute::optional_string().with_description(format!(
                "Strava API application ID. May also be provided via the {} environment variable.",
                CLIENT_ID_ENV
            )),
        )
        .with_attribute(
            CLIENT_SECRET.attribute,
            Attribute::optional_string().sensitive().with_description(format!(
                "Strava API application secret. May also be provided via the {} environment variable.",
                CLIENT_SECRET_ENV
            )),
        )
        .with_attribute(
            "base_url",
            Attribute::optional_string()
                .with_description(format!("Strava API root. Defaults to {}.", DEFAULT_BASE_URL)),
        )
}

/// A configuration value as sent by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    /// Not set.
    Null,
    /// Set, but not known until apply.
    Unknown,
    /// Set to a concrete string.
    Known(String),
}

impl ConfigValue {
    /// Extract attribute `key` from a configuration object.
    pub fn from_config(config: &Value, key: &str) -> Result<Self, Diagnostic> {
        match config.get(key) {
            None | Some(Value::Null) => Ok(Self::Null),
            Some(v) if is_unknown(v) => Ok(Self::Unknown),
            Some(Value::String(s)) => Ok(Self::Known(s.clone())),
            Some(_) => Err(Diagnostic::error(format!("Invalid type for '{}'", key))
                .with_detail("Expected a string")
                .with_attribute(key)),
        }
    }

    /// Resolve against a fallback: an explicit value overrides the fallback.
    fn or_default(self, fallback: Option<String>) -> String {
        match self {
            Self::Known(s) => s,
            Self::Null | Self::Unknown => fallback.unwrap_or_default(),
        }
    }
}

/// Strava API application credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Application ID.
    pub client_id: String,
    /// Application secret.
    pub client_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish()
    }
}

/// Everything needed to build a [`StravaClient`](crate::client::StravaClient).
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Application credentials.
    pub credentials: Credentials,
    /// API root; always ends with `/`.
    pub base_url: Url,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl ProviderConfig {
    /// Resolve configuration using the process environment for defaults.
    pub fn from_env(config: &Value) -> Result<Self, Vec<Diagnostic>> {
        Self::resolve(config, |key| std::env::var(key).ok())
    }

    /// Resolve configuration using `env` to look up default values.
    ///
    /// Returns every error diagnostic found. Unknown values are reported
    /// before resolution is attempted; missing values after.
    pub fn resolve<F>(config: &Value, env: F) -> Result<Self, Vec<Diagnostic>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut diagnostics = Vec::new();

        let mut read = |key: &str| match ConfigValue::from_config(config, key) {
            Ok(value) => value,
            Err(diag) => {
                diagnostics.push(diag);
                ConfigValue::Null
            },
        };
        let client_id = read(CLIENT_ID.attribute);
        let client_secret = read(CLIENT_SECRET.attribute);
        let base_url = read("base_url");

        for (field, value) in [(&CLIENT_ID, &client_id), (&CLIENT_SECRET, &client_secret)] {
            if *value == ConfigValue::Unknown {
                diagnostics.push(unknown_credential(field));
            }
        }
        if base_url == ConfigValue::Unknown {
            diagnostics.push(
                Diagnostic::error("Unknown Strava API base URL")
                    .with_detail("The base_url value must be known before the provider is configured.")
                    .with_attribute("base_url"),
            );
        }
        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }

        let client_id = client_id.or_default(env(CLIENT_ID.env));
        let client_secret = client_secret.or_default(env(CLIENT_SECRET.env));

        for (field, value) in [(&CLIENT_ID, &client_id), (&CLIENT_SECRET, &client_secret)] {
            if value.is_empty() {
                diagnostics.push(missing_credential(field));
            }
        }

        let base_url = match parse_base_url(&base_url.or_default(None)) {
            Ok(url) => Some(url),
            Err(diag) => {
                diagnostics.push(diag);
                None
            },
        };

        match base_url {
            Some(base_url) if diagnostics.is_empty() => Ok(Self {
                credentials: Credentials {
                    client_id,
                    client_secret,
                },
                base_url,
                timeout: DEFAULT_TIMEOUT,
            }),
            _ => Err(diagnostics),
        }
    }
}

fn parse_base_url(raw: &str) -> Result<Url, Diagnostic> {
    let raw = if raw.is_empty() { DEFAULT_BASE_URL } else { raw };
    // Url::join drops the last path segment unless the base ends with '/'.
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    Url::parse(&normalized).map_err(|e| {
        Diagnostic::error("Invalid Strava API base URL")
            .with_detail(format!("Could not parse '{}': {}", raw, e))
            .with_attribute("base_url")
    })
}

fn unknown_credential(field: &CredentialField) -> Diagnostic {
    Diagnostic::error(format!("Unknown Strava API {}", field.label))
        .with_detail(format!(
            "The provider cannot create the Strava API client as there is an unknown configuration value for the Strava API {}. \
             Either apply the source of the value first, set the value statically in the configuration, or use the {} environment variable.",
            field.label, field.env
        ))
        .with_attribute(field.attribute)
}

fn missing_credential(field: &CredentialField) -> Diagnostic {
    Diagnostic::error(format!("Missing Strava API {}", field.label))
        .with_detail(format!(
            "The provider cannot create the Strava API client as there is a missing or empty value for the Strava API {}. \
             Set the {} value in the configuration or use the {} environment variable. \
             If either is already set, ensure the value is not empty.",
            field.label, field.attribute, field.env
        ))
        .with_attribute(field.attribute)
}
