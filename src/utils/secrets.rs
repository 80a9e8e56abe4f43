use crate::domain::ports::SecretStore;
use crate::utils::error::{LoaderError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;
use std::sync::OnceLock;

pub const ENV_INSTANCE_URL: &str = "SF_API_INSTANCE_URL";
pub const ENV_ACCESS_TOKEN: &str = "SF_API_ACCESS_TOKEN";
pub const ENV_GOOGLE_TOKEN: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

pub(crate) const SECRET_MANAGER_BASE_URL: &str = "https://secretmanager.googleapis.com";

#[derive(Debug, Clone)]
pub struct ResolvedCredentials {
    pub instance_url: String,
    pub access_token: String,
}

/// Resolves the Salesforce credential pair before any source work happens.
/// Per value: explicit CLI flag wins, then the environment variable; either
/// may carry an `env://` or `secretmanager://` reference that is
/// dereferenced afterwards.
pub async fn resolve_credentials(
    flag_instance_url: Option<&str>,
    flag_access_token: Option<&str>,
    store: &dyn SecretStore,
) -> Result<ResolvedCredentials> {
    let instance_url =
        resolve_value("sf-api-instance-url", flag_instance_url, ENV_INSTANCE_URL, store).await?;
    let access_token =
        resolve_value("sf-api-access-token", flag_access_token, ENV_ACCESS_TOKEN, store).await?;
    Ok(ResolvedCredentials {
        instance_url,
        access_token,
    })
}

pub async fn resolve_value(
    field_name: &str,
    flag: Option<&str>,
    env_var: &str,
    store: &dyn SecretStore,
) -> Result<String> {
    let candidate = match flag {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => match std::env::var(env_var) {
            Ok(v) if !v.trim().is_empty() => v,
            _ => {
                return Err(LoaderError::Config {
                    message: format!(
                        "{} is not set (flag missing and {} is empty)",
                        field_name, env_var
                    ),
                })
            }
        },
    };

    let resolved = dereference(field_name, &candidate, store).await?;
    if resolved.trim().is_empty() {
        return Err(LoaderError::Config {
            message: format!("{} resolved to an empty value", field_name),
        });
    }
    Ok(resolved)
}

/// Dereferences `env://NAME` and
/// `secretmanager://projects/<n>/secrets/...` values; anything else is
/// returned verbatim.
async fn dereference(field_name: &str, value: &str, store: &dyn SecretStore) -> Result<String> {
    if let Some(var_name) = value.strip_prefix("env://") {
        return std::env::var(var_name).map_err(|_| LoaderError::Config {
            message: format!(
                "{}: environment variable {} is not set",
                field_name, var_name
            ),
        });
    }

    static SECRET_REF: OnceLock<Regex> = OnceLock::new();
    let secret_ref = SECRET_REF
        .get_or_init(|| Regex::new(r"^secretmanager://projects/\d+/secrets/").expect("valid regex"));
    if secret_ref.is_match(value) {
        let name = value.trim_start_matches("secretmanager://");
        return store.access(name).await;
    }

    Ok(value.to_string())
}

/// Thin client for the GCP Secret Manager REST API. Only covers the
/// `:access` call used to resolve credential values.
pub struct SecretManagerClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl SecretManagerClient {
    pub fn new(token: Option<String>) -> Self {
        Self::with_base_url(SECRET_MANAGER_BASE_URL.to_string(), token)
    }

    pub fn with_base_url(base_url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            token,
        }
    }
}

#[async_trait]
impl SecretStore for SecretManagerClient {
    async fn access(&self, name: &str) -> Result<String> {
        let token = self.token.as_ref().ok_or_else(|| LoaderError::Config {
            message: format!(
                "{} must be set to read secret `{}`",
                ENV_GOOGLE_TOKEN, name
            ),
        })?;

        let url = format!(
            "{}/v1/{}:access",
            self.base_url.trim_end_matches('/'),
            name
        );
        tracing::debug!("Accessing secret `{}`", name);

        let response = self.client.get(&url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            return Err(LoaderError::Config {
                message: format!(
                    "secret `{}` could not be read (status {})",
                    name,
                    response.status()
                ),
            });
        }

        let body: SecretPayload = response.json().await?;
        let bytes = STANDARD
            .decode(body.payload.data.as_bytes())
            .map_err(|e| LoaderError::Config {
                message: format!("secret `{}` payload is not valid base64: {}", name, e),
            })?;
        String::from_utf8(bytes).map_err(|e| LoaderError::Config {
            message: format!("secret `{}` payload is not valid UTF-8: {}", name, e),
        })
    }
}

#[derive(serde::Deserialize)]
struct SecretPayload {
    payload: SecretData,
}

#[derive(serde::Deserialize)]
struct SecretData {
    data: String,
}
