use crate::config::CliConfig;
use crate::core::dispatch::SalesforceClient;
use crate::core::source::{
    self, FileSource, SourceDescriptor, StorageSource, WarehouseSource,
};
use crate::core::transform::RecordTransformer;
use crate::domain::model::DispatchSummary;
use crate::domain::ports::RecordSource;
use crate::utils::error::{LoaderError, Result};
use crate::utils::secrets::{self, SecretManagerClient};
use crate::utils::validation::{validate_url, Validate};

/// Google-side endpoints and the OAuth bearer token shared by the Cloud
/// Storage, BigQuery and Secret Manager clients. Overridable so runs can be
/// pointed at local servers.
#[derive(Debug, Clone)]
pub struct GoogleBackends {
    pub storage_base_url: String,
    pub bigquery_base_url: String,
    pub secret_manager_base_url: String,
    pub token: Option<String>,
}

impl Default for GoogleBackends {
    fn default() -> Self {
        Self {
            storage_base_url: source::STORAGE_BASE_URL.to_string(),
            bigquery_base_url: source::BIGQUERY_BASE_URL.to_string(),
            secret_manager_base_url: secrets::SECRET_MANAGER_BASE_URL.to_string(),
            token: None,
        }
    }
}

impl GoogleBackends {
    /// Production endpoints with the token from `GOOGLE_OAUTH_ACCESS_TOKEN`.
    pub fn from_env() -> Self {
        Self {
            token: std::env::var(secrets::ENV_GOOGLE_TOKEN).ok(),
            ..Self::default()
        }
    }
}

/// Runs a full load for the given configuration: validate, resolve the
/// Salesforce credentials, then read, transform and dispatch. Credentials
/// resolve before any source work so a bad token or instance URL fails
/// without reading anything.
pub async fn run(config: &CliConfig, backends: &GoogleBackends) -> Result<DispatchSummary> {
    config.validate()?;

    let store = SecretManagerClient::with_base_url(
        backends.secret_manager_base_url.clone(),
        backends.token.clone(),
    );
    let credentials = secrets::resolve_credentials(
        config.sf_api_instance_url.as_deref(),
        config.sf_api_access_token.as_deref(),
        &store,
    )
    .await?;
    validate_url("sf-api-instance-url", &credentials.instance_url)?;

    let client = SalesforceClient::new(
        &credentials.instance_url,
        credentials.access_token,
        config.api_target()?,
        config.sf_api_method,
    )?
    .bulk_size(config.sf_api_bulk_size)
    .all_or_none(config.sf_api_all_or_none)
    .dry_run(config.dry_run);

    let source = build_source(config, backends)?;
    let transformer = RecordTransformer::new(config.sf_api_req_item_json_template.as_deref())?;

    LoadPipeline::new(source, transformer).run(client).await
}

fn build_source(config: &CliConfig, backends: &GoogleBackends) -> Result<Box<dyn RecordSource>> {
    let options = config.csv_options();
    Ok(match SourceDescriptor::parse(&config.input_path)? {
        SourceDescriptor::File { path } => Box::new(FileSource::new(path, options)),
        SourceDescriptor::Storage { bucket, object } => Box::new(StorageSource::with_base_url(
            backends.storage_base_url.clone(),
            bucket,
            object,
            config.input_project_id.clone(),
            backends.token.clone(),
            options,
        )),
        SourceDescriptor::Warehouse { sql } => {
            let project =
                config
                    .input_project_id
                    .clone()
                    .ok_or_else(|| LoaderError::Config {
                        message: "bq:// inputs need a billing project (--input-project-id)"
                            .to_string(),
                    })?;
            Box::new(WarehouseSource::with_base_url(
                backends.bigquery_base_url.clone(),
                project,
                sql,
                backends.token.clone(),
            ))
        }
    })
}

/// Wires reader, transformer and dispatcher together: records are pulled
/// one at a time, transformed, and queued into bounded batches, so the
/// whole input is never held in memory.
pub struct LoadPipeline {
    source: Box<dyn RecordSource>,
    transformer: RecordTransformer,
}

impl LoadPipeline {
    pub fn new(source: Box<dyn RecordSource>, transformer: RecordTransformer) -> Self {
        Self {
            source,
            transformer,
        }
    }

    /// Runs the full load. Every record yields exactly one request item or
    /// aborts the run; the final flush sends any partial last batch.
    pub async fn run(&self, mut client: SalesforceClient) -> Result<DispatchSummary> {
        let records = self.source.records().await?;

        let mut position: usize = 0;
        for record in records {
            let record = record?;
            position += 1;
            let item = self.transformer.apply(record, position)?;
            client.queue_item(item).await?;
        }
        client.flush().await?;

        tracing::info!("Processed {} records", position);
        Ok(client.into_summary())
    }
}
