use crate::core::dispatch::{ApiMethod, ApiTarget};
use crate::core::source::{CsvOptions, SourceDescriptor};
use crate::utils::error::{LoaderError, Result};
use crate::utils::validation::{
    validate_non_empty_string, validate_positive_number, validate_required_field, Validate,
};
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "talk-to-salesforce")]
#[command(about = "Create or upsert Salesforce objects from CSV files, GCS objects or BigQuery query results")]
pub struct CliConfig {
    /// Where the input comes from: file://<path>, gs://<bucket>/<key> or
    /// bq://<base64 encoded SQL query>
    #[arg(long)]
    pub input_path: String,

    /// Billing project used when fetching gs:// objects or running bq://
    /// queries
    #[arg(long)]
    pub input_project_id: Option<String>,

    /// Format of file-backed inputs. Only CSV is available so far
    #[arg(long, default_value = "CSV")]
    pub input_file_format: String,

    /// Treat the first CSV row as a header; without it fields are addressed
    /// by position
    #[arg(long)]
    pub input_csv_file_has_headers: bool,

    /// Handlebars template rendered per record with the record bound as
    /// `row`, producing one JSON request item
    #[arg(long)]
    pub sf_api_req_item_json_template: Option<String>,

    /// URL of the instance that the org lives on (falls back to
    /// SF_API_INSTANCE_URL)
    #[arg(long)]
    pub sf_api_instance_url: Option<String>,

    /// Access token used to authenticate the requests (falls back to
    /// SF_API_ACCESS_TOKEN)
    #[arg(long)]
    pub sf_api_access_token: Option<String>,

    /// Raw API endpoint path, sent as-is
    #[arg(long, conflicts_with = "sf_api_object")]
    pub sf_api_endpoint: Option<String>,

    /// Object API name, expanded to the composite sobjects endpoint
    #[arg(long)]
    pub sf_api_object: Option<String>,

    /// External id field used to match existing records, required for
    /// upsert
    #[arg(long)]
    pub sf_api_external_id: Option<String>,

    /// Method used to write the records
    #[arg(long, value_enum, default_value = "create")]
    pub sf_api_method: ApiMethod,

    /// Number of records sent in a single API request body
    #[arg(long, default_value_t = 200)]
    pub sf_api_bulk_size: usize,

    /// Ask the API to roll back the whole batch when any record fails;
    /// passed through unchanged in the request body
    #[arg(long)]
    pub sf_api_all_or_none: bool,

    /// Print the constructed requests instead of sending them
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose output
    #[arg(long)]
    pub verbose: bool,
}

impl CliConfig {
    pub fn csv_options(&self) -> CsvOptions {
        CsvOptions {
            has_headers: self.input_csv_file_has_headers,
        }
    }

    pub fn api_target(&self) -> Result<ApiTarget> {
        match (&self.sf_api_endpoint, &self.sf_api_object) {
            (Some(endpoint), None) => Ok(ApiTarget::Endpoint(endpoint.clone())),
            (None, Some(object)) => Ok(ApiTarget::Object {
                name: object.clone(),
                external_id: self.sf_api_external_id.clone(),
            }),
            (Some(_), Some(_)) => Err(LoaderError::Config {
                message: "sf-api-endpoint and sf-api-object are mutually exclusive".to_string(),
            }),
            (None, None) => Err(LoaderError::Config {
                message: "either sf-api-endpoint or sf-api-object must be given".to_string(),
            }),
        }
    }
}

impl Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        if !self.input_file_format.eq_ignore_ascii_case("csv") {
            return Err(LoaderError::Config {
                message: format!(
                    "input-file-format `{}` is not supported, only CSV is available so far",
                    self.input_file_format
                ),
            });
        }

        // Catches unknown schemes and undecodable bq:// queries before any
        // credential or source work.
        let descriptor = SourceDescriptor::parse(&self.input_path)?;
        if matches!(descriptor, SourceDescriptor::Warehouse { .. })
            && self.input_project_id.is_none()
        {
            return Err(LoaderError::Config {
                message: "bq:// inputs need a billing project (--input-project-id)".to_string(),
            });
        }

        let target = self.api_target()?;
        if let ApiTarget::Object { name, .. } = &target {
            validate_non_empty_string("sf-api-object", name)?;
        }

        if self.sf_api_method == ApiMethod::Upsert {
            validate_required_field("sf-api-external-id", &self.sf_api_external_id)?;
        }

        validate_positive_number("sf-api-bulk-size", self.sf_api_bulk_size, 1)?;
        Ok(())
    }
}
