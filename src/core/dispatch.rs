use crate::domain::model::{DispatchSummary, ItemFailure, RequestItem, SaveResult};
use crate::utils::error::{LoaderError, Result};
use clap::ValueEnum;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use url::Url;

const API_VERSION: &str = "v59.0";

/// How records are written: create maps to POST on the collections
/// endpoint, upsert to PATCH keyed by an external-id field.
#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
pub enum ApiMethod {
    Create,
    Upsert,
}

/// Where bulk requests go: a raw endpoint path used verbatim, or an object
/// API name expanded to the composite sobjects endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiTarget {
    Endpoint(String),
    Object {
        name: String,
        external_id: Option<String>,
    },
}

impl ApiTarget {
    fn path(&self, method: ApiMethod) -> Result<String> {
        match self {
            ApiTarget::Endpoint(endpoint) => {
                if endpoint.starts_with('/') {
                    Ok(endpoint.clone())
                } else {
                    Ok(format!("/{}", endpoint))
                }
            }
            ApiTarget::Object { name, external_id } => match method {
                ApiMethod::Create => {
                    Ok(format!("/services/data/{}/composite/sobjects", API_VERSION))
                }
                ApiMethod::Upsert => {
                    let external_id = external_id.as_ref().ok_or_else(|| LoaderError::Config {
                        message: "upsert requires an external id field (--sf-api-external-id)"
                            .to_string(),
                    })?;
                    Ok(format!(
                        "/services/data/{}/composite/sobjects/{}/{}",
                        API_VERSION, name, external_id
                    ))
                }
            },
        }
    }

    /// Object API name, when the target owns the request envelope.
    fn object_name(&self) -> Option<&str> {
        match self {
            ApiTarget::Endpoint(_) => None,
            ApiTarget::Object { name, .. } => Some(name),
        }
    }
}

#[derive(Debug, Serialize)]
struct BulkRequest {
    #[serde(rename = "allOrNone")]
    all_or_none: bool,
    records: Vec<RequestItem>,
}

/// Accumulates request items into bounded batches and sends one bulk
/// request per batch, strictly in source order with at most one request in
/// flight. No retry, no backoff: transport failures are fatal, per-item
/// rejections are collected into the summary.
#[derive(Debug)]
pub struct SalesforceClient {
    client: reqwest::Client,
    url: Url,
    http_method: Method,
    access_token: String,
    object_name: Option<String>,
    bulk_size: usize,
    all_or_none: bool,
    dry_run: bool,
    queue: Vec<RequestItem>,
    summary: DispatchSummary,
}

impl SalesforceClient {
    pub fn new(
        instance_url: &str,
        access_token: String,
        target: ApiTarget,
        method: ApiMethod,
    ) -> Result<Self> {
        let path = target.path(method)?;
        let base = Url::parse(instance_url).map_err(|e| LoaderError::Config {
            message: format!("invalid instance URL `{}`: {}", instance_url, e),
        })?;
        let url = base.join(&path).map_err(|e| LoaderError::Config {
            message: format!("invalid endpoint path `{}`: {}", path, e),
        })?;

        let http_method = match method {
            ApiMethod::Create => Method::POST,
            ApiMethod::Upsert => Method::PATCH,
        };

        Ok(Self {
            client: reqwest::Client::new(),
            url,
            http_method,
            access_token,
            object_name: target.object_name().map(|name| name.to_string()),
            bulk_size: 200,
            all_or_none: false,
            dry_run: false,
            queue: Vec::new(),
            summary: DispatchSummary::default(),
        })
    }

    pub fn bulk_size(mut self, bulk_size: usize) -> Self {
        self.bulk_size = bulk_size;
        self
    }

    pub fn all_or_none(mut self, all_or_none: bool) -> Self {
        self.all_or_none = all_or_none;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Queues one item and sends a bulk request once the queue reaches the
    /// configured bulk size.
    pub async fn queue_item(&mut self, item: RequestItem) -> Result<()> {
        self.queue.push(self.with_attributes(item));
        if self.queue.len() >= self.bulk_size {
            self.send_queued().await?;
        }
        Ok(())
    }

    /// Sends any remaining queued items as a final, possibly short, batch.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.queue.is_empty() {
            self.send_queued().await?;
        }
        Ok(())
    }

    pub fn into_summary(self) -> DispatchSummary {
        self.summary
    }

    /// When the target is an object name, the collections API needs each
    /// record to carry `attributes.type`; fill it in unless the item
    /// already has one.
    fn with_attributes(&self, item: RequestItem) -> RequestItem {
        let object_name = match &self.object_name {
            Some(name) => name,
            None => return item,
        };
        match item {
            Value::Object(mut fields) => {
                if !fields.contains_key("attributes") {
                    fields.insert(
                        "attributes".to_string(),
                        serde_json::json!({ "type": object_name }),
                    );
                }
                Value::Object(fields)
            }
            other => other,
        }
    }

    async fn send_queued(&mut self) -> Result<()> {
        let records = std::mem::take(&mut self.queue);
        let batch_size = records.len();
        let body = BulkRequest {
            all_or_none: self.all_or_none,
            records,
        };

        self.summary.batches_sent += 1;
        let batch_number = self.summary.batches_sent;

        tracing::info!(
            "Sending a {} HTTP request to {} ({} records)",
            self.http_method,
            self.url,
            batch_size
        );

        if self.dry_run {
            println!("--- dry run: batch {} ({} records) ---", batch_number, batch_size);
            println!("{} {}", self.http_method, self.url);
            println!("authorization: Bearer ***");
            println!("content-type: application/json");
            println!("{}", serde_json::to_string_pretty(&body)?);
            self.summary.records_sent += batch_size;
            return Ok(());
        }

        let response = self
            .client
            .request(self.http_method.clone(), self.url.clone())
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LoaderError::Dispatch {
                message: format!(
                    "batch {} rejected with status {}: {}",
                    batch_number, status, detail
                ),
            });
        }

        let results: Vec<SaveResult> =
            response.json().await.map_err(|e| LoaderError::Dispatch {
                message: format!("batch {} response could not be parsed: {}", batch_number, e),
            })?;

        let batch_start = self.summary.records_sent;
        self.summary.records_sent += batch_size;
        for (offset, result) in results.iter().enumerate() {
            if result.success {
                self.summary.succeeded += 1;
            } else {
                self.summary.failed += 1;
                self.summary.failures.push(ItemFailure {
                    record: batch_start + offset + 1,
                    errors: result.errors.iter().map(format_save_error).collect(),
                });
            }
        }

        tracing::info!(
            "Batch {} acknowledged: {} results ({} failed so far)",
            batch_number,
            results.len(),
            self.summary.failed
        );
        Ok(())
    }
}

fn format_save_error(error: &crate::domain::model::SaveError) -> String {
    if error.fields.is_empty() {
        format!("{}: {}", error.status_code, error.message)
    } else {
        format!(
            "{}: {} (fields: {})",
            error.status_code,
            error.message,
            error.fields.join(", ")
        )
    }
}
