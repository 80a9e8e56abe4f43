use crate::domain::model::Record;
use crate::domain::ports::{RecordIter, RecordSource};
use crate::utils::error::{LoaderError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::Read;
use std::path::PathBuf;
use url::Url;

pub(crate) const STORAGE_BASE_URL: &str = "https://storage.googleapis.com";
pub(crate) const BIGQUERY_BASE_URL: &str = "https://bigquery.googleapis.com";

/// Where the input comes from, parsed from the `--input-path` URI.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceDescriptor {
    /// `file://<path>` - local delimited file.
    File { path: PathBuf },
    /// `gs://<bucket>/<object>` - object fetched over the GCS JSON API.
    Storage { bucket: String, object: String },
    /// `bq://<base64 sql>` - query executed against BigQuery.
    Warehouse { sql: String },
}

impl SourceDescriptor {
    pub fn parse(input: &str) -> Result<Self> {
        if let Some(path) = input.strip_prefix("file://") {
            return Ok(SourceDescriptor::File {
                path: PathBuf::from(path),
            });
        }

        if let Some(rest) = input.strip_prefix("gs://") {
            let (bucket, object) = rest.split_once('/').ok_or_else(|| LoaderError::Config {
                message: format!("`{}` is missing an object key after the bucket", input),
            })?;
            if bucket.is_empty() || object.is_empty() {
                return Err(LoaderError::Config {
                    message: format!("`{}` is missing a bucket or object key", input),
                });
            }
            return Ok(SourceDescriptor::Storage {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }

        if let Some(encoded) = input.strip_prefix("bq://") {
            let bytes = STANDARD
                .decode(encoded.trim().as_bytes())
                .map_err(|e| LoaderError::Config {
                    message: format!("bq:// query is not valid base64: {}", e),
                })?;
            let sql = String::from_utf8(bytes).map_err(|e| LoaderError::Config {
                message: format!("bq:// query is not valid UTF-8: {}", e),
            })?;
            return Ok(SourceDescriptor::Warehouse { sql });
        }

        Err(LoaderError::Config {
            message: format!(
                "input path `{}` must use one of the schemes file://, gs:// or bq://",
                input
            ),
        })
    }
}

/// Parsing controls for delimited inputs, shared by file and storage
/// sources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CsvOptions {
    pub has_headers: bool,
}

/// Turns a byte reader into a lazy record iterator. With headers, each row
/// becomes a named record keyed by the header fields; without, a positional
/// record preserving column order.
fn csv_records<R: Read + Send + 'static>(reader: R, options: CsvOptions) -> Result<RecordIter> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(options.has_headers)
        .from_reader(reader);

    let headers: Option<Vec<String>> = if options.has_headers {
        Some(
            csv_reader
                .headers()?
                .iter()
                .map(|field| field.to_string())
                .collect(),
        )
    } else {
        None
    };

    let iter = csv_reader.into_records().map(move |row| {
        let row = row?;
        match &headers {
            Some(headers) => {
                let mut fields = Map::new();
                for (name, value) in headers.iter().zip(row.iter()) {
                    fields.insert(name.clone(), Value::String(value.to_string()));
                }
                Ok(Record::Named(fields))
            }
            None => Ok(Record::Positional(
                row.iter()
                    .map(|value| Value::String(value.to_string()))
                    .collect(),
            )),
        }
    });

    Ok(Box::new(iter))
}

/// Reads records from a local delimited file.
pub struct FileSource {
    path: PathBuf,
    options: CsvOptions,
}

impl FileSource {
    pub fn new(path: PathBuf, options: CsvOptions) -> Self {
        Self { path, options }
    }
}

#[async_trait]
impl RecordSource for FileSource {
    async fn records(&self) -> Result<RecordIter> {
        tracing::info!("Reading records from `{}`", self.path.display());
        let file = std::fs::File::open(&self.path).map_err(|e| LoaderError::Source {
            message: format!("cannot open `{}`: {}", self.path.display(), e),
        })?;
        csv_records(file, self.options)
    }
}

/// Fetches an object from Google Cloud Storage and parses it with the same
/// CSV controls as a local file.
pub struct StorageSource {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    object: String,
    project: Option<String>,
    token: Option<String>,
    options: CsvOptions,
}

impl StorageSource {
    pub fn new(
        bucket: String,
        object: String,
        project: Option<String>,
        token: Option<String>,
        options: CsvOptions,
    ) -> Self {
        Self::with_base_url(STORAGE_BASE_URL.to_string(), bucket, object, project, token, options)
    }

    pub fn with_base_url(
        base_url: String,
        bucket: String,
        object: String,
        project: Option<String>,
        token: Option<String>,
        options: CsvOptions,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            bucket,
            object,
            project,
            token,
            options,
        }
    }

    fn object_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| LoaderError::Config {
            message: format!("invalid storage base URL `{}`: {}", self.base_url, e),
        })?;
        url.path_segments_mut()
            .map_err(|_| LoaderError::Config {
                message: format!("storage base URL `{}` cannot carry a path", self.base_url),
            })?
            .extend(["storage", "v1", "b", self.bucket.as_str(), "o", self.object.as_str()]);
        url.query_pairs_mut().append_pair("alt", "media");
        if let Some(project) = &self.project {
            url.query_pairs_mut().append_pair("userProject", project);
        }
        Ok(url)
    }
}

#[async_trait]
impl RecordSource for StorageSource {
    async fn records(&self) -> Result<RecordIter> {
        tracing::info!(
            "Downloading object `{}` from bucket `{}` (billing project: {:?})",
            self.object,
            self.bucket,
            self.project
        );

        let mut request = self.client.get(self.object_url()?);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(LoaderError::Source {
                message: format!(
                    "object gs://{}/{} could not be read (status {})",
                    self.bucket,
                    self.object,
                    response.status()
                ),
            });
        }

        let bytes = response.bytes().await?;
        tracing::debug!("Downloaded {} bytes", bytes.len());
        csv_records(std::io::Cursor::new(bytes.to_vec()), self.options)
    }
}

/// Executes a SQL query against BigQuery and yields each result row as a
/// named record, with warehouse types coerced to JSON primitives.
pub struct WarehouseSource {
    client: reqwest::Client,
    base_url: String,
    project: String,
    sql: String,
    token: Option<String>,
}

impl WarehouseSource {
    pub fn new(project: String, sql: String, token: Option<String>) -> Self {
        Self::with_base_url(BIGQUERY_BASE_URL.to_string(), project, sql, token)
    }

    pub fn with_base_url(
        base_url: String,
        project: String,
        sql: String,
        token: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            project,
            sql,
            token,
        }
    }

    fn query_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| LoaderError::Config {
            message: format!("invalid BigQuery base URL `{}`: {}", self.base_url, e),
        })?;
        url.path_segments_mut()
            .map_err(|_| LoaderError::Config {
                message: format!("BigQuery base URL `{}` cannot carry a path", self.base_url),
            })?
            .extend(["bigquery", "v2", "projects", self.project.as_str(), "queries"]);
        Ok(url)
    }

    /// `jobs.getQueryResults` for the follow-up pages of a paginated result.
    async fn fetch_page(&self, job_id: &str, page_token: &str) -> Result<QueryResponse> {
        let mut url = self.query_url()?;
        url.path_segments_mut()
            .map_err(|_| LoaderError::Config {
                message: format!("BigQuery base URL `{}` cannot carry a path", self.base_url),
            })?
            .push(job_id);
        url.query_pairs_mut().append_pair("pageToken", page_token);

        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(LoaderError::Source {
                message: format!(
                    "BigQuery result page for job `{}` could not be read (status {})",
                    job_id,
                    response.status()
                ),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl RecordSource for WarehouseSource {
    async fn records(&self) -> Result<RecordIter> {
        tracing::info!(
            "Executing query against BigQuery (billing project `{}`):\n{}",
            self.project,
            self.sql
        );

        let body = serde_json::json!({
            "query": self.sql,
            "useLegacySql": false,
        });

        let mut request = self.client.post(self.query_url()?).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(LoaderError::Source {
                message: format!("BigQuery query failed (status {})", response.status()),
            });
        }

        let result: QueryResponse = response.json().await?;
        if !result.job_complete.unwrap_or(true) {
            return Err(LoaderError::Source {
                message: "BigQuery job did not complete within the query timeout".to_string(),
            });
        }

        let fields = result
            .schema
            .ok_or_else(|| LoaderError::Source {
                message: "BigQuery response carries no schema".to_string(),
            })?
            .fields;

        let mut records = rows_to_records(&fields, result.rows);

        // Large result sets come back one page at a time; follow the page
        // token until the result is exhausted so no row is dropped.
        let mut page_token = result.page_token;
        if page_token.is_some() {
            let job_id = result
                .job_reference
                .map(|reference| reference.job_id)
                .ok_or_else(|| LoaderError::Source {
                    message: "paginated BigQuery response carries no job reference".to_string(),
                })?;

            while let Some(token) = page_token {
                tracing::debug!("Fetching next result page for job `{}`", job_id);
                let page = self.fetch_page(&job_id, &token).await?;
                records.extend(rows_to_records(&fields, page.rows));
                page_token = page.page_token;
            }
        }

        tracing::debug!("Query returned {} rows", records.len());
        Ok(Box::new(records.into_iter().map(Ok)))
    }
}

fn rows_to_records(fields: &[QueryField], rows: Vec<QueryRow>) -> Vec<Record> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let mut data = Map::new();
        for (field, cell) in fields.iter().zip(row.f) {
            data.insert(field.name.clone(), coerce_cell(&field.field_type, cell.v));
        }
        records.push(Record::Named(data));
    }
    records
}

/// BigQuery serializes every scalar cell as a string; coerce the common
/// types back to JSON primitives and leave the rest as strings.
fn coerce_cell(field_type: &str, value: Value) -> Value {
    let text = match value {
        Value::Null => return Value::Null,
        Value::String(s) => s,
        other => return other,
    };

    match field_type {
        "INTEGER" | "INT64" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(text)),
        "FLOAT" | "FLOAT64" => text
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or(Value::String(text)),
        "BOOLEAN" | "BOOL" => match text.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(text),
        },
        _ => Value::String(text),
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    schema: Option<QuerySchema>,
    #[serde(default)]
    rows: Vec<QueryRow>,
    #[serde(rename = "jobComplete")]
    job_complete: Option<bool>,
    #[serde(rename = "pageToken")]
    page_token: Option<String>,
    #[serde(rename = "jobReference")]
    job_reference: Option<JobReference>,
}

#[derive(Debug, Deserialize)]
struct JobReference {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct QuerySchema {
    #[serde(default)]
    fields: Vec<QueryField>,
}

#[derive(Debug, Deserialize)]
struct QueryField {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct QueryRow {
    #[serde(default)]
    f: Vec<QueryCell>,
}

#[derive(Debug, Deserialize)]
struct QueryCell {
    #[serde(default)]
    v: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_file_descriptor() {
        let descriptor = SourceDescriptor::parse("file:///tmp/input.csv").unwrap();
        assert_eq!(
            descriptor,
            SourceDescriptor::File {
                path: PathBuf::from("/tmp/input.csv")
            }
        );
    }

    #[test]
    fn test_parse_storage_descriptor() {
        let descriptor = SourceDescriptor::parse("gs://my-bucket/exports/accounts.csv").unwrap();
        assert_eq!(
            descriptor,
            SourceDescriptor::Storage {
                bucket: "my-bucket".to_string(),
                object: "exports/accounts.csv".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_storage_descriptor_without_object_fails() {
        assert!(SourceDescriptor::parse("gs://my-bucket").is_err());
        assert!(SourceDescriptor::parse("gs://my-bucket/").is_err());
    }

    #[test]
    fn test_parse_warehouse_descriptor_decodes_query() {
        let encoded = STANDARD.encode("SELECT name FROM accounts");
        let descriptor = SourceDescriptor::parse(&format!("bq://{}", encoded)).unwrap();
        assert_eq!(
            descriptor,
            SourceDescriptor::Warehouse {
                sql: "SELECT name FROM accounts".to_string()
            }
        );
    }

    #[test]
    fn test_parse_warehouse_descriptor_rejects_bad_base64() {
        assert!(SourceDescriptor::parse("bq://not base64!").is_err());
    }

    #[test]
    fn test_parse_unknown_scheme_is_config_error() {
        let err = SourceDescriptor::parse("s3://bucket/key").unwrap_err();
        assert!(matches!(err, LoaderError::Config { .. }));
    }

    #[tokio::test]
    async fn test_file_source_with_headers() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Name,Industry").unwrap();
        writeln!(file, "Acme,Manufacturing").unwrap();
        writeln!(file, "Globex,Energy").unwrap();

        let source = FileSource::new(
            file.path().to_path_buf(),
            CsvOptions { has_headers: true },
        );
        let records: Vec<Record> = source
            .records()
            .await
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        match &records[0] {
            Record::Named(fields) => {
                assert_eq!(fields["Name"], Value::String("Acme".to_string()));
                assert_eq!(fields["Industry"], Value::String("Manufacturing".to_string()));
            }
            other => panic!("expected named record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_file_source_without_headers_is_positional() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "42,Acme").unwrap();
        writeln!(file, "43,Globex").unwrap();

        let source = FileSource::new(
            file.path().to_path_buf(),
            CsvOptions { has_headers: false },
        );
        let records: Vec<Record> = source
            .records()
            .await
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            Record::Positional(vec![
                Value::String("42".to_string()),
                Value::String("Acme".to_string()),
            ])
        );
    }

    #[tokio::test]
    async fn test_file_source_malformed_row_is_fatal() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Name,Industry").unwrap();
        writeln!(file, "Acme,Manufacturing,extra-column").unwrap();

        let source = FileSource::new(
            file.path().to_path_buf(),
            CsvOptions { has_headers: true },
        );
        let result: Result<Vec<Record>> = source.records().await.unwrap().collect();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_file_source_missing_file_is_source_error() {
        let source = FileSource::new(
            PathBuf::from("/nonexistent/input.csv"),
            CsvOptions { has_headers: true },
        );
        let err = source.records().await.err().unwrap();
        assert!(matches!(err, LoaderError::Source { .. }));
    }

    #[tokio::test]
    async fn test_storage_source_downloads_and_parses() {
        let server = MockServer::start();
        let object_mock = server.mock(|when, then| {
            when.method(GET)
                .path_contains("/storage/v1/b/my-bucket/o/")
                .query_param("alt", "media")
                .query_param("userProject", "billing-project");
            then.status(200).body("Name,Industry\nAcme,Manufacturing\n");
        });

        let source = StorageSource::with_base_url(
            server.base_url(),
            "my-bucket".to_string(),
            "exports/accounts.csv".to_string(),
            Some("billing-project".to_string()),
            None,
            CsvOptions { has_headers: true },
        );
        let records: Vec<Record> = source
            .records()
            .await
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        object_mock.assert();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_storage_source_missing_object_is_source_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET);
            then.status(404);
        });

        let source = StorageSource::with_base_url(
            server.base_url(),
            "my-bucket".to_string(),
            "missing.csv".to_string(),
            None,
            None,
            CsvOptions { has_headers: true },
        );
        let err = source.records().await.err().unwrap();
        assert!(matches!(err, LoaderError::Source { .. }));
    }

    #[tokio::test]
    async fn test_warehouse_source_coerces_types() {
        let server = MockServer::start();
        let query_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bigquery/v2/projects/billing-project/queries")
                .json_body_partial(r#"{"query": "SELECT * FROM accounts"}"#);
            then.status(200).json_body(serde_json::json!({
                "jobComplete": true,
                "schema": { "fields": [
                    { "name": "id", "type": "INTEGER" },
                    { "name": "name", "type": "STRING" },
                    { "name": "score", "type": "FLOAT" },
                    { "name": "active", "type": "BOOLEAN" }
                ]},
                "rows": [
                    { "f": [ {"v": "7"}, {"v": "Acme"}, {"v": "1.5"}, {"v": "true"} ] },
                    { "f": [ {"v": "8"}, {"v": "Globex"}, {"v": "2.25"}, {"v": "false"} ] }
                ]
            }));
        });

        let source = WarehouseSource::with_base_url(
            server.base_url(),
            "billing-project".to_string(),
            "SELECT * FROM accounts".to_string(),
            None,
        );
        let records: Vec<Record> = source
            .records()
            .await
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        query_mock.assert();
        assert_eq!(records.len(), 2);
        match &records[0] {
            Record::Named(fields) => {
                assert_eq!(fields["id"], Value::from(7));
                assert_eq!(fields["name"], Value::String("Acme".to_string()));
                assert_eq!(fields["score"], Value::from(1.5));
                assert_eq!(fields["active"], Value::Bool(true));
            }
            other => panic!("expected named record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_warehouse_source_follows_page_tokens() {
        let server = MockServer::start();
        let first_page = server.mock(|when, then| {
            when.method(POST)
                .path("/bigquery/v2/projects/billing-project/queries");
            then.status(200).json_body(serde_json::json!({
                "jobComplete": true,
                "jobReference": { "projectId": "billing-project", "jobId": "job_abc" },
                "totalRows": "3",
                "pageToken": "PAGE2",
                "schema": { "fields": [ { "name": "name", "type": "STRING" } ] },
                "rows": [ { "f": [ {"v": "Acme"} ] } ]
            }));
        });
        let second_page = server.mock(|when, then| {
            when.method(GET)
                .path("/bigquery/v2/projects/billing-project/queries/job_abc")
                .query_param("pageToken", "PAGE2");
            then.status(200).json_body(serde_json::json!({
                "jobComplete": true,
                "totalRows": "3",
                "pageToken": "PAGE3",
                "rows": [ { "f": [ {"v": "Globex"} ] } ]
            }));
        });
        let third_page = server.mock(|when, then| {
            when.method(GET)
                .path("/bigquery/v2/projects/billing-project/queries/job_abc")
                .query_param("pageToken", "PAGE3");
            then.status(200).json_body(serde_json::json!({
                "jobComplete": true,
                "totalRows": "3",
                "rows": [ { "f": [ {"v": "Initech"} ] } ]
            }));
        });

        let source = WarehouseSource::with_base_url(
            server.base_url(),
            "billing-project".to_string(),
            "SELECT name FROM accounts".to_string(),
            None,
        );
        let records: Vec<Record> = source
            .records()
            .await
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        first_page.assert();
        second_page.assert();
        third_page.assert();
        assert_eq!(records.len(), 3);
        let names: Vec<&Value> = records
            .iter()
            .map(|record| match record {
                Record::Named(fields) => &fields["name"],
                other => panic!("expected named record, got {:?}", other),
            })
            .collect();
        assert_eq!(
            names,
            vec![
                &Value::String("Acme".to_string()),
                &Value::String("Globex".to_string()),
                &Value::String("Initech".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_warehouse_source_paginated_response_without_job_reference_fails() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(200).json_body(serde_json::json!({
                "jobComplete": true,
                "pageToken": "PAGE2",
                "schema": { "fields": [ { "name": "name", "type": "STRING" } ] },
                "rows": [ { "f": [ {"v": "Acme"} ] } ]
            }));
        });

        let source = WarehouseSource::with_base_url(
            server.base_url(),
            "billing-project".to_string(),
            "SELECT name FROM accounts".to_string(),
            None,
        );
        let err = source.records().await.err().unwrap();
        assert!(matches!(err, LoaderError::Source { .. }));
    }

    #[tokio::test]
    async fn test_warehouse_source_incomplete_job_is_source_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(200)
                .json_body(serde_json::json!({ "jobComplete": false }));
        });

        let source = WarehouseSource::with_base_url(
            server.base_url(),
            "billing-project".to_string(),
            "SELECT 1".to_string(),
            None,
        );
        let err = source.records().await.err().unwrap();
        assert!(matches!(err, LoaderError::Source { .. }));
    }

    #[tokio::test]
    async fn test_warehouse_source_query_failure_is_source_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(403);
        });

        let source = WarehouseSource::with_base_url(
            server.base_url(),
            "billing-project".to_string(),
            "SELECT 1".to_string(),
            None,
        );
        let err = source.records().await.err().unwrap();
        assert!(matches!(err, LoaderError::Source { .. }));
    }

    #[test]
    fn test_coerce_cell_falls_back_to_string() {
        assert_eq!(
            coerce_cell("INTEGER", Value::String("not-a-number".to_string())),
            Value::String("not-a-number".to_string())
        );
        assert_eq!(coerce_cell("TIMESTAMP", Value::Null), Value::Null);
    }
}
