use crate::domain::model::{Record, RequestItem};
use crate::utils::error::{LoaderError, Result};
use handlebars::Handlebars;

const TEMPLATE_NAME: &str = "request-item";

/// Reshapes records into request items. Without a template this is the
/// identity mapping; with one, the template is rendered with the record
/// bound as `row` ({{row.Name}} for named fields, {{row.[0]}} for
/// positional ones) and the output parsed as JSON.
#[derive(Debug)]
pub struct RecordTransformer {
    registry: Option<Handlebars<'static>>,
}

impl RecordTransformer {
    pub fn new(template: Option<&str>) -> Result<Self> {
        let registry = match template {
            None => None,
            Some(template) => {
                let mut registry = Handlebars::new();
                // Missing fields are configuration defects, not data noise.
                registry.set_strict_mode(true);
                // The output is JSON, not HTML.
                registry.register_escape_fn(handlebars::no_escape);
                registry
                    .register_template_string(TEMPLATE_NAME, template)
                    .map_err(|e| LoaderError::Config {
                        message: format!("invalid request item template: {}", e),
                    })?;
                Some(registry)
            }
        };
        Ok(Self { registry })
    }

    /// `position` is the 1-based source position of the record, used to
    /// identify the offending record on failure.
    pub fn apply(&self, record: Record, position: usize) -> Result<RequestItem> {
        let registry = match &self.registry {
            None => return Ok(record.into_value()),
            Some(registry) => registry,
        };

        let context = serde_json::json!({ "row": record.into_value() });
        let rendered =
            registry
                .render(TEMPLATE_NAME, &context)
                .map_err(|e| LoaderError::Transform {
                    position,
                    message: format!("template rendering failed: {}", e),
                })?;

        serde_json::from_str(&rendered).map_err(|e| LoaderError::Transform {
            position,
            message: format!("rendered template is not valid JSON: {}", e),
        })
    }
}
