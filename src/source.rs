//! Raw reading source.
//!
//! Pulls paginated batches from the upstream sensor API and checks the shape
//! of every batch before anything reaches the validator. A batch that is not
//! an array of reading objects is schema drift: the whole batch is refused.

use anyhow::Result;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::models::RawReading;

// ---

/// Parse one batch of raw readings.
///
/// Accepts either a bare JSON array or an object with a `results` array.
/// Any item that does not deserialize as a [`RawReading`] fails the batch.
pub fn parse_batch(batch: Value) -> CoreResult<Vec<RawReading>> {
    // ---
    let items = match batch {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(CoreError::SchemaDrift(format!(
                    "'results' is {}, expected an array",
                    kind(&other)
                )))
            }
            None => {
                return Err(CoreError::SchemaDrift(
                    "object batch has no 'results' field".to_string(),
                ))
            }
        },
        other => {
            return Err(CoreError::SchemaDrift(format!(
                "batch is {}, expected an array",
                kind(&other)
            )))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value::<RawReading>(item)
                .map_err(|e| CoreError::SchemaDrift(format!("item {}: {}", i, e)))
        })
        .collect()
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Cursor-paginated HTTP source: `GET {base_url}[?cursor=..]` returning
/// `{"results": [...], "next_cursor": "..."}`.
#[derive(Debug, Clone)]
pub struct SensorSource {
    client: reqwest::Client,
    base_url: String,
    max_pages: u32,
}

impl SensorSource {
    pub fn new(base_url: impl Into<String>, max_pages: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            max_pages,
        }
    }

    /// Fetch every page up to the page limit. Each page is shape-checked
    /// with [`parse_batch`]; drift on any page aborts the fetch.
    pub async fn fetch(&self) -> Result<Vec<RawReading>> {
        // ---
        let mut all_data = Vec::new();
        let mut cursor: Option<String> = None;
        let mut page_count = 0;

        loop {
            if page_count >= self.max_pages {
                tracing::debug!(
                    max_pages = self.max_pages,
                    fetched = all_data.len(),
                    "hit page limit, stopping pagination"
                );
                break;
            }
            page_count += 1;

            let mut request = self.client.get(&self.base_url);
            if let Some(ref cursor) = cursor {
                request = request.query(&[("cursor", cursor)]);
            }

            tracing::debug!(page = page_count, cursor = ?cursor, "fetching source page");

            let response: Value = request.send().await?.error_for_status()?.json().await?;

            cursor = response
                .get("next_cursor")
                .and_then(|c| c.as_str())
                .map(String::from);

            let page = parse_batch(response)?;
            tracing::debug!(page = page_count, items = page.len(), "parsed source page");
            all_data.extend(page);

            if cursor.is_none() {
                break;
            }
        }

        tracing::info!(
            records = all_data.len(),
            pages = page_count,
            "finished fetching source readings"
        );
        Ok(all_data)
    }
}
