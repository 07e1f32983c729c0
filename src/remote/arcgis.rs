//! ArcGIS feature-service HTTP adapters.
//!
//! Thin wrappers over the REST endpoints the pipelines need:
//! - `GET  <layer>?f=json`            → field list, mapped to a JSON schema
//! - `GET  <layer>/query?f=geojson`   → paged features
//! - `POST <layer>/query`             → lookup by correlation id
//! - `POST <layer>/addFeatures`       → insert
//! - `POST <layer>/updateFeatures`    → update
//!
//! Every request carries `Authorization: Bearer <token>` and the `Referer`
//! the token was issued for. A 200 response with an `error` payload is a
//! [`SyncError::Remote`], a non-success status a [`SyncError::Transport`].

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{EsriFeature, ExistingRow, FeatureReader, FeatureStream, FeatureWriter, ReadRequest};
use crate::auth::Credential;
use crate::feature::RawFeature;
use crate::{Result, SyncError};

/// Features requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

fn authorize(
    mut request: reqwest::RequestBuilder,
    credential: Option<&Credential>,
) -> reqwest::RequestBuilder {
    if let Some(credential) = credential {
        request = request.bearer_auth(&credential.token);
        if let Some(referer) = &credential.referer {
            request = request.header(reqwest::header::REFERER, referer);
        }
    }
    request
}

/// Read a JSON body, turning bad statuses and embedded errors into errors.
async fn read_json(resp: reqwest::Response, what: &str) -> Result<Value> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(SyncError::Transport(format!("{what} failed ({status}): {body}")));
    }
    let body: Value = resp.json().await?;
    if let Some(error) = body.get("error").filter(|e| !is_empty_error(e)) {
        return Err(SyncError::Remote(format!("{what}: {}", describe_error(error))));
    }
    Ok(body)
}

fn is_empty_error(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn describe_error(error: &Value) -> String {
    let message = error
        .get("message")
        .or_else(|| error.get("description"))
        .and_then(Value::as_str);
    match (error.get("code").and_then(Value::as_i64), message) {
        (Some(code), Some(message)) => format!("{message} (code {code})"),
        (None, Some(message)) => message.to_string(),
        _ => error.to_string(),
    }
}

fn layer_endpoint(url: &str, operation: &str) -> String {
    format!("{}/{operation}", url.trim_end_matches('/'))
}

// ── Reader ───────────────────────────────────────────────────────

/// Paged reader over `<layer>/query`.
#[derive(Clone)]
pub struct ArcgisReader {
    http: reqwest::Client,
    page_size: usize,
}

impl ArcgisReader {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[derive(Debug, Deserialize)]
struct EsriField {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    alias: Option<String>,
}

/// Map an ArcGIS field type onto a JSON-schema property.
fn field_schema(field: &EsriField) -> Option<Value> {
    let mut prop = match field.field_type.as_str() {
        "esriFieldTypeOID" | "esriFieldTypeSmallInteger" | "esriFieldTypeInteger"
        | "esriFieldTypeBigInteger" => json!({"type": "integer"}),
        "esriFieldTypeSingle" | "esriFieldTypeDouble" => json!({"type": "number"}),
        "esriFieldTypeString" | "esriFieldTypeGUID" | "esriFieldTypeGlobalID"
        | "esriFieldTypeTimeOnly" => json!({"type": "string"}),
        "esriFieldTypeDate" | "esriFieldTypeTimestampOffset" => {
            json!({"type": "string", "format": "date-time"})
        }
        "esriFieldTypeDateOnly" => json!({"type": "string", "format": "date"}),
        _ => return None,
    };
    if let (Some(alias), Some(obj)) = (field.alias.as_deref(), prop.as_object_mut()) {
        if alias != field.name {
            obj.insert("description".into(), Value::from(alias));
        }
    }
    Some(prop)
}

struct PageState {
    http: reqwest::Client,
    request: ReadRequest,
    page_size: usize,
    offset: usize,
    buffer: VecDeque<RawFeature>,
    exhausted: bool,
}

impl PageState {
    async fn next_page(&mut self) -> Result<()> {
        let where_clause = self
            .request
            .where_clause
            .clone()
            .filter(|w| !w.trim().is_empty())
            .unwrap_or_else(|| "1=1".to_string());
        let mut query: Vec<(String, String)> = vec![
            ("where".into(), where_clause),
            ("outFields".into(), "*".into()),
            ("returnGeometry".into(), "true".into()),
            ("outSR".into(), "4326".into()),
            ("resultOffset".into(), self.offset.to_string()),
            ("resultRecordCount".into(), self.page_size.to_string()),
        ];
        for (key, value) in &self.request.params {
            query.retain(|(k, _)| k != key);
            query.push((key.clone(), value.clone()));
        }
        query.push(("f".into(), "geojson".into()));

        let url = layer_endpoint(&self.request.url, "query");
        tracing::debug!(url = %url, offset = self.offset, "Fetching feature page");
        let resp = authorize(self.http.get(&url), self.request.credential.as_ref())
            .query(&query)
            .send()
            .await?;
        let body = read_json(resp, "feature query").await?;

        let features = match body.get("features") {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => return Err(SyncError::Decode("`features` is not an array".into())),
            None => Vec::new(),
        };
        let exceeded = body
            .get("exceededTransferLimit")
            .or_else(|| body.pointer("/properties/exceededTransferLimit"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        self.offset += features.len();
        self.exhausted = !exceeded || features.is_empty();
        for feature in features {
            self.buffer.push_back(serde_json::from_value(feature)?);
        }
        Ok(())
    }
}

async fn next_feature(mut state: PageState) -> Result<Option<(RawFeature, PageState)>> {
    loop {
        if let Some(feature) = state.buffer.pop_front() {
            return Ok(Some((feature, state)));
        }
        if state.exhausted {
            return Ok(None);
        }
        state.next_page().await?;
    }
}

#[async_trait]
impl FeatureReader for ArcgisReader {
    async fn schema(&self, request: &ReadRequest) -> Result<Value> {
        let resp = authorize(self.http.get(&request.url), request.credential.as_ref())
            .query(&[("f", "json")])
            .send()
            .await?;
        let body = read_json(resp, "layer description").await?;

        let fields: Vec<EsriField> = match body.get("fields") {
            Some(fields) => serde_json::from_value(fields.clone())?,
            None => Vec::new(),
        };
        let properties: Map<String, Value> = fields
            .iter()
            .filter_map(|field| field_schema(field).map(|prop| (field.name.clone(), prop)))
            .collect();

        Ok(json!({
            "type": "object",
            "required": [],
            "properties": properties,
        }))
    }

    fn fetch(&self, request: ReadRequest) -> FeatureStream {
        let state = PageState {
            http: self.http.clone(),
            request,
            page_size: self.page_size,
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::try_unfold(state, next_feature).boxed()
    }
}

// ── Writer ───────────────────────────────────────────────────────

/// Form-encoded writer over `query`, `addFeatures` and `updateFeatures`.
#[derive(Clone)]
pub struct ArcgisWriter {
    http: reqwest::Client,
}

impl ArcgisWriter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn post(
        &self,
        url: &str,
        operation: &str,
        credential: Option<&Credential>,
        form: &[(&str, String)],
    ) -> Result<Value> {
        let endpoint = layer_endpoint(url, operation);
        let resp = authorize(self.http.post(&endpoint), credential)
            .form(form)
            .send()
            .await?;
        read_json(resp, operation).await
    }

    async fn edit(
        &self,
        url: &str,
        operation: &str,
        results_key: &str,
        credential: Option<&Credential>,
        feature: &EsriFeature,
    ) -> Result<Option<i64>> {
        let features = serde_json::to_string(&[feature])?;
        let body = self
            .post(
                url,
                operation,
                credential,
                &[("features", features), ("f", "json".to_string())],
            )
            .await?;
        edit_outcome(&body, results_key)
    }
}

/// First entry of `addResults`/`updateResults`, or why the edit failed.
fn edit_outcome(body: &Value, results_key: &str) -> Result<Option<i64>> {
    let result = body
        .get(results_key)
        .and_then(Value::as_array)
        .and_then(|results| results.first())
        .ok_or_else(|| SyncError::Remote(format!("response carried no {results_key}")))?;

    if let Some(error) = result.get("error").filter(|e| !is_empty_error(e)) {
        return Err(SyncError::Remote(describe_error(error)));
    }
    if result.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(SyncError::Remote(format!("{results_key}: edit not applied")));
    }
    Ok(result.get("objectId").and_then(Value::as_i64))
}

/// Quote a value for a `where` clause.
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn find_object_id(attributes: &Map<String, Value>, field: &str) -> Option<i64> {
    attributes.get(field).and_then(Value::as_i64).or_else(|| {
        attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(field))
            .and_then(|(_, value)| value.as_i64())
    })
}

#[async_trait]
impl FeatureWriter for ArcgisWriter {
    async fn query_existing(
        &self,
        url: &str,
        credential: Option<&Credential>,
        field: &str,
        value: &str,
    ) -> Result<Option<ExistingRow>> {
        let body = self
            .post(
                url,
                "query",
                credential,
                &[
                    ("where", format!("{field}={}", sql_literal(value))),
                    ("outFields", "*".to_string()),
                    ("returnGeometry", "false".to_string()),
                    ("f", "json".to_string()),
                ],
            )
            .await?;

        let object_id_field = body
            .get("objectIdFieldName")
            .and_then(Value::as_str)
            .unwrap_or("OBJECTID")
            .to_string();

        let Some(attributes) = body
            .get("features")
            .and_then(Value::as_array)
            .and_then(|features| features.first())
            .and_then(|feature| feature.get("attributes"))
            .and_then(Value::as_object)
        else {
            return Ok(None);
        };

        let object_id = find_object_id(attributes, &object_id_field).ok_or_else(|| {
            SyncError::Decode(format!("matched row has no {object_id_field} attribute"))
        })?;
        Ok(Some(ExistingRow {
            object_id_field,
            object_id,
        }))
    }

    async fn add_feature(
        &self,
        url: &str,
        credential: Option<&Credential>,
        feature: &EsriFeature,
    ) -> Result<Option<i64>> {
        self.edit(url, "addFeatures", "addResults", credential, feature)
            .await
    }

    async fn update_feature(
        &self,
        url: &str,
        credential: Option<&Credential>,
        feature: &EsriFeature,
    ) -> Result<Option<i64>> {
        self.edit(url, "updateFeatures", "updateResults", credential, feature)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_types_map_to_schema() {
        let date = EsriField {
            name: "created".into(),
            field_type: "esriFieldTypeDate".into(),
            alias: Some("Created On".into()),
        };
        assert_eq!(
            field_schema(&date).unwrap(),
            json!({"type": "string", "format": "date-time", "description": "Created On"})
        );

        let oid = EsriField {
            name: "OBJECTID".into(),
            field_type: "esriFieldTypeOID".into(),
            alias: Some("OBJECTID".into()),
        };
        assert_eq!(field_schema(&oid).unwrap(), json!({"type": "integer"}));

        let shape = EsriField {
            name: "SHAPE".into(),
            field_type: "esriFieldTypeGeometry".into(),
            alias: None,
        };
        assert!(field_schema(&shape).is_none());
    }

    #[test]
    fn edit_outcome_reads_object_id() {
        let body = json!({"addResults": [{"objectId": 17, "success": true}]});
        assert_eq!(edit_outcome(&body, "addResults").unwrap(), Some(17));
    }

    #[test]
    fn edit_outcome_flags_embedded_error() {
        let body = json!({"updateResults": [{
            "objectId": 3,
            "success": false,
            "error": {"code": 1019, "description": "Invalid field"}
        }]});
        let err = edit_outcome(&body, "updateResults").unwrap_err();
        assert!(matches!(err, SyncError::Remote(ref m) if m.contains("Invalid field")));
    }

    #[test]
    fn edit_outcome_requires_results() {
        assert!(edit_outcome(&json!({"addResults": []}), "addResults").is_err());
        assert!(edit_outcome(&json!({}), "addResults").is_err());
    }

    #[test]
    fn empty_error_values_are_ignored() {
        assert!(is_empty_error(&Value::Null));
        assert!(is_empty_error(&json!([])));
        assert!(is_empty_error(&json!({})));
        assert!(!is_empty_error(&json!({"code": 500})));
    }

    #[test]
    fn literal_quotes_are_escaped() {
        assert_eq!(sql_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn object_id_lookup_ignores_case() {
        let attrs = json!({"objectid": 9, "cotuid": "x"}).as_object().cloned().unwrap();
        assert_eq!(find_object_id(&attrs, "OBJECTID"), Some(9));
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(
            layer_endpoint("https://x.example.com/FeatureServer/0/", "addFeatures"),
            "https://x.example.com/FeatureServer/0/addFeatures"
        );
    }
}
