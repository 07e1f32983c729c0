//! Push direction: inbound change records → remote insert or update.
//!
//! The batch authenticates once, then every record runs through its own
//! future: route by geometry kind, reproject, then either insert
//! (preserve-history) or query-then-insert-or-update (upsert). Each future
//! resolves to a `Result`, and `join_all` waits for all of them, so one bad
//! record never stops its siblings.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::auth::{AuthCache, Credential, CredentialScope, PUSH_GUARD};
use crate::config::{Direction, LayerConfig, OutgoingConfig};
use crate::geometry::{project, Geometry, GeometryKind, Reproject};
use crate::remote::{EsriFeature, FeatureWriter};
use crate::{Result, SyncError};

/// Attribute values written when the record leaves them out.
const DEFAULT_CALLSIGN: &str = "Unknown";
const DEFAULT_REMARKS: &str = "";

/// One inbound change, shaped as a GeoJSON feature.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PushRecord {
    pub id: String,
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: PushProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PushProperties {
    #[serde(default)]
    pub callsign: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub how: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub stale: Option<String>,
}

impl PushRecord {
    /// The fixed attribute projection written to the remote layer.
    pub fn attributes(&self, correlation_field: &str) -> Map<String, Value> {
        let props = &self.properties;
        let text = |v: &Option<String>| v.clone().map(Value::String).unwrap_or(Value::Null);

        let mut attrs = Map::new();
        attrs.insert(correlation_field.to_string(), Value::String(self.id.clone()));
        attrs.insert(
            "callsign".into(),
            Value::String(
                props
                    .callsign
                    .clone()
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| DEFAULT_CALLSIGN.to_string()),
            ),
        );
        attrs.insert(
            "remarks".into(),
            Value::String(
                props
                    .remarks
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REMARKS.to_string()),
            ),
        );
        attrs.insert("type".into(), text(&props.kind));
        attrs.insert("how".into(), text(&props.how));
        attrs.insert("time".into(), text(&props.time));
        attrs.insert("start".into(), text(&props.start));
        attrs.insert("stale".into(), text(&props.stale));
        attrs
    }
}

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted { object_id: Option<i64> },
    Updated { object_id: i64 },
    /// No destination is configured for this geometry kind.
    Skipped { kind: GeometryKind },
}

/// Per-record result, tagged with the record id when it could be read.
#[derive(Debug)]
pub struct RecordReport {
    pub id: Option<String>,
    pub result: Result<RecordOutcome>,
}

/// Outcome of a whole batch. Individual failures live in the reports.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub records: Vec<RecordReport>,
}

impl BatchReport {
    fn count(&self, pred: impl Fn(&Result<RecordOutcome>) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.result)).count()
    }

    pub fn inserted(&self) -> usize {
        self.count(|r| matches!(r, Ok(RecordOutcome::Inserted { .. })))
    }

    pub fn updated(&self) -> usize {
        self.count(|r| matches!(r, Ok(RecordOutcome::Updated { .. })))
    }

    pub fn skipped(&self) -> usize {
        self.count(|r| {
            matches!(
                r,
                Ok(RecordOutcome::Skipped { .. }) | Err(SyncError::UnsupportedGeometry(_))
            )
        })
    }

    pub fn failed(&self) -> usize {
        self.count(|r| matches!(r, Err(e) if !matches!(e, SyncError::UnsupportedGeometry(_))))
    }
}

pub struct PushPipeline {
    layer: Arc<LayerConfig>,
    auth: Arc<AuthCache>,
    writer: Arc<dyn FeatureWriter>,
    reproject: Arc<dyn Reproject>,
}

impl PushPipeline {
    pub fn new(
        layer: Arc<LayerConfig>,
        auth: Arc<AuthCache>,
        writer: Arc<dyn FeatureWriter>,
        reproject: Arc<dyn Reproject>,
    ) -> Self {
        Self {
            layer,
            auth,
            writer,
            reproject,
        }
    }

    /// Process one batch of raw inbound messages.
    ///
    /// Only configuration and authentication errors fail the batch; every
    /// record-level error is logged and reported in the [`BatchReport`].
    pub async fn process(&self, batch: &[Value]) -> Result<BatchReport> {
        let outgoing = self.layer.outgoing()?;
        if batch.is_empty() {
            return Ok(BatchReport::default());
        }

        let scope = CredentialScope::new(&self.layer.id, Direction::Outgoing);
        let token_url = outgoing
            .destinations()
            .first()
            .map(|(_, url)| url.to_string())
            .unwrap_or_default();
        let credential = self
            .auth
            .ensure_credential(&scope, &outgoing.auth, &token_url, PUSH_GUARD)
            .await?;

        let tasks = batch
            .iter()
            .map(|raw| self.process_message(outgoing, credential.as_ref(), raw));
        let report = BatchReport {
            records: join_all(tasks).await,
        };

        tracing::info!(
            layer = %self.layer.id,
            total = report.records.len(),
            inserted = report.inserted(),
            updated = report.updated(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Push batch processed"
        );
        Ok(report)
    }

    /// Record boundary: nothing raised here escapes into the batch.
    async fn process_message(
        &self,
        outgoing: &OutgoingConfig,
        credential: Option<&Credential>,
        raw: &Value,
    ) -> RecordReport {
        let id = raw.get("id").and_then(Value::as_str).map(str::to_string);
        let result = match PushRecord::deserialize(raw) {
            Ok(record) => self.process_record(outgoing, credential, &record).await,
            Err(e) => Err(SyncError::Decode(format!("invalid push record: {e}"))),
        };

        match &result {
            Ok(RecordOutcome::Skipped { kind }) => {
                tracing::info!(layer = %self.layer.id, id = ?id, kind = ?kind, "No destination for geometry kind, skipping");
            }
            Ok(outcome) => {
                tracing::debug!(layer = %self.layer.id, id = ?id, outcome = ?outcome, "Record pushed");
            }
            Err(SyncError::UnsupportedGeometry(geometry)) => {
                tracing::info!(layer = %self.layer.id, id = ?id, geometry = %geometry, "Unsupported geometry, skipping");
            }
            Err(e) => {
                tracing::warn!(layer = %self.layer.id, id = ?id, error = %e, record = %raw, "Failed to push record");
            }
        }

        RecordReport { id, result }
    }

    async fn process_record(
        &self,
        outgoing: &OutgoingConfig,
        credential: Option<&Credential>,
        record: &PushRecord,
    ) -> Result<RecordOutcome> {
        let kind = record.geometry.kind()?;
        let Some(url) = outgoing.destination(kind) else {
            return Ok(RecordOutcome::Skipped { kind });
        };

        let geometry = project(
            &record.geometry,
            outgoing.source_reference(),
            outgoing.target_reference(),
            self.reproject.as_ref(),
        )?;
        let mut feature = EsriFeature {
            attributes: record.attributes(&outgoing.correlation_field),
            geometry,
        };

        if outgoing.preserve_history {
            let object_id = self.writer.add_feature(url, credential, &feature).await?;
            return Ok(RecordOutcome::Inserted { object_id });
        }

        let existing = self
            .writer
            .query_existing(url, credential, &outgoing.correlation_field, &record.id)
            .await?;

        match existing {
            None => {
                let object_id = self.writer.add_feature(url, credential, &feature).await?;
                Ok(RecordOutcome::Inserted { object_id })
            }
            Some(row) => {
                feature
                    .attributes
                    .insert(row.object_id_field.clone(), Value::from(row.object_id));
                self.writer.update_feature(url, credential, &feature).await?;
                Ok(RecordOutcome::Updated {
                    object_id: row.object_id,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthResponse, MemoryCredentialStore, TokenIssuer, TokenRequest};
    use crate::config::AuthSettings;
    use crate::geometry::Identity;
    use crate::remote::ExistingRow;
    use async_trait::async_trait;
    use chrono::{TimeDelta, Utc};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const POINTS: &str = "https://gis.example.com/arcgis/rest/services/Cot/FeatureServer/0";
    const POLYS: &str = "https://gis.example.com/arcgis/rest/services/Cot/FeatureServer/2";

    #[derive(Default)]
    struct FakeIssuer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenIssuer for FakeIssuer {
        async fn issue(&self, request: &TokenRequest) -> Result<AuthResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(AuthResponse::Issued {
                token: "push-token".into(),
                expires_at: Utc::now() + TimeDelta::minutes(30),
                referer: request.referer.clone(),
            })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Query(String),
        Add(String, EsriFeature),
        Update(String, EsriFeature),
    }

    /// In-memory remote keyed by correlation id.
    #[derive(Default)]
    struct FakeWriter {
        rows: Mutex<HashMap<String, i64>>,
        calls: Mutex<Vec<Call>>,
        fail_add_for: Option<String>,
        tokens: Mutex<Vec<Option<String>>>,
    }

    impl FakeWriter {
        fn with_row(self, uid: &str, object_id: i64) -> Self {
            self.rows.lock().insert(uid.into(), object_id);
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.lock().iter().filter(|c| pred(c)).count()
        }
    }

    #[async_trait]
    impl FeatureWriter for FakeWriter {
        async fn query_existing(
            &self,
            _url: &str,
            credential: Option<&Credential>,
            field: &str,
            value: &str,
        ) -> Result<Option<ExistingRow>> {
            assert_eq!(field, "cotuid");
            self.tokens.lock().push(credential.map(|c| c.token.clone()));
            self.calls.lock().push(Call::Query(value.to_string()));
            tokio::task::yield_now().await;
            Ok(self.rows.lock().get(value).map(|&object_id| ExistingRow {
                object_id_field: "OBJECTID".into(),
                object_id,
            }))
        }

        async fn add_feature(
            &self,
            url: &str,
            _credential: Option<&Credential>,
            feature: &EsriFeature,
        ) -> Result<Option<i64>> {
            let uid = feature.attributes["cotuid"].as_str().unwrap_or_default().to_string();
            self.calls.lock().push(Call::Add(url.into(), feature.clone()));
            if self.fail_add_for.as_deref() == Some(uid.as_str()) {
                return Err(SyncError::Remote("Insert failed (code 1000)".into()));
            }
            let mut rows = self.rows.lock();
            let next = rows.len() as i64 + 100;
            rows.insert(uid, next);
            Ok(Some(next))
        }

        async fn update_feature(
            &self,
            url: &str,
            _credential: Option<&Credential>,
            feature: &EsriFeature,
        ) -> Result<Option<i64>> {
            self.calls.lock().push(Call::Update(url.into(), feature.clone()));
            Ok(feature.attributes["OBJECTID"].as_i64())
        }
    }

    /// Fails for any coordinate with x == 666.
    struct Picky;

    impl Reproject for Picky {
        fn transform(&self, _from: u32, _to: u32, xy: [f64; 2]) -> Result<[f64; 2]> {
            if xy[0] == 666.0 {
                return Err(SyncError::Decode("coordinate outside projection".into()));
            }
            Ok(xy)
        }
    }

    fn outgoing(preserve_history: bool) -> OutgoingConfig {
        OutgoingConfig {
            points_url: Some(POINTS.into()),
            polygons_url: Some(POLYS.into()),
            preserve_history,
            auth: AuthSettings {
                username: Some("writer".into()),
                password: Some("pw".into()),
                ..AuthSettings::default()
            },
            ..OutgoingConfig::default()
        }
    }

    fn pipeline(
        config: OutgoingConfig,
        writer: Arc<FakeWriter>,
        reproject: Arc<dyn Reproject>,
    ) -> (Arc<FakeIssuer>, PushPipeline) {
        let issuer = Arc::new(FakeIssuer::default());
        let auth = Arc::new(AuthCache::new(
            issuer.clone(),
            Arc::new(MemoryCredentialStore::new()),
        ));
        let layer = Arc::new(LayerConfig {
            id: "abc".into(),
            outgoing: Some(config),
            ..LayerConfig::default()
        });
        (issuer, PushPipeline::new(layer, auth, writer, reproject))
    }

    fn point(uid: &str, x: f64) -> Value {
        json!({
            "type": "Feature",
            "id": uid,
            "properties": {
                "type": "a-f-G-U-C",
                "how": "m-g",
                "callsign": "ALPHA",
                "time": "2024-05-01T12:00:00Z",
                "start": "2024-05-01T12:00:00Z",
                "stale": "2024-05-01T12:05:00Z"
            },
            "geometry": {"type": "Point", "coordinates": [x, 10.0]}
        })
    }

    #[tokio::test]
    async fn match_issues_update_not_insert() {
        let writer = Arc::new(FakeWriter::default().with_row("uid-1", 7));
        let (_, pipeline) = pipeline(outgoing(false), writer.clone(), Arc::new(Identity));

        let report = pipeline.process(&[point("uid-1", 1.0)]).await.unwrap();
        assert_eq!(
            report.records[0].result.as_ref().unwrap(),
            &RecordOutcome::Updated { object_id: 7 }
        );
        assert_eq!(writer.count(|c| matches!(c, Call::Add(..))), 0);

        let Call::Update(url, feature) = &writer.calls()[1] else {
            panic!("expected update after query");
        };
        assert_eq!(url, POINTS);
        assert_eq!(feature.attributes["OBJECTID"], 7);
        assert_eq!(feature.attributes["cotuid"], "uid-1");
    }

    #[tokio::test]
    async fn no_match_issues_insert_not_update() {
        let writer = Arc::new(FakeWriter::default());
        let (_, pipeline) = pipeline(outgoing(false), writer.clone(), Arc::new(Identity));

        let report = pipeline.process(&[point("uid-2", 1.0)]).await.unwrap();
        assert_eq!(report.inserted(), 1);
        assert_eq!(writer.count(|c| matches!(c, Call::Update(..))), 0);
        assert_eq!(writer.calls()[0], Call::Query("uid-2".into()));
    }

    #[tokio::test]
    async fn preserve_history_only_inserts() {
        let writer = Arc::new(FakeWriter::default().with_row("uid-1", 7));
        let (_, pipeline) = pipeline(outgoing(true), writer.clone(), Arc::new(Identity));

        let report = pipeline
            .process(&[point("uid-1", 1.0), point("uid-1", 2.0)])
            .await
            .unwrap();
        assert_eq!(report.inserted(), 2);
        assert_eq!(writer.count(|c| matches!(c, Call::Query(_))), 0);
        assert_eq!(writer.count(|c| matches!(c, Call::Update(..))), 0);
    }

    #[tokio::test]
    async fn failing_record_does_not_affect_siblings() {
        let writer = Arc::new(FakeWriter::default());
        let (_, pipeline) = pipeline(outgoing(false), writer.clone(), Arc::new(Picky));

        let report = pipeline
            .process(&[point("one", 1.0), point("two", 666.0), point("three", 3.0)])
            .await
            .unwrap();

        assert_eq!(report.records.len(), 3);
        assert!(report.records[0].result.is_ok());
        assert!(report.records[1].result.is_err());
        assert!(report.records[2].result.is_ok());
        assert_eq!(report.inserted(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.records[1].id.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn remote_edit_error_is_record_scoped() {
        let writer = Arc::new(FakeWriter {
            fail_add_for: Some("bad".into()),
            ..FakeWriter::default()
        });
        let (_, pipeline) = pipeline(outgoing(false), writer, Arc::new(Identity));

        let report = pipeline
            .process(&[point("bad", 1.0), point("good", 2.0)])
            .await
            .unwrap();
        assert!(matches!(report.records[0].result, Err(SyncError::Remote(_))));
        assert_eq!(report.inserted(), 1);
    }

    #[tokio::test]
    async fn authenticates_once_per_batch() {
        let writer = Arc::new(FakeWriter::default());
        let (issuer, pipeline) = pipeline(outgoing(false), writer.clone(), Arc::new(Identity));

        let batch: Vec<Value> = (0..4).map(|i| point(&format!("u{i}"), 1.0)).collect();
        pipeline.process(&batch).await.unwrap();

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        let tokens = writer.tokens.lock().clone();
        assert_eq!(tokens.len(), 4);
        assert!(tokens.iter().all(|t| t.as_deref() == Some("push-token")));
    }

    #[tokio::test]
    async fn concurrent_batches_share_one_refresh() {
        let writer = Arc::new(FakeWriter::default());
        let (issuer, pipeline) = pipeline(outgoing(false), writer, Arc::new(Identity));

        let a = [point("a", 1.0)];
        let b = [point("b", 1.0)];
        let (ra, rb) = tokio::join!(pipeline.process(&a), pipeline.process(&b));
        ra.unwrap();
        rb.unwrap();
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unconfigured_kind_is_skipped() {
        let writer = Arc::new(FakeWriter::default());
        let (_, pipeline) = pipeline(outgoing(false), writer.clone(), Arc::new(Identity));
        let line = json!({
            "id": "route-1",
            "properties": {},
            "geometry": {"type": "LineString", "coordinates": [[0, 0], [1, 1]]}
        });

        let report = pipeline.process(&[line]).await.unwrap();
        assert_eq!(
            report.records[0].result.as_ref().unwrap(),
            &RecordOutcome::Skipped {
                kind: GeometryKind::LineString
            }
        );
        assert!(writer.calls().is_empty());
    }

    #[tokio::test]
    async fn multi_geometry_and_garbage_are_isolated() {
        let writer = Arc::new(FakeWriter::default());
        let (_, pipeline) = pipeline(outgoing(false), writer, Arc::new(Identity));
        let multi = json!({
            "id": "m",
            "geometry": {"type": "MultiPoint", "coordinates": [[0, 0]]}
        });
        let garbage = json!({"hello": "world"});

        let report = pipeline
            .process(&[multi, garbage, point("ok", 1.0)])
            .await
            .unwrap();
        assert!(matches!(
            report.records[0].result,
            Err(SyncError::UnsupportedGeometry(_))
        ));
        assert!(matches!(report.records[1].result, Err(SyncError::Decode(_))));
        assert!(report.records[1].id.is_none());
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.inserted(), 1);
    }

    #[tokio::test]
    async fn polygon_routes_to_polygon_layer_with_target_reference() {
        let writer = Arc::new(FakeWriter::default());
        let (_, pipeline) = pipeline(outgoing(true), writer.clone(), Arc::new(Identity));
        let area = json!({
            "id": "zone",
            "properties": {"remarks": "perimeter"},
            "geometry": {"type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]]}
        });

        pipeline.process(&[area]).await.unwrap();
        let Call::Add(url, feature) = &writer.calls()[0] else {
            panic!("expected insert");
        };
        assert_eq!(url, POLYS);
        assert_eq!(feature.geometry.spatial_reference().wkid, 3857);
        assert_eq!(feature.attributes["callsign"], "Unknown");
        assert_eq!(feature.attributes["remarks"], "perimeter");
        assert!(feature.attributes["type"].is_null());
    }

    #[tokio::test]
    async fn missing_destinations_fail_the_batch_up_front() {
        let writer = Arc::new(FakeWriter::default());
        let config = OutgoingConfig {
            points_url: None,
            polygons_url: None,
            ..outgoing(false)
        };
        let (issuer, pipeline) = pipeline(config, writer, Arc::new(Identity));

        let err = pipeline.process(&[point("x", 1.0)]).await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn attribute_projection_defaults() {
        let record: PushRecord = serde_json::from_value(json!({
            "id": "u",
            "geometry": {"type": "Point", "coordinates": [0, 0]}
        }))
        .unwrap();
        let attrs = record.attributes("cotuid");
        assert_eq!(attrs["cotuid"], "u");
        assert_eq!(attrs["callsign"], "Unknown");
        assert_eq!(attrs["remarks"], "");
        assert_eq!(attrs.len(), 8);
    }
}
