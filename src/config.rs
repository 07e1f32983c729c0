//! Layer configuration.
//!
//! A layer is loaded from TOML, optionally overlaid with `ARCGIS_*`
//! environment variables, and validated per direction before any network
//! call. The same types generate the JSON schema the host uses for its
//! configuration form.
//!
//! ```toml
//! id = "42"
//!
//! [incoming]
//! url = "https://example.com/arcgis/rest/services/Parcels/FeatureServer/0"
//! query = "STATUS = 'ACTIVE'"
//! timezone = "America/Denver"
//!
//! [outgoing]
//! points_url = "https://example.com/arcgis/rest/services/Cot/FeatureServer/0"
//! username = "sync"
//! password = "secret"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use reqwest::Url;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::geometry::{GeometryKind, SpatialReference, WEB_MERCATOR, WGS84};
use crate::{Result, SyncError};

/// Correlation field written on every pushed feature.
pub const DEFAULT_CORRELATION_FIELD: &str = "cotuid";

/// Environment overrides for the incoming section.
const ENV_URL: &str = "ARCGIS_URL";
const ENV_QUERY: &str = "ARCGIS_QUERY";
const ENV_PORTAL: &str = "ARCGIS_PORTAL";
const ENV_USERNAME: &str = "ARCGIS_USERNAME";
const ENV_PASSWORD: &str = "ARCGIS_PASSWORD";
const ENV_TIMEZONE: &str = "ARCGIS_TIMEZONE";

/// Sync direction. Each direction of a layer owns its own credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials for one direction. All fields optional: with none set the
/// remote is accessed anonymously.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AuthSettings {
    /// Portal URL used for token issuance instead of the service URL.
    #[serde(default)]
    pub portal: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Pre-issued token used as-is when no username/password is set.
    #[serde(default)]
    pub token: Option<String>,
}

impl AuthSettings {
    /// Username and password are both present.
    pub fn has_login(&self) -> bool {
        non_empty(&self.username).is_some() && non_empty(&self.password).is_some()
    }

    pub fn is_anonymous(&self) -> bool {
        !self.has_login() && non_empty(&self.token).is_none()
    }

    fn validate(&self, direction: Direction) -> Result<()> {
        let user = non_empty(&self.username).is_some();
        let pass = non_empty(&self.password).is_some();
        if user != pass {
            return Err(SyncError::Config(format!(
                "{direction}: username and password must be set together"
            )));
        }
        if let Some(portal) = non_empty(&self.portal) {
            parse_url(portal, direction, "portal")?;
        }
        Ok(())
    }
}

/// Pull-direction settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IncomingConfig {
    /// Feature layer URL, e.g. `.../FeatureServer/0`.
    pub url: String,
    /// Optional `where` clause.
    #[serde(default)]
    pub query: Option<String>,
    /// Extra request parameters passed through to every query.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// IANA zone used to format date-time attributes.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(flatten)]
    pub auth: AuthSettings,
}

/// Push-direction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutgoingConfig {
    /// Destination layer for Point records.
    #[serde(default)]
    pub points_url: Option<String>,
    /// Destination layer for LineString records.
    #[serde(default)]
    pub lines_url: Option<String>,
    /// Destination layer for Polygon records.
    #[serde(default)]
    pub polygons_url: Option<String>,
    /// Always insert instead of updating, keeping every change as a row.
    #[serde(default)]
    pub preserve_history: bool,
    #[serde(default = "default_correlation_field")]
    pub correlation_field: String,
    #[serde(default = "default_source_wkid")]
    pub source_wkid: u32,
    #[serde(default = "default_target_wkid")]
    pub target_wkid: u32,
    #[serde(flatten)]
    pub auth: AuthSettings,
}

impl Default for OutgoingConfig {
    fn default() -> Self {
        Self {
            points_url: None,
            lines_url: None,
            polygons_url: None,
            preserve_history: false,
            correlation_field: default_correlation_field(),
            source_wkid: default_source_wkid(),
            target_wkid: default_target_wkid(),
            auth: AuthSettings::default(),
        }
    }
}

impl OutgoingConfig {
    /// Destination URL for a geometry kind, if one is configured.
    pub fn destination(&self, kind: GeometryKind) -> Option<&str> {
        let url = match kind {
            GeometryKind::Point => &self.points_url,
            GeometryKind::LineString => &self.lines_url,
            GeometryKind::Polygon => &self.polygons_url,
        };
        non_empty(url)
    }

    /// All configured destinations, in kind order.
    pub fn destinations(&self) -> Vec<(GeometryKind, &str)> {
        [
            GeometryKind::Point,
            GeometryKind::LineString,
            GeometryKind::Polygon,
        ]
        .into_iter()
        .filter_map(|kind| self.destination(kind).map(|url| (kind, url)))
        .collect()
    }

    pub fn source_reference(&self) -> SpatialReference {
        SpatialReference::new(self.source_wkid)
    }

    pub fn target_reference(&self) -> SpatialReference {
        SpatialReference::new(self.target_wkid)
    }
}

fn default_correlation_field() -> String {
    DEFAULT_CORRELATION_FIELD.to_string()
}

fn default_source_wkid() -> u32 {
    WGS84
}

fn default_target_wkid() -> u32 {
    WEB_MERCATOR
}

/// One configured sync unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LayerConfig {
    /// Layer identifier, used in feature ids and credential scopes.
    pub id: String,
    #[serde(default)]
    pub incoming: Option<IncomingConfig>,
    #[serde(default)]
    pub outgoing: Option<OutgoingConfig>,
    /// Where issued credentials are persisted between runs.
    #[serde(default)]
    pub state_path: Option<String>,
}

impl LayerConfig {
    /// Read a layer from a TOML file. `~` and `$VAR` in the path are expanded.
    pub fn load(path: &str) -> Result<Self> {
        let expanded = shellexpand::full(path)
            .map_err(|e| SyncError::Config(format!("cannot expand {path}: {e}")))?;
        let raw = std::fs::read_to_string(expanded.as_ref())?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| SyncError::Config(format!("invalid layer config: {e}")))
    }

    /// Overlay `ARCGIS_*` variables from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Overlay incoming settings from a key lookup. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_URL) {
            self.incoming.get_or_insert_with(IncomingConfig::default).url = url;
        }
        let Some(incoming) = self.incoming.as_mut() else {
            return;
        };
        if let Some(query) = get(ENV_QUERY) {
            incoming.query = Some(query);
        }
        if let Some(portal) = get(ENV_PORTAL) {
            incoming.auth.portal = Some(portal);
        }
        if let Some(username) = get(ENV_USERNAME) {
            incoming.auth.username = Some(username);
        }
        if let Some(password) = get(ENV_PASSWORD) {
            incoming.auth.password = Some(password);
        }
        if let Some(timezone) = get(ENV_TIMEZONE) {
            incoming.timezone = Some(timezone);
        }
    }

    /// Incoming settings, checked for everything a pull needs.
    pub fn incoming(&self) -> Result<&IncomingConfig> {
        let incoming = self
            .incoming
            .as_ref()
            .ok_or_else(|| SyncError::Config(format!("layer {}: no incoming section", self.id)))?;
        if incoming.url.trim().is_empty() {
            return Err(SyncError::Config(format!(
                "layer {}: no ArcGIS URL provided",
                self.id
            )));
        }
        parse_url(&incoming.url, Direction::Incoming, "url")?;
        if let Some(tz) = non_empty(&incoming.timezone) {
            crate::fields::parse_timezone(tz)?;
        }
        incoming.auth.validate(Direction::Incoming)?;
        Ok(incoming)
    }

    /// Outgoing settings, checked for everything a push needs.
    pub fn outgoing(&self) -> Result<&OutgoingConfig> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or_else(|| SyncError::Config(format!("layer {}: no outgoing section", self.id)))?;
        let destinations = outgoing.destinations();
        if destinations.is_empty() {
            return Err(SyncError::Config(format!(
                "layer {}: no destination URL for any geometry type",
                self.id
            )));
        }
        for (kind, url) in &destinations {
            parse_url(url, Direction::Outgoing, kind.esri_type())?;
        }
        // One token and referer serve the whole batch.
        let first = origin(destinations[0].1)?;
        for (kind, url) in &destinations[1..] {
            if origin(url)? != first {
                return Err(SyncError::Config(format!(
                    "layer {}: {} destination {url} is not on {first}; \
                     all destinations must share one server",
                    self.id,
                    kind.esri_type()
                )));
            }
        }
        outgoing.auth.validate(Direction::Outgoing)?;
        Ok(outgoing)
    }

    /// Check every section that is present. At least one direction is required.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SyncError::Config("layer id must not be empty".into()));
        }
        if self.incoming.is_none() && self.outgoing.is_none() {
            return Err(SyncError::Config(format!(
                "layer {}: neither incoming nor outgoing is configured",
                self.id
            )));
        }
        if self.incoming.is_some() {
            self.incoming()?;
        }
        if self.outgoing.is_some() {
            self.outgoing()?;
        }
        Ok(())
    }

    /// Credential state file: the configured path, else the platform data dir.
    ///
    /// `Ok(None)` only when no path is configured and the platform has no
    /// data directory.
    pub fn credential_path(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = non_empty(&self.state_path) {
            let expanded = shellexpand::full(path).map_err(|e| {
                SyncError::Config(format!(
                    "layer {}: cannot expand state_path {path}: {e}",
                    self.id
                ))
            })?;
            return Ok(Some(PathBuf::from(expanded.as_ref())));
        }
        Ok(directories::ProjectDirs::from("", "", "arcgis-sync")
            .map(|dirs| dirs.data_dir().join("credentials.json")))
    }
}

/// JSON schema of [`LayerConfig`], tagged with the host's `display` hint.
pub fn input_schema() -> serde_json::Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(LayerConfig))
        .unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = schema.as_object_mut() {
        obj.insert("display".into(), serde_json::Value::from("arcgis"));
    }
    schema
}

/// Origin of a URL, used as the token referer.
pub fn origin(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| SyncError::Config(format!("invalid url {url}: {e}")))?;
    Ok(parsed.origin().ascii_serialization())
}

fn parse_url(raw: &str, direction: Direction, field: &str) -> Result<Url> {
    Url::parse(raw)
        .map_err(|e| SyncError::Config(format!("{direction}: invalid {field} `{raw}`: {e}")))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
