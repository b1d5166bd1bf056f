//! Registry of resources exposed under `/{resource}/api`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use assessor_core::PageLimits;
use assessor_storage::Source;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

pub const PARCEL_FEATURES_FUNCTION: &str = "get_parcel_value_features_asof";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Table,
    Rpc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDef {
    pub name: String,
    pub kind: ResourceKind,
    pub target: String,
    #[serde(default)]
    pub default_sort: Option<String>,
    #[serde(default)]
    pub max_page_size: Option<u32>,
    /// Fixed arguments merged under the request's own RPC arguments.
    #[serde(default)]
    pub args: BTreeMap<String, JsonValue>,
}

impl ResourceDef {
    fn table(name: &str, default_sort: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ResourceKind::Table,
            target: name.to_string(),
            default_sort: Some(default_sort.to_string()),
            max_page_size: None,
            args: BTreeMap::new(),
        }
    }

    fn rpc(name: &str, function: &str, default_sort: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            kind: ResourceKind::Rpc,
            target: function.to_string(),
            default_sort: default_sort.map(ToString::to_string),
            max_page_size: None,
            args: BTreeMap::new(),
        }
    }

    pub fn parcel_features() -> Self {
        Self::rpc("features", PARCEL_FEATURES_FUNCTION, Some("parcel_id"))
    }

    pub fn page_limits(&self, base: PageLimits) -> PageLimits {
        PageLimits {
            max_page_size: self.max_page_size.unwrap_or(base.max_page_size),
            ..base
        }
    }

    /// Query-string arguments only reach RPC-backed resources.
    pub fn source(&self, request_args: &BTreeMap<String, String>) -> Source {
        match self.kind {
            ResourceKind::Table => {
                if !request_args.is_empty() {
                    debug!(
                        resource = %self.name,
                        ignored = ?request_args.keys().collect::<Vec<_>>(),
                        "ignoring non-filter parameters for table resource"
                    );
                }
                Source::Table(self.target.clone())
            }
            ResourceKind::Rpc => {
                let mut args = self
                    .args
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Map<String, JsonValue>>();
                for (key, value) in request_args {
                    args.insert(key.clone(), arg_value(value));
                }
                Source::Rpc {
                    function: self.target.clone(),
                    args,
                }
            }
        }
    }
}

/// Query-string argument to JSON: integers, decimals, booleans and `null`
/// are sent typed, everything else as a string.
pub fn arg_value(raw: &str) -> JsonValue {
    let trimmed = raw.trim();
    if trimmed == "null" {
        return JsonValue::Null;
    }
    if let Ok(b) = trimmed.parse::<bool>() {
        return JsonValue::Bool(b);
    }
    // codes like postcodes keep their leading zeros
    let leading_zero = trimmed.len() > 1 && trimmed.starts_with('0') && !trimmed.starts_with("0.");
    if leading_zero {
        return JsonValue::String(raw.to_string());
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return JsonValue::from(i);
    }
    if let Some(n) = trimmed
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(serde_json::Number::from_f64)
    {
        return JsonValue::Number(n);
    }
    JsonValue::String(raw.to_string())
}

#[derive(Debug, Clone, Deserialize)]
struct ResourcesYaml {
    resources: Vec<ResourceDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRegistry {
    resources: BTreeMap<String, ResourceDef>,
}

impl ResourceRegistry {
    pub fn builtin() -> Self {
        Self::from_defs(vec![
            ResourceDef::table("parcels", "parcel_id"),
            ResourceDef::table("sales", "-sale_date"),
            ResourceDef::table("appeals", "-created_at"),
            ResourceDef::table("neighborhoods", "name"),
            ResourceDef::table("tax_rates", "-year"),
            ResourceDef::rpc("vehicles", "search_vehicle_unified", None),
            ResourceDef::rpc("ratios", "get_ratios", None),
            ResourceDef::parcel_features(),
        ])
    }

    pub fn from_defs(defs: Vec<ResourceDef>) -> Self {
        Self {
            resources: defs.into_iter().map(|d| (d.name.clone(), d)).collect(),
        }
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let parsed: ResourcesYaml = serde_yaml::from_str(text).context("parsing resource registry")?;
        Ok(Self::from_defs(parsed.resources))
    }

    /// Loads `path`, or the built-in registry when the file does not exist.
    pub fn load_or_builtin(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn get(&self, name: &str) -> Option<&ResourceDef> {
        self.resources.get(name)
    }

    pub fn features(&self) -> ResourceDef {
        self.get("features")
            .cloned()
            .unwrap_or_else(ResourceDef::parcel_features)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDef> {
        self.resources.values()
    }
}
