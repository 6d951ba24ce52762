//! Data Container
//!
//! The unit of data interchange between workflow steps: an
//! entity × period grid of optional payloads plus lineage, warnings
//! and free-form metadata.
//!
//! Cells start as `None` placeholders (e.g. after the input step) and
//! are filled in by later analysis steps. Entities that lose their
//! last period are pruned, so every key in the grid has at least one
//! period.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::field;
use crate::steps::StepKind;

/// Period grid for a single entity.
pub type PeriodMap = IndexMap<String, Option<Payload>>;

/// A single cell value.
///
/// Structured payloads carry the name of the model type that produced
/// them and are persisted as `{"type": ..., "data": ...}` so that a
/// round trip through the job store keeps their identity. Plain values
/// pass through unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Structured { type_name: String, data: Value },
    Plain(Value),
}

impl Payload {
    pub fn structured(type_name: impl Into<String>, data: Value) -> Self {
        Self::Structured {
            type_name: type_name.into(),
            data,
        }
    }

    pub fn plain(value: Value) -> Self {
        Self::Plain(value)
    }

    /// The payload's data, without the type tag.
    pub fn data(&self) -> &Value {
        match self {
            Self::Structured { data, .. } => data,
            Self::Plain(value) => value,
        }
    }

    pub fn type_name(&self) -> Option<&str> {
        match self {
            Self::Structured { type_name, .. } => Some(type_name),
            Self::Plain(_) => None,
        }
    }

    /// Resolves a dot-path field inside the payload's data.
    pub fn field(&self, path: &str) -> Option<&Value> {
        field::lookup(self.data(), path)
    }

    /// Converts to the persisted JSON form.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Structured { type_name, data } => {
                let mut map = Map::new();
                map.insert("type".to_string(), Value::String(type_name.clone()));
                map.insert("data".to_string(), data.clone());
                Value::Object(map)
            }
            Self::Plain(value) => value.clone(),
        }
    }

    /// Reads the persisted JSON form, recognising the `{type, data}` wrapper.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut map)
                if map.len() == 2
                    && map.get("type").is_some_and(Value::is_string)
                    && map.contains_key("data") =>
            {
                let data = map.remove("data").unwrap_or(Value::Null);
                let type_name = match map.remove("type") {
                    Some(Value::String(name)) => name,
                    _ => String::new(),
                };
                Self::Structured { type_name, data }
            }
            other => Self::Plain(other),
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Structured { type_name, data } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", type_name)?;
                map.serialize_entry("data", data)?;
                map.end()
            }
            Self::Plain(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_value)
    }
}

/// Extent of a container: `(entity count, max periods per entity)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub entities: usize,
    pub periods: usize,
}

impl Shape {
    pub const fn new(entities: usize, periods: usize) -> Self {
        Self { entities, periods }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.entities, self.periods)
    }
}

/// A timestamped warning or error attached to a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Shape-tracked data envelope passed between workflow steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataContainer {
    #[serde(deserialize_with = "deserialize_grid")]
    data: IndexMap<String, PeriodMap>,
    pub step_id: String,
    pub step_type: StepKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub source_run_ids: Vec<String>,
    #[serde(default)]
    pub errors: Vec<Issue>,
    #[serde(default)]
    pub warnings: Vec<Issue>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DataContainer {
    /// Creates an empty container produced by the given step.
    pub fn new(step_id: impl Into<String>, step_type: StepKind) -> Self {
        Self {
            data: IndexMap::new(),
            step_id: step_id.into(),
            step_type,
            created_at: Utc::now(),
            source_run_ids: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Creates an empty container for a downstream step that keeps this
    /// container's lineage and metadata.
    pub fn derive(&self, step_id: impl Into<String>, step_type: StepKind) -> Self {
        let mut derived = Self::new(step_id, step_type);
        derived.source_run_ids = self.source_run_ids.clone();
        derived.metadata = self.metadata.clone();
        derived
    }

    /// Sets a cell, creating the entity if needed.
    pub fn insert(
        &mut self,
        entity: impl Into<String>,
        period: impl Into<String>,
        payload: Option<Payload>,
    ) {
        self.data
            .entry(entity.into())
            .or_default()
            .insert(period.into(), payload);
    }

    /// Removes a cell, pruning the entity if it has no periods left.
    pub fn remove(&mut self, entity: &str, period: &str) -> Option<Option<Payload>> {
        let periods = self.data.get_mut(entity)?;
        let removed = periods.shift_remove(period);
        if periods.is_empty() {
            self.data.shift_remove(entity);
        }
        removed
    }

    /// Keeps only the cells for which `keep` returns true, then prunes
    /// empty entities. Returns the number of cells removed.
    pub fn retain_cells<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str, &str, Option<&Payload>) -> bool,
    {
        let mut removed = 0;
        for (entity, periods) in self.data.iter_mut() {
            let before = periods.len();
            periods.retain(|period, payload| keep(entity, period, payload.as_ref()));
            removed += before - periods.len();
        }
        self.prune_empty();
        removed
    }

    /// Drops entities with no periods.
    pub fn prune_empty(&mut self) {
        self.data.retain(|_, periods| !periods.is_empty());
    }

    pub fn shape(&self) -> Shape {
        let periods = self.data.values().map(IndexMap::len).max().unwrap_or(0);
        Shape::new(self.data.len(), periods)
    }

    pub fn num_entities(&self) -> usize {
        self.data.len()
    }

    pub fn periods_per_entity(&self) -> IndexMap<String, usize> {
        self.data
            .iter()
            .map(|(entity, periods)| (entity.clone(), periods.len()))
            .collect()
    }

    /// Number of non-null payloads.
    pub fn total_items(&self) -> usize {
        self.data
            .values()
            .flat_map(IndexMap::values)
            .filter(|cell| cell.is_some())
            .count()
    }

    /// Number of cells, placeholders included.
    pub fn total_slots(&self) -> usize {
        self.data.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn entities(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }

    pub fn contains_entity(&self, entity: &str) -> bool {
        self.data.contains_key(entity)
    }

    pub fn periods_for(&self, entity: &str) -> Vec<&str> {
        self.data
            .get(entity)
            .map(|periods| periods.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Union of periods across all entities, sorted.
    pub fn all_periods(&self) -> Vec<String> {
        self.data
            .values()
            .flat_map(IndexMap::keys)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn get(&self, entity: &str, period: &str) -> Option<&Payload> {
        self.data.get(entity)?.get(period)?.as_ref()
    }

    pub fn entity(&self, entity: &str) -> Option<&PeriodMap> {
        self.data.get(entity)
    }

    /// Iterates every cell (placeholders included) in insertion order.
    pub fn slots(&self) -> impl Iterator<Item = (&str, &str, Option<&Payload>)> {
        self.data.iter().flat_map(|(entity, periods)| {
            periods
                .iter()
                .map(move |(period, cell)| (entity.as_str(), period.as_str(), cell.as_ref()))
        })
    }

    /// Iterates non-null cells in insertion order.
    pub fn cells(&self) -> impl Iterator<Item = (&str, &str, &Payload)> {
        self.slots()
            .filter_map(|(entity, period, cell)| cell.map(|payload| (entity, period, payload)))
    }

    pub fn add_warning(&mut self, message: impl Into<String>, context: Map<String, Value>) {
        self.warnings.push(Issue {
            message: message.into(),
            context,
            timestamp: Utc::now(),
        });
    }

    pub fn add_error(&mut self, message: impl Into<String>, context: Map<String, Value>) {
        self.errors.push(Issue {
            message: message.into(),
            context,
            timestamp: Utc::now(),
        });
    }

    /// Records the run id of an analysis invocation in the lineage.
    pub fn add_source_run(&mut self, run_id: impl Into<String>) {
        let run_id = run_id.into();
        if !self.source_run_ids.contains(&run_id) {
            self.source_run_ids.push(run_id);
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Reads the entity grid, dropping entities without periods.
fn deserialize_grid<'de, D>(deserializer: D) -> Result<IndexMap<String, PeriodMap>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut grid = IndexMap::<String, PeriodMap>::deserialize(deserializer)?;
    grid.retain(|_, periods| !periods.is_empty());
    Ok(grid)
}

/// Builds a context map for warnings from `(key, value)` pairs.
pub fn context<I, K>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grid() -> DataContainer {
        let mut container = DataContainer::new("load", StepKind::Input);
        container.insert("AAPL", "2023", Some(Payload::plain(json!({"score": 80}))));
        container.insert("AAPL", "2024", None);
        container.insert("MSFT", "2022", Some(Payload::plain(json!({"score": 60}))));
        container
    }

    #[test]
    fn test_shape_and_counts() {
        let container = grid();
        assert_eq!(container.shape(), Shape::new(2, 2));
        assert_eq!(container.total_items(), 2);
        assert_eq!(container.total_slots(), 3);
        assert_eq!(container.entities(), vec!["AAPL", "MSFT"]);
        assert_eq!(container.periods_for("AAPL"), vec!["2023", "2024"]);
        assert_eq!(container.periods_per_entity().get("MSFT"), Some(&1));
    }

    #[test]
    fn test_all_periods_sorted_union() {
        let container = grid();
        assert_eq!(container.all_periods(), vec!["2022", "2023", "2024"]);
    }

    #[test]
    fn test_remove_prunes_empty_entity() {
        let mut container = grid();
        container.remove("MSFT", "2022");
        assert!(!container.contains_entity("MSFT"));
        assert_eq!(container.num_entities(), 1);
    }

    #[test]
    fn test_from_json_drops_empty_entities() {
        let mut value = serde_json::to_value(grid()).unwrap();
        value["data"]["EMPTY"] = json!({});

        let container = DataContainer::from_json(&value.to_string()).unwrap();
        assert!(!container.contains_entity("EMPTY"));
        assert_eq!(container.shape(), grid().shape());
    }

    #[test]
    fn test_retain_cells_prunes() {
        let mut container = grid();
        let removed = container.retain_cells(|_, _, payload| payload.is_some());
        assert_eq!(removed, 1);
        assert_eq!(container.shape(), Shape::new(2, 1));
        assert_eq!(container.total_items(), 2);
    }

    #[test]
    fn test_structured_payload_roundtrip_keeps_type() {
        let mut container = DataContainer::new("analyze", StepKind::FundamentalAnalysis);
        container.insert(
            "AAPL",
            "2024",
            Some(Payload::structured("FundamentalAnalysis", json!({"rating": "buy"}))),
        );
        container.insert("AAPL", "2023", Some(Payload::plain(json!({"note": "x"}))));
        container.insert("AAPL", "2022", None);

        let json = container.to_json().unwrap();
        assert!(json.contains(r#""type":"FundamentalAnalysis""#));

        let restored = DataContainer::from_json(&json).unwrap();
        assert_eq!(restored, container);
        assert_eq!(
            restored.get("AAPL", "2024").and_then(Payload::type_name),
            Some("FundamentalAnalysis")
        );
        assert!(restored.get("AAPL", "2022").is_none());
        assert_eq!(restored.periods_for("AAPL").len(), 3);
    }

    #[test]
    fn test_payload_field_lookup_through_wrapper() {
        let payload = Payload::structured("Score", json!({"metrics": {"score": 9}}));
        assert_eq!(payload.field("metrics.score"), Some(&json!(9)));
    }

    #[test]
    fn test_plain_map_with_extra_keys_stays_plain() {
        let payload = Payload::from_value(json!({"type": "x", "data": 1, "extra": true}));
        assert!(matches!(payload, Payload::Plain(_)));
    }

    #[test]
    fn test_warnings_accumulate() {
        let mut container = grid();
        container.add_warning("first", Map::new());
        container.add_warning("second", context([("entity", json!("AAPL"))]));
        container.add_error("bad", Map::new());
        assert_eq!(container.warnings.len(), 2);
        assert_eq!(container.errors.len(), 1);
        assert_eq!(container.warnings[1].context["entity"], json!("AAPL"));
    }

    #[test]
    fn test_derive_keeps_lineage() {
        let mut container = grid();
        container.add_source_run("run-a");
        container.add_source_run("run-a");
        container.metadata.insert("origin".into(), json!("test"));

        let derived = container.derive("next", StepKind::Filter);
        assert_eq!(derived.source_run_ids, vec!["run-a"]);
        assert_eq!(derived.metadata["origin"], json!("test"));
        assert!(derived.is_empty());
        assert_eq!(derived.step_type, StepKind::Filter);
    }
}
