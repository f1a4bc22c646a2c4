//! Serde-deserializable types matching backend RPC responses.
//!
//! Cached entities are stored exactly as decoded; unknown attributes are
//! kept in catch-all maps so a re-fetch never loses server-side data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One entry of the remote menu tree, as returned by `model.ir.ui.menu.read`.
///
/// Nodes are read-only on the client and never mutated after caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuNode {
  pub id: i64,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub complete_name: Option<String>,
  #[serde(default)]
  pub parent: Option<i64>,
  #[serde(default)]
  pub childs: Vec<i64>,
  #[serde(default)]
  pub icon: Option<String>,
  /// Bound action reference; shape varies with the action kind.
  #[serde(default)]
  pub action: Option<Value>,
  #[serde(default)]
  pub sequence: Option<i64>,
}

/// An action bound to a menu node via the `tree_open` keyword.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
  pub id: i64,
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default)]
  pub res_model: Option<String>,
  /// Remaining action attributes, cached as-is.
  #[serde(flatten)]
  pub extra: HashMap<String, Value>,
}

impl Action {
  /// Only window actions open a data-model view and trigger a model sync;
  /// reports and other kinds are ignored.
  pub fn is_window(&self) -> bool {
    self.kind == "ir.action.act_window"
  }
}

/// Schema row for one model, from `model.ir.model.search_read`, enriched
/// with its field rows before caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
  /// Numeric database id of the model row.
  pub id: i64,
  /// Symbolic model id, e.g. `party.party`.
  pub model: String,
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub fields: Vec<FieldDefinition>,
  #[serde(flatten)]
  pub extra: HashMap<String, Value>,
}

/// One field row from `model.ir.model.field.search_read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
  pub id: i64,
  pub name: String,
  #[serde(default)]
  pub ttype: Option<String>,
  #[serde(flatten)]
  pub extra: HashMap<String, Value>,
}

/// One data row. Field values stay untyped and are cached verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
  pub id: i64,
  #[serde(flatten)]
  pub values: HashMap<String, Value>,
}

/// Field names worth requesting when reading records.
///
/// Binary columns are skipped: icons, attachments and map payloads are
/// cached by dedicated steps and would bloat every record read.
pub fn requestable_field_names(fields: &[FieldDefinition]) -> Vec<String> {
  fields
    .iter()
    .filter(|field| field.ttype.as_deref() != Some("binary"))
    .map(|field| field.name.clone())
    .collect()
}
