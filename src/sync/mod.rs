//! The offline synchronization engine.
//!
//! Walks the remote menu hierarchy, discovers the data models bound to
//! window actions, and pulls model metadata, views, icons, attachment
//! counts and record sets into the local store so the client can run
//! without connectivity.
//!
//! The cache is accumulated, not snapshotted: every independently fetched
//! unit is written as soon as it arrives, records are additive across
//! extents, and re-running a sync repairs a partial previous run. Fan-out
//! uses `try_join!`/`try_join_all` inside one task, so the first failure
//! drops the remaining sibling futures instead of leaking them.

mod attachments;
mod icons;
mod menu;
mod model;
mod records;

use serde::Deserialize;

use crate::rpc::RpcGateway;
use crate::spatial::SpatialGateway;
use crate::store::{KvBackend, Store};

/// Default ceiling on paginated record/id queries, guarding against
/// accidental huge responses. Hitting it truncates silently (logged).
pub const DEFAULT_RESULTS_LIMIT: usize = 1000;

/// Attachment listings carry a single short field, so a larger ceiling
/// is safe.
const ATTACHMENTS_LIMIT: usize = 10_000;

/// What to do when a model has already been cached.
///
/// The presence of the stored model definition is the sole signal that a
/// model was ever synced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyPolicy {
  /// Skip models whose definition is already stored.
  #[default]
  Skip,
  /// Unconditionally repeat every sync step.
  Refetch,
}

/// The synchronization engine: remote gateways, the local store, and the
/// sync policy knobs.
pub struct SyncEngine<R, W, B> {
  rpc: R,
  spatial: W,
  store: Store<B>,
  policy: IdempotencyPolicy,
  results_limit: usize,
}

impl<R, W, B> SyncEngine<R, W, B>
where
  R: RpcGateway,
  W: SpatialGateway,
  B: KvBackend,
{
  pub fn new(
    rpc: R,
    spatial: W,
    store: Store<B>,
    policy: IdempotencyPolicy,
    results_limit: usize,
  ) -> Self {
    Self {
      rpc,
      spatial,
      store,
      policy,
      results_limit,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::rpc::RpcGateway;
  use crate::spatial::{Crs, Extent, Feature, SpatialGateway};
  use crate::store::MemoryBackend;
  use async_trait::async_trait;
  use base64::{engine::general_purpose::STANDARD, Engine as _};
  use color_eyre::{eyre::eyre, Result};
  use serde_json::{json, Value};
  use std::collections::HashMap;
  use std::sync::{Arc, Mutex};

  #[derive(Default)]
  struct FakeModel {
    db_id: i64,
    fields: Value,
    records: Vec<Value>,
    no_geom_ids: Vec<i64>,
    view_ids: Vec<i64>,
    spatial_def: Option<String>,
    feature_ids: Vec<String>,
  }

  /// In-memory server interpreting the RPC and feature-query protocols
  /// against fixtures, with a method call log.
  #[derive(Default)]
  struct FakeServer {
    menus: HashMap<i64, Value>,
    actions: HashMap<i64, Value>,
    models: HashMap<String, FakeModel>,
    attachments: Vec<String>,
    icons: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
  }

  impl FakeServer {
    fn log(&self, method: &str) {
      self.calls.lock().unwrap().push(method.to_string());
    }

    fn call_count(&self, method: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|m| *m == method)
        .count()
    }

    fn handle(&self, method: &str, params: &Value) -> Result<Value> {
      self.log(method);
      match method {
        "model.ir.ui.menu.read" => {
          let id = params[0][0].as_i64().ok_or_else(|| eyre!("bad menu read params"))?;
          let node = self
            .menus
            .get(&id)
            .ok_or_else(|| eyre!("unknown menu {}", id))?;
          Ok(json!([node]))
        }
        "model.ir.ui.menu.search" => {
          let parent = &params[0][0][2];
          let mut ids: Vec<i64> = self
            .menus
            .values()
            .filter(|node| &node["parent"] == parent)
            .filter_map(|node| node["id"].as_i64())
            .collect();
          ids.sort_unstable();
          Ok(json!(ids))
        }
        "model.ir.action.keyword.get_keyword" => {
          let id = params[1][1]
            .as_i64()
            .ok_or_else(|| eyre!("bad keyword params"))?;
          Ok(match self.actions.get(&id) {
            Some(action) => json!([action]),
            None => json!([]),
          })
        }
        "model.ir.model.search_read" => {
          let model_id = params[0][0][2]
            .as_str()
            .ok_or_else(|| eyre!("bad model domain"))?;
          let model = self
            .models
            .get(model_id)
            .ok_or_else(|| eyre!("unknown model {}", model_id))?;
          Ok(json!([{"id": model.db_id, "model": model_id, "name": model_id}]))
        }
        "model.ir.model.field.search_read" => {
          let db_id = params[0][0][2]
            .as_i64()
            .ok_or_else(|| eyre!("bad field domain"))?;
          let model = self
            .models
            .values()
            .find(|m| m.db_id == db_id)
            .ok_or_else(|| eyre!("unknown model db id {}", db_id))?;
          Ok(model.fields.clone())
        }
        "model.ir.ui.view.search" => {
          let model_id = params[0][0][2]
            .as_str()
            .ok_or_else(|| eyre!("bad view domain"))?;
          let model = self
            .models
            .get(model_id)
            .ok_or_else(|| eyre!("unknown model {}", model_id))?;
          Ok(json!(model.view_ids))
        }
        "model.ir.attachment.search_read" => {
          let lower = params[0][0][2]
            .as_str()
            .ok_or_else(|| eyre!("bad attachment domain"))?;
          let upper = params[0][1][2]
            .as_str()
            .ok_or_else(|| eyre!("bad attachment domain"))?;
          let rows: Vec<Value> = self
            .attachments
            .iter()
            .filter(|resource| resource.as_str() >= lower && resource.as_str() < upper)
            .map(|resource| json!({"resource": resource}))
            .collect();
          Ok(json!(rows))
        }
        "model.ir.ui.icon.search_read" => {
          let name = params[0][0][2]
            .as_str()
            .ok_or_else(|| eyre!("bad icon domain"))?;
          Ok(match self.icons.get(name) {
            Some(svg) => json!([{"icon": svg}]),
            None => json!([]),
          })
        }
        other => self.handle_model_call(other, params),
      }
    }

    fn handle_model_call(&self, method: &str, params: &Value) -> Result<Value> {
      let rest = method
        .strip_prefix("model.")
        .ok_or_else(|| eyre!("unknown method {}", method))?;
      let (model_id, verb) = rest
        .rsplit_once('.')
        .ok_or_else(|| eyre!("unknown method {}", method))?;
      let model = self
        .models
        .get(model_id)
        .ok_or_else(|| eyre!("unknown model {}", model_id))?;

      match verb {
        "search_read" => Ok(json!(model.records)),
        "search" => Ok(json!(model.no_geom_ids)),
        "read" => {
          let ids: Vec<i64> = serde_json::from_value(params[0].clone())
            .map_err(|e| eyre!("bad read params: {}", e))?;
          let rows: Vec<Value> = model
            .records
            .iter()
            .filter(|record| record["id"].as_i64().is_some_and(|id| ids.contains(&id)))
            .cloned()
            .collect();
          Ok(json!(rows))
        }
        "default_get" => Ok(json!({})),
        "fields_view_get" => Ok(json!({"arch": "<view/>", "model": model_id})),
        "get_spatial_definition" => Ok(match &model.spatial_def {
          Some(payload) => json!(payload),
          None => Value::Null,
        }),
        _ => Err(eyre!("unknown verb {} for {}", verb, model_id)),
      }
    }
  }

  #[async_trait]
  impl RpcGateway for Arc<FakeServer> {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
      self.handle(method, &params)
    }
  }

  #[async_trait]
  impl SpatialGateway for Arc<FakeServer> {
    fn service_crs(&self) -> Crs {
      Crs::Epsg4326
    }

    async fn get_features(&self, type_name: &str, _bbox: &Extent) -> Result<Vec<Feature>> {
      self.log("wfs.getFeature");
      let model = self
        .models
        .get(type_name)
        .ok_or_else(|| eyre!("unknown layer {}", type_name))?;
      Ok(
        model
          .feature_ids
          .iter()
          .map(|id| Feature { id: id.clone() })
          .collect(),
      )
    }
  }

  type TestEngine = SyncEngine<Arc<FakeServer>, Arc<FakeServer>, MemoryBackend>;

  fn engine_for(server: &Arc<FakeServer>) -> (TestEngine, Store<MemoryBackend>) {
    engine_with_policy(server, IdempotencyPolicy::Skip)
  }

  fn engine_with_policy(
    server: &Arc<FakeServer>,
    policy: IdempotencyPolicy,
  ) -> (TestEngine, Store<MemoryBackend>) {
    let store = Store::new(MemoryBackend::new());
    let engine = SyncEngine::new(
      Arc::clone(server),
      Arc::clone(server),
      store.clone(),
      policy,
      DEFAULT_RESULTS_LIMIT,
    );
    (engine, store)
  }

  fn extent() -> Extent {
    Extent::new(0.0, 40.0, 10.0, 50.0, Crs::Epsg4326)
  }

  fn menu_node(id: i64, parent: Option<i64>, icon: &str) -> Value {
    json!({
      "id": id,
      "name": format!("Node {}", id),
      "complete_name": format!("Node {}", id),
      "parent": parent,
      "childs": [],
      "icon": icon,
      "action": null,
      "sequence": id,
    })
  }

  fn window_action(model_id: &str) -> Value {
    json!({"id": 900, "type": "ir.action.act_window", "res_model": model_id})
  }

  fn plain_model(db_id: i64) -> FakeModel {
    FakeModel {
      db_id,
      fields: json!([
        {"id": 1, "name": "name", "ttype": "char"},
        {"id": 2, "name": "photo", "ttype": "binary"},
      ]),
      records: vec![
        json!({"id": 1, "name": "first"}),
        json!({"id": 2, "name": "second"}),
      ],
      ..FakeModel::default()
    }
  }

  #[tokio::test]
  async fn test_leaf_node_without_action() {
    let mut server = FakeServer::default();
    server.menus.insert(5, menu_node(5, None, "tryton-party"));
    server
      .icons
      .insert("tryton-party".into(), "<svg/>".into());
    let server = Arc::new(server);

    let (engine, store) = engine_for(&server);
    engine.sync_menu_tree(5, &extent()).await.unwrap();

    // Exactly the node value and its icon; no model keys
    assert_eq!(
      store.keys().unwrap(),
      vec!["icons/tryton-party".to_string(), "menuItemValues/5".to_string()]
    );
  }

  #[tokio::test]
  async fn test_skip_policy_fetches_once() {
    let mut server = FakeServer::default();
    server.models.insert("foo.bar".into(), plain_model(42));
    let server = Arc::new(server);

    let (engine, store) = engine_for(&server);
    engine.sync_model("foo.bar", &extent()).await.unwrap();
    let keys_after_first = store.keys().unwrap();

    engine.sync_model("foo.bar", &extent()).await.unwrap();

    assert_eq!(server.call_count("model.ir.model.search_read"), 1);
    assert_eq!(server.call_count("model.foo.bar.search_read"), 1);
    assert_eq!(store.keys().unwrap(), keys_after_first);
  }

  #[tokio::test]
  async fn test_refetch_policy_fetches_twice() {
    let mut server = FakeServer::default();
    server.models.insert("foo.bar".into(), plain_model(42));
    let server = Arc::new(server);

    let (engine, store) = engine_with_policy(&server, IdempotencyPolicy::Refetch);
    engine.sync_model("foo.bar", &extent()).await.unwrap();
    let keys_after_first = store.keys().unwrap();
    let record_after_first: Value = store.get("models/foo.bar/items/1").unwrap().unwrap();

    engine.sync_model("foo.bar", &extent()).await.unwrap();

    assert_eq!(server.call_count("model.ir.model.search_read"), 2);
    assert_eq!(server.call_count("model.foo.bar.search_read"), 2);

    // The fetch is deterministic, so the second run leaves identical contents
    assert_eq!(store.keys().unwrap(), keys_after_first);
    assert_eq!(
      store.get::<Value>("models/foo.bar/items/1").unwrap().unwrap(),
      record_after_first
    );
  }

  #[tokio::test]
  async fn test_icon_fetched_at_most_once() {
    let mut server = FakeServer::default();
    server.icons.insert("tryton-tree".into(), "<svg/>".into());
    let server = Arc::new(server);

    let (engine, store) = engine_for(&server);
    engine.ensure_icon("tryton-tree").await.unwrap();
    engine.ensure_icon("tryton-tree").await.unwrap();

    assert_eq!(server.call_count("model.ir.ui.icon.search_read"), 1);
    assert_eq!(
      store.get::<String>("icons/tryton-tree").unwrap().unwrap(),
      "<svg/>"
    );
  }

  #[tokio::test]
  async fn test_geofenced_loader_stores_id_union() {
    let mut server = FakeServer::default();
    server.models.insert(
      "geo.site".into(),
      FakeModel {
        db_id: 77,
        fields: json!([
          {"id": 1, "name": "name", "ttype": "char"},
          {"id": 2, "name": "geom", "ttype": "geometry"},
        ]),
        records: vec![
          json!({"id": 3, "name": "in extent"}),
          json!({"id": 7, "name": "both"}),
          json!({"id": 9, "name": "no geometry"}),
          json!({"id": 11, "name": "outside extent"}),
        ],
        no_geom_ids: vec![7, 9],
        spatial_def: Some("<qgs/>".into()),
        feature_ids: vec!["geo.site.3".into(), "geo.site.7".into()],
        ..FakeModel::default()
      },
    );
    let server = Arc::new(server);

    let (engine, store) = engine_for(&server);
    engine.sync_model("geo.site", &extent()).await.unwrap();

    // Union of in-extent ids {3,7} and null-geometry ids {7,9}, deduplicated
    let items = store.scope("models").scope("geo.site").scope("items");
    assert_eq!(
      items.keys().unwrap(),
      vec!["3".to_string(), "7".to_string(), "9".to_string()]
    );

    // The spatial asset is stored base64-encoded
    let encoded: String = store
      .get("models/geo.site/spatialDef")
      .unwrap()
      .unwrap();
    assert_eq!(encoded, STANDARD.encode("<qgs/>"));
  }

  #[tokio::test]
  async fn test_geofenced_loader_is_additive() {
    let mut server = FakeServer::default();
    server.models.insert(
      "geo.site".into(),
      FakeModel {
        db_id: 77,
        fields: json!([{"id": 1, "name": "name", "ttype": "char"}]),
        records: vec![json!({"id": 3, "name": "a"}), json!({"id": 4, "name": "b"})],
        spatial_def: Some("<qgs/>".into()),
        feature_ids: vec!["geo.site.3".into()],
        ..FakeModel::default()
      },
    );
    let server = Arc::new(server);

    let (engine, store) = engine_for(&server);
    let items = store.scope("models").scope("geo.site").scope("items");

    // A record cached by an earlier pan over another extent
    items.put("4", &json!({"id": 4, "name": "b"})).unwrap();

    engine.sync_model("geo.site", &extent()).await.unwrap();

    // Record 4 is outside this extent's result union but stays cached
    assert_eq!(
      items.keys().unwrap(),
      vec!["3".to_string(), "4".to_string()]
    );
  }

  #[tokio::test]
  async fn test_attachment_range_excludes_prefix_collisions() {
    let mut server = FakeServer::default();
    server.models.insert("12".into(), plain_model(12));
    server.attachments = vec!["12,5".into(), "12,9".into(), "12,5".into(), "120,1".into()];
    let server = Arc::new(server);

    let (engine, store) = engine_for(&server);
    let db = store.scope("models").scope("12");
    engine.count_attachments(&db, "12").await.unwrap();

    let index = db.scope("itemAttachmentCounts");
    assert_eq!(index.keys().unwrap(), vec!["5".to_string(), "9".to_string()]);
    assert_eq!(index.get::<u64>("5").unwrap(), Some(2));
    assert_eq!(index.get::<u64>("9").unwrap(), Some(1));
  }

  #[tokio::test]
  async fn test_attachment_counts_are_recomputed_not_merged() {
    let mut server = FakeServer::default();
    server.models.insert("12".into(), plain_model(12));
    server.attachments = vec!["12,5".into()];
    let server = Arc::new(server);

    let (engine, store) = engine_for(&server);
    let db = store.scope("models").scope("12");
    let index = db.scope("itemAttachmentCounts");

    // Stale count from a previous run, for a record with no attachments left
    index.put("99", &4u64).unwrap();

    engine.count_attachments(&db, "12").await.unwrap();

    assert_eq!(index.keys().unwrap(), vec!["5".to_string()]);
  }

  #[tokio::test]
  async fn test_stale_spatial_asset_is_removed() {
    let mut server = FakeServer::default();
    server.models.insert("foo.bar".into(), plain_model(42));
    let server = Arc::new(server);

    let (engine, store) = engine_with_policy(&server, IdempotencyPolicy::Refetch);

    // The model used to be spatial
    store
      .scope("models")
      .scope("foo.bar")
      .put("spatialDef", &"stale")
      .unwrap();

    engine.sync_model("foo.bar", &extent()).await.unwrap();

    assert!(!store.contains("models/foo.bar/spatialDef").unwrap());
  }

  #[tokio::test]
  async fn test_unknown_node_fails_the_subtree() {
    let server = Arc::new(FakeServer::default());
    let (engine, store) = engine_for(&server);

    assert!(engine.sync_menu_tree(1, &extent()).await.is_err());
    assert!(store.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_end_to_end_menu_tree() {
    let mut server = FakeServer::default();
    server.menus.insert(132, menu_node(132, None, "tryton-folder"));
    server.menus.insert(5, menu_node(5, Some(132), "tryton-folder"));
    server.menus.insert(6, menu_node(6, Some(132), "tryton-list"));
    server.actions.insert(6, window_action("foo.bar"));
    server.models.insert(
      "foo.bar".into(),
      FakeModel {
        view_ids: vec![12],
        ..plain_model(42)
      },
    );
    server.attachments = vec!["foo.bar,1".into()];
    server.icons.insert("tryton-folder".into(), "<svg/>".into());
    server.icons.insert("tryton-list".into(), "<svg/>".into());
    let server = Arc::new(server);

    let (engine, store) = engine_for(&server);
    engine.sync_menu_tree(132, &extent()).await.unwrap();

    let expected: Vec<String> = [
      "icons/tryton-folder",
      "icons/tryton-list",
      "menuItemActions/6",
      "menuItemValues/132",
      "menuItemValues/5",
      "menuItemValues/6",
      "models/dbIds/42",
      "models/foo.bar/defaultValue",
      "models/foo.bar/itemAttachmentCounts/1",
      "models/foo.bar/items/1",
      "models/foo.bar/items/2",
      "models/foo.bar/modelDef",
      "models/foo.bar/views/12",
      "models/foo.bar/views/form",
      "models/foo.bar/views/tree",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect();

    assert_eq!(store.keys().unwrap(), expected);
  }
}
