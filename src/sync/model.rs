//! Per-model synchronization: definition, views, defaults, attachment
//! counts and the record set.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::rpc::types::{requestable_field_names, ModelDefinition};
use crate::rpc::{call_decoded, search_read_params, RpcGateway};
use crate::spatial::{Extent, SpatialGateway};
use crate::store::{KvBackend, Store};

use super::{IdempotencyPolicy, SyncEngine};

impl<R, W, B> SyncEngine<R, W, B>
where
  R: RpcGateway,
  W: SpatialGateway,
  B: KvBackend,
{
  /// Synchronize one model into `models/{modelId}/...`.
  ///
  /// Under the skip policy, a stored model definition means the model was
  /// already synced and the whole call is a no-op; under refetch every
  /// step runs again.
  pub async fn sync_model(&self, model_id: &str, extent: &Extent) -> Result<()> {
    if self.policy == IdempotencyPolicy::Skip
      && self.store.scope("models").scope(model_id).contains("modelDef")?
    {
      debug!(model_id, "model already cached, skipping");
      return Ok(());
    }

    self.load_model(model_id, extent).await
  }

  async fn load_model(&self, model_id: &str, extent: &Extent) -> Result<()> {
    info!(model_id, "syncing model");
    let models = self.store.scope("models");
    let db = models.scope(model_id);

    let ((), (), definition) = tokio::try_join!(
      self.load_views(&db, model_id),
      self.count_attachments(&db, model_id),
      self.fetch_model_definition(model_id),
    )?;

    // Reverse index from the numeric database id back to the symbolic id
    models.put(&format!("dbIds/{}", definition.id), &definition.model)?;
    db.put("modelDef", &definition)?;

    let all_fields: Vec<String> = definition.fields.iter().map(|f| f.name.clone()).collect();
    let requested = requestable_field_names(&definition.fields);

    tokio::try_join!(
      self.load_default_values(&db, model_id, &all_fields),
      self.load_record_set(&db, model_id, extent, &requested),
    )?;

    Ok(())
  }

  async fn fetch_model_definition(&self, model_id: &str) -> Result<ModelDefinition> {
    let rows: Vec<ModelDefinition> = call_decoded(
      &self.rpc,
      "model.ir.model.search_read",
      search_read_params(json!([["model", "=", model_id]]), 1, json!([])),
    )
    .await?;
    let mut definition = rows
      .into_iter()
      .next()
      .ok_or_else(|| eyre!("Model {} not known to the server", model_id))?;

    definition.fields = call_decoded(
      &self.rpc,
      "model.ir.model.field.search_read",
      search_read_params(
        json!([["model", "=", definition.id]]),
        self.results_limit,
        json!([]),
      ),
    )
    .await?;

    Ok(definition)
  }

  async fn load_default_values(
    &self,
    db: &Store<B>,
    model_id: &str,
    field_names: &[String],
  ) -> Result<()> {
    let defaults = self
      .rpc
      .call(
        &format!("model.{}.default_get", model_id),
        json!([field_names]),
      )
      .await?;
    db.put("defaultValue", &defaults)
  }

  /// Fetch every registered view plus the two symbolic defaults, and store
  /// them as one batch keyed by view id.
  async fn load_views(&self, db: &Store<B>, model_id: &str) -> Result<()> {
    let mut view_ids: Vec<Value> = call_decoded(
      &self.rpc,
      "model.ir.ui.view.search",
      search_read_params(
        json!([["model", "=", model_id]]),
        self.results_limit,
        json!([]),
      ),
    )
    .await?;
    view_ids.push(json!("tree"));
    view_ids.push(json!("form"));

    let definitions = try_join_all(
      view_ids
        .iter()
        .map(|view_id| self.fetch_view_definition(model_id, view_id)),
    )
    .await?;

    let entries: Vec<(String, Value)> = view_ids
      .iter()
      .zip(definitions)
      .map(|(view_id, definition)| (view_key(view_id), definition))
      .collect();
    db.scope("views").batch_put(&entries)
  }

  async fn fetch_view_definition(&self, model_id: &str, view_id: &Value) -> Result<Value> {
    // Symbolic ids ask for the default view of that kind; explicit
    // registrations are fetched by id.
    let params = match view_id {
      Value::String(kind) => json!([null, kind]),
      id => json!([id, null]),
    };
    self
      .rpc
      .call(&format!("model.{}.fields_view_get", model_id), params)
      .await
  }

  /// Store the spatial definition asset and dispatch to the record-loading
  /// strategy it implies.
  async fn load_record_set(
    &self,
    db: &Store<B>,
    model_id: &str,
    extent: &Extent,
    field_names: &[String],
  ) -> Result<()> {
    let items = db.scope("items");

    match self.fetch_spatial_definition(model_id).await? {
      Some(payload) => {
        db.put("spatialDef", &STANDARD.encode(payload))?;
        self
          .load_geofenced_records(&items, model_id, extent, field_names)
          .await
      }
      None => {
        // The model may have turned non-spatial since the last sync
        db.delete("spatialDef")?;
        self.load_plain_records(&items, model_id, field_names).await
      }
    }
  }

  /// The spatial definition asset marks a model as geometry-bearing.
  async fn fetch_spatial_definition(&self, model_id: &str) -> Result<Option<String>> {
    let value = self
      .rpc
      .call(
        &format!("model.{}.get_spatial_definition", model_id),
        json!([]),
      )
      .await?;

    match value {
      Value::Null => Ok(None),
      Value::String(payload) if payload.is_empty() => Ok(None),
      Value::String(payload) => Ok(Some(payload)),
      other => Err(eyre!(
        "Unexpected spatial definition payload for {}: {}",
        model_id,
        other
      )),
    }
  }
}

fn view_key(view_id: &Value) -> String {
  match view_id {
    Value::String(kind) => kind.clone(),
    id => id.to_string(),
  }
}
