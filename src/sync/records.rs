//! Record loading strategies: plain paginated fetch and geofenced fetch.
//!
//! Both strategies are additive: they write only the records returned by
//! this run, leaving records cached from other extents untouched. The
//! cache grows as the user pans; it is never a refreshed snapshot.

use color_eyre::Result;
use serde_json::json;
use std::collections::BTreeSet;
use tracing::warn;

use crate::rpc::types::Record;
use crate::rpc::{call_decoded, search_params, search_read_params, RpcGateway};
use crate::spatial::{Extent, SpatialGateway};
use crate::store::{KvBackend, Store};

use super::SyncEngine;

impl<R, W, B> SyncEngine<R, W, B>
where
  R: RpcGateway,
  W: SpatialGateway,
  B: KvBackend,
{
  /// Fetch the records of a non-spatial model in one bounded query.
  pub(super) async fn load_plain_records(
    &self,
    items: &Store<B>,
    model_id: &str,
    field_names: &[String],
  ) -> Result<()> {
    let records: Vec<Record> = call_decoded(
      &self.rpc,
      &format!("model.{}.search_read", model_id),
      search_read_params(json!([]), self.results_limit, json!(field_names)),
    )
    .await?;

    if records.len() >= self.results_limit {
      warn!(
        model_id,
        limit = self.results_limit,
        "record fetch hit the results ceiling; excess records are not cached"
      );
    }

    store_records(items, records)
  }

  /// Fetch the records of a spatial model: everything intersecting the
  /// extent, plus every record with no geometry at all.
  pub(super) async fn load_geofenced_records(
    &self,
    items: &Store<B>,
    model_id: &str,
    extent: &Extent,
    field_names: &[String],
  ) -> Result<()> {
    let bbox = extent.reproject(self.spatial.service_crs())?;

    // Feature attribute values are untyped; only the ids are taken from
    // the feature service, the data itself comes from the RPC read.
    let (features, no_geom_ids) = tokio::try_join!(
      self.spatial.get_features(model_id, &bbox),
      self.search_ids_without_geometry(model_id),
    )?;

    if no_geom_ids.len() >= self.results_limit {
      warn!(
        model_id,
        limit = self.results_limit,
        "null-geometry id fetch hit the results ceiling; excess records are not cached"
      );
    }

    let mut ids: BTreeSet<i64> = features
      .iter()
      .map(|feature| feature.record_id())
      .collect::<Result<_>>()?;
    ids.extend(no_geom_ids);

    if ids.is_empty() {
      return Ok(());
    }

    let ids: Vec<i64> = ids.into_iter().collect();
    let records: Vec<Record> = call_decoded(
      &self.rpc,
      &format!("model.{}.read", model_id),
      json!([ids, field_names]),
    )
    .await?;

    store_records(items, records)
  }

  async fn search_ids_without_geometry(&self, model_id: &str) -> Result<Vec<i64>> {
    call_decoded(
      &self.rpc,
      &format!("model.{}.search", model_id),
      search_params(json!([["geom", "=", null]]), self.results_limit),
    )
    .await
  }
}

/// Store records keyed by id, replacing existing entries with the same id.
fn store_records<B: KvBackend>(items: &Store<B>, records: Vec<Record>) -> Result<()> {
  let entries: Vec<(String, Record)> = records
    .into_iter()
    .map(|record| (record.id.to_string(), record))
    .collect();
  items.batch_put(&entries)
}
