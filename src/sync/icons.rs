//! Idempotent icon asset caching.

use color_eyre::Result;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::rpc::{call_decoded, search_read_params, RpcGateway};
use crate::spatial::SpatialGateway;
use crate::store::KvBackend;

use super::SyncEngine;

#[derive(Debug, Deserialize)]
struct IconRow {
  #[serde(default)]
  icon: String,
}

impl<R, W, B> SyncEngine<R, W, B>
where
  R: RpcGateway,
  W: SpatialGateway,
  B: KvBackend,
{
  /// Fetch and store the named icon unless it is already cached.
  ///
  /// Icons are shared across menus and models and written at most once;
  /// an existing key returns immediately without network access.
  /// Concurrent calls for the same name may issue a redundant fetch, but
  /// an already-present key is never an error.
  pub(super) async fn ensure_icon(&self, name: &str) -> Result<()> {
    let icons = self.store.scope("icons");
    if icons.contains(name)? {
      return Ok(());
    }

    let rows: Vec<IconRow> = call_decoded(
      &self.rpc,
      "model.ir.ui.icon.search_read",
      search_read_params(json!([["name", "=", name]]), 1, json!(["icon"])),
    )
    .await?;

    let Some(row) = rows.into_iter().next() else {
      warn!(name, "icon not found on the server");
      return Ok(());
    };

    icons.put(name, &row.icon)
  }
}
