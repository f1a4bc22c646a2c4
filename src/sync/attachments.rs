//! Attachment count aggregation.

use color_eyre::Result;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use crate::rpc::{call_decoded, search_read_params, RpcGateway};
use crate::spatial::SpatialGateway;
use crate::store::{KvBackend, Store};

use super::{SyncEngine, ATTACHMENTS_LIMIT};

#[derive(Debug, Deserialize)]
struct AttachmentRef {
  #[serde(default)]
  resource: Option<String>,
}

impl<R, W, B> SyncEngine<R, W, B>
where
  R: RpcGateway,
  W: SpatialGateway,
  B: KvBackend,
{
  /// Recompute the record -> attachment-count index for one model.
  ///
  /// One range query fetches the attachments of all the model's records at
  /// once. The half-open resource range `[id+"," , id+",a")` relies on
  /// decimal record ids sorting below `'a'`: it captures exactly the
  /// resources prefixed with `id + ","` and never a model whose id merely
  /// starts with `id` (e.g. `"120,1"` is outside model `"12"`'s range).
  pub(super) async fn count_attachments(&self, db: &Store<B>, model_id: &str) -> Result<()> {
    let lower = format!("{},", model_id);
    let upper = format!("{},a", model_id);

    let attachments: Vec<AttachmentRef> = call_decoded(
      &self.rpc,
      "model.ir.attachment.search_read",
      search_read_params(
        json!([["resource", ">=", lower], ["resource", "<", upper]]),
        ATTACHMENTS_LIMIT,
        json!(["resource"]),
      ),
    )
    .await?;

    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for attachment in &attachments {
      let record_id = attachment
        .resource
        .as_deref()
        .and_then(|resource| resource.split(',').nth(1));
      if let Some(record_id) = record_id {
        *counts.entry(record_id.to_string()).or_insert(0) += 1;
      }
    }

    // Full replacement: counts for records whose attachments vanished must
    // disappear too
    let index = db.scope("itemAttachmentCounts");
    index.clear()?;
    let entries: Vec<(String, u64)> = counts.into_iter().collect();
    index.batch_put(&entries)
  }
}
