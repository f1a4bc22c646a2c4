//! Recursive menu tree synchronization: the engine's entry point.

use color_eyre::{eyre::eyre, Result};
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, warn};

use crate::rpc::{call_decoded, search_params, RpcGateway};
use crate::rpc::types::{Action, MenuNode};
use crate::spatial::{Extent, SpatialGateway};
use crate::store::KvBackend;

use super::SyncEngine;

/// Menu attributes requested for every node.
const MENU_FIELDS: &[&str] = &[
  "parent",
  "name",
  "complete_name",
  "childs",
  "icon",
  "action",
  "sequence",
];

impl<R, W, B> SyncEngine<R, W, B>
where
  R: RpcGateway,
  W: SpatialGateway,
  B: KvBackend,
{
  /// Synchronize the menu subtree rooted at `node_id` for the given extent.
  ///
  /// The node's own value, icon and bound action are fetched concurrently
  /// with its children's subtrees, and the subtree completes only when all
  /// of them do. The first failure fails the whole subtree and drops the
  /// unfinished siblings; already-stored data stays valid and a retry
  /// repairs the rest. The remote tree is assumed acyclic.
  pub fn sync_menu_tree<'a>(
    &'a self,
    node_id: i64,
    extent: &'a Extent,
  ) -> BoxFuture<'a, Result<()>> {
    async move {
      let ((), children) = tokio::try_join!(
        self.sync_menu_node(node_id, extent),
        self.fetch_menu_children(node_id),
      )?;

      try_join_all(
        children
          .into_iter()
          .map(|child| self.sync_menu_tree(child, extent)),
      )
      .await?;

      Ok(())
    }
    .boxed()
  }

  async fn sync_menu_node(&self, node_id: i64, extent: &Extent) -> Result<()> {
    tokio::try_join!(
      self.sync_menu_value(node_id),
      self.sync_menu_action(node_id, extent),
    )?;
    Ok(())
  }

  /// Fetch and store one node's value, then make sure its icon is cached.
  async fn sync_menu_value(&self, node_id: i64) -> Result<()> {
    let nodes: Vec<MenuNode> = call_decoded(
      &self.rpc,
      "model.ir.ui.menu.read",
      json!([[node_id], MENU_FIELDS]),
    )
    .await?;
    let node = nodes
      .into_iter()
      .next()
      .ok_or_else(|| eyre!("Menu node {} not found", node_id))?;

    self
      .store
      .put(&format!("menuItemValues/{}", node_id), &node)?;

    if let Some(icon) = &node.icon {
      self.ensure_icon(icon).await?;
    }

    Ok(())
  }

  /// Resolve the node's bound action; a window action is stored and its
  /// target model synced, anything else is a no-op.
  async fn sync_menu_action(&self, node_id: i64, extent: &Extent) -> Result<()> {
    let actions: Vec<Action> = call_decoded(
      &self.rpc,
      "model.ir.action.keyword.get_keyword",
      json!(["tree_open", ["ir.ui.menu", node_id]]),
    )
    .await?;

    let Some(action) = actions.into_iter().next().filter(Action::is_window) else {
      debug!(node_id, "no window action bound");
      return Ok(());
    };

    self
      .store
      .put(&format!("menuItemActions/{}", node_id), &action)?;

    match &action.res_model {
      Some(model_id) => self.sync_model(model_id, extent).await,
      None => {
        warn!(node_id, action = action.id, "window action without target model");
        Ok(())
      }
    }
  }

  async fn fetch_menu_children(&self, node_id: i64) -> Result<Vec<i64>> {
    call_decoded(
      &self.rpc,
      "model.ir.ui.menu.search",
      search_params(json!([["parent", "=", node_id]]), self.results_limit),
    )
    .await
  }
}
