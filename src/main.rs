mod config;
mod rpc;
mod spatial;
mod store;
mod sync;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use spatial::{Crs, Extent};

#[derive(Parser, Debug)]
#[command(name = "geosync")]
#[command(about = "Offline sync client for a Tryton-style business/GIS backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/geosync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Menu node to sync from (overrides the configured root)
  #[arg(short, long)]
  menu_id: Option<i64>,

  /// Extent to sync, as minx,miny,maxx,maxy
  #[arg(long)]
  bbox: Option<String>,

  /// Coordinate reference system of --bbox
  #[arg(long, default_value = "EPSG:4326")]
  crs: String,

  /// Re-fetch every model even if it is already cached
  #[arg(long)]
  refetch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;

  let policy = if args.refetch {
    sync::IdempotencyPolicy::Refetch
  } else {
    config.sync.policy
  };

  let extent = match &args.bbox {
    Some(bbox) => parse_bbox(bbox, &args.crs)?,
    None => config.sync.default_extent()?,
  };

  let menu_id = args.menu_id.unwrap_or(config.sync.root_menu_id);

  let backend = store::SqliteBackend::open(config.cache_db_path()?)?;
  let store = store::Store::new(backend);

  let password = config::Config::get_password()?;
  let rpc = rpc::JsonRpcClient::new(&config.server, &password)?;
  let wfs = spatial::WfsClient::new(&config.spatial)?;

  let engine = sync::SyncEngine::new(
    rpc,
    wfs,
    store.clone(),
    policy,
    config.sync.results_limit,
  );
  engine.sync_menu_tree(menu_id, &extent).await?;

  let menus = store.scope("menuItemValues").keys()?.len();
  let icons = store.scope("icons").keys()?.len();
  let models = store
    .scope("models")
    .keys()?
    .iter()
    .filter(|key| key.ends_with("/modelDef"))
    .count();
  println!(
    "Synced menu {}: {} menu entries, {} models, {} icons cached.",
    menu_id, menus, models, icons
  );

  Ok(())
}

/// Parse a `minx,miny,maxx,maxy` extent argument.
fn parse_bbox(s: &str, crs: &str) -> Result<Extent> {
  let coords = s
    .split(',')
    .map(|part| part.trim().parse::<f64>())
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| eyre!("Invalid --bbox {:?}: {}", s, e))?;

  match coords.as_slice() {
    [min_x, min_y, max_x, max_y] => Ok(Extent::new(
      *min_x,
      *min_y,
      *max_x,
      *max_y,
      Crs::parse(crs)?,
    )),
    _ => Err(eyre!("--bbox expects minx,miny,maxx,maxy")),
  }
}
