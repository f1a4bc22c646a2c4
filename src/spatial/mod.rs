//! Spatial extents and the WFS-style feature gateway.
//!
//! The transport is the structured variant: a WFS `GetFeature` request with
//! GeoJSON output, decoded into [`Feature`]s by this client.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::SpatialConfig;

/// Coordinate reference systems the client understands.
///
/// Reprojection is implemented inline for the WGS84 / Web Mercator pair,
/// which covers the geographic extents users pan over and the system most
/// feature services index by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crs {
  /// Geographic WGS84, degrees.
  #[serde(rename = "EPSG:4326")]
  Epsg4326,
  /// Web Mercator, meters.
  #[serde(rename = "EPSG:3857")]
  Epsg3857,
}

impl Crs {
  pub fn parse(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "EPSG:4326" => Ok(Self::Epsg4326),
      "EPSG:3857" => Ok(Self::Epsg3857),
      other => Err(eyre!("Unsupported coordinate reference system: {}", other)),
    }
  }

  pub fn code(&self) -> &'static str {
    match self {
      Self::Epsg4326 => "EPSG:4326",
      Self::Epsg3857 => "EPSG:3857",
    }
  }
}

/// A rectangular spatial query window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
  pub min_x: f64,
  pub min_y: f64,
  pub max_x: f64,
  pub max_y: f64,
  pub crs: Crs,
}

const EARTH_RADIUS_M: f64 = 6_378_137.0;

fn wgs84_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
  let x = EARTH_RADIUS_M * lon.to_radians();
  let y = EARTH_RADIUS_M
    * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0)
      .tan()
      .ln();
  (x, y)
}

fn mercator_to_wgs84(x: f64, y: f64) -> (f64, f64) {
  let lon = (x / EARTH_RADIUS_M).to_degrees();
  let lat = (2.0 * (y / EARTH_RADIUS_M).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
  (lon, lat)
}

impl Extent {
  pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64, crs: Crs) -> Self {
    Self {
      min_x,
      min_y,
      max_x,
      max_y,
      crs,
    }
  }

  /// Reproject into `target`. Same-system reprojection is the identity.
  pub fn reproject(&self, target: Crs) -> Result<Extent> {
    if self.crs == target {
      return Ok(*self);
    }

    let ((min_x, min_y), (max_x, max_y)) = match (self.crs, target) {
      (Crs::Epsg4326, Crs::Epsg3857) => (
        wgs84_to_mercator(self.min_x, self.min_y),
        wgs84_to_mercator(self.max_x, self.max_y),
      ),
      (Crs::Epsg3857, Crs::Epsg4326) => (
        mercator_to_wgs84(self.min_x, self.min_y),
        mercator_to_wgs84(self.max_x, self.max_y),
      ),
      // Same-system pairs returned above
      _ => return Ok(*self),
    };

    Ok(Extent {
      min_x,
      min_y,
      max_x,
      max_y,
      crs: target,
    })
  }

  /// Corner coordinates as a `minx,miny,maxx,maxy` parameter string.
  pub fn bbox_param(&self) -> String {
    format!("{},{},{},{}", self.min_x, self.min_y, self.max_x, self.max_y)
  }
}

/// A spatially-referenced record returned by the feature service.
#[derive(Debug, Clone, Deserialize)]
pub struct Feature {
  pub id: String,
}

impl Feature {
  /// Extract the record id from a compound feature id: the trailing
  /// component after the last separator, e.g. `cg.ug.123` -> `123`.
  pub fn record_id(&self) -> Result<i64> {
    let tail = self.id.rsplit('.').next().unwrap_or(&self.id);
    tail
      .parse()
      .map_err(|e| eyre!("Unparseable feature id {:?}: {}", self.id, e))
  }
}

/// Gateway for spatial feature queries.
#[async_trait]
pub trait SpatialGateway: Send + Sync {
  /// Coordinate system the service expects bounding boxes in.
  fn service_crs(&self) -> Crs;

  /// Fetch the features of `type_name` intersecting `bbox`.
  ///
  /// `bbox` must already be in the service's coordinate system.
  async fn get_features(&self, type_name: &str, bbox: &Extent) -> Result<Vec<Feature>>;
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
  #[serde(default)]
  features: Vec<Feature>,
}

/// WFS client issuing `GetFeature` requests with GeoJSON output.
pub struct WfsClient {
  http: reqwest::Client,
  url: Url,
  crs: Crs,
}

impl WfsClient {
  pub fn new(config: &SpatialConfig) -> Result<Self> {
    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let url = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid spatial service URL {}: {}", config.url, e))?;

    Ok(Self {
      http,
      url,
      crs: Crs::parse(&config.crs)?,
    })
  }
}

#[async_trait]
impl SpatialGateway for WfsClient {
  fn service_crs(&self) -> Crs {
    self.crs
  }

  async fn get_features(&self, type_name: &str, bbox: &Extent) -> Result<Vec<Feature>> {
    let mut url = self.url.clone();
    url
      .query_pairs_mut()
      .append_pair("service", "WFS")
      .append_pair("version", "2.0.0")
      .append_pair("request", "GetFeature")
      .append_pair("typenames", type_name)
      .append_pair("outputFormat", "application/json")
      .append_pair("bbox", &format!("{},{}", bbox.bbox_param(), self.crs.code()));

    let response = self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Feature query transport failure for {}: {}", type_name, e))?
      .error_for_status()
      .map_err(|e| eyre!("Feature query HTTP error for {}: {}", type_name, e))?;

    let collection: FeatureCollection = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to decode feature collection for {}: {}", type_name, e))?;

    Ok(collection.features)
  }
}
