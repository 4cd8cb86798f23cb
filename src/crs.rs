//! Coordinate transforms for the Natura 2000 reference layer.
//!
//! European spatial datasets ship in ETRS89-LAEA (EPSG:3035), a Lambert
//! azimuthal equal-area projection on the GRS80 ellipsoid centred on
//! 52N 10E. Occurrence coordinates are WGS84, so the site polygons are
//! reprojected to EPSG:4326 once, during reference preparation.

use crate::error::PipelineError;

// GRS80 ellipsoid.
const A: f64 = 6_378_137.0;
const INV_F: f64 = 298.257_222_101;

// EPSG:3035 projection parameters.
const LAT_0_DEG: f64 = 52.0;
const LON_0_DEG: f64 = 10.0;
const FALSE_EASTING: f64 = 4_321_000.0;
const FALSE_NORTHING: f64 = 3_210_000.0;

/// CRS identifiers accepted in the raw site layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteCrs {
    Wgs84,
    EtrsLaea,
}

impl SiteCrs {
    /// Recognize a CRS from the identifiers GeoJSON exports carry, either
    /// a bare EPSG code or an OGC URN.
    pub fn parse(name: &str) -> Result<Self, PipelineError> {
        match name.rsplit(':').next().unwrap_or(name).trim() {
            "4326" | "CRS84" => Ok(SiteCrs::Wgs84),
            "3035" => Ok(SiteCrs::EtrsLaea),
            _ => Err(PipelineError::UnsupportedCrs(name.to_string())),
        }
    }
}

struct LaeaConstants {
    e: f64,
    qp: f64,
    rq: f64,
    beta1: f64,
    d: f64,
    lam0: f64,
}

fn constants() -> LaeaConstants {
    let f = 1.0 / INV_F;
    let e2 = f * (2.0 - f);
    let e = e2.sqrt();
    let phi0 = LAT_0_DEG.to_radians();
    let lam0 = LON_0_DEG.to_radians();

    let qp = authalic_q(std::f64::consts::FRAC_PI_2, e);
    let q0 = authalic_q(phi0, e);
    let rq = A * (qp / 2.0).sqrt();
    let beta1 = (q0 / qp).asin();
    let m1 = phi0.cos() / (1.0 - e2 * phi0.sin() * phi0.sin()).sqrt();
    let d = A * m1 / (rq * beta1.cos());

    LaeaConstants {
        e,
        qp,
        rq,
        beta1,
        d,
        lam0,
    }
}

/// Snyder's q function (authalic latitude support).
fn authalic_q(phi: f64, e: f64) -> f64 {
    let sin_phi = phi.sin();
    let es = e * sin_phi;
    (1.0 - e * e) * (sin_phi / (1.0 - es * es) - (1.0 / (2.0 * e)) * ((1.0 - es) / (1.0 + es)).ln())
}

/// EPSG:3035 easting/northing to WGS84 (longitude, latitude) in degrees.
///
/// The ETRS89 to WGS84 datum shift is below coordinate precision at this
/// scale and is treated as identity.
pub fn laea_to_lonlat(easting: f64, northing: f64) -> (f64, f64) {
    let c = constants();
    let x = easting - FALSE_EASTING;
    let y = northing - FALSE_NORTHING;

    let rho = (x / c.d).hypot(c.d * y);
    if rho == 0.0 {
        return (LON_0_DEG, LAT_0_DEG);
    }
    let ce = (rho / (2.0 * c.rq)).asin() * 2.0;
    let q = c.qp
        * (ce.cos() * c.beta1.sin() + c.d * y * ce.sin() * c.beta1.cos() / rho);

    // Iterate Snyder 3-16 for the geodetic latitude.
    let mut phi = (q / 2.0).asin();
    for _ in 0..8 {
        let sin_phi = phi.sin();
        let es = c.e * sin_phi;
        let one_m = 1.0 - es * es;
        let delta = one_m * one_m / (2.0 * phi.cos())
            * (q / (1.0 - c.e * c.e) - sin_phi / one_m
                + (1.0 / (2.0 * c.e)) * ((1.0 - es) / (1.0 + es)).ln());
        phi += delta;
        if delta.abs() < 1e-12 {
            break;
        }
    }

    let lam = c.lam0
        + (x * ce.sin()).atan2(c.d * rho * c.beta1.cos() * ce.cos()
            - c.d * c.d * y * c.beta1.sin() * ce.sin());

    (lam.to_degrees(), phi.to_degrees())
}

/// WGS84 (longitude, latitude) in degrees to EPSG:3035 easting/northing.
/// Exists to build fixtures and to cross-check the inverse transform.
pub fn lonlat_to_laea(lon: f64, lat: f64) -> (f64, f64) {
    let c = constants();
    let phi = lat.to_radians();
    let lam = lon.to_radians();

    let q = authalic_q(phi, c.e);
    let beta = (q / c.qp).asin();
    let dlam = lam - c.lam0;

    let b = c.rq
        * (2.0 / (1.0 + c.beta1.sin() * beta.sin()
            + c.beta1.cos() * beta.cos() * dlam.cos()))
        .sqrt();
    let x = b * c.d * beta.cos() * dlam.sin();
    let y = (b / c.d)
        * (c.beta1.cos() * beta.sin() - c.beta1.sin() * beta.cos() * dlam.cos());

    (x + FALSE_EASTING, y + FALSE_NORTHING)
}
