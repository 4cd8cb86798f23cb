//! GBIF occurrence pipeline for Natura 2000 reporting.
//!
//! Seven file-based stages: bulk acquisition from the GBIF download API,
//! quality filtering, spatial validation, Natura 2000 reference
//! preparation, point-in-polygon spatial join, and two metrics passes.
//! Every stage writes its artifacts and a plain-text report under a data
//! root; a dataset identifier keeps independent runs apart.

pub mod advanced;
pub mod config;
pub mod crs;
pub mod domain;
pub mod dwca;
pub mod error;
pub mod filter;
pub mod gbif;
pub mod join;
pub mod metrics;
pub mod occurrence;
pub mod pipeline;
pub mod sites;
pub mod store;
pub mod validate;
