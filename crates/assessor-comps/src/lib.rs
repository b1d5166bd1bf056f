//! Comparable-sale pipeline: request building, result normalization, map
//! projection and a cached fetch client over a pluggable scorer.

pub mod builder;
pub mod client;
pub mod normalize;
pub mod points;
pub mod scorer;

pub use builder::{coerce_bool, coerce_number, to_rpc_args, CompDefaults, CompFilters, CompForm};
pub use client::{CompFetchClient, CompQueryState, CompSession};
pub use normalize::{derive_price_per_sqft, normalize_result, normalize_row, FIELD_ALIASES};
pub use points::map_points;
pub use scorer::{CompScorer, RpcCompScorer};

use assessor_storage::StoreError;
use thiserror::Error;

pub const CRATE_NAME: &str = "assessor-comps";

#[derive(Debug, Error)]
pub enum CompError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unexpected comps payload: {0}")]
    Payload(String),
}
