//! Core domain model for the assessment records service.
//!
//! Everything here is pure data: comparable-sale requests and rows, the
//! list-query grammar shared by the `/…/api` endpoints, and the
//! `{error, success}` action tuple returned by mutating actions.

pub mod action;
pub mod comps;
pub mod query;

pub use action::ActionResult;
pub use comps::{
    CompResult, CompWeights, ComparableRow, ComparableSearchRequest, MapPoint, PartialWeights,
    SubjectFeatures, DEFAULT_LIVING_AREA_BAND, DEFAULT_MAX_DISTANCE_MILES,
};
pub use query::{
    ColumnFilter, FilterOp, IsValue, ListQuery, ListResponse, PageLimits, PageMeta,
    QueryParseError, SortKey,
};

pub const CRATE_NAME: &str = "assessor-core";
