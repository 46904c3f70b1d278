//! One module per vendor: its fetch plan (API or browser) and its normalizer.

pub mod garmin;
pub mod oura;
pub mod polar;
pub mod rollaone;
pub mod ultrahuman;
pub mod withings;

pub use garmin::{GarminNormalizer, GarminPlan};
pub use oura::{OuraNormalizer, OuraPlan};
pub use polar::{PolarNormalizer, PolarPlan};
pub use rollaone::{RollaOneNormalizer, RollaOnePlan};
pub use ultrahuman::{UltrahumanNormalizer, UltrahumanPlan};
pub use withings::{WithingsNormalizer, WithingsPlan};

use crate::api::PlannedRequest;

/// Same request with `name` set to `value`, for cursor-style pagination.
pub(crate) fn with_cursor(previous: &PlannedRequest, name: &str, value: &str) -> PlannedRequest {
    let mut next = previous.clone();
    next.request.query.retain(|(k, _)| k != name);
    next.request.query.push((name.to_string(), value.to_string()));
    next
}

pub(crate) fn trim_base(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}
