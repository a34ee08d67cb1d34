//! Provider routing: health tracking, candidate planning and fallback

mod fallback;
mod health;
mod plan;
mod router;

pub use fallback::{classify_failure, classify_text};
pub use health::{HealthThresholds, ProviderHealth, ProviderHealthTracker};
pub use plan::{plan_route, RoundRobinCursor, RoutePolicy};
pub use router::{
    AttemptRecorder, DbAttemptRecorder, DbPolicySource, InMemoryAttemptRecorder, MessageRouter,
    PolicySource, RouteOutcome, RouteResult, StaticPolicySource,
};
