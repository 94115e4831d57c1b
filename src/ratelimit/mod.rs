//! Rate limiting logic and state management.

mod clock;
mod counter;
mod decision;
pub mod headers;
mod identity;
mod limiter;
mod policy;
mod sweeper;
mod tiers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::CounterEntry;
pub use decision::{Decision, Evaluation, Rejection, ReleaseToken};
pub use headers::HeaderMode;
pub use identity::{ClientKey, ForwardedSource, IdentityExtractor, IdentitySource, UNKNOWN_KEY};
pub use limiter::{Limiter, LimiterStats};
pub use policy::{OperatingMode, TierPolicy, MODE_ENV_VAR};
pub use sweeper::spawn_sweeper;
pub use tiers::{Tier, TierOutcome, TierRegistry};
