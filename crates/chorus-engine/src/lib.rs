//! Mention routing for a team of chat agents.
//!
//! [`Router::turn`] sends the user's text to the coordinator, dispatches the
//! `@mentions` in its reply to the named agents concurrently, recursively,
//! and folds their answers back for synthesis.

pub mod aggregator;
pub mod error;
pub mod mentions;
pub mod registry;
pub mod router;
pub mod spawn;

pub use aggregator::{CohortTracker, ResponseAggregator};
pub use error::EngineError;
pub use mentions::{Mention, MentionExtractor};
pub use registry::ConnectionRegistry;
pub use router::{fold_back, Router, RoutingContext, TurnOutcome};
pub use spawn::AgentFactory;
