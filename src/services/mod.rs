//! Business logic built on top of the repository traits.
//!
//! - [`adapters`]: source adapter framework (C4)
//! - [`collector`]: periodic/bounded-concurrency collection scheduler (C5)
//! - [`registry`]: challenge definition registry loader (C6)
//! - [`rounds`]: round materializer (C7)
//! - [`evaluator`]: score evaluator (C8)
//! - [`elo`]: bootstrapped ELO engine (C9)
//! - [`supervisor`]: cron/interval supervisor with crash recovery (C10)

pub mod adapters;
pub mod collector;
pub mod elo;
pub mod evaluator;
pub mod registry;
pub mod rounds;
pub mod supervisor;
