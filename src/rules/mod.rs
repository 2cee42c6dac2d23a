//! Rule Engine + Load Balancer and the Provider/Rule/Service data
//! model that the rest of the crate shares.

pub mod engine;
pub mod store;
pub mod types;

pub use engine::{ResolvedService, RuleEngine};
pub use store::RuleStateStore;
pub use types::{
    ApiStyle, AuthType, OAuthDetail, Provider, Rule, Service, ServiceStats, Tactic, well_known,
    wildcard_match,
};
