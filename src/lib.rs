//! # mesh-policy
//!
//! Policy decision engine for service-mesh authorization checks.
//!
//! Rules name who may talk to whom, over which protocol, resource and
//! operation, and may carry a boolean conditions tree over request
//! attributes and the JSON body. Checking a message evaluates every rule
//! and returns the highest decision (`DEFAULT < ALLOW < ALERT < BLOCK`).
//!
//! ```no_run
//! use mesh_policy::{load_messages_yaml, PredefinedStringsAndLists, RuleSet};
//!
//! # fn main() -> mesh_policy::Result<()> {
//! let predefined = PredefinedStringsAndLists::from_yaml_file("predefined.yaml")?;
//! let rules = RuleSet::from_yaml_file("rules.yaml", &predefined)?;
//! for message in load_messages_yaml(&std::fs::read_to_string("messages.yaml")?)? {
//!     let outcome = rules.check(&message);
//!     println!("{} (rule {:?})", outcome.decision, outcome.rule_index);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Conditions trees can also be compiled to MongoDB queries, see
//! [`PreparedRule::to_mongo_query`].

pub mod conditions;
pub mod config;
pub mod error;
pub mod loader;
pub mod message;
pub mod policy;
pub mod predefined;

pub use conditions::{
    parse_conditions_tree, Condition, EvalContext, ExtraData, Method, MongoQuery, Node,
    Quantifier, Scope,
};
pub use config::EngineConfig;
pub use error::{PolicyError, Result};
pub use loader::{load_messages_file, load_messages_yaml, RuleSet};
pub use message::{Endpoint, Message, Request, Side};
pub use policy::{check, check_with_config, CheckOutcome, Decision, PreparedRule, RawRule};
pub use predefined::PredefinedStringsAndLists;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
