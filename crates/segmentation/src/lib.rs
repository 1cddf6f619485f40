//! Declarative filter-rule evaluation: compiles a campaign's rules into
//! predicates and narrows a candidate set with them.

pub mod builder;
pub mod engine;
pub mod predicates;

pub use builder::RuleBuilder;
pub use engine::{apply_rules, RuleEvaluator};
pub use predicates::{compile_rule, CompiledRule, Operand};
