// =============================================================================
// Exit Management Module
// =============================================================================
//
// Per-position exit state (context), the pure rule predicates (policy), the
// trailing-stop ratchet (trailing), and the rule-ordered evaluation pass
// (evaluator) that turns one market snapshot into an ordered effect list.

pub mod context;
pub mod evaluator;
pub mod policy;
pub mod trailing;
