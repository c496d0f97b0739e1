//! Cross-module integration suites: end-to-end scenarios driven through
//! the orchestrator facade, and invariants exercised across components.

mod invariants;
