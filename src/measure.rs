//! Measurement vocabulary shared by the dispatch engine and the supervisor:
//! probe kinds, resolved targets and the per-kind jobs built from configuration.

pub mod job;
pub mod kind;
pub mod target;
