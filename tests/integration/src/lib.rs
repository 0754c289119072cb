//! Integration tests for the Lifeline resilience core
//!
//! This test suite drives a full [`lifeline_runtime::ResilienceSystem`]
//! over the loopback transport with a manual clock:
//! - Channel quality and lifecycle under clean traffic
//! - Rapid-disconnect quarantine and probation
//! - Emergency mode and recovery
//! - Layer join and stabilization
//! - Memory pressure shedding
//! - Queue flush, delivery failures and admission bounds

pub mod test_utils;

#[cfg(test)]
mod scenario_tests;

#[cfg(test)]
mod recovery_flow_tests;
