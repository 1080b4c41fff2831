//! Property-based tests for the store, graph and sweep invariants.
//!
//! These drive random operation sequences against a store and check that:
//!
//! - strength and edge weight never leave [0, 1]
//! - an evicted node stays evicted and no edge ever references it
//! - touching never moves access counters or timestamps backwards
//! - a sweep always leaves the store within its capacity ceiling
