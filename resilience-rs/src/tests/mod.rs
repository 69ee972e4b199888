//! Scenario tests for the resilience core
//!
//! Unit tests live next to each module; these exercise several modules
//! together through the public surface.
