//! Integration tests for the bearer token coordinator.

mod cooldown;
mod single_flight;
