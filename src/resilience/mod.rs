//! Failure isolation fabric (§2 "Failure isolation fabric"): the error classifier, the
//! per-source circuit breaker (C2), and the connection-recovery / failover coordinator (C3).
//!
//! Grounded on `route_quality::mitigation`'s `CircuitBreaker`/`MitigationController` pair,
//! generalized from per-endpoint network mitigation to per-source price-feed failover.

pub mod circuit_breaker;
pub mod classifier;
pub mod failover;
