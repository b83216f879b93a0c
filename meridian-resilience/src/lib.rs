//! Resilience primitives for Meridian
//!
//! - **Circuit Breaker**: fail fast against a dependency that keeps failing,
//!   and probe it once it has had time to recover.
//! - **Backoff**: delay schedules for local retry loops.
//!
//! ```rust
//! use meridian_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("billing-api")
//!         .error_threshold(5)
//!         .reset_timeout(Duration::from_secs(30)),
//! );
//!
//! match breaker.call(|| async { Ok::<_, std::io::Error>("data") }).await {
//!     Ok(data) => println!("{data}"),
//!     Err(CircuitBreakerError::Open) => println!("try again later"),
//!     Err(e) => println!("failed: {e}"),
//! }
//! # });
//! ```

mod backoff;
mod circuit_breaker;

pub use backoff::*;
pub use circuit_breaker::*;
