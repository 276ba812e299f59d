//! Reliability envelope components
//!
//! Retries with backoff, per-node circuit breakers, saga compensation,
//! the idempotency store and the dead-letter queue. The executor composes
//! these around every node dispatch; see the envelope in
//! [`crate::executor`].

mod circuit_breaker;
mod compensation;
mod dlq;
mod idempotency;
mod retry;

pub use circuit_breaker::{
    BreakerRejection, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitState,
};
pub use compensation::{CompensationManager, CompensationOutcome};
pub use dlq::{DeadLetterQueue, DlqEntry, DlqFilter, InMemoryDeadLetterQueue, Pagination};
pub use idempotency::{
    idempotency_key, IdempotencyOutcome, IdempotencyRecord, IdempotencyStore,
    InMemoryIdempotencyStore,
};
pub use retry::{Backoff, RetryPolicy};
