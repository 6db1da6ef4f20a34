pub mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStats, CircuitOpen, CircuitState,
};
pub use retry::RetryPolicy;
