//! # Resilience Module
//!
//! Bounded retry with backoff for command handler invocation.
//!
//! ## Usage
//!
//! ```rust
//! use command_bus::resilience::{RetryController, RetryPolicy};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let controller = RetryController::new(RetryPolicy::new(2, Duration::from_millis(1)));
//!
//! let result = controller
//!     .run(
//!         |attempt| async move { if attempt < 2 { Err("flaky") } else { Ok("done") } },
//!         |event| eprintln!("attempt {} failed, waiting {}ms", event.attempt, event.delay_ms),
//!     )
//!     .await;
//!
//! assert_eq!(result.unwrap(), ("done", 2));
//! # }
//! ```

pub mod retry;

pub use retry::{RetryController, RetryError, RetryEvent, RetryPolicy};
