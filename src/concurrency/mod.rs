//! Concurrency Module
//!
//! Off-thread execution for EmberKV. The [`Executor`] is an elastic pool of
//! OS threads fed from a bounded FIFO queue; anything in the server (the
//! reactor included) can hand it work. It knows nothing about connections.
//!
//! ## Sizing
//!
//! ```text
//!   live threads
//!        ▲
//!   high ┤        ┌──────┐            burst: one thread spawned per
//!        │      ┌─┘      └─┐          submission that finds every
//!        │    ┌─┘          └─┐        live thread busy
//!   low  ┤────┘              └─────   idle: threads above `low` retire
//!        └──────────────────────────> after `idle_timeout`
//! ```

pub mod executor;

pub use executor::{
    ExecuteError, Executor, ExecutorConfig, ExecutorError, ExecutorState, ExecutorStats, Task,
};
