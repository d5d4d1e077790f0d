//! Bandit policies for conversational action selection.
//!
//! [`ContextualBandit`] learns per-context action values with UCB1 and
//! decaying random exploration. [`EpsilonGreedy`] wraps any
//! [`Policy`](dialoglern_core::Policy) with ε-greedy exploration.

#![warn(clippy::unwrap_used, clippy::expect_used)]

pub mod contextual;
pub mod epsilon;
mod explore;

pub use contextual::{ArmStats, BanditConfig, Choice, ContextualBandit};
pub use epsilon::{EpsilonGreedy, EpsilonGreedyConfig};
pub use explore::decayed_rate;
