//! Core of a binary-outcome prediction market platform.
//!
//! Markets are priced by a fixed-point logarithmic market scoring rule
//! ([`math::lmsr`]) and move through a voted lifecycle
//! ([`state::markets`]): proposal votes open them, traders buy and sell
//! outcome shares, and a resolution plus optional dispute vote settles
//! them. The authoritative records live on an external ledger behind the
//! [`ledger::Ledger`] trait; the node keeps a local mirror and a set of
//! vote tallies, and a [`node::Reconciler`] periodically closes the gap
//! between the two.

pub mod config;
pub mod ledger;
pub mod math;
pub mod node;
pub mod state;
pub mod types;

pub use config::Config;
pub use node::{Reconciler, ReconcilerHandle};
