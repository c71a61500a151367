//! churnbot: whale-copy market-making engine for binary prediction markets
//!
//! Watches whale-wallet flow on a long-only CLOB, takes short-lived long
//! positions in outcome tokens, manages each one against an EV budget,
//! hedges adverse moves with the sibling token, and exits on take-profit,
//! hard stop, time stop, or bias flip.

pub mod balance;
pub mod clob;
pub mod config;
pub mod engine;
pub mod feeds;
pub mod latency;
pub mod models;
pub mod notify;
pub mod pricing;
