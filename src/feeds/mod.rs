//! Whale-flow and on-chain feeds consumed by the engine.

pub mod leaderboard;
pub mod onchain;
pub mod scanner;

pub use leaderboard::{HttpLeaderboardFeed, LeaderboardFeed, TradeDeduper};
pub use onchain::{
    ChainPosition, HttpPositionFetcher, OnChainEvent, OnChainMonitor, PositionFetcher,
};
pub use scanner::{HttpMarketScanner, MarketScanner, NullScanner};
