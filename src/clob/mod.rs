//! CLOB boundary: REST client, WS-fed book cache, market metadata.

pub mod client;
pub mod market_data;
pub mod metadata;

pub use client::{
    ClobBalanceSource, ClobClient, ClobCredentials, ClobError, HttpClobClient, LimitOrderArgs,
    MarketOrderArgs, PaperClobClient, PaperFillConfig, PostOrderResponse, SignedOrder,
};
pub use market_data::{MarketDataFacade, OrderbookState, WsBookCache};
pub use metadata::{HttpMetadataClient, MarketMetadata, MarketTokenPair, StaticMetadata, TokenInfo};
