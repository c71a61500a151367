//! churnbot binary
//!
//! Wires the engine together: every collaborator is constructed once here
//! and handed down as an explicit dependency, torn down on ctrl-c.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use churnbot::balance::BalanceCache;
use churnbot::clob::{
    ClobBalanceSource, ClobClient, ClobCredentials, HttpClobClient, HttpMetadataClient,
    MarketDataFacade, MarketMetadata, PaperClobClient, PaperFillConfig, WsBookCache,
};
use churnbot::config::{Config, LiquidationMode};
use churnbot::engine::{
    AdaptiveEvConfig, AdaptiveEvEngine, AdaptiveHedgeConfig, AdaptiveHedgePolicy, BiasAccumulator,
    BiasConfig, BookResolver, ChurnEngine, CooldownManager, EvTracker, ExecutionEngine,
    PositionConfig, PositionManager, ReserveManager, RiskGuard, RiskGuardConfig,
};
use churnbot::feeds::{
    HttpLeaderboardFeed, HttpMarketScanner, LeaderboardFeed, MarketScanner, PositionFetcher,
};
use churnbot::latency::LatencyMonitor;
use churnbot::notify::{spawn_transition_listener, LogNotifier, Notifier, NotifyEvent};

/// Whale-copy market-making engine for binary prediction markets.
#[derive(Debug, Parser)]
#[command(name = "churnbot")]
struct Args {
    /// Force paper execution even if live trading is configured.
    #[arg(long)]
    paper: bool,

    /// Override the liquidation mode (off | losing | all).
    #[arg(long)]
    liquidation_mode: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if args.paper {
        config.live_trading_enabled = false;
    }
    if let Some(mode) = &args.liquidation_mode {
        config.liquidation_mode = LiquidationMode::parse(mode);
    }

    let paper = !config.live_trading_enabled;
    info!(
        paper = %paper,
        liquidation_mode = ?config.liquidation_mode,
        watched_wallets = %config.watched_wallets.len(),
        "churnbot starting"
    );

    let creds = ClobCredentials::from_env();
    if creds.is_none() && !paper {
        anyhow::bail!("live trading requires POLYMARKET_CLOB_* credentials");
    }

    let latency = Arc::new(LatencyMonitor::new(config.base_slippage_pct));
    let http_clob = HttpClobClient::new(creds.clone());
    let clob: Arc<dyn ClobClient> = if paper {
        Arc::new(PaperClobClient::new(http_clob, PaperFillConfig::default()))
    } else {
        Arc::new(http_clob)
    };

    let metadata: Arc<dyn MarketMetadata> = Arc::new(HttpMetadataClient::new());
    let ws_cache = Arc::new(WsBookCache::new(2_000));
    let market_data: Arc<dyn MarketDataFacade> = ws_cache.clone();

    let resolver = Arc::new(BookResolver::new(
        clob.clone(),
        market_data.clone(),
        latency.clone(),
        config.max_ask_cents,
    ));

    let balances = Arc::new(BalanceCache::new(
        Arc::new(ClobBalanceSource::new(HttpClobClient::new(creds))),
        Duration::from_secs(config.balance_refresh_seconds),
    ));

    let positions = Arc::new(PositionManager::new(PositionConfig {
        tp_cents: config.tp_cents,
        hedge_trigger_cents: config.hedge_trigger_cents,
        max_adverse_cents: config.max_adverse_cents,
        max_hold_seconds: config.max_hold_seconds,
        max_hedge_ratio: config.max_hedge_ratio,
        max_open_positions_total: config.max_open_positions_total,
        max_open_positions_per_market: config.max_open_positions_per_market,
    }));

    let ev = Arc::new(EvTracker::new(
        config.rolling_window_trades,
        config.churn_cost_cents_estimate,
        config.min_ev_cents,
        config.min_profit_factor,
        config.pause_seconds,
    ));
    let adaptive_ev = config.adaptive_ev_enabled.then(|| {
        Arc::new(AdaptiveEvEngine::new(AdaptiveEvConfig {
            fallback_churn_cents: config.churn_cost_cents_estimate,
            pause_seconds: config.pause_seconds,
            ..AdaptiveEvConfig::default()
        }))
    });

    let hedge_policy = Arc::new(AdaptiveHedgePolicy::new(AdaptiveHedgeConfig {
        base_trigger_cents: config.hedge_trigger_cents,
        base_max_adverse_cents: config.max_adverse_cents,
        max_hedge_ratio: config.max_hedge_ratio,
        ..AdaptiveHedgeConfig::default()
    }));

    let reserve = Arc::new(ReserveManager::new(
        config.reserve_fraction,
        config.max_reserve_fraction,
        config.reserve_adaptation_rate,
        config.min_reserve_usd,
    ));

    let risk = Arc::new(RiskGuard::new(RiskGuardConfig {
        min_wallet_balance_usd: config.min_wallet_balance_usd,
        max_total_deployment_fraction: config.max_deployed_fraction_total,
        max_hedged_positions: config.max_hedged_positions,
        max_total_hedge_usd: config.max_total_hedge_usd,
        max_global_hedge_exposure: config.max_global_hedge_exposure,
        hedge_cooldown_seconds: config.hedge_cooldown_seconds,
    }));

    let cooldowns = Arc::new(CooldownManager::new());

    let execution = Arc::new(ExecutionEngine::new(
        config.clone(),
        clob.clone(),
        metadata.clone(),
        positions.clone(),
        ev.clone(),
        adaptive_ev,
        hedge_policy.clone(),
        reserve.clone(),
        risk.clone(),
        cooldowns.clone(),
        latency.clone(),
        balances.clone(),
    ));

    let bias = Arc::new(BiasAccumulator::new(BiasConfig {
        window_seconds: config.bias_window_seconds,
        min_net_usd: config.bias_min_net_usd,
        min_trades: config.bias_min_trades,
        stale_seconds: config.bias_stale_seconds,
        copy_any_whale_buy: config.copy_any_whale_buy,
        conservative: config.conservative_bias,
    }));

    let leaderboard: Arc<dyn LeaderboardFeed> =
        Arc::new(HttpLeaderboardFeed::new(config.watched_wallets.clone()));
    let scanner: Arc<dyn MarketScanner> = Arc::new(HttpMarketScanner::new());
    let position_fetcher: Option<Arc<dyn PositionFetcher>> =
        std::env::var("POLYMARKET_WALLET_ADDRESS").ok().map(|wallet| {
            Arc::new(churnbot::feeds::HttpPositionFetcher::new(wallet))
                as Arc<dyn PositionFetcher>
        });
    if position_fetcher.is_none() {
        warn!("POLYMARKET_WALLET_ADDRESS not set, external position sync disabled");
    }

    let notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    let listener = spawn_transition_listener(positions.subscribe(), notifiers.clone());

    for notifier in &notifiers {
        notifier.notify(&NotifyEvent::BotStart { paper }).await;
    }

    let engine = Arc::new(ChurnEngine::new(
        config,
        execution,
        positions,
        resolver,
        bias,
        leaderboard,
        None,
        position_fetcher,
        scanner,
        metadata,
        market_data,
        cooldowns,
        reserve,
        risk,
        ev,
        hedge_policy,
        balances,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_handle = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    let _ = engine_handle.await;

    for notifier in &notifiers {
        notifier.notify(&NotifyEvent::BotStop).await;
    }
    drop(listener);

    info!("churnbot stopped");
    Ok(())
}
