use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use regime_risk::config::AppConfig;
use regime_risk::indicators::atr_series;
use regime_risk::ml::{run_walk_forward, MarketRegime, RegimeDetector, RegimePrediction, WalkForwardConfig};
use regime_risk::risk::RiskSizer;
use regime_risk::types::{trailing_window, Candle, CandleBuffer, Side};

const ATR_PERIOD: usize = 14;

#[derive(Parser)]
#[command(name = "regime-risk")]
#[command(author = "Trading Bot")]
#[command(version = "0.1.0")]
#[command(about = "HMM regime detection and regime-aware position sizing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "regime.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the regime model on a candle history and save it
    Train {
        /// JSON array of candles, oldest first
        #[arg(long)]
        candles: String,
        /// Output path for the model file
        #[arg(short, long, default_value = "models/regime_model.json")]
        output: String,
        /// Trailing days of history to train on
        #[arg(long, default_value = "1460")]
        window_days: i64,
    },
    /// Classify the latest bar with a saved model
    Predict {
        #[arg(long)]
        candles: String,
        #[arg(short, long, default_value = "models/regime_model.json")]
        model: String,
    },
    /// Refit on a trailing window and classify each following bar out of sample
    WalkForward {
        #[arg(long)]
        candles: String,
        #[arg(long, default_value = "1460")]
        train_days: i64,
        #[arg(long, default_value = "30")]
        step_days: i64,
        /// Write the per-window results as JSON
        #[arg(long)]
        output: Option<String>,
    },
    /// Size a proposed trade
    Size {
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
        /// long or short
        #[arg(long)]
        side: String,
        #[arg(long)]
        entry: Decimal,
        #[arg(long)]
        equity: Decimal,
        /// ATR at entry; derived from --candles when omitted
        #[arg(long)]
        atr: Option<Decimal>,
        /// Regime to size under (low-vol, high-vol, transition); detected when omitted
        #[arg(long)]
        regime: Option<String>,
        #[arg(long)]
        candles: Option<String>,
        #[arg(short, long, default_value = "models/regime_model.json")]
        model: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when set
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config))?;
    if let Err(errors) = config.validate() {
        return Err(anyhow!("invalid configuration: {}", errors.join(", ")));
    }

    match cli.command {
        Commands::Train { candles, output, window_days } => {
            train_model(config, &candles, &output, window_days).await?;
        }
        Commands::Predict { candles, model } => {
            predict(config, &candles, &model)?;
        }
        Commands::WalkForward { candles, train_days, step_days, output } => {
            walk_forward(config, &candles, train_days, step_days, output.as_deref()).await?;
        }
        Commands::Size { symbol, side, entry, equity, atr, regime, candles, model } => {
            size_trade(config, &symbol, &side, entry, equity, atr, regime.as_deref(), candles.as_deref(), &model)?;
        }
    }

    Ok(())
}

fn load_candles(path: &str) -> Result<Vec<Candle>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path))?;
    let raw: Vec<Candle> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("{} is not a JSON array of candles", path))?;

    let mut buffer = CandleBuffer::new(raw.len());
    for candle in raw {
        buffer.push(candle)?;
    }
    info!("Loaded {} candles from {}", buffer.len(), path);
    Ok(buffer.candles)
}

async fn train_model(config: AppConfig, candles_path: &str, output: &str, window_days: i64) -> Result<()> {
    if window_days <= 0 {
        return Err(anyhow!("--window-days must be positive"));
    }

    info!("═══════════════════════════════════════════════════");
    info!("HMM Regime Model Training");
    info!("═══════════════════════════════════════════════════");

    let candles = load_candles(candles_path)?;
    let window = trailing_window(&candles, Duration::days(window_days)).to_vec();
    info!("Training window: {} candles over the last {} days", window.len(), window_days);

    let mut detector = RegimeDetector::new(config.detector)?;
    let start_time = std::time::Instant::now();
    // EM is CPU bound; keep it off the async workers
    let (detector, report) = tokio::task::spawn_blocking(move || {
        let report = detector.fit(&window);
        (detector, report)
    })
    .await?;
    let report = report?;

    info!("✓ Training complete in {:.1}s", start_time.elapsed().as_secs_f64());
    info!("  Log-likelihood: {:.2}", report.log_likelihood);
    info!("  Iterations: {} (converged: {})", report.iterations, report.converged);
    for (regime, share) in &report.occupancy {
        info!("  {:<10} {:5.1}% of window", regime.as_str(), share * 100.0);
    }

    detector.save_model(output)?;
    info!("✓ Model saved to {}", output);
    Ok(())
}

fn predict(config: AppConfig, candles_path: &str, model_path: &str) -> Result<()> {
    let detector = RegimeDetector::from_model_file(config.detector, model_path)?;
    if detector.should_retrain() {
        warn!("Model at {} is older than the retrain interval", model_path);
    }

    let candles = load_candles(candles_path)?;
    let prediction = detector.predict_regime(&candles)?;
    print_prediction(&prediction);
    Ok(())
}

fn print_prediction(prediction: &RegimePrediction) {
    info!("Regime as of {}: {}", prediction.as_of, prediction.regime);
    info!("  Confidence: {:.3}", prediction.confidence);
    if prediction.is_overridden() {
        info!("  Raw regime {} overridden by low confidence", prediction.raw_regime);
    }
    let probs: Vec<String> = prediction
        .state_probabilities
        .iter()
        .map(|p| format!("{:.3}", p))
        .collect();
    info!("  State probabilities: [{}]", probs.join(", "));
    let p = &prediction.permissions;
    info!(
        "  Permissions: multiplier {} long {} short {} paused {}",
        p.position_multiplier, p.allow_long, p.allow_short, p.pause_trading
    );
}

async fn walk_forward(
    config: AppConfig,
    candles_path: &str,
    train_days: i64,
    step_days: i64,
    output: Option<&str>,
) -> Result<()> {
    let candles = load_candles(candles_path)?;
    let wf_config = WalkForwardConfig {
        train_window: Duration::days(train_days),
        step: Duration::days(step_days),
        prediction_context: WalkForwardConfig::default()
            .prediction_context
            .max(config.detector.lookback_window * 3),
    };

    info!("=== Walk-Forward Regime Classification ===");
    info!("Train window: {} days, step: {} days", train_days, step_days);

    let detector_config = config.detector;
    let result = tokio::task::spawn_blocking(move || run_walk_forward(&candles, &detector_config, &wf_config))
        .await??;
    result.print_summary();

    if let Some(path) = output {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(&result)?)?;
        info!("Results written to {}", path);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn size_trade(
    config: AppConfig,
    symbol: &str,
    side: &str,
    entry: Decimal,
    equity: Decimal,
    atr: Option<Decimal>,
    regime: Option<&str>,
    candles_path: Option<&str>,
    model_path: &str,
) -> Result<()> {
    let side: Side = side.parse().map_err(|e: String| anyhow!(e))?;
    let candles = candles_path.map(load_candles).transpose()?;

    let mut sizer = RiskSizer::new(config.risk, equity)?;
    let mut derived_atr = None;
    if let Some(candles) = &candles {
        let series = atr_series(candles, ATR_PERIOD);
        for value in &series {
            sizer.observe_atr(symbol, *value)?;
        }
        derived_atr = series.last().copied();
    }
    let atr = atr
        .or(derived_atr)
        .ok_or_else(|| anyhow!("--atr is required unless --candles gives enough history"))?;

    let prediction = match (regime, &candles) {
        (Some(name), _) => {
            let regime: MarketRegime = name.parse().map_err(|e: String| anyhow!(e))?;
            RegimePrediction::fixed(regime, chrono::Utc::now())
        }
        (None, Some(candles)) => {
            let detector = RegimeDetector::from_model_file(config.detector, model_path)?;
            detector.predict_regime(candles)?
        }
        (None, None) => return Err(anyhow!("either --regime or --candles is required")),
    };
    print_prediction(&prediction);

    let decision = sizer.get_optimal_position(symbol, side, entry, atr, &prediction)?;
    info!("{} {} @ {} (ATR {})", decision.symbol, decision.side, entry, atr);
    info!("  Position size:  {:.6}", decision.position_size);
    info!("  Position value: ${:.2}", decision.position_value);
    info!("  Stop loss:      {:.4}", decision.stop_loss);
    info!("  Dollar risk:    ${:.2}", decision.risk_amount);
    info!("  Bound by:       {:?}", decision.binding);
    let b = &decision.breakdown;
    info!(
        "  Kelly {:.4} (ATR pct {:.2}), effective risk {:.4}, breaker x{}, regime x{}",
        b.kelly_fraction, b.atr_percentile, b.effective_risk_fraction, b.circuit_breaker_multiplier, b.regime_multiplier
    );
    Ok(())
}
