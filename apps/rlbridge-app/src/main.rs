//! rlbridge CLI.
//!
//! - `serve`: host a demo point-mass environment for a remote trainer, or
//!   run it against a local ONNX model (feature `onnx`)
//! - `info`: print the effective configuration and protocol details

mod demo;

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use rlbridge_controller::{LocalInference, MultiEnvBridge, SingleEnvBridge};
use rlbridge_core::prelude::*;
use rlbridge_net::{MultiPool, SinglePool};
use rlbridge_wire::Handshake;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::demo::PointMass;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Lock-step socket bridge between RL trainers and simulated environments.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// TOML file with bridge settings.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo environment.
    Serve {
        /// Override the listening port.
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of environments; more than one selects the multiplexed pool.
        #[arg(short = 'n', long)]
        envs: Option<usize>,

        /// Host ticks per second.
        #[arg(long, default_value_t = 60)]
        tick_rate: u32,

        /// Ticks each action takes to play out.
        #[arg(long, default_value_t = 2)]
        action_ticks: u32,

        /// Actions per episode.
        #[arg(long, default_value_t = 200)]
        max_steps: u32,

        /// Seconds to wait for peers before giving up (0 waits forever).
        #[arg(long, default_value_t = 0)]
        connect_timeout: u64,

        /// Drive the environment with a local ONNX model instead of a peer.
        #[cfg(feature = "onnx")]
        #[arg(long)]
        model: Option<PathBuf>,
    },

    /// Print the effective configuration.
    Info,
}

struct ServeOptions {
    tick_rate: u32,
    action_ticks: u32,
    max_steps: u32,
    connect_timeout: Option<Duration>,
    model: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig, BridgeError> {
    let config = match path {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            BridgeConfig::from_file(path)?
        }
        None => BridgeConfig::default(),
    };
    Ok(config)
}

fn environment(config: &BridgeConfig, options: &ServeOptions) -> PointMass {
    PointMass::new(
        config.observation_size,
        config.precision,
        options.action_ticks,
        options.max_steps,
    )
}

#[cfg(feature = "onnx")]
fn local_inference(
    config: &BridgeConfig,
    model: Option<&PathBuf>,
) -> Result<Option<LocalInference>, BridgeError> {
    let Some(path) = model else {
        return Ok(None);
    };
    let model = rlbridge_controller::OnnxModel::load(path)?;
    Ok(Some(LocalInference::from_config(Box::new(model), config)))
}

#[cfg(not(feature = "onnx"))]
#[allow(clippy::unnecessary_wraps)]
fn local_inference(
    _config: &BridgeConfig,
    _model: Option<&PathBuf>,
) -> Result<Option<LocalInference>, BridgeError> {
    Ok(None)
}

/// Block until every peer is in. `false` on timeout.
fn await_peers(connected: impl Fn() -> bool, timeout: Option<Duration>) -> bool {
    let started = Instant::now();
    let mut last_notice = started;
    while !connected() {
        if timeout.is_some_and(|t| started.elapsed() >= t) {
            return false;
        }
        if last_notice.elapsed() >= Duration::from_secs(5) {
            info!("waiting for admin and environment peers");
            last_notice = Instant::now();
        }
        thread::sleep(Duration::from_millis(50));
    }
    true
}

/// Tick at `rate` Hz until the bridge stops.
fn tick_loop(mut tick: impl FnMut() -> (TickReport, BridgeMode), rate: u32) {
    let period = Duration::from_secs_f64(1.0 / f64::from(rate.max(1)));
    let mut next = Instant::now();
    loop {
        let (report, mode) = tick();
        if !report.stalled.is_empty() {
            warn!(envs = ?report.stalled, "environments stalled");
        }
        if report.completed {
            info!("peer signalled training complete");
        }
        if mode == BridgeMode::Stopped {
            return;
        }
        next += period;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            next = now;
        }
    }
}

fn run_serve(config: BridgeConfig, options: &ServeOptions) -> Result<(), BridgeError> {
    config.validate()?;
    let inference = local_inference(&config, options.model.as_ref())?;

    if config.num_envs > 1 {
        let mut pool = MultiPool::new(&config);
        if inference.is_none() {
            let addr = pool.start()?;
            info!(%addr, envs = config.num_envs, "multi-environment bridge listening");
            if !await_peers(|| pool.is_connected(), options.connect_timeout) {
                return Err(TransportError::NotConnected("admin and environment peers").into());
            }
        }
        let envs: Vec<PointMass> = (0..config.num_envs)
            .map(|_| environment(&config, options))
            .collect();
        let mut bridge = MultiEnvBridge::new(&config, Box::new(pool), Box::new(envs));
        match inference {
            Some(inference) => {
                bridge.set_inference(inference);
                bridge.start_inference()?;
            }
            None => bridge.start_training(),
        }
        tick_loop(|| (bridge.tick(), bridge.mode()), options.tick_rate);
    } else {
        let mut pool = SinglePool::new(&config);
        if inference.is_none() {
            let addr = pool.start()?;
            info!(%addr, "single-environment bridge listening");
            if !await_peers(|| pool.is_connected(), options.connect_timeout) {
                return Err(TransportError::NotConnected("admin and environment peers").into());
            }
        }
        let env = environment(&config, options);
        let mut bridge = SingleEnvBridge::new(&config, Box::new(pool), Box::new(env));
        match inference {
            Some(inference) => {
                bridge.set_inference(inference);
                bridge.start_inference()?;
            }
            None => bridge.start_training(),
        }
        tick_loop(|| (bridge.tick(), bridge.mode()), options.tick_rate);
    }

    info!("bridge stopped");
    Ok(())
}

fn run_info(config: &BridgeConfig) {
    let handshake = if config.num_envs > 1 {
        Handshake::multi(config.observation_size, config.action_size, config.num_envs)
    } else {
        Handshake::single(config.observation_size, config.action_size)
    };
    println!("rlbridge v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("endpoint:   {}", config.endpoint());
    println!("envs:       {}", config.num_envs);
    println!("terminator: {}", config.terminator);
    println!("precision:  {}", config.precision);
    println!("handshake:  {handshake}");
    println!();
    println!("{config:#?}");
    if let Err(err) = config.validate() {
        println!();
        println!("invalid configuration: {err}");
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Some(Commands::Serve {
            port,
            envs,
            tick_rate,
            action_ticks,
            max_steps,
            connect_timeout,
            #[cfg(feature = "onnx")]
            model,
        }) => {
            let mut config = config;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(envs) = envs {
                config.num_envs = envs;
            }
            #[cfg(not(feature = "onnx"))]
            let model = None;
            let options = ServeOptions {
                tick_rate,
                action_ticks,
                max_steps,
                connect_timeout: (connect_timeout > 0).then(|| Duration::from_secs(connect_timeout)),
                model,
            };
            run_serve(config, &options)
        }
        Some(Commands::Info) | None => {
            run_info(&config);
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
