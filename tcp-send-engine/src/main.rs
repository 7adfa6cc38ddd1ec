//! Entry point for `tcp-send-engine`.
//!
//! Runs one bulk transfer through the simulated network and prints what the
//! engine did.  All protocol work lives in the library; `main.rs` owns only
//! process setup (logging, argument parsing).

use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tcp_send_engine::simulator::{Simulation, SimulatorConfig};
use tcp_send_engine::EngineConfig;

/// Push a byte stream through the send engine over a lossy simulated link.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Bytes to transfer.
    #[arg(short, long, default_value_t = 1 << 20)]
    size: usize,

    /// Maximum segment size.
    #[arg(long, default_value_t = 1460)]
    mss: u16,

    /// Segment loss probability (0.0 - 1.0).
    #[arg(short, long, default_value_t = 0.0)]
    loss: f64,

    /// ACK loss probability (0.0 - 1.0).
    #[arg(long, default_value_t = 0.0)]
    ack_loss: f64,

    /// Reorder probability (0.0 - 1.0).
    #[arg(long, default_value_t = 0.0)]
    reorder: f64,

    /// One-way delay in milliseconds.
    #[arg(short, long, default_value_t = 25)]
    delay: u64,

    /// Bottleneck bandwidth in bytes per second.
    #[arg(long)]
    bandwidth: Option<u64>,

    /// Peer receive window in bytes.
    #[arg(long, default_value_t = 65_535)]
    window: u32,

    /// RNG seed.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Disable Nagle's algorithm.
    #[arg(long)]
    no_nagle: bool,

    /// Disable selective acknowledgements.
    #[arg(long)]
    no_sack: bool,

    /// Print the congestion-window trace.
    #[arg(long)]
    trace: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let engine_cfg = EngineConfig {
        mss: cli.mss,
        nagle: !cli.no_nagle,
        sack: !cli.no_sack,
        ..EngineConfig::default()
    };
    let sim_cfg = SimulatorConfig {
        loss_rate: cli.loss,
        ack_loss_rate: cli.ack_loss,
        reorder_rate: cli.reorder,
        reorder_delay: Duration::from_millis(cli.delay),
        one_way_delay: Duration::from_millis(cli.delay),
        bw_limit: cli.bandwidth,
        receive_window: cli.window,
        seed: cli.seed,
        ..SimulatorConfig::default()
    };
    for (name, p) in [("loss", cli.loss), ("ack-loss", cli.ack_loss), ("reorder", cli.reorder)] {
        if !(0.0..=1.0).contains(&p) {
            bail!("--{name} must be between 0 and 1, got {p}");
        }
    }

    log::info!("Transferring {} bytes (mss={}, loss={}, seed={})", cli.size, cli.mss, cli.loss, cli.seed);
    let data: Vec<u8> = (0..cli.size).map(|i| (i % 251) as u8).collect();

    // The simulation is synchronous; keep it off the async workers.
    let report = tokio::task::spawn_blocking(move || {
        Simulation::new(engine_cfg, sim_cfg).run_transfer(&data)
    })
    .await
    .context("simulation task panicked")?
    .context("connection reset")?;

    println!("{report}");
    if cli.trace {
        for sample in &report.cwnd_trace {
            println!(
                "{:>10.3}s cwnd={:<8} ssthresh={:<10} {}",
                sample.elapsed.as_secs_f64(),
                sample.cwnd,
                sample.ssthresh,
                sample.phase
            );
        }
    }
    if !report.completed {
        bail!("transfer did not complete within the time limit");
    }
    Ok(())
}
