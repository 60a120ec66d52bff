use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use pmdt_tools::libs::cli::{BackendArgs, FeatureArgs};
use pmdt_tools::libs::error::Result;
use pmdt_tools::libs::regs::Direction;
use pmdt_tools::libs::sim::Transaction;

/// Struct representing the CLI arguments
#[derive(Parser, Debug)]
#[command(
    about = "Service PMDT interrupts and print error reports until ctrl+C.",
    long_about = None,
    after_help = "Example usage - watch read timeouts on units 0 and 3 of a simulated complex:\n\
                  pmdt-monitor --sim -u 0 -u 3 --timeout-ns 500 --rearm"
)]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    /// Units to configure with the feature flags before watching.
    #[arg(short = 'u', long = "unit")]
    units: Vec<u8>,

    #[arg(short = 'i', long = "interval-ms", default_value_t = 100)]
    interval_ms: u64,

    /// Re-arm a unit after printing its report.
    #[arg(long = "rearm")]
    rearm: bool,

    #[command(flatten)]
    features: FeatureArgs,
}

fn run(cli: &Cli, running: Arc<AtomicBool>) -> Result<()> {
    let mut session = cli.backend.open()?;
    if !cli.units.is_empty() {
        let request = cli.features.request()?;
        for &unit in &cli.units {
            session.pmdt.configure_unit(unit, request.clone())?;
        }
    }

    let mut tick = 0u64;
    while running.load(Ordering::SeqCst) {
        // Synthetic traffic: every unit sees a slowly growing latency.
        if let Some(sim) = &session.sim {
            for record in session.pmdt.units() {
                for (&direction, &monitor) in &record.allocation.monitors {
                    let address = 0x1000 + (tick % 16) * 4;
                    let latency = 50 + (tick % 20) * 50;
                    let txn = match direction {
                        Direction::Read => Transaction::read(address, latency),
                        Direction::Write => Transaction::write(address, latency),
                    };
                    sim.inject(record.desc.id, monitor, &txn);
                }
            }
            sim.tick(cli.interval_ms * 1_000_000);
        }

        while let Some(report) = session.pmdt.service_interrupt()? {
            print!("{}", report);
            if cli.rearm {
                session.pmdt.rearm_unit(report.unit)?;
            }
        }
        tick += 1;
        thread::sleep(Duration::from_millis(cli.interval_ms));
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    // Use an atomic flag to handle ctrl+c termination.
    let running = Arc::new(AtomicBool::new(true));
    let handler = ctrlc::set_handler({
        let running = running.clone();
        move || {
            println!("\nKeyboard interrupt received (ctrl+C). Exiting.");
            running.store(false, Ordering::SeqCst);
        }
    });
    if let Err(e) = handler {
        eprintln!("pmdt-monitor: cannot install ctrl+C handler: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(&cli, running) {
        eprintln!("pmdt-monitor: {}", e);
        std::process::exit(1);
    }
}
