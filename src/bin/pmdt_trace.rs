use std::fs;

use clap::Parser;

use pmdt_tools::libs::cli::BackendArgs;
use pmdt_tools::libs::config::{DirectionReq, TrackerPattern, TrapFeature, UnitRequest};
use pmdt_tools::libs::ela::format_trace;
use pmdt_tools::libs::error::Result;
use pmdt_tools::libs::sim::Transaction;

/// Struct representing the CLI arguments
#[derive(Parser, Debug)]
#[command(
    about = "Stop a PMDT trace engine and dump its trace memory.",
    long_about = None,
    after_help = "Example usage - dump trace engine 1 of unit 0 and keep a raw copy:\n\
                  pmdt-trace -m units.map -R /dev/mem -u 0 -e 1 --raw trace.bin\n\n\
                  Simulated run with 80 captured reads (wraps a 64-entry memory):\n\
                  pmdt-trace --sim -u 0 --demo-txns 80"
)]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    #[arg(short = 'u', long = "unit", required = true)]
    unit: u8,

    #[arg(short = 'e', long = "engine", default_value_t = 0)]
    engine: u8,

    /// Also write the raw entry words to this file.
    #[arg(long = "raw")]
    raw: Option<String>,

    /// With --sim, trap reads to 0x1000..0x10ff and inject this many.
    #[arg(long = "demo-txns", default_value_t = 16)]
    demo_txns: u32,
}

fn run(cli: &Cli) -> Result<()> {
    let mut session = cli.backend.open()?;

    if let Some(sim) = session.sim.clone() {
        session.pmdt.configure_unit(
            cli.unit,
            UnitRequest {
                trap: Some(TrapFeature {
                    direction: DirectionReq::Read,
                    pattern: TrackerPattern {
                        address: 0x1000,
                        address_mask: !0xFF,
                        id: None,
                    },
                    trace: true,
                }),
                ..Default::default()
            },
        )?;
        for i in 0..cli.demo_txns {
            let txn = Transaction::read(0x1000 + (i as u64 % 64) * 4, 20 + i as u64).with_id(i as u16);
            sim.inject(cli.unit, 0, &txn);
        }
    }

    let hw = session.pmdt.hw(cli.unit)?;
    let engine = hw.ela(cli.engine)?;
    engine.write_lock(false);
    engine.stop()?;
    let (wptr, wrapped) = engine.ram_write_ptr()?;
    let entries = engine.dump()?;
    println!(
        "unit {} engine {}: {} of {} entries, write pointer {}{}",
        cli.unit,
        cli.engine,
        entries.len(),
        engine.depth(),
        wptr,
        if wrapped { " (wrapped)" } else { "" }
    );

    for line in format_trace(&entries, engine.payload_bits()) {
        println!("{}", line);
    }

    if let Some(path) = &cli.raw {
        let words: Vec<u32> = entries
            .iter()
            .flat_map(|e| e.to_words(engine.payload_bits()))
            .collect();
        fs::write(path, bytemuck::cast_slice::<u32, u8>(&words))?;
        println!("wrote {} words to {}", words.len(), path);
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("pmdt-trace: {}", e);
        std::process::exit(1);
    }
}
