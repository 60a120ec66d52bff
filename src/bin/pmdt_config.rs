use clap::Parser;

use pmdt_tools::libs::cli::{BackendArgs, FeatureArgs};
use pmdt_tools::libs::error::Result;

/// Struct representing the CLI arguments
#[derive(Parser, Debug)]
#[command(
    about = "Configure monitoring features on a PMDT unit.",
    long_about = None,
    after_help = "Example usage - latency histogram and timeout on the read side of unit 2:\n\
                  pmdt-config -m units.map -R /sys/bus/pci/devices/0000:65:00.0/resource0 \
                  -u 2 --histogram read --bars 0,100,200,300,400 --timeout-ns 1000"
)]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    #[arg(short = 'u', long = "unit", required = true)]
    unit: u8,

    /// Tear the unit down instead of configuring it.
    #[arg(long = "disable")]
    disable: bool,

    #[command(flatten)]
    features: FeatureArgs,
}

fn run(cli: &Cli) -> Result<()> {
    let mut session = cli.backend.open()?;
    if cli.disable {
        session.pmdt.disable_unit(cli.unit)?;
        println!("unit {} disabled", cli.unit);
        return Ok(());
    }

    let request = cli.features.request()?;
    let desc = session.pmdt.map().get(cli.unit)?.clone();
    let alloc = session.pmdt.configure_unit(cli.unit, request)?;
    println!("{} on {} ready", desc, desc.bus);
    print!("{}", alloc);
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("pmdt-config: {}", e);
        std::process::exit(1);
    }
}
