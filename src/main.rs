use simulation::simulate;
use tracing_subscriber::EnvFilter;
pub mod simulation;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            TAMPERLOG EXCHANGE SIMULATIONS                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut all_complete = true;
    for (devices, blocks, exchanges) in [(3, 5, 20), (6, 10, 60), (10, 20, 150)] {
        let stats = simulate(devices, blocks, exchanges).await;
        stats.print();
        all_complete &= stats.complete;
    }

    if all_complete {
        println!("\n✓ Every device holds the complete history!");
    } else {
        eprintln!("\n✗ Some devices did not receive the full history");
        std::process::exit(1);
    }
}
