use async_stream::stream;
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tlog_chain::{Hash, MemoryCredentialStore, Repository, SigningIdentity, Transaction};
use tlog_exchange::{run_exchange, ExchangeConfig, ExchangeError, MemoryChannel};
use tracing::{debug, warn};

/// Statistics collected during a simulation run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub num_devices: usize,
    pub blocks_issued: usize,
    pub total_exchanges: usize,
    pub failed_exchanges: usize,
    pub blocks_per_device: usize,
    pub total_time: Duration,
    pub avg_exchange_time: Duration,
    /// Every device holds every issued block and a closed history.
    pub complete: bool,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Simulation Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Devices:                   {:>30} ║", self.num_devices);
        println!("║  Record Blocks Issued:      {:>30} ║", self.blocks_issued);
        println!("║  Exchanges:                 {:>30} ║", self.total_exchanges);
        println!("║  Failed Exchanges:          {:>30} ║", self.failed_exchanges);
        println!("║  Blocks per Device:         {:>30} ║", self.blocks_per_device);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Exchange Time:     {:>28}µs ║", self.avg_exchange_time.as_micros());
        println!("║  Histories Complete:        {:>30} ║", self.complete);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// One simulated device: a user and their local repository.
struct Device {
    identity: SigningIdentity,
    repository: Arc<Repository>,
}

fn provision(num_devices: usize) -> Vec<Device> {
    let admin = SigningIdentity::generate("ca", "Origin");
    let users: Vec<SigningIdentity> = (0..num_devices)
        .map(|i| SigningIdentity::generate(format!("user-{}", i), format!("ward-{}", i)))
        .collect();
    let genesis = admin.genesis(users.iter().map(SigningIdentity::certificate));

    users
        .into_iter()
        .map(|identity| {
            let credentials = MemoryCredentialStore::new("ca", admin.public_key())
                .with_user(identity.clone(), "simulation");
            let repository = Repository::in_memory(Arc::new(credentials));
            if let Err(e) = repository.bootstrap(genesis.clone()) {
                warn!(user = identity.user_id(), error = %e, "bootstrap failed");
            }
            Device {
                identity,
                repository: Arc::new(repository),
            }
        })
        .collect()
}

/// Generator that yields device pairs for exchanges
fn pair_generator(num_devices: usize, num_exchanges: usize) -> impl Stream<Item = (usize, usize)> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for _ in 0..num_exchanges {
            let a = rng.gen_range(0..num_devices);
            let b = rng.gen_range(0..num_devices);
            if a != b {
                yield (a, b);
            }
        }
    }
}

/// Gossip through device 0: first collect everything, then hand it back out.
fn gossip_pairs(num_devices: usize) -> impl Stream<Item = (usize, usize)> {
    stream! {
        for _ in 0..2 {
            for other in 1..num_devices {
                yield (0, other);
            }
        }
    }
}

/// Run both halves of one exchange. Returns whether both sides agree on
/// the new root.
async fn exchange_pair(a: &Device, b: &Device, config: &ExchangeConfig) -> Result<bool, ExchangeError> {
    let (left, right) = MemoryChannel::pair();
    let (ra, rb) = tokio::join!(
        run_exchange(Arc::new(left), a.repository.clone(), a.identity.clone(), config),
        run_exchange(Arc::new(right), b.repository.clone(), b.identity.clone(), config),
    );
    let (ra, rb) = (ra?, rb?);
    debug!(
        a = a.identity.user_id(),
        b = b.identity.user_id(),
        outcome = ?ra.outcome,
        root = %ra.new_root.short(),
        "pair exchanged"
    );
    Ok(ra.new_root == rb.new_root)
}

async fn drive<S>(
    devices: &[Device],
    pairs: S,
    config: &ExchangeConfig,
    exchange_times: &mut Vec<Duration>,
    failed: &mut usize,
) where
    S: Stream<Item = (usize, usize)>,
{
    let mut pairs = Box::pin(pairs);
    while let Some((a, b)) = pairs.next().await {
        let start = Instant::now();
        match exchange_pair(&devices[a], &devices[b], config).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(a, b, "exchange finished on diverging roots");
                *failed += 1;
            }
            Err(e) => {
                warn!(a, b, error = %e, "exchange failed");
                *failed += 1;
            }
        }
        exchange_times.push(start.elapsed());

        if exchange_times.len() % 50 == 0 {
            println!("  Exchanges completed: {}", exchange_times.len());
        }
    }
}

fn histories_complete(devices: &[Device], issued: &HashSet<Hash>) -> bool {
    devices.iter().all(|device| {
        let repo = &device.repository;
        let Some(root) = repo.root_hash() else {
            return false;
        };
        let closed = repo
            .ancestors(&root)
            .map(|ancestors| ancestors.iter().all(|hash| repo.contains(hash)))
            .unwrap_or(false);
        closed && issued.iter().all(|hash| repo.contains(hash))
    })
}

/// Issue random records on every device, exchange at random, gossip, and
/// check that every device ended up with the whole history.
pub async fn simulate(num_devices: usize, max_blocks_per_device: usize, num_exchanges: usize) -> SimulationStats {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Exchange Simulation                                 ║");
    println!("║  Devices: {} | Blocks/Device: ≤{} | Exchanges: {} ║",
             num_devices, max_blocks_per_device, num_exchanges);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let config = ExchangeConfig::builder()
        .round_trip_timeout(Duration::from_secs(5))
        .teardown_grace(Duration::from_millis(500))
        .build();
    let devices = provision(num_devices.max(2));

    println!("\n[Phase 1/3] Issuing record blocks...");
    let mut issued = HashSet::new();
    let mut rng = StdRng::from_entropy();
    for device in &devices {
        let count = rng.gen_range(1..=max_blocks_per_device.max(1));
        for i in 0..count {
            let record = format!("chart-{}", rng.gen_range(0..1000));
            let tx = if rng.gen_bool(0.5) {
                Transaction::record_request(record, format!("visit {}", i))
            } else {
                Transaction::record_access(record, "read")
            };
            match device.repository.add_user_block(vec![tx], &device.identity) {
                Ok(block) => {
                    issued.insert(block.hash());
                }
                Err(e) => warn!(user = device.identity.user_id(), error = %e, "issue failed"),
            }
        }
    }
    println!("[Phase 1/3] ✓ {} blocks issued", issued.len());

    let mut exchange_times = vec![];
    let mut failed = 0;

    println!("[Phase 2/3] Random pairwise exchanges...");
    drive(&devices, pair_generator(devices.len(), num_exchanges), &config, &mut exchange_times, &mut failed).await;
    println!("[Phase 2/3] ✓ Completed");

    println!("[Phase 3/3] Gossip round...");
    drive(&devices, gossip_pairs(devices.len()), &config, &mut exchange_times, &mut failed).await;
    println!("[Phase 3/3] ✓ Completed");

    let avg_exchange_time = if !exchange_times.is_empty() {
        exchange_times.iter().sum::<Duration>() / exchange_times.len() as u32
    } else {
        Duration::ZERO
    };

    SimulationStats {
        num_devices: devices.len(),
        blocks_issued: issued.len(),
        total_exchanges: exchange_times.len(),
        failed_exchanges: failed,
        blocks_per_device: devices.iter().map(|d| d.repository.len()).max().unwrap_or(0),
        total_time: start.elapsed(),
        avg_exchange_time,
        complete: failed == 0 && histories_complete(&devices, &issued),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn small_network_ends_complete() {
        let stats = simulate(3, 4, 10).await;
        assert_eq!(stats.failed_exchanges, 0);
        assert!(stats.complete);
        assert!(stats.blocks_issued >= 3);
    }
}
