use ccstore::{
    BackwardOcc, ConcurrencyControl, ForwardOcc, LockFreeMvto, Mvto, Operation, Silo, Store,
    StoreOptions, TwoPhaseLocking, WorkerStats,
};
use clap::{arg, Parser, ValueEnum};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Serialize;
use std::{
    io::Write,
    sync::Barrier,
    time::{Duration, Instant},
};
use tracing::Level;

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Protocol::Mvto)]
    protocol: Protocol,

    #[arg(long, default_value_t = 8)]
    threads: usize,

    #[arg(long, default_value_t = 10)]
    keys: usize,

    /// Number of operations per transaction
    #[arg(long, default_value_t = 4)]
    txn_len: usize,

    /// Total number of transactions across all the threads
    #[arg(long, default_value_t = 100_000)]
    txns: usize,

    /// Probability that an operation is a read
    #[arg(long, default_value_t = 0.5)]
    read_ratio: f64,

    #[arg(long, default_value_t = 10)]
    gc_threshold: u64,

    /// Upper bound of the randomized sleep before retrying an aborted
    /// transaction
    #[arg(long, default_value_t = 1)]
    backoff_micros: u64,

    /// Seed of the workload generator. Random if omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// Print the state of every record after the run
    #[arg(long)]
    dump: bool,

    #[arg(long, default_value_t = Level::WARN)]
    log_level: Level,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Protocol {
    Mvto,
    LockFreeMvto,
    BackwardOcc,
    ForwardOcc,
    Silo,
    TwoPhaseLocking,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    anyhow::ensure!(cli.threads > 0, "--threads must be positive");
    anyhow::ensure!(cli.keys > 0, "--keys must be positive");
    anyhow::ensure!(
        (0.0..=1.0).contains(&cli.read_ratio),
        "--read-ratio must be between 0 and 1"
    );

    match cli.protocol {
        Protocol::Mvto => run_benchmark::<Mvto>(&cli),
        Protocol::LockFreeMvto => run_benchmark::<LockFreeMvto>(&cli),
        Protocol::BackwardOcc => run_benchmark::<BackwardOcc>(&cli),
        Protocol::ForwardOcc => run_benchmark::<ForwardOcc>(&cli),
        Protocol::Silo => run_benchmark::<Silo>(&cli),
        Protocol::TwoPhaseLocking => run_benchmark::<TwoPhaseLocking>(&cli),
    }
}

fn run_benchmark<C: ConcurrencyControl>(cli: &Cli) -> anyhow::Result<()> {
    let seed = cli
        .seed
        .unwrap_or_else(|| SmallRng::from_entropy().gen());
    tracing::info!(seed, "generating workload");
    let workloads: Vec<_> = (0..cli.threads)
        .map(|thread_index| {
            let from = cli.txns * thread_index / cli.threads;
            let to = cli.txns * (thread_index + 1) / cli.threads;
            generate_workload(cli, seed.wrapping_add(thread_index as u64), to - from)
        })
        .collect();

    let store = StoreOptions::new()
        .keys(cli.keys)
        .gc_threshold(cli.gc_threshold)
        .abort_backoff(Duration::from_micros(cli.backoff_micros))
        .open::<C>();
    let barrier = Barrier::new(cli.threads + 1);

    #[cfg(feature = "affinity")]
    let core_ids = core_affinity::get_core_ids().unwrap();
    #[cfg(feature = "affinity")]
    assert!(core_ids.len() >= cli.threads);

    eprintln!("Spawning worker threads");
    let (elapsed, reports) = std::thread::scope(|s| {
        let clients: Vec<_> = workloads
            .iter()
            .enumerate()
            .map(|#[allow(unused)] (i, workload)| {
                #[cfg(feature = "affinity")]
                let core_id = core_ids[i];
                let store = &store;
                let barrier = &barrier;
                s.spawn(move || {
                    #[cfg(feature = "affinity")]
                    assert!(core_affinity::set_for_current(core_id));
                    run_client(store, barrier, workload)
                })
            })
            .collect();

        eprintln!("Start");
        barrier.wait();
        let start = Instant::now();
        let reports: Vec<_> = clients
            .into_iter()
            .map(|client| client.join().unwrap())
            .collect();
        (start.elapsed(), reports)
    });
    let reports = reports.into_iter().collect::<ccstore::Result<Vec<_>>>()?;

    eprintln!("Finished");
    let mut total = WorkerStats::default();
    for (i, report) in reports.iter().enumerate() {
        eprintln!(
            "Thread {i}\telapsed {:.3?}\tcommits {}\taborts {}\tabort rate {:.3}\tTPS {}",
            report.elapsed,
            report.stats.commits,
            report.stats.aborts,
            abort_rate(&report.stats),
            tps(report.stats.commits, report.elapsed),
        );
        total.commits += report.stats.commits;
        total.aborts += report.stats.aborts;
    }
    eprintln!("Elapsed\t{elapsed:.3?}");
    eprintln!("Commits\t{}", total.commits);
    eprintln!("Aborts\t{}", total.aborts);
    eprintln!("Abort rate\t{:.3}", abort_rate(&total));
    eprintln!("TPS\t{}", tps(total.commits, elapsed));
    eprintln!("GC\t{}", store.gc_count());

    let mut sum = 0;
    for key in 0..cli.keys {
        sum += store.committed_value(key)?;
    }
    if cli.dump {
        eprint!("{}", store.dump());
    }
    eprintln!("Sum of values\t{sum}");

    #[derive(Serialize)]
    struct Summary {
        etime: u64,
        commits: u64,
        aborts: u64,
        abort_rate: f64,
        tps: u64,
        gc_count: u64,
        protocol: String,
        threads: usize,
        keys: usize,
        txn_len: usize,
        read_ratio: f64,
        seed: u64,
        value_sum: u64,
    }
    let mut stdout = std::io::stdout().lock();
    serde_json::ser::to_writer_pretty(
        &mut stdout,
        &Summary {
            etime: elapsed.as_millis() as u64,
            commits: total.commits,
            aborts: total.aborts,
            abort_rate: abort_rate(&total),
            tps: tps(total.commits, elapsed),
            gc_count: store.gc_count(),
            protocol: format!("{:?}", cli.protocol),
            threads: cli.threads,
            keys: cli.keys,
            txn_len: cli.txn_len,
            read_ratio: cli.read_ratio,
            seed,
            value_sum: sum,
        },
    )?;
    stdout.write_all(b"\n")?;
    Ok(())
}

struct ClientReport {
    elapsed: Duration,
    stats: WorkerStats,
}

fn run_client<C: ConcurrencyControl>(
    store: &Store<C>,
    barrier: &Barrier,
    workload: &[Vec<Operation>],
) -> ccstore::Result<ClientReport> {
    let mut worker = store.worker();
    barrier.wait();
    let start = Instant::now();
    for operations in workload {
        worker.execute(operations)?;
    }
    Ok(ClientReport {
        elapsed: start.elapsed(),
        stats: worker.stats(),
    })
}

/// Generates `num_txns` transactions of `txn_len` operations each,
/// choosing keys uniformly at random.
fn generate_workload(cli: &Cli, seed: u64, num_txns: usize) -> Vec<Vec<Operation>> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..num_txns)
        .map(|_| {
            (0..cli.txn_len)
                .map(|_| {
                    let key = rng.gen_range(0..cli.keys);
                    if rng.gen_bool(cli.read_ratio) {
                        Operation::read(key)
                    } else {
                        Operation::write(key)
                    }
                })
                .collect()
        })
        .collect()
}

fn abort_rate(stats: &WorkerStats) -> f64 {
    let attempts = stats.commits + stats.aborts;
    if attempts == 0 {
        return 0.0;
    }
    stats.aborts as f64 / attempts as f64
}

fn tps(commits: u64, elapsed: Duration) -> u64 {
    (commits as f64 / elapsed.as_secs_f64()) as u64
}
