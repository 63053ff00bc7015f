use std::{rc::Rc, time::Duration};

use rand::{Rng, SeedableRng, rngs::StdRng};
use tally::{CounterBackend, CounterId, MemoryBackend, SyncError, SyncStatus};
use tapcat_frontend_rs::{EngineConfig, TapEngine, init_logging};
use tokio::{task::LocalSet, time::Instant};

struct Options {
    clients: usize,
    duration: Duration,
    failure_rate: f64,
    seed: u64,
    supabase: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            clients: 4,
            duration: Duration::from_secs(5),
            failure_rate: 0.1,
            seed: 42,
            supabase: false,
        }
    }
}

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {program} [--clients N] [--seconds S] [--failure-rate P] [--seed X] [--supabase]"
    );
    eprintln!("\nSimulates N clients tapping on one shared counter and checks that no taps were lost.");
    eprintln!("--failure-rate only applies to the in-memory backend.");
    std::process::exit(1);
}

fn parse_args() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("tapcat-sim");
    let mut options = Options::default();

    let mut rest = args.iter().skip(1);
    while let Some(flag) = rest.next() {
        if flag == "--supabase" {
            options.supabase = true;
            continue;
        }
        let Some(value) = rest.next() else {
            eprintln!("Error: {flag} needs a value");
            usage(program);
        };
        let parsed = match flag.as_str() {
            "--clients" => value.parse().map(|v| options.clients = v).ok(),
            "--seconds" => value
                .parse()
                .ok()
                .and_then(|v| Duration::try_from_secs_f64(v).ok())
                .map(|v| options.duration = v),
            "--failure-rate" => value.parse().map(|v| options.failure_rate = v).ok(),
            "--seed" => value.parse().map(|v| options.seed = v).ok(),
            _ => {
                eprintln!("Error: unknown flag {flag}");
                usage(program);
            }
        };
        if parsed.is_none() {
            eprintln!("Error: invalid value {value:?} for {flag}");
            usage(program);
        }
    }

    if options.clients == 0 || !(0.0..1.0).contains(&options.failure_rate) {
        usage(program);
    }
    options
}

fn main() {
    let options = parse_args();
    init_logging();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error starting runtime: {e}");
            std::process::exit(1);
        }
    };

    let lost = LocalSet::new().block_on(&runtime, async {
        if options.supabase {
            run_against_supabase(&options, config).await
        } else {
            let backend = MemoryBackend::new().with_counter(config.global_counter_id.clone(), 1_000);
            let chaos = tokio::task::spawn_local(inject_failures(
                backend.clone(),
                options.failure_rate,
                options.seed,
                Instant::now() + options.duration,
            ));
            let lost = simulate(backend, config, &options).await;
            chaos.abort();
            lost
        }
    });

    if lost != 0 {
        eprintln!("FAILED: {lost} taps went missing");
        std::process::exit(1);
    }
    println!("OK: every tap landed");
}

/// Assumes nobody else is tapping on the counter while this runs.
#[cfg(feature = "supabase")]
async fn run_against_supabase(options: &Options, config: EngineConfig) -> i128 {
    use tally::supabase::{SupabaseBackend, SupabaseConfig, SupabaseCounterTable};

    let supabase = match SupabaseConfig::from_env() {
        Ok(supabase) => supabase,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let backend = SupabaseBackend::new(&supabase, SupabaseCounterTable::default());
    simulate(backend, config, options).await
}

#[cfg(not(feature = "supabase"))]
async fn run_against_supabase(_options: &Options, _config: EngineConfig) -> i128 {
    eprintln!("--supabase requires the 'supabase' feature to be enabled");
    eprintln!("Please run with: cargo run --bin tapcat-sim --features supabase -- --supabase");
    std::process::exit(1);
}

/// Every so often, make the next write fail. Stops at `until` so the clients can catch up.
async fn inject_failures(backend: MemoryBackend, failure_rate: f64, seed: u64, until: Instant) {
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    while Instant::now() < until {
        ticker.tick().await;
        if rng.random_bool(failure_rate) {
            backend.fail_next_writes(1, SyncError::Transient("simulated timeout".into()));
        }
    }
}

/// Returns how many taps the backend is missing (negative if it has more than expected).
async fn simulate<B: CounterBackend + Clone + 'static>(
    backend: B,
    config: EngineConfig,
    options: &Options,
) -> i128 {
    let id = config.global_counter_id.clone();
    let before = read_or_exit(&backend, &id).await;

    let mut engines = Vec::with_capacity(options.clients);
    for _ in 0..options.clients {
        let engine = Rc::new(TapEngine::new(backend.clone(), config.clone()));
        engine.initialize().await;
        engine.start();
        engines.push(engine);
    }
    println!(
        "Simulating {} clients for {:?} starting from {before}",
        options.clients, options.duration
    );

    let deadline = Instant::now() + options.duration;
    let tappers: Vec<_> = engines
        .iter()
        .enumerate()
        .map(|(client, engine)| {
            let engine = Rc::clone(engine);
            let seed = options.seed.wrapping_add(client as u64);
            tokio::task::spawn_local(tap_until(engine, deadline, seed))
        })
        .collect();

    let mut tapped: u64 = 0;
    for tapper in tappers {
        match tapper.await {
            Ok(amount) => tapped += amount,
            Err(e) => log::error!("Client task failed: {e:?}"),
        }
    }

    wait_until_synced(&engines).await;
    for (client, engine) in engines.iter().enumerate() {
        println!(
            "  client {client}: display {} ({:?})",
            engine.current_display_value(),
            engine.sync_status()
        );
        engine.stop();
    }

    let after = read_or_exit(&backend, &id).await;
    println!("Tapped {tapped}, backend went from {before} to {after}");
    i128::from(before) + i128::from(tapped) - i128::from(after)
}

async fn tap_until<B: CounterBackend + 'static>(
    engine: Rc<TapEngine<B>>,
    deadline: Instant,
    seed: u64,
) -> u64 {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tapped = 0;
    while Instant::now() < deadline {
        if rng.random_ratio(1, 200) && engine.leave_party().is_none() {
            engine.join_party(format!("room-{}", rng.random_range(1..=3)), 2);
        }
        // Bursts of fast taps with the odd pause.
        let pause = if rng.random_ratio(1, 20) {
            rng.random_range(500..2500)
        } else {
            rng.random_range(30..200)
        };
        tokio::time::sleep(Duration::from_millis(pause)).await;
        tapped += engine.tap().amount;
    }
    tapped
}

async fn wait_until_synced<B: CounterBackend + 'static>(engines: &[Rc<TapEngine<B>>]) {
    let give_up = Instant::now() + Duration::from_secs(60);
    while Instant::now() < give_up {
        if engines
            .iter()
            .all(|engine| engine.sync_status() == SyncStatus::Synced)
        {
            return;
        }
        for engine in engines {
            engine.flush_now().await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    log::warn!("Gave up waiting for every client to sync");
}

async fn read_or_exit<B: CounterBackend>(backend: &B, id: &CounterId) -> u64 {
    match backend.read_counter(id).await {
        Ok(value) => value,
        Err(e) => {
            eprintln!("Error reading counter {id}: {e}");
            std::process::exit(1);
        }
    }
}
