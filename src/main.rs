use color_eyre::eyre::{eyre, Result, WrapErr};
use netpump::{Broker, Config, Role, Sinks, WaitOutcome};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netpump=info".into()),
        )
        .init();

    let workers = std::thread::available_parallelism()?.get() * 2;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .wrap_err("Failed to build the runtime")?;

    let code = runtime.block_on(run())?;
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    // Argument parsing stays minimal here: role plus an optional port.
    // Real deployments drive the library through their own front end.
    let args: Vec<String> = std::env::args().collect();
    let role = match args.get(1).map(String::as_str) {
        Some("server") => Role::Server,
        Some("client") => Role::Client,
        _ => return Err(eyre!("usage: netpump <server|client> [port]")),
    };
    let port = args
        .get(2)
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(netpump::config::DEFAULT_PORT);

    let mut config = Config {
        role,
        port,
        ..Config::default()
    };
    match role {
        Role::Server => {
            config.listen_addresses = vec![format!("0.0.0.0:{port}").parse().unwrap()];
        }
        Role::Client => {
            config.target_addresses = netpump::net::resolve(&format!("127.0.0.1:{port}")).await?;
        }
    }
    config.validate().wrap_err("Invalid configuration")?;

    info!(?role, port, "starting");
    let broker = Broker::start(Arc::new(config), Sinks::tracing())
        .await
        .wrap_err("Failed to start the broker")?;

    let outcome = tokio::select! {
        outcome = broker.wait(None) => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, cancelling");
            broker.cancel();
            broker.wait(Some(Duration::from_secs(5))).await
        }
    };
    info!(?outcome, "run finished");

    Ok(match outcome {
        WaitOutcome::Done => broker.exit_code(),
        WaitOutcome::Cancelled | WaitOutcome::TimedOut => 1,
        WaitOutcome::Failed => 2,
    })
}
