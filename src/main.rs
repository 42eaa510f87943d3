use anyhow::Result;
use clap::Parser;
use relay_node::config_models::cli_args;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<()> {
    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not create tokio runtime");

    tokio_runtime.block_on(async {
        let args: cli_args::Args = cli_args::Args::parse();

        // Diagnostics go to stderr so the stdout status panel stays intact.
        // Accepted `RUST_LOG` values are `trace`, `debug`, `info`, `warn`,
        // and `error`.
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|_err| eprintln!("Unable to set global default subscriber"))
            .expect("Failed to set trace subscriber");

        relay_node::initialize(args).await
    })
}
