use davsyncd::daemon::{DaemonConfig, DaemonRuntime, RunMode};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Check,
    Download,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Check;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "check" => mode = CliMode::Check,
            "download" => mode = CliMode::Download,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mode = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: davsyncd [check|download]");
            println!("  check      List the remote collection and local storage (default)");
            println!("  download   Check, then fetch missing files and remove local orphans");
            return Ok(());
        }
        CliMode::Check => RunMode::Check,
        CliMode::Download => RunMode::Download,
    };
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run(mode).await
}
