use anyhow::Context;
use kiosksyncd::daemon::{self, DaemonConfig, DaemonRuntime};
use kiosksyncd::logging;
use kiosksyncd::storage::CredentialStore;

const STATUS_SNAPSHOT_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    SyncOnce,
    Status,
    ResetFailed,
    SetApiKey(String),
    ForgetApiKey,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sync-once" => mode = CliMode::SyncOnce,
            "--status" => mode = CliMode::Status,
            "--reset-failed" => mode = CliMode::ResetFailed,
            "--set-api-key" => {
                let key = args
                    .next()
                    .filter(|key| !key.trim().is_empty())
                    .context("--set-api-key requires a value")?;
                mode = CliMode::SetApiKey(key);
            }
            "--forget-api-key" => mode = CliMode::ForgetApiKey,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn print_usage() {
    println!(
        "Usage: kiosksyncd [--sync-once | --status | --reset-failed | --set-api-key <key> | --forget-api-key]"
    );
    println!("  --sync-once          Run one sync pass, print the report as JSON and exit");
    println!("  --status             Print queue counts and recent entries as JSON");
    println!("  --reset-failed       Return failed entries to the queue");
    println!("  --set-api-key <key>  Save the backend API key");
    println!("  --forget-api-key     Remove the saved backend API key");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_usage();
        return Ok(());
    }
    logging::init();

    match mode {
        CliMode::Status => {
            let status =
                daemon::queue_status(&daemon::db_path_from_env()?, STATUS_SNAPSHOT_LIMIT).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        CliMode::ResetFailed => {
            let count = daemon::reset_failed(&daemon::db_path_from_env()?).await?;
            println!("{count} failed entries returned to the queue");
        }
        CliMode::SetApiKey(key) => {
            let storage = CredentialStore::new()?;
            storage.save_api_key(&key)?;
            eprintln!("[kiosksyncd] api key saved ({})", storage.backend_name());
        }
        CliMode::ForgetApiKey => {
            let storage = CredentialStore::new()?;
            storage.delete_api_key()?;
            eprintln!("[kiosksyncd] saved api key removed");
        }
        CliMode::SyncOnce => {
            let config = DaemonConfig::from_env()?;
            let daemon = DaemonRuntime::bootstrap(config).await?;
            let report = daemon.sync_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        CliMode::Run => {
            let config = DaemonConfig::from_env()?;
            let daemon = DaemonRuntime::bootstrap(config).await?;
            daemon.run().await?;
        }
        CliMode::Help => {}
    }
    Ok(())
}
