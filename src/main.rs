// ABOUTME: Entry point for the hostwire CLI application.
// ABOUTME: Parses arguments and dispatches to the library's trust and SSH operations.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use hostwire::concurrent::run_concurrently;
use hostwire::config::{Config, Target};
use hostwire::error::{Error, ErrorKind, Result};
use hostwire::ssh::{self, Client, ConnectConfig};
use hostwire::trust::TrustStore;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let interrupted = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted.cancel();
        }
    });

    if let Err(e) = run(cli, cancel).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let cwd = env::current_dir().map_err(|e| Error::io("cannot read current directory", e))?;
            Config::discover(&cwd)
        }
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let store = TrustStore::from_config(&config.trust)?;

    match cli.command {
        Commands::Keys => {
            store.ensure_root_keys_exist()?;
            print!("{}", store.root_authorized_key().content()?);
            Ok(())
        }
        Commands::ServerCert => {
            store.ensure_root_keys_exist()?;
            let leaf = store.new_server_certificate()?;
            store.persist_server_certificate(&leaf)?;
            println!("{}", store.server_cert().path().display());
            Ok(())
        }
        Commands::Probe { host, timeout } => {
            store.ensure_root_keys_exist()?;
            let connect = ConnectConfig::from_settings(&host, &config.ssh);
            let deadline = cancel.child_token();
            let expiry = deadline.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                expiry.cancel();
            });
            let reachable =
                ssh::check_ssh_every(&deadline, &connect, &store, config.probe.interval).await;
            timer.abort();
            if reachable {
                println!("{host} is reachable");
                Ok(())
            } else {
                Err(Error::new(ErrorKind::Connection(format!(
                    "{host} not reachable within {}",
                    humantime::format_duration(timeout)
                ))))
            }
        }
        Commands::Exec { hosts, command } => {
            store.ensure_root_keys_exist()?;
            let command = Arc::new(command.join(" "));
            fan_out(&cancel, &config, &store, hosts, move |client: Arc<Client>| {
                let command = Arc::clone(&command);
                async move { client.run_command(&command).await }
            })
            .await
        }
        Commands::Script { hosts, file } => {
            store.ensure_root_keys_exist()?;
            let script = std::fs::read_to_string(&file)
                .map_err(|e| Error::io(format!("cannot read {}", file.display()), e))?;
            let script = Arc::new(script);
            fan_out(&cancel, &config, &store, hosts, move |client: Arc<Client>| {
                let script = Arc::clone(&script);
                async move { client.run_script(&script).await }
            })
            .await
        }
        Commands::Upload {
            host,
            local,
            remote_dir,
        } => {
            let client = connect(&config, &store, &host, false).await?;
            let uploaded = client.upload(&local, &remote_dir).await;
            Error::combine(uploaded, client.close().await)
        }
        Commands::Download {
            host,
            remote_file,
            local_dir,
        } => {
            let client = connect(&config, &store, &host, false).await?;
            let downloaded = client.download(&remote_file, &local_dir).await;
            let path = Error::combine(downloaded, client.close().await)?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

async fn connect(
    config: &Config,
    store: &TrustStore,
    host: &Target,
    forward_stdin: bool,
) -> Result<Client> {
    let settings = ConnectConfig::from_settings(host, &config.ssh).forward_stdin(forward_stdin);
    Client::connect(settings, store)
        .await
        .map_err(|e| Error::with_context(format!("cannot reach {host}"), e))
}

/// Connect to every host and run `work` there, collecting every failure.
/// Local stdin reaches the remote side only when there is a single host.
async fn fan_out<F, Fut>(
    cancel: &CancellationToken,
    config: &Config,
    store: &TrustStore,
    hosts: Vec<Target>,
    work: F,
) -> Result<()>
where
    F: Fn(Arc<Client>) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    let forward_stdin = hosts.len() == 1;
    let tasks = hosts.into_iter().map(|host| {
        let config = config.clone();
        let store = store.clone();
        let work = work.clone();
        move |cancel: CancellationToken| async move {
            let on_host = async {
                let client = Arc::new(connect(&config, &store, &host, forward_stdin).await?);
                let result = work(Arc::clone(&client)).await;
                Error::combine(result, client.close().await)
            };
            hostwire::concurrent::with_cancel(&cancel, on_host)
                .await
                .map_err(|e| Error::with_context(format!("host {host}"), e))
        }
    });
    run_concurrently(cancel, tasks).await
}
