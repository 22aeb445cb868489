use std::sync::Arc;

use clap::Parser;
use eyre::WrapErr;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::{fmt, prelude::*, registry};

use updater::cfg::{self, AnvilConfig, Command, Options, Target, UpdateArgs};
use updater::detect::CapabilityDetector;
use updater::model::{
    ComponentUpdate, Credentials, FirmwareUpdateRequest, Protocol, ServerIdentity, UpdateMode,
};
use updater::poller::{PollEvent, PollSink, PollerSettings, TaskPoller};
use updater::protocol::{
    IpmiClient, ProtocolClient, ProtocolManager, RacadmClient, RedfishClient, SshClient,
    WsmanClient,
};

fn init_log(debug: u8) -> eyre::Result<()> {
    let default_level = match debug {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    registry()
        .with(fmt::Layer::default().compact().with_writer(std::io::stderr))
        .with(env_filter)
        .try_init()
        .map_err(|e| eyre::eyre!("failed to initialize logging: {e}"))
}

fn load_config(path: &str) -> eyre::Result<AnvilConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => Some(raw),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
        Err(error) => {
            return Err(error).wrap_err_with(|| format!("failed to read config file {path}"))
        }
    };
    cfg::parse_config(raw.as_deref())
}

fn build_clients(config: &AnvilConfig) -> eyre::Result<Vec<Arc<dyn ProtocolClient>>> {
    Ok(vec![
        Arc::new(RedfishClient::new(&config.http)?),
        Arc::new(WsmanClient::new(&config.http)?),
        Arc::new(RacadmClient::new(config.subprocess.clone())),
        Arc::new(IpmiClient::new(config.subprocess.clone())),
        Arc::new(SshClient::new(config.subprocess.clone())),
    ])
}

fn target_parts(target: &Target) -> (ServerIdentity, Credentials) {
    (
        ServerIdentity::new(target.host.clone()),
        Credentials {
            username: target.username.clone(),
            password: target.password.clone(),
            port: target.port,
        },
    )
}

async fn run_detect(config: &AnvilConfig, target: &Target) -> eyre::Result<()> {
    let clients = build_clients(config)?;
    let detector = CapabilityDetector::from_clients(&clients, config.detect_ipmi);
    let manager = ProtocolManager::new(clients);
    let (identity, credentials) = target_parts(target);

    let classification = detector.classify(&identity, &credentials).await;
    let capabilities = manager.detect(&identity, &credentials).await;
    manager.dispose().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "host": identity.host,
            "generation": classification.generation.to_string(),
            "usable_protocol": classification.usable_protocol().map(|p| p.to_string()),
            "capabilities": capabilities,
        }))?
    );
    Ok(())
}

async fn run_health(config: &AnvilConfig, target: &Target) -> eyre::Result<()> {
    let manager = ProtocolManager::new(build_clients(config)?);
    let (identity, credentials) = target_parts(target);

    let reports = manager.health_check_all(&identity, &credentials).await;
    manager.dispose().await;

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

fn stderr_sink() -> PollSink {
    Arc::new(|event: &PollEvent| {
        if let Ok(rendered) = serde_json::to_string(event) {
            eprintln!("{rendered}");
        }
    })
}

async fn run_update(config: &AnvilConfig, args: &UpdateArgs) -> eyre::Result<()> {
    if args.components.is_empty() && args.repository.is_none() {
        eyre::bail!("an update needs at least one --component or a --repository URL");
    }

    let clients = build_clients(config)?;
    let redfish = RedfishClient::new(&config.http)?;
    let manager = ProtocolManager::new(clients);
    let (identity, credentials) = target_parts(&args.target);

    let request = FirmwareUpdateRequest {
        identity: identity.clone(),
        credentials: credentials.clone(),
        mode: if args.repository.is_some() {
            UpdateMode::Repository
        } else {
            UpdateMode::Immediate
        },
        components: args
            .components
            .iter()
            .map(|(id, uri)| ComponentUpdate {
                component_id: id.clone(),
                image_uri: uri.clone(),
            })
            .collect(),
        repository_url: args.repository.clone(),
        parameters: Default::default(),
    };

    let outcome = manager.run_update(&request, None).await;
    manager.dispose().await;
    let result = outcome.wrap_err("firmware update failed on every protocol")?;

    tracing::info!(protocol = %result.protocol, "Update submitted");
    for message in &result.messages {
        tracing::info!("{message}");
    }

    // Redfish hands back an asynchronous job; drive it to completion here
    // so the operator gets a definitive answer and the inventory diff.
    if result.protocol == Protocol::Redfish {
        let endpoint = redfish.endpoint(&identity, &credentials);
        let settings = PollerSettings::with_deadline(config.poll_timeout());
        let poller = TaskPoller::new(endpoint, settings).with_sink(stderr_sink());
        let outcome = poller.track(result.task_location(), None).await?;

        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "completed": outcome.completed,
                "state": outcome.task.state(),
                "percent_complete": outcome.percent_complete,
                "messages": outcome.messages,
                "duration_secs": outcome.duration.as_secs(),
                "inventory_changes": outcome.inventory.changes,
            }))?
        );
        if !outcome.completed {
            eyre::bail!("firmware job finished in a failed state");
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let options = Options::parse();
    init_log(options.debug)?;
    let config = load_config(&options.config)?;

    match &options.subcmd {
        Command::Detect(target) => run_detect(&config, target).await,
        Command::Health(target) => run_health(&config, target).await,
        Command::Update(args) => run_update(&config, args).await,
    }
}
