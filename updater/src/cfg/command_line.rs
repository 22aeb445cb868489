use clap::{Args, Parser, Subcommand};

static DEFAULT_CONFIG_PATH: &str = ".anvil.toml";

#[derive(Parser)]
#[command(name = "anvil", about = "Out-of-band fleet firmware updater")]
pub struct Options {
    /// Increase debug level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub debug: u8,

    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    #[command(subcommand)]
    pub subcmd: Command,
}

#[derive(Args)]
pub struct Target {
    /// Network address of the management controller
    pub host: String,

    #[arg(long, env = "ANVIL_BMC_USERNAME")]
    pub username: String,

    #[arg(long, env = "ANVIL_BMC_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Probe every protocol and report the host's capabilities
    Detect(Target),

    /// Health-check every protocol on the host
    Health(Target),

    /// Apply a firmware update, falling back across protocols
    Update(UpdateArgs),
}

#[derive(Args)]
pub struct UpdateArgs {
    #[command(flatten)]
    pub target: Target,

    /// Image URI for a single component, as `<component-id>=<uri>`
    #[arg(long = "component", value_parser = parse_component)]
    pub components: Vec<(String, String)>,

    /// Firmware repository URL for repository-mode updates
    #[arg(long)]
    pub repository: Option<String>,
}

fn parse_component(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((id, uri)) if !id.is_empty() && !uri.is_empty() => {
            Ok((id.to_string(), uri.to_string()))
        }
        _ => Err(format!("expected <component-id>=<uri>, got {raw:?}")),
    }
}
