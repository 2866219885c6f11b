mod console;
mod settings;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tether_core::client::{ClientConfig, ConnectionRegistry, DeviceProfile};
use tether_core::types::TerminalSize;

use crate::settings::Settings;

/// Attach to a remote ttyd shell, holding the session for this device.
///
/// Type `~.` on its own line to quit, `~r` to take the session back after
/// another device claimed it, `~?` for the tmux and quick-command escapes.
#[derive(Parser, Debug)]
#[command(name = "tether", version)]
struct Cli {
    /// Saved profile to use (name or id). Defaults to the selected profile.
    profile: Option<String>,

    /// Connect to this host instead of a saved profile
    #[arg(long)]
    host: Option<String>,

    /// ttyd port
    #[arg(long)]
    port: Option<u16>,

    /// Session arbitration API port
    #[arg(long)]
    api_port: Option<u16>,

    /// Name to claim the session under
    #[arg(long, env = "TETHER_DEVICE_NAME")]
    device_name: Option<String>,

    #[arg(long)]
    cols: Option<u16>,

    #[arg(long)]
    rows: Option<u16>,

    /// Store the --host connection as a profile
    #[arg(long, requires = "host")]
    save: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = settings::load_settings();
    let profile = resolve_profile(&cli, &settings)?;

    if cli.save {
        settings.add_profile(profile.clone());
        settings::save_settings(&settings).context("Failed to save settings")?;
        log::info!("Saved profile '{}'", profile.name);
    }

    let defaults = settings.default_size();
    let size = TerminalSize::new(
        cli.cols.unwrap_or(defaults.columns),
        cli.rows.unwrap_or(defaults.rows),
    );
    let device_name = cli
        .device_name
        .clone()
        .unwrap_or_else(|| settings.device_name.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .thread_name("tether-net")
        .build()
        .context("Failed to create tokio runtime")?;

    log::info!(
        "Attaching to '{}' at {}:{} as {}",
        profile.name,
        profile.host,
        profile.ttyd_port,
        device_name
    );

    let (registry, events) =
        ConnectionRegistry::new(runtime.handle().clone(), device_name, ClientConfig::default());
    let connection = registry.connection_for(&profile, size);

    let quick_commands = settings.quick_commands.clone();
    let result = runtime.block_on(console::run(connection, events, quick_commands));
    registry.disconnect_all();
    result
}

/// Pick the profile to attach to: an ad-hoc `--host`, the named profile, or
/// the selected one. Port flags override whatever was found.
fn resolve_profile(cli: &Cli, settings: &Settings) -> Result<DeviceProfile> {
    let mut profile = match (&cli.host, &cli.profile) {
        (Some(host), name) => {
            let name = name.clone().unwrap_or_else(|| host.clone());
            DeviceProfile::new(name, host.clone())
        }
        (None, Some(key)) => settings
            .find_profile(key)
            .cloned()
            .with_context(|| format!("No saved profile named '{}'", key))?,
        (None, None) => match settings.selected() {
            Some(profile) => profile.clone(),
            None => bail!(
                "No saved profiles in {}; pass --host",
                settings::get_settings_path().display()
            ),
        },
    };

    if let Some(port) = cli.port {
        profile.ttyd_port = port;
    }
    if let Some(api_port) = cli.api_port {
        profile.api_port = api_port;
    }
    if profile.host.trim().is_empty() {
        bail!("Profile '{}' has no host configured", profile.name);
    }
    Ok(profile)
}
