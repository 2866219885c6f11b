use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tether_core::client::DeviceProfile;
use tether_core::client::config::{DEFAULT_API_PORT, DEFAULT_TTYD_PORT};
use tether_core::types::TerminalSize;

/// Current settings schema version - increment when making breaking changes
pub const SETTINGS_VERSION: u32 = 1;

/// Name given to the profile created from the legacy single-host layout.
const LEGACY_PROFILE_NAME: &str = "My Mac";

/// Client settings, persisted as settings.json
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Settings schema version for migration support
    #[serde(default = "default_settings_version")]
    pub version: u32,
    /// Name this device claims sessions under
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_columns")]
    pub default_columns: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    #[serde(default)]
    pub profiles: Vec<DeviceProfile>,
    /// Id of the profile used when none is named
    #[serde(default)]
    pub selected_profile: Option<String>,
    #[serde(default = "default_quick_commands")]
    pub quick_commands: Vec<QuickCommand>,
}

/// A saved shell command, typed into tmux through the control API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickCommand {
    #[serde(default = "new_id")]
    pub id: String,
    pub label: String,
    pub command: String,
    #[serde(default)]
    pub description: String,
    /// Run it in a fresh tmux window instead of the active one
    #[serde(default)]
    pub new_window: bool,
}

impl QuickCommand {
    pub fn new(label: &str, command: &str, description: &str) -> Self {
        Self {
            id: new_id(),
            label: label.to_string(),
            command: command.to_string(),
            description: description.to_string(),
            new_window: false,
        }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn default_quick_commands() -> Vec<QuickCommand> {
    vec![
        QuickCommand::new("git status", "git status", "Show git status"),
        QuickCommand::new("git diff", "git diff", "Show changes"),
        QuickCommand::new("ls -la", "ls -la", "List files"),
        QuickCommand::new("pwd", "pwd", "Current directory"),
        QuickCommand::new("npm test", "npm test", "Run tests"),
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            device_name: default_device_name(),
            default_columns: default_columns(),
            default_rows: default_rows(),
            profiles: Vec::new(),
            selected_profile: None,
            quick_commands: default_quick_commands(),
        }
    }
}

fn default_settings_version() -> u32 {
    // Files written before versioning have no version field
    0
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "tether".to_string())
}

fn default_columns() -> u16 {
    TerminalSize::default().columns
}

fn default_rows() -> u16 {
    TerminalSize::default().rows
}

impl Settings {
    pub fn default_size(&self) -> TerminalSize {
        TerminalSize::new(self.default_columns, self.default_rows)
    }

    /// Look a profile up by id, then by name (case-insensitive).
    pub fn find_profile(&self, key: &str) -> Option<&DeviceProfile> {
        self.profiles
            .iter()
            .find(|p| p.id == key)
            .or_else(|| self.profiles.iter().find(|p| p.name.eq_ignore_ascii_case(key)))
    }

    /// The selected profile, falling back to the first one.
    pub fn selected(&self) -> Option<&DeviceProfile> {
        self.selected_profile
            .as_deref()
            .and_then(|id| self.profiles.iter().find(|p| p.id == id))
            .or_else(|| self.profiles.first())
    }

    /// Add a profile and select it.
    pub fn add_profile(&mut self, profile: DeviceProfile) {
        self.selected_profile = Some(profile.id.clone());
        self.profiles.push(profile);
    }
}

/// Get the config directory path
pub fn get_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

/// Get the settings file path
pub fn get_settings_path() -> PathBuf {
    get_config_dir().join("settings.json")
}

pub fn load_settings() -> Settings {
    load_settings_from(&get_settings_path())
}

/// Load settings with partial recovery and migration.
///
/// Never fails: unreadable files fall back to defaults and are left in place.
pub fn load_settings_from(path: &Path) -> Settings {
    if !path.exists() {
        log::info!("Settings file not found at {}, using defaults", path.display());
        return Settings::default();
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::error!("Failed to read settings file {}: {}", path.display(), e);
            return Settings::default();
        }
    };

    // Fast path for valid settings
    let (settings, recovered) = match serde_json::from_str::<Settings>(&content) {
        Ok(settings) => (settings, false),
        Err(e) => {
            log::warn!("Failed to parse settings directly: {}, attempting partial recovery", e);
            match recover_settings_from_json(&content) {
                Ok(settings) => {
                    log::info!("Successfully recovered settings with partial data");
                    (settings, true)
                }
                Err(e) => {
                    log::error!("Failed to recover settings from {}: {}", path.display(), e);
                    log::error!("Using default settings. Your old settings file has been preserved.");
                    return Settings::default();
                }
            }
        }
    };

    let original_version = settings.version;
    let settings = migrate_settings(settings, &content);

    if recovered || settings.version != original_version {
        if let Err(e) = save_settings_to(&settings, path) {
            log::warn!("Failed to save settings after recovery/migration: {}", e);
        }
    }
    settings
}

/// Pull out whatever fields are still usable from a malformed file.
fn recover_settings_from_json(content: &str) -> Result<Settings> {
    use anyhow::Context;

    let value: serde_json::Value =
        serde_json::from_str(content).context("Settings file is not valid JSON")?;
    let obj = value
        .as_object()
        .context("Settings file root is not a JSON object")?;

    let mut settings = Settings {
        version: default_settings_version(),
        ..Settings::default()
    };

    if let Some(v) = obj.get("version").and_then(|v| v.as_u64()) {
        settings.version = v as u32;
    }

    if let Some(v) = obj.get("device_name").and_then(|v| v.as_str()) {
        if !v.trim().is_empty() {
            settings.device_name = v.to_string();
        }
    }

    if let Some(v) = obj.get("default_columns").and_then(|v| v.as_u64()) {
        settings.default_columns = v.clamp(20, 500) as u16;
    }

    if let Some(v) = obj.get("default_rows").and_then(|v| v.as_u64()) {
        settings.default_rows = v.clamp(5, 300) as u16;
    }

    // Keep every profile that still parses
    if let Some(profiles) = obj.get("profiles").and_then(|v| v.as_array()) {
        for entry in profiles {
            match serde_json::from_value::<DeviceProfile>(entry.clone()) {
                Ok(profile) => settings.profiles.push(profile),
                Err(e) => log::warn!("Dropping unreadable profile: {}", e),
            }
        }
    }

    if let Some(v) = obj.get("selected_profile").and_then(|v| v.as_str()) {
        if settings.profiles.iter().any(|p| p.id == v) {
            settings.selected_profile = Some(v.to_string());
        }
    }

    // An explicit list is kept even if it ends up empty
    if let Some(commands) = obj.get("quick_commands").and_then(|v| v.as_array()) {
        settings.quick_commands = commands
            .iter()
            .filter_map(|entry| {
                serde_json::from_value::<QuickCommand>(entry.clone())
                    .map_err(|e| log::warn!("Dropping unreadable quick command: {}", e))
                    .ok()
            })
            .collect();
    }

    Ok(settings)
}

/// Migrate settings from older versions to the current version
fn migrate_settings(mut settings: Settings, content: &str) -> Settings {
    let original_version = settings.version;

    // v0 -> v1: single host at top level becomes the first profile
    if settings.version == 0 {
        log::info!("Migrating settings from pre-versioning (v0) to v1");
        if settings.profiles.is_empty() {
            if let Some(profile) = legacy_profile(content) {
                log::info!("Created profile '{}' for {}", profile.name, profile.host);
                settings.add_profile(profile);
            }
        }
        settings.version = 1;
    }

    if settings.version < SETTINGS_VERSION {
        log::warn!(
            "Settings version {} is older than current version {}, some settings may use defaults",
            original_version,
            SETTINGS_VERSION
        );
        settings.version = SETTINGS_VERSION;
    }

    if original_version != settings.version {
        log::info!("Settings migrated from v{} to v{}", original_version, settings.version);
    }
    settings
}

fn legacy_profile(content: &str) -> Option<DeviceProfile> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    let obj = value.as_object()?;

    let host = obj.get("tailscale_ip")?.as_str()?.trim();
    if host.is_empty() {
        return None;
    }

    // Zero means "never set"
    let port = |key: &str, default: u16| {
        obj.get(key)
            .and_then(|v| v.as_u64())
            .and_then(|v| u16::try_from(v).ok())
            .filter(|v| *v != 0)
            .unwrap_or(default)
    };

    let mut profile = DeviceProfile::new(LEGACY_PROFILE_NAME, host);
    profile.ttyd_port = port("ttyd_port", DEFAULT_TTYD_PORT);
    profile.api_port = port("api_port", DEFAULT_API_PORT);
    if let Some(session) = obj.get("tmux_session").and_then(|v| v.as_str()) {
        profile.tmux_session = session.to_string();
    }
    Some(profile)
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(settings, &get_settings_path())
}

/// Save settings, readable only by the owner on Unix.
pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("settings.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("settings.json"));
        assert_eq!(settings.version, SETTINGS_VERSION);
        assert_eq!(settings.default_size(), TerminalSize::new(80, 24));
        assert!(settings.profiles.is_empty());
    }

    #[test]
    fn save_then_load_keeps_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.device_name = "phone-A".into();
        settings.add_profile(DeviceProfile::new("Studio", "10.0.0.5"));
        save_settings_to(&settings, &path).unwrap();

        let loaded = load_settings_from(&path);
        assert_eq!(loaded, settings);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn legacy_layout_becomes_first_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{"tailscale_ip":"100.64.0.2","ttyd_port":0,"api_port":9090,"tmux_session":"work"}"#,
        );

        let settings = load_settings_from(&path);
        assert_eq!(settings.version, SETTINGS_VERSION);
        assert_eq!(settings.profiles.len(), 1);
        let profile = &settings.profiles[0];
        assert_eq!(profile.name, "My Mac");
        assert_eq!(profile.host, "100.64.0.2");
        assert_eq!(profile.ttyd_port, 7681);
        assert_eq!(profile.api_port, 9090);
        assert_eq!(profile.tmux_session, "work");
        assert_eq!(settings.selected().map(|p| p.id.as_str()), Some(profile.id.as_str()));

        // Written back, so a second load does not migrate again
        let reloaded = load_settings_from(&path);
        assert_eq!(reloaded.profiles, settings.profiles);
    }

    #[test]
    fn legacy_layout_with_empty_host_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"tailscale_ip":""}"#);
        assert!(load_settings_from(&path).profiles.is_empty());
    }

    #[test]
    fn malformed_fields_are_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{
                "version": 1,
                "device_name": "phone-A",
                "default_columns": "wide",
                "default_rows": 1000,
                "profiles": [
                    {"id": "p1", "name": "Mac", "host": "10.0.0.5"},
                    {"id": "p2"}
                ],
                "selected_profile": "p2"
            }"#,
        );

        let settings = load_settings_from(&path);
        assert_eq!(settings.device_name, "phone-A");
        assert_eq!(settings.default_columns, 80);
        assert_eq!(settings.default_rows, 300);
        assert_eq!(settings.profiles.len(), 1);
        assert_eq!(settings.profiles[0].id, "p1");
        assert_eq!(settings.selected_profile, None);

        // The repaired file parses directly now
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(serde_json::from_str::<Settings>(&content).is_ok());
    }

    #[test]
    fn quick_commands_default_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"version":1,"device_name":"phone-A"}"#);
        let settings = load_settings_from(&path);
        let labels: Vec<_> = settings.quick_commands.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["git status", "git diff", "ls -la", "pwd", "npm test"]);
        assert!(settings.quick_commands.iter().all(|c| !c.new_window));
    }

    #[test]
    fn quick_commands_keep_explicit_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{"version":1,"quick_commands":[{"label":"build","command":"cargo build","new_window":true}]}"#,
        );
        let settings = load_settings_from(&path);
        assert_eq!(settings.quick_commands.len(), 1);
        let command = &settings.quick_commands[0];
        assert_eq!(command.command, "cargo build");
        assert_eq!(command.description, "");
        assert!(command.new_window);
        assert!(!command.id.is_empty());

        let path = write(&dir, r#"{"version":1,"quick_commands":[]}"#);
        assert!(load_settings_from(&path).quick_commands.is_empty());
    }

    #[test]
    fn unreadable_quick_commands_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{"version":1,"default_rows":"tall","quick_commands":[{"label":"x"},{"label":"top","command":"htop"}]}"#,
        );
        let settings = load_settings_from(&path);
        assert_eq!(settings.quick_commands.len(), 1);
        assert_eq!(settings.quick_commands[0].command, "htop");
    }

    #[test]
    fn garbage_file_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "not json at all");
        let settings = load_settings_from(&path);
        assert!(settings.profiles.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not json at all");
    }

    #[test]
    fn profile_lookup() {
        let mut settings = Settings::default();
        let mac = DeviceProfile::new("Studio Mac", "10.0.0.5");
        let linux = DeviceProfile::new("Linux Box", "10.0.0.6");
        settings.add_profile(mac.clone());
        settings.add_profile(linux.clone());

        assert_eq!(settings.find_profile("studio mac").map(|p| &p.id), Some(&mac.id));
        assert_eq!(settings.find_profile(&linux.id).map(|p| &p.name), Some(&linux.name));
        assert_eq!(settings.selected().map(|p| &p.id), Some(&linux.id));
    }
}
