//!
//! Resolution of the effective node configuration.
//!
//! Sources, highest precedence first: the caller supplied [`ConfigOverrides`], command line
//! flags, the TOML config file and built-in defaults. The result is an immutable
//! [`EffectiveConfig`] shared by every subsystem.
//!

use crate::args::Args;
use helm_chain::{ChainParams, Network, repair::RepairWindow};
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fmt::{Display, Formatter},
    net::SocketAddr,
    path::PathBuf,
};
use thiserror::Error;

/// Listen address of a disabled listener
pub const DISABLED_LISTEN: &str = "0.0.0.0:0";

const DEFAULT_APP_DIR: &str = ".helmd";
const DEFAULT_LOG_DIR: &str = "logs";

/// Default listen addresses per network
struct NetworkBinds {
    rpc: &'static str,
    p2p: &'static str,
    getwork: &'static str,
}

const MAINNET_BINDS: NetworkBinds = NetworkBinds { rpc: "127.0.0.1:10102", p2p: "0.0.0.0:18089", getwork: "0.0.0.0:10100" };
const TESTNET_BINDS: NetworkBinds = NetworkBinds { rpc: "127.0.0.1:40402", p2p: "0.0.0.0:40401", getwork: "0.0.0.0:10100" };

fn network_binds(network: Network) -> &'static NetworkBinds {
    match network {
        Network::Mainnet => &MAINNET_BINDS,
        Network::Testnet => &TESTNET_BINDS,
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid option --{option}: {reason}")]
    InvalidOption { option: String, reason: String },

    #[error(transparent)]
    Cli(#[from] clap::Error),
}

impl ConfigError {
    fn invalid(option: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidOption { option: option.to_string(), reason: reason.into() }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl ConfigValue {
    fn kind(&self) -> &'static str {
        match self {
            ConfigValue::Bool(_) => "a boolean",
            ConfigValue::Int(_) => "an integer",
            ConfigValue::Str(_) => "a string",
            ConfigValue::List(_) => "a list",
        }
    }
}

impl Display for ConfigValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Bool(value) => write!(f, "{}", value),
            ConfigValue::Int(value) => write!(f, "{}", value),
            ConfigValue::Str(value) => f.write_str(value),
            ConfigValue::List(values) => write!(f, "[{}]", values.join(", ")),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Str(value)
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(values: Vec<String>) -> Self {
        ConfigValue::List(values)
    }
}

/// Option values forced by the embedding caller. Keys are option names, leading dashes are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    values: BTreeMap<String, ConfigValue>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, option: &str, value: impl Into<ConfigValue>) -> Self {
        self.insert(option, value);
        self
    }

    pub fn insert(&mut self, option: &str, value: impl Into<ConfigValue>) {
        self.values.insert(option.trim_start_matches('-').to_string(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.values.iter().map(|(option, value)| (option.as_str(), value))
    }
}

fn expect_bool(option: &str, value: &ConfigValue) -> ConfigResult<bool> {
    match value {
        ConfigValue::Bool(value) => Ok(*value),
        ConfigValue::Str(value) => value.parse().map_err(|_| ConfigError::invalid(option, format!("expected a boolean, got '{}'", value))),
        other => Err(ConfigError::invalid(option, format!("expected a boolean, got {}", other.kind()))),
    }
}

fn expect_string(option: &str, value: &ConfigValue) -> ConfigResult<String> {
    match value {
        ConfigValue::Str(value) => Ok(value.clone()),
        ConfigValue::Int(value) => Ok(value.to_string()),
        other => Err(ConfigError::invalid(option, format!("expected a string, got {}", other.kind()))),
    }
}

fn expect_list(option: &str, value: &ConfigValue) -> ConfigResult<Vec<String>> {
    match value {
        ConfigValue::List(values) => Ok(values.clone()),
        ConfigValue::Str(value) => Ok(vec![value.clone()]),
        other => Err(ConfigError::invalid(option, format!("expected a list, got {}", other.kind()))),
    }
}

fn expect_int<T: TryFrom<i64> + std::str::FromStr>(option: &str, value: &ConfigValue) -> ConfigResult<T> {
    match value {
        ConfigValue::Int(value) => T::try_from(*value).map_err(|_| ConfigError::invalid(option, format!("{} is out of range", value))),
        ConfigValue::Str(value) => value.parse().map_err(|_| ConfigError::invalid(option, format!("expected an integer, got '{}'", value))),
        other => Err(ConfigError::invalid(option, format!("expected an integer, got {}", other.kind()))),
    }
}

impl Args {
    /// Replaces the value of `option` with `value`
    pub fn apply_override(&mut self, option: &str, value: &ConfigValue) -> ConfigResult<()> {
        match option {
            "testnet" => self.testnet = expect_bool(option, value)?,
            "rpc-bind" => self.rpc_bind = Some(expect_string(option, value)?),
            "p2p-bind" => self.p2p_bind = Some(expect_string(option, value)?),
            "getwork-bind" => self.getwork_bind = Some(expect_string(option, value)?),
            "add-exclusive-node" => self.add_exclusive_node = expect_list(option, value)?,
            "add-priority-node" => self.add_priority_node = expect_list(option, value)?,
            "min-peers" => self.min_peers = expect_int(option, value)?,
            "node-tag" => self.node_tag = Some(expect_string(option, value)?),
            "integrator-address" => self.integrator_address = Some(expect_string(option, value)?),
            "prune-history" => self.prune_history = Some(expect_string(option, value)?),
            "socks-proxy" => self.socks_proxy = Some(expect_string(option, value)?),
            "data-dir" => self.data_dir = Some(expect_string(option, value)?),
            "fastsync" => self.fastsync = expect_bool(option, value)?,
            "timeisinsync" => self.time_is_in_sync = expect_bool(option, value)?,
            "sync-node" => self.sync_node = expect_bool(option, value)?,
            "debug" => self.debug = expect_bool(option, value)?,
            "clog-level" => self.clog_level = expect_int(option, value)?,
            "flog-level" => self.flog_level = expect_int(option, value)?,
            "logdir" => self.logdir = Some(expect_string(option, value)?),
            "nologfiles" => self.no_log_files = expect_bool(option, value)?,
            "async-threads" => self.async_threads = expect_int(option, value)?,
            "repair-anchor" => self.repair_anchor = expect_int(option, value)?,
            "repair-depth" => self.repair_depth = expect_int(option, value)?,
            _ => return Err(ConfigError::invalid(option, "unknown option")),
        }
        Ok(())
    }
}

/// The resolved node configuration. Built once at startup, read-only afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub network: Network,
    pub rpc_bind: SocketAddr,
    pub p2p_bind: SocketAddr,
    pub getwork_bind: SocketAddr,
    pub exclusive_nodes: Vec<String>,
    pub priority_nodes: Vec<String>,
    pub min_peers: u64,
    pub node_tag: Option<String>,
    pub integrator_address: Option<String>,
    pub prune_history: Option<u64>,
    pub socks_proxy: Option<String>,
    /// Base data directory, one subdirectory per network lives below it
    pub app_dir: PathBuf,
    pub fastsync: bool,
    pub time_is_in_sync: bool,
    pub sync_node: bool,
    pub debug: bool,
    pub clog_level: u8,
    pub flog_level: u8,
    /// `None` when file logging is disabled
    pub log_dir: Option<PathBuf>,
    pub async_threads: usize,
    pub repair_depth: u64,
    pub repair_window: RepairWindow,
}

impl EffectiveConfig {
    pub fn is_testnet(&self) -> bool {
        !self.network.is_mainnet()
    }

    /// Network specific data directory
    pub fn data_dir(&self) -> PathBuf {
        self.app_dir.join(self.network.name())
    }

    /// Resolved value of `option` (leading dashes ignored), `None` for unset optional values
    /// and unknown names
    pub fn get(&self, option: &str) -> Option<ConfigValue> {
        let int = |value: u64| ConfigValue::Int(i64::try_from(value).unwrap_or(i64::MAX));
        let value: ConfigValue = match option.trim_start_matches('-') {
            "testnet" => self.is_testnet().into(),
            "rpc-bind" => self.rpc_bind.to_string().into(),
            "p2p-bind" => self.p2p_bind.to_string().into(),
            "getwork-bind" => self.getwork_bind.to_string().into(),
            "add-exclusive-node" => self.exclusive_nodes.clone().into(),
            "add-priority-node" => self.priority_nodes.clone().into(),
            "min-peers" => int(self.min_peers),
            "node-tag" => self.node_tag.clone()?.into(),
            "integrator-address" => self.integrator_address.clone()?.into(),
            "prune-history" => int(self.prune_history?),
            "socks-proxy" => self.socks_proxy.clone()?.into(),
            "data-dir" => self.app_dir.display().to_string().into(),
            "fastsync" => self.fastsync.into(),
            "timeisinsync" => self.time_is_in_sync.into(),
            "sync-node" => self.sync_node.into(),
            "debug" => self.debug.into(),
            "clog-level" => int(self.clog_level as u64),
            "flog-level" => int(self.flog_level as u64),
            "logdir" => self.log_dir.as_ref()?.display().to_string().into(),
            "nologfiles" => self.log_dir.is_none().into(),
            "async-threads" => int(self.async_threads as u64),
            "repair-anchor" => int(self.repair_window.anchor),
            "repair-depth" => int(self.repair_depth),
            _ => return None,
        };
        Some(value)
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams {
            network: self.network,
            data_dir: self.data_dir(),
            integrator_address: self.integrator_address.clone(),
            fastsync: self.fastsync && !self.sync_node,
            time_is_in_sync: self.time_is_in_sync,
        }
    }

    /// Listener addresses with port 0 are disabled
    pub fn is_enabled(bind: &SocketAddr) -> bool {
        bind.port() != 0
    }
}

/// Resolves the configuration from the process arguments
pub fn resolve(overrides: &ConfigOverrides) -> ConfigResult<EffectiveConfig> {
    resolve_from(overrides, std::env::args_os())
}

/// Resolves the configuration from `itr` (program name first)
pub fn resolve_from<I, T>(overrides: &ConfigOverrides, itr: I) -> ConfigResult<EffectiveConfig>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut args = Args::parse(itr)?;
    for (option, value) in overrides.iter() {
        args.apply_override(option, value)?;
    }
    finalize(args)
}

fn parse_bind(option: &str, value: Option<&str>, default: &str) -> ConfigResult<SocketAddr> {
    let value = value.unwrap_or(default);
    value.parse().map_err(|_| ConfigError::invalid(option, format!("'{}' is not an IP:PORT address", value)))
}

fn parse_prune_history(value: &str) -> ConfigResult<u64> {
    match value.trim().parse::<u64>() {
        Ok(topoheight) if topoheight > 1 => Ok(topoheight),
        Ok(_) => Err(ConfigError::invalid("prune-history", format!("topoheight must be greater than 1, got {}", value))),
        Err(_) => Err(ConfigError::invalid("prune-history", format!("'{}' is not a valid topoheight", value))),
    }
}

fn validate_proxy(value: &str) -> ConfigResult<()> {
    match value.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok_and(|port| port != 0) => Ok(()),
        _ => Err(ConfigError::invalid("socks-proxy", format!("'{}' is not a HOST:PORT address", value))),
    }
}

fn get_home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    return dirs::data_local_dir();
    #[cfg(not(target_os = "windows"))]
    return dirs::home_dir();
}

fn expand_home(path: &str) -> ConfigResult<PathBuf> {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home = get_home_dir().ok_or_else(|| ConfigError::invalid("data-dir", "cannot resolve the home directory"))?;
            Ok(home.join(rest.trim_start_matches(['/', '\\'])))
        }
        None => Ok(PathBuf::from(path)),
    }
}

fn finalize(args: Args) -> ConfigResult<EffectiveConfig> {
    if args.logdir.is_some() && args.no_log_files {
        return Err(ConfigError::invalid("logdir", "cannot be combined with --nologfiles"));
    }
    if args.async_threads == 0 {
        return Err(ConfigError::invalid("async-threads", "at least one thread is required"));
    }

    let network = if args.testnet { Network::Testnet } else { Network::Mainnet };
    let binds = network_binds(network);
    let rpc_bind = parse_bind("rpc-bind", args.rpc_bind.as_deref(), binds.rpc)?;
    let mut p2p_bind = parse_bind("p2p-bind", args.p2p_bind.as_deref(), binds.p2p)?;
    let getwork_bind = parse_bind("getwork-bind", args.getwork_bind.as_deref(), binds.getwork)?;

    let prune_history = args.prune_history.as_deref().map(parse_prune_history).transpose()?;

    let socks_proxy = args.socks_proxy.filter(|proxy| !proxy.is_empty());
    if let Some(proxy) = socks_proxy.as_deref() {
        validate_proxy(proxy)?;
        // Never advertise an inbound address while hiding behind a proxy
        p2p_bind = parse_bind("p2p-bind", Some(DISABLED_LISTEN), DISABLED_LISTEN)?;
    }

    let app_dir = match args.data_dir.as_deref().filter(|dir| !dir.is_empty()) {
        Some(dir) => expand_home(dir)?,
        None => get_home_dir()
            .ok_or_else(|| ConfigError::invalid("data-dir", "cannot resolve the home directory, set it explicitly"))?
            .join(DEFAULT_APP_DIR),
    };
    let log_dir = match (args.no_log_files, args.logdir.as_deref()) {
        (true, _) => None,
        (false, Some(dir)) if !dir.is_empty() => Some(expand_home(dir)?),
        (false, _) => Some(app_dir.join(network.name()).join(DEFAULT_LOG_DIR)),
    };

    Ok(EffectiveConfig {
        network,
        rpc_bind,
        p2p_bind,
        getwork_bind,
        exclusive_nodes: args.add_exclusive_node,
        priority_nodes: args.add_priority_node,
        min_peers: args.min_peers,
        node_tag: args.node_tag,
        integrator_address: args.integrator_address,
        prune_history,
        socks_proxy,
        app_dir,
        fastsync: args.fastsync,
        time_is_in_sync: args.time_is_in_sync,
        sync_node: args.sync_node,
        debug: args.debug,
        clog_level: args.clog_level,
        flog_level: args.flog_level,
        log_dir,
        async_threads: args.async_threads,
        repair_depth: args.repair_depth,
        repair_window: RepairWindow::with_depth(args.repair_anchor, args.repair_depth),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_args(overrides: &ConfigOverrides, args: &[&str]) -> ConfigResult<EffectiveConfig> {
        let itr = std::iter::once("helmd").chain(args.iter().copied()).chain(std::iter::once("--data-dir=/tmp/helmd-test"));
        resolve_from(overrides, itr)
    }

    #[test]
    fn test_overrides_win_over_flags() {
        let overrides = ConfigOverrides::new().with("--min-peers", 3i64).with("node-tag", "override");
        let config = resolve_args(&overrides, &["--min-peers=20", "--node-tag=flag", "--rpc-bind=127.0.0.1:9999"]).unwrap();
        assert_eq!(config.get("min-peers"), Some(ConfigValue::Int(3)));
        assert_eq!(config.get("node-tag"), Some(ConfigValue::Str("override".into())));
        assert_eq!(config.get("rpc-bind"), Some(ConfigValue::Str("127.0.0.1:9999".into())));
        assert_eq!(config.get("fastsync"), Some(ConfigValue::Bool(false)));
    }

    #[test]
    fn test_testnet_defaults_to_false() {
        let config = resolve_args(&ConfigOverrides::new(), &[]).unwrap();
        assert_eq!(config.get("testnet"), Some(ConfigValue::Bool(false)));
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.rpc_bind.to_string(), MAINNET_BINDS.rpc);
        assert_eq!(config.app_dir, PathBuf::from("/tmp/helmd-test"));
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/helmd-test/mainnet"));
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/helmd-test/mainnet/logs")));
    }

    #[test]
    fn test_testnet_selects_network_defaults() {
        let config = resolve_args(&ConfigOverrides::new(), &["--testnet"]).unwrap();
        assert!(config.is_testnet());
        assert_eq!(config.p2p_bind.to_string(), TESTNET_BINDS.p2p);
        assert_eq!(config.getwork_bind.to_string(), TESTNET_BINDS.getwork);

        let config = resolve_args(&ConfigOverrides::new().with("testnet", false), &["--testnet"]).unwrap();
        assert!(!config.is_testnet());
    }

    #[test]
    fn test_socks_proxy_disables_p2p_listen() {
        for p2p_override in [None, Some("0.0.0.0:18089"), Some("10.1.1.1:5000")] {
            let mut overrides = ConfigOverrides::new().with("socks-proxy", "127.0.0.1:9050");
            if let Some(bind) = p2p_override {
                overrides.insert("p2p-bind", bind);
            }
            let config = resolve_args(&overrides, &["--p2p-bind=0.0.0.0:1234"]).unwrap();
            assert_eq!(config.get("p2p-bind"), Some(ConfigValue::Str(DISABLED_LISTEN.into())));
            assert!(!EffectiveConfig::is_enabled(&config.p2p_bind));
        }

        let err = resolve_args(&ConfigOverrides::new().with("socks-proxy", "nope"), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { option, .. } if option == "socks-proxy"));
    }

    #[test]
    fn test_prune_history_validation() {
        for bad in ["1", "0", "-5", "abc"] {
            let err = resolve_args(&ConfigOverrides::new().with("prune-history", bad), &[]).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidOption { ref option, .. } if option == "prune-history"), "{} => {}", bad, err);
        }
        let config = resolve_args(&ConfigOverrides::new().with("prune-history", "50"), &[]).unwrap();
        assert_eq!(config.prune_history, Some(50));
        assert_eq!(config.get("prune-history"), Some(ConfigValue::Int(50)));

        assert!(resolve_args(&ConfigOverrides::new(), &["--prune-history=1"]).is_err());
        assert_eq!(resolve_args(&ConfigOverrides::new(), &["--prune-history=7"]).unwrap().prune_history, Some(7));
    }

    #[test]
    fn test_invalid_overrides() {
        let err = resolve_args(&ConfigOverrides::new().with("no-such-option", true), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { option, .. } if option == "no-such-option"));
        assert!(resolve_args(&ConfigOverrides::new().with("testnet", 1i64), &[]).is_err());
        assert!(resolve_args(&ConfigOverrides::new().with("min-peers", -1i64), &[]).is_err());
        assert!(resolve_args(&ConfigOverrides::new().with("rpc-bind", "localhost"), &[]).is_err());
    }

    #[test]
    fn test_log_dir_options() {
        let config = resolve_args(&ConfigOverrides::new(), &["--nologfiles"]).unwrap();
        assert_eq!(config.log_dir, None);
        let config = resolve_args(&ConfigOverrides::new(), &["--logdir=/var/log/helmd"]).unwrap();
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/helmd")));
        assert!(resolve_args(&ConfigOverrides::new(), &["--logdir=/var/log/helmd", "--nologfiles"]).is_err());
    }

    #[test]
    fn test_overridden_values_are_reported_as_given() {
        let overrides = ConfigOverrides::new().with("data-dir", "/srv/helm").with("async-threads", 2i64).with("testnet", true);
        let config = resolve_from(&overrides, ["helmd", "--data-dir=/flag", "--async-threads=8"]).unwrap();
        assert_eq!(config.get("data-dir"), Some(ConfigValue::Str("/srv/helm".into())));
        assert_eq!(config.get("async-threads"), Some(ConfigValue::Int(2)));
        assert_eq!(config.data_dir(), PathBuf::from("/srv/helm/testnet"));
        assert_eq!(config.chain_params().data_dir, PathBuf::from("/srv/helm/testnet"));
        assert_eq!(config.log_dir, Some(PathBuf::from("/srv/helm/testnet/logs")));
    }

    #[test]
    fn test_zero_async_threads_is_rejected() {
        let err = resolve_args(&ConfigOverrides::new().with("async-threads", 0i64), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { option, .. } if option == "async-threads"));
        assert!(resolve_args(&ConfigOverrides::new(), &["--async-threads=0"]).is_err());
    }

    #[test]
    fn test_repair_depth_deeper_than_anchor() {
        let overrides = ConfigOverrides::new().with("repair-anchor", 50i64).with("repair-depth", 100i64);
        let config = resolve_args(&overrides, &[]).unwrap();
        assert_eq!(config.get("repair-depth"), Some(ConfigValue::Int(100)));
        assert_eq!(config.repair_window, RepairWindow::new(50, 0));
    }

    #[test]
    fn test_repair_window_from_flags() {
        let config = resolve_args(&ConfigOverrides::new(), &["--repair-anchor=500", "--repair-depth=20"]).unwrap();
        assert_eq!(config.repair_window, RepairWindow::new(500, 480));
        let config = resolve_args(&ConfigOverrides::new(), &[]).unwrap();
        assert_eq!(config.repair_window, RepairWindow::default());
    }
}
