use clap::{Arg, ArgAction, Command, arg, parser::ValueSource::DefaultValue};
use helm_chain::repair::{DEFAULT_REPAIR_ANCHOR, DEFAULT_REPAIR_DEPTH};
use serde::Deserialize;
use std::{ffi::OsString, fs};
use toml::from_str;

pub const DEFAULT_MIN_PEERS: u64 = 11;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Args {
    // NOTE: property names match config file fields and override keys
    pub testnet: bool,
    pub rpc_bind: Option<String>,
    pub p2p_bind: Option<String>,
    pub getwork_bind: Option<String>,
    pub add_exclusive_node: Vec<String>,
    pub add_priority_node: Vec<String>,
    pub min_peers: u64,
    pub node_tag: Option<String>,
    pub integrator_address: Option<String>,
    /// Kept raw, validated by the resolver
    pub prune_history: Option<String>,
    pub socks_proxy: Option<String>,
    pub data_dir: Option<String>,
    pub fastsync: bool,
    #[serde(rename = "timeisinsync")]
    pub time_is_in_sync: bool,
    pub sync_node: bool,
    pub debug: bool,
    pub clog_level: u8,
    pub flog_level: u8,
    pub logdir: Option<String>,
    #[serde(rename = "nologfiles")]
    pub no_log_files: bool,
    pub async_threads: usize,
    pub repair_anchor: u64,
    pub repair_depth: u64,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            testnet: false,
            rpc_bind: None,
            p2p_bind: None,
            getwork_bind: None,
            add_exclusive_node: vec![],
            add_priority_node: vec![],
            min_peers: DEFAULT_MIN_PEERS,
            node_tag: None,
            integrator_address: None,
            prune_history: None,
            socks_proxy: None,
            data_dir: None,
            fastsync: false,
            time_is_in_sync: false,
            sync_node: false,
            debug: false,
            clog_level: 0,
            flog_level: 0,
            logdir: None,
            no_log_files: false,
            async_threads: num_cpus::get(),
            repair_anchor: DEFAULT_REPAIR_ANCHOR,
            repair_depth: DEFAULT_REPAIR_DEPTH,
        }
    }
}

pub fn cli() -> Command {
    let defaults: Args = Default::default();

    Command::new("helmd")
        .about(format!("{} v{}", env!("CARGO_PKG_DESCRIPTION"), env!("CARGO_PKG_VERSION")))
        .version(env!("CARGO_PKG_VERSION"))
        .arg(arg!(-C --configfile <CONFIG_FILE> "Path of a TOML config file."))
        .arg(arg!(--testnet "Use the test network"))
        .arg(
            Arg::new("rpc-bind")
                .long("rpc-bind")
                .env("HELMD_RPC_BIND")
                .value_name("IP:PORT")
                .require_equals(true)
                .help("Interface:port for the RPC server, port 0 disables it (default: 127.0.0.1:10102, testnet: 127.0.0.1:40402)."),
        )
        .arg(
            Arg::new("p2p-bind")
                .long("p2p-bind")
                .env("HELMD_P2P_BIND")
                .value_name("IP:PORT")
                .require_equals(true)
                .help("Interface:port to listen for peers, port 0 disables listening (default: 0.0.0.0:18089, testnet: 0.0.0.0:40401)."),
        )
        .arg(
            Arg::new("getwork-bind")
                .long("getwork-bind")
                .env("HELMD_GETWORK_BIND")
                .value_name("IP:PORT")
                .require_equals(true)
                .help("Interface:port for the getwork server, port 0 disables it (default: 0.0.0.0:10100)."),
        )
        .arg(
            Arg::new("add-exclusive-node")
                .long("add-exclusive-node")
                .env("HELMD_ADD_EXCLUSIVE_NODE")
                .value_name("IP:PORT")
                .action(ArgAction::Append)
                .require_equals(true)
                .help("Connect only to the specified peers."),
        )
        .arg(
            Arg::new("add-priority-node")
                .long("add-priority-node")
                .env("HELMD_ADD_PRIORITY_NODE")
                .value_name("IP:PORT")
                .action(ArgAction::Append)
                .require_equals(true)
                .help("Always keep a connection to the specified peers."),
        )
        .arg(
            Arg::new("min-peers")
                .long("min-peers")
                .env("HELMD_MIN_PEERS")
                .value_name("min-peers")
                .require_equals(true)
                .value_parser(clap::value_parser!(u64))
                .help(format!("Number of peers to keep connected (default: {}).", defaults.min_peers)),
        )
        .arg(Arg::new("node-tag").long("node-tag").env("HELMD_NODE_TAG").require_equals(true).help("Tag announced to peers."))
        .arg(
            Arg::new("integrator-address")
                .long("integrator-address")
                .env("HELMD_INTEGRATOR_ADDRESS")
                .require_equals(true)
                .help("Address receiving integrator rewards for blocks mined through this node."),
        )
        .arg(
            Arg::new("prune-history")
                .long("prune-history")
                .env("HELMD_PRUNE_HISTORY")
                .value_name("TOPOHEIGHT")
                .require_equals(true)
                .help("Discard block history below the given topoheight (must be > 1) before starting."),
        )
        .arg(
            Arg::new("socks-proxy")
                .long("socks-proxy")
                .env("HELMD_SOCKS_PROXY")
                .value_name("HOST:PORT")
                .require_equals(true)
                .help("Route peer traffic through a SOCKS proxy. Disables listening for peers."),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .env("HELMD_DATA_DIR")
                .value_name("DATA_DIR")
                .require_equals(true)
                .help("Directory to store data (default: ~/.helmd)."),
        )
        .arg(arg!(--fastsync "Bootstrap from a recent state snapshot instead of replaying history"))
        .arg(arg!(--timeisinsync "Trust the local clock, skip time synchronization"))
        .arg(arg!(--"sync-node" "Sync the full history from peers, never fast sync"))
        .arg(arg!(--debug "Log at debug level or above on the console"))
        .arg(
            Arg::new("clog-level")
                .long("clog-level")
                .env("HELMD_CLOG_LEVEL")
                .value_name("0-127")
                .require_equals(true)
                .value_parser(clap::value_parser!(u8).range(0..=127))
                .help("Console log verbosity: 0 info, 1 debug, 2 and above trace."),
        )
        .arg(
            Arg::new("flog-level")
                .long("flog-level")
                .env("HELMD_FLOG_LEVEL")
                .value_name("0-127")
                .require_equals(true)
                .value_parser(clap::value_parser!(u8).range(0..=127))
                .help("File log verbosity: 0 info, 1 debug, 2 and above trace."),
        )
        .arg(arg!(--logdir <LOG_DIR> "Directory to log output (default: <data-dir>/logs)."))
        .arg(arg!(--nologfiles "Disable logging to files."))
        .arg(
            Arg::new("async-threads")
                .short('t')
                .long("async-threads")
                .env("HELMD_ASYNC_THREADS")
                .value_name("async-threads")
                .require_equals(true)
                .value_parser(clap::value_parser!(usize))
                .help(format!("Specify number of async threads (default: {}).", defaults.async_threads)),
        )
        .arg(
            Arg::new("repair-anchor")
                .long("repair-anchor")
                .env("HELMD_REPAIR_ANCHOR")
                .value_name("TOPOHEIGHT")
                .require_equals(true)
                .value_parser(clap::value_parser!(u64))
                .help(format!("Topoheight the startup index repair walks down from (default: {}).", defaults.repair_anchor)),
        )
        .arg(
            Arg::new("repair-depth")
                .long("repair-depth")
                .env("HELMD_REPAIR_DEPTH")
                .value_name("HEIGHTS")
                .require_equals(true)
                .value_parser(clap::value_parser!(u64))
                .help(format!("Number of heights below the anchor the startup index repair verifies (default: {}).", defaults.repair_depth)),
        )
}

impl Args {
    /// Parses `itr` (program name first) on top of the config file given by `--configfile`, if any
    pub fn parse<I, T>(itr: I) -> Result<Args, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let m: clap::ArgMatches = cli().try_get_matches_from(itr)?;
        let mut defaults: Args = Default::default();

        if let Some(config_file) = m.get_one::<String>("configfile") {
            let config_str = fs::read_to_string(config_file)?;
            defaults = from_str(&config_str).map_err(|toml_error| {
                clap::Error::raw(
                    clap::error::ErrorKind::ValueValidation,
                    format!("failed parsing config file, reason: {}", toml_error.message()),
                )
            })?;
        }

        let args = Args {
            testnet: arg_match_unwrap_or::<bool>(&m, "testnet", defaults.testnet),
            rpc_bind: m.get_one::<String>("rpc-bind").cloned().or(defaults.rpc_bind),
            p2p_bind: m.get_one::<String>("p2p-bind").cloned().or(defaults.p2p_bind),
            getwork_bind: m.get_one::<String>("getwork-bind").cloned().or(defaults.getwork_bind),
            add_exclusive_node: arg_match_many_unwrap_or::<String>(&m, "add-exclusive-node", defaults.add_exclusive_node),
            add_priority_node: arg_match_many_unwrap_or::<String>(&m, "add-priority-node", defaults.add_priority_node),
            min_peers: arg_match_unwrap_or::<u64>(&m, "min-peers", defaults.min_peers),
            node_tag: m.get_one::<String>("node-tag").cloned().or(defaults.node_tag),
            integrator_address: m.get_one::<String>("integrator-address").cloned().or(defaults.integrator_address),
            prune_history: m.get_one::<String>("prune-history").cloned().or(defaults.prune_history),
            socks_proxy: m.get_one::<String>("socks-proxy").cloned().or(defaults.socks_proxy),
            data_dir: m.get_one::<String>("data-dir").cloned().or(defaults.data_dir),
            fastsync: arg_match_unwrap_or::<bool>(&m, "fastsync", defaults.fastsync),
            time_is_in_sync: arg_match_unwrap_or::<bool>(&m, "timeisinsync", defaults.time_is_in_sync),
            sync_node: arg_match_unwrap_or::<bool>(&m, "sync-node", defaults.sync_node),
            debug: arg_match_unwrap_or::<bool>(&m, "debug", defaults.debug),
            clog_level: arg_match_unwrap_or::<u8>(&m, "clog-level", defaults.clog_level),
            flog_level: arg_match_unwrap_or::<u8>(&m, "flog-level", defaults.flog_level),
            logdir: m.get_one::<String>("logdir").cloned().or(defaults.logdir),
            no_log_files: arg_match_unwrap_or::<bool>(&m, "nologfiles", defaults.no_log_files),
            async_threads: arg_match_unwrap_or::<usize>(&m, "async-threads", defaults.async_threads),
            repair_anchor: arg_match_unwrap_or::<u64>(&m, "repair-anchor", defaults.repair_anchor),
            repair_depth: arg_match_unwrap_or::<u64>(&m, "repair-depth", defaults.repair_depth),
        };

        Ok(args)
    }
}

fn arg_match_unwrap_or<T: Clone + Send + Sync + 'static>(m: &clap::ArgMatches, arg_id: &str, default: T) -> T {
    m.get_one::<T>(arg_id).cloned().filter(|_| m.value_source(arg_id) != Some(DefaultValue)).unwrap_or(default)
}

fn arg_match_many_unwrap_or<T: Clone + Send + Sync + 'static>(m: &clap::ArgMatches, arg_id: &str, default: Vec<T>) -> Vec<T> {
    match m.get_many::<T>(arg_id) {
        Some(val_ref) => val_ref.cloned().collect(),
        None => default,
    }
}
