use helm_core::{
    error, info,
    log::try_init_logger,
    panic::{FATAL_EXIT_CODE, configure_panic},
    signals::Signals,
    warn,
};
use helmd_lib::{
    config::{ConfigError, ConfigOverrides, resolve},
    daemon::{create_daemon, init_logging, log_banner},
};
use std::{process::exit, sync::Arc};

fn fail(message: String) -> ! {
    // The configured logger may not be installed yet
    try_init_logger("info");
    error!("{}", message);
    exit(FATAL_EXIT_CODE);
}

pub fn main() {
    let config = match resolve(&ConfigOverrides::new()) {
        Ok(config) => config,
        Err(ConfigError::Cli(err)) => err.exit(),
        Err(err) => fail(err.to_string()),
    };

    if let Err(err) = init_logging(&config) {
        fail(format!("failed to initialize the logger: {}", err));
    }
    configure_panic();
    log_banner(&config);

    let (core, daemon) = match create_daemon(config) {
        Ok(created) => created,
        Err(err) => fail(err.to_string()),
    };

    // Bind the interrupt signals to the core
    if let Err(err) = Arc::new(Signals::new(&core)).init() {
        warn!("Unable to install the interrupt handler: {}", err);
    }

    core.run();
    let exit_code = daemon.exit_code();
    info!("helmd has stopped...");
    exit(exit_code);
}
