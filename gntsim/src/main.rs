//! Grant table simulator
//!
//! Boots a simulated hypervisor with the grant table limits given as `key=value` boot parameters
//! and runs a set of guest scenarios against it.

#![deny(missing_docs)]

use {
    config::Config,
    log::{error, info, warn},
    std::{env, process},
};

mod config;
mod logger;
mod scenarios;

fn main() {
    let config = match Config::parse(env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gntsim: {}", e);
            process::exit(2);
        }
    };

    logger::init(config.log_level);

    println!();
    println!("   __ _ _ __ | |_ ___(_)_ __ ___  ");
    println!("  / _` | '_ \\| __/ __| | '_ ` _ \\ ");
    println!(" | (_| | | | | |_\\__ \\ | | | | | |");
    println!("  \\__, |_| |_|\\__|___/_|_| |_| |_|");
    println!("  |___/                           ");
    println!();
    print_config(&config);

    for parameter in &config.unknown {
        warn!("ignoring unknown boot parameter {}", parameter);
    }

    let failed = scenarios::run(&config);
    if failed > 0 {
        error!("{} scenarios failed", failed);
        process::exit(1);
    }

    info!("all scenarios passed");
}

fn print_config(config: &Config) {
    println!("    gnttab_initial_frames: {}", config.grant_table.initial_frames);
    println!("    gnttab_max_frames: {}", config.grant_table.max_grant_frames);
    println!(
        "    gnttab_max_maptrack_frames: {}",
        config.grant_table.max_maptrack_frames
    );
    println!("    loglvl: {}", config.log_level);
}
