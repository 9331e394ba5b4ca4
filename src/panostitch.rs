// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

mod cli;

use simplelog::{ ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger, TerminalMode, WriteLogger };

fn init_logging() {
    let log_config = ConfigBuilder::new()
        .add_filter_ignore_str("wgpu")
        .add_filter_ignore_str("naga")
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .set_time_format_rfc3339()
        .build();

    let level = match std::env::var("PANOSTITCH_LOG").as_deref() {
        Ok("trace") => LevelFilter::Trace,
        Ok("info")  => LevelFilter::Info,
        Ok("warn")  => LevelFilter::Warn,
        _ => LevelFilter::Debug,
    };

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(level, log_config.clone(), TerminalMode::Mixed, ColorChoice::Auto)
    ];
    if let Ok(path) = std::env::var("PANOSTITCH_LOG_FILE") {
        match std::fs::File::create(&path) {
            Ok(file) => loggers.push(WriteLogger::new(LevelFilter::Debug, log_config, file)),
            Err(e) => eprintln!("Failed to create log file {}: {:?}", path, e),
        }
    }
    let _ = CombinedLogger::init(loggers);
}

fn main() {
    init_logging();
    log_panics::init();

    if !cli::will_run_in_console() {
        log::info!("Panostitch v{}, run with --help for usage", env!("CARGO_PKG_VERSION"));
        return;
    }

    if !cli::run() {
        std::process::exit(1);
    }
}
