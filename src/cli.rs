//! Command-line interface: just enough to point at a config file and set
//! the log level.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "modmqtt-bridge", about = "Bridge an MQTT bus to Modbus RTU/TCP fieldbus networks")]
pub struct Args {
    /// Path to the bridge's TOML configuration file.
    #[arg(short, long, default_value = "modmqtt-bridge.toml")]
    pub config: std::path::PathBuf,

    /// Increase log verbosity; repeatable (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decrease log verbosity; repeatable (-q, -qq).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Args {
    /// Net verbosity relative to the default `info` level.
    pub fn log_level(&self) -> log::LevelFilter {
        let base = 2i8; // Info
        let level = base + self.verbose as i8 - self.quiet as i8;
        match level.clamp(0, 4) {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}
