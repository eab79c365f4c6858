use clap::{Parser, Subcommand};

/// lux-engine - telemetry and control for LuxPower/EG4 inverter dongles
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Optional runtime limit in seconds
    #[clap(short = 't', long = "time")]
    pub runtime: Option<u64>,

    /// Print sink events as JSON lines
    #[clap(long)]
    pub json: bool,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll every enabled inverter until stopped (the default)
    Run,

    /// Switch one control bit on or off, then exit
    Toggle {
        /// Inverter to use, defaults to the first enabled one
        #[clap(long)]
        datalog: Option<String>,

        slot: String,

        #[clap(value_parser = parse_on_off)]
        state: bool,
    },
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}

fn parse_on_off(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(format!("{} is not one of on/off", s)),
    }
}
