use clap::Parser;
use rtc_engine_core::config::EngineConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rtc-probe")]
#[command(version)]
#[command(about = "Join a room, hold the session and report engine events", long_about = None)]
pub struct Args {
    /// Signaling server URL (ws, wss, http or https)
    #[arg(short, long)]
    pub url: String,

    /// Access token
    #[arg(short, long)]
    pub token: String,

    /// Configuration file path
    #[arg(short, long, default_value = "rtc-engine.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Disconnect after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long)]
    pub duration: Option<u64>,

    /// Send this text on the reliable data channel once connected
    #[arg(long)]
    pub send: Option<String>,
}

impl Args {
    pub fn load_config(&self) -> Result<EngineConfig, Box<dyn std::error::Error>> {
        EngineConfig::load(&self.config)
    }
}
