use clap::Parser;

/// Simulated collaboration session over a high-latency in-memory network.
#[derive(Parser, Debug, Clone)]
#[command(name = "duet-sim")]
#[command(about = "Run a host and several clients editing shared documents concurrently")]
#[command(version)]
pub struct Cli {
    /// Number of clients connected to the host
    #[arg(short, long, default_value_t = 3)]
    pub clients: usize,

    /// Number of shared documents
    #[arg(short, long, default_value_t = 2)]
    pub documents: usize,

    /// Edits made by each client
    #[arg(short, long, default_value_t = 200)]
    pub edits: usize,

    /// Seed for edits and network delays (random when omitted)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Upper bound of the per-message network delay
    #[arg(long, value_name = "MS", default_value_t = 5)]
    pub max_delay_ms: u64,

    /// Upper bound of the pause between two edits of one client
    #[arg(long, value_name = "MS", default_value_t = 3)]
    pub pace_ms: u64,

    /// Interval between watchdog checksum cycles
    #[arg(long, value_name = "MS", default_value_t = 25)]
    pub checksum_interval_ms: u64,

    /// How long the host waits for every client to confirm the final state
    #[arg(long, value_name = "MS", default_value_t = 10_000)]
    pub settle_timeout_ms: u64,

    /// Corrupt the first client's copy once, without telling anyone
    #[arg(long)]
    pub corrupt: bool,
}
