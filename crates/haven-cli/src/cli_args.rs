use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use haven_core::MeteredFeature;

/// Haven wallet, metering and call sessions from the terminal.
///
/// State (wallet balance, free-trial allowance, settings) lives in the data
/// directory, `$XDG_DATA_HOME/haven` by default.
#[derive(Parser, Debug)]
#[clap(name = "haven")]
pub struct Opt {
    /// Override the data directory.
    #[clap(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the wallet balance and remaining free-trial time.
    Balance,

    /// Credit the wallet.
    TopUp(TopUp),

    /// Run a metered session and print every charge.
    Meter(Meter),

    /// Place a call between two local identities over the loopback hub.
    DemoCall(DemoCall),

    /// Print the effective settings as JSON.
    Settings,
}

#[derive(Args, Debug, Clone)]
pub struct TopUp {
    /// Whole rupees to add.
    pub rupees: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Feature {
    Chat,
    Video,
}

impl From<Feature> for MeteredFeature {
    fn from(f: Feature) -> Self {
        match f {
            Feature::Chat => MeteredFeature::Chat,
            Feature::Video => MeteredFeature::VideoCall,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct Meter {
    #[clap(long, value_enum, default_value = "chat")]
    pub feature: Feature,

    /// How long to keep the session open.
    #[clap(long, default_value_t = 10)]
    pub seconds: u64,

    /// Seconds billed as one unit. Defaults to the settings value.
    #[clap(long = "tick-interval")]
    pub tick_interval: Option<u64>,

    /// Cost of one unit in paise. Defaults to the settings value.
    #[clap(long = "unit-cost")]
    pub unit_cost: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct DemoCall {
    /// Local identity. Defaults to the display name from settings, then "user1".
    #[clap(long)]
    pub caller: Option<String>,

    #[clap(long, default_value = "user2")]
    pub callee: String,

    /// Seconds to stay connected before hanging up.
    #[clap(long, default_value_t = 3)]
    pub hold: u64,
}
