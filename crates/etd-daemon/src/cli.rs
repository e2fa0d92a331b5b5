//! Command-line surface (spec.md §6's flag table, plus `--config`).

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "etd-daemon", version, about = "Remote file-transfer daemon")]
pub(crate) struct DaemonArgs {
    /// Optional TOML config file; any flag below overrides its value.
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'f')]
    pub(crate) foreground: bool,

    /// Setuid/setgid to this user before serving (mutually exclusive with -f).
    #[arg(long = "run-as", value_name = "USER")]
    pub(crate) run_as: Option<String>,

    /// Log verbosity, range [-1,5].
    #[arg(short = 'm', allow_hyphen_values = true)]
    pub(crate) verbosity: Option<i8>,

    /// Default UDT MSS.
    #[arg(long)]
    pub(crate) mss: Option<u32>,

    /// Default send/receive buffer size.
    #[arg(long)]
    pub(crate) buffer: Option<usize>,

    /// Control listen address; repeatable.
    #[arg(long = "command", value_name = "URL")]
    pub(crate) command: Vec<String>,

    /// Data listen address; repeatable.
    #[arg(long = "data", value_name = "URL")]
    pub(crate) data: Vec<String>,
}
