mod cli;
mod config;
#[cfg(unix)]
mod daemonize;
mod logging;
mod runtime;

use clap::Parser;
use eyre::Result;

use cli::DaemonArgs;

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = DaemonArgs::parse();
    let cfg = runtime::resolve(&args)?;

    logging::init(cfg.verbosity);

    // Daemonization forks the process, which must happen before the
    // tokio runtime (and its worker threads) exists.
    #[cfg(unix)]
    if !cfg.foreground {
        daemonize::daemonize()?;
    }
    #[cfg(not(unix))]
    if !cfg.foreground {
        log::warn!("daemonization is only implemented on unix; running in foreground");
    }

    #[cfg(unix)]
    if let Some(user) = &cfg.run_as {
        daemonize::drop_privileges(user)?;
    }
    #[cfg(not(unix))]
    if cfg.run_as.is_some() {
        eyre::bail!("--run-as is only implemented on unix");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(runtime::serve(cfg))
}
