//! Flag/config resolution and the accept-loop/signal runtime (spec.md §5,
//! §6). CLI flags always override the config file; the config file only
//! fills in defaults for flags the user omitted.

use eyre::{bail, Result};
use etd_core::channel::Listener;
use etd_core::endpoint_factory::{mk_server, SocketSettings};
use etd_core::shared_state::SharedState;
use etd_core::sockname::{EndpointUrl, Sockname};
use log::{info, warn};

use crate::cli::DaemonArgs;
use crate::config;

pub(crate) const DEFAULT_CONTROL_PORT: u16 = 4004;
pub(crate) const DEFAULT_DATA_PORT: u16 = 8008;

pub(crate) struct ResolvedConfig {
    pub(crate) foreground: bool,
    pub(crate) run_as: Option<String>,
    pub(crate) verbosity: i8,
    pub(crate) mss: Option<u32>,
    pub(crate) buffer: Option<usize>,
    pub(crate) command_urls: Vec<String>,
    pub(crate) data_urls: Vec<String>,
}

pub(crate) fn resolve(args: &DaemonArgs) -> Result<ResolvedConfig> {
    let file = match &args.config {
        Some(path) => config::load(path)?,
        None => Default::default(),
    };
    let daemon = file.daemon;

    if args.foreground && args.run_as.is_some() {
        bail!("-f and --run-as are mutually exclusive");
    }

    let command_urls = if !args.command.is_empty() {
        args.command.clone()
    } else {
        daemon.command
    };
    let data_urls = if !args.data.is_empty() {
        args.data.clone()
    } else {
        daemon.data
    };
    if command_urls.is_empty() {
        bail!("at least one --command listen address is required");
    }
    if data_urls.is_empty() {
        bail!("at least one --data listen address is required");
    }

    Ok(ResolvedConfig {
        foreground: args.foreground || daemon.foreground.unwrap_or(false),
        run_as: args.run_as.clone().or(daemon.run_as),
        verbosity: args.verbosity.or(daemon.verbosity).unwrap_or(2),
        mss: args.mss.or(daemon.mss),
        buffer: args.buffer.or(daemon.buffer),
        command_urls,
        data_urls,
    })
}

/// Bind every configured listen address, then run the daemon until a
/// terminating signal flips `SharedState::cancel_all` and every in-flight
/// worker has drained (spec.md §5's thread-count barrier).
pub(crate) async fn serve(cfg: ResolvedConfig) -> Result<()> {
    let socket_settings = SocketSettings {
        udt_mss: cfg.mss,
        recv_buffer: cfg.buffer,
        send_buffer: cfg.buffer,
        ..Default::default()
    };

    let mut command_listeners = Vec::new();
    for raw in &cfg.command_urls {
        let url = EndpointUrl::parse(raw)?;
        command_listeners.push(mk_server(&url, &socket_settings, DEFAULT_CONTROL_PORT).await?);
    }

    let mut data_listeners = Vec::new();
    let mut dataaddrs: Vec<Sockname> = Vec::new();
    for raw in &cfg.data_urls {
        let url = EndpointUrl::parse(raw)?;
        let listener = mk_server(&url, &socket_settings, DEFAULT_DATA_PORT).await?;
        dataaddrs.push(listener.getsockname()?);
        data_listeners.push(listener);
    }

    let buf_size = cfg.buffer.unwrap_or(1 << 20);
    let state = SharedState::new(dataaddrs, buf_size, socket_settings);

    for listener in &command_listeners {
        info!("control listener bound on {}", listener.getsockname()?);
    }
    for listener in &data_listeners {
        info!("data listener bound on {}", listener.getsockname()?);
    }

    for listener in command_listeners {
        let state = state.clone();
        tokio::spawn(accept_loop(state, listener, Role::Control));
    }
    for listener in data_listeners {
        let state = state.clone();
        tokio::spawn(accept_loop(state, listener, Role::Data));
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, cancelling active transfers");
    state.cancel_all();
    state.wait_for_idle().await;
    info!("all workers drained, exiting");
    Ok(())
}

enum Role {
    Control,
    Data,
}

async fn accept_loop(state: std::sync::Arc<SharedState>, listener: Listener, role: Role) {
    loop {
        match listener.accept().await {
            Ok(channel) => {
                let state = state.clone();
                match role {
                    Role::Control => {
                        tokio::spawn(etd_core::control_wrapper::run(state, channel));
                    }
                    Role::Data => {
                        tokio::spawn(etd_core::data_wrapper::run(state, channel));
                    }
                }
            }
            Err(e) => {
                // A per-connection accept failure does not take the
                // daemon down (spec.md §7: "logs them and continues
                // accepting new connections").
                warn!("accept failed: {e}");
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = hangup.recv() => info!("received SIGHUP"),
        _ = interrupt.recv() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> DaemonArgs {
        DaemonArgs {
            config: None,
            foreground: false,
            run_as: None,
            verbosity: None,
            mss: None,
            buffer: None,
            command: vec!["tcp://0:4004".into()],
            data: vec!["tcp://0:8008".into()],
        }
    }

    #[test]
    fn resolve_rejects_missing_command_urls() {
        let mut args = base_args();
        args.command.clear();
        let err = resolve(&args).unwrap_err();
        assert!(err.to_string().contains("--command"));
    }

    #[test]
    fn resolve_rejects_foreground_and_run_as_together() {
        let mut args = base_args();
        args.foreground = true;
        args.run_as = Some("nobody".into());
        assert!(resolve(&args).is_err());
    }

    #[test]
    fn resolve_defaults_verbosity_to_two() {
        let cfg = resolve(&base_args()).unwrap();
        assert_eq!(cfg.verbosity, 2);
    }
}
