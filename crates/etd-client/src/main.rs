//! A thin orchestrator CLI driving the sendFile/getFile choreography of
//! spec.md §2 end to end against two daemons (or a daemon and a local
//! path). Not a protocol requirement in its own right — a manual/
//! integration-testing counterpart to `blit-cli`.

mod spec;

use clap::Parser;
use eyre::{bail, Result};
use log::info;

use etd_core::channel::Channel;
use etd_core::endpoint_factory::{mk_client, SocketSettings};
use etd_core::local_server::LocalTransferServer;
use etd_core::open_mode::OpenMode;
use etd_core::remote_proxy::RemoteTransferProxy;
use etd_core::shared_state::SharedState;
use etd_core::sockname::Protocol;
use etd_core::transfer_api::TransferServer;

use spec::Location;

#[derive(Parser, Debug)]
#[command(name = "etd-client", version, about = "Drive an etd file transfer end to end")]
struct Args {
    /// Source location: a local path, or `tcp://host[:port]/path`.
    source: String,
    /// Destination location: a local path, or `tcp://host[:port]/path`.
    destination: String,

    /// Have the destination pull from the source instead of the source
    /// pushing to the destination (mutually exclusive with --pull is
    /// the default `--push`).
    #[arg(long, conflicts_with = "push")]
    pull: bool,
    #[arg(long)]
    push: bool,

    /// Open mode to request on the destination: new, overwrite, resume,
    /// skip-existing.
    #[arg(long, default_value = "new")]
    mode: String,
}

/// Accept the CLI's lowercase/kebab-case spelling (`new`, `overwrite`,
/// `resume`, `skip-existing`) and translate to the wire-cased
/// [`OpenMode`] variant names `OpenMode::parse` expects.
fn parse_mode(raw: &str) -> Option<OpenMode> {
    match raw.to_ascii_lowercase().as_str() {
        "new" => Some(OpenMode::New),
        "overwrite" => Some(OpenMode::OverWrite),
        "resume" => Some(OpenMode::Resume),
        "skip-existing" | "skipexisting" => Some(OpenMode::SkipExisting),
        _ => OpenMode::parse(raw),
    }
}

async fn connect(url: &etd_core::sockname::EndpointUrl) -> Result<Channel> {
    let never_cancel = || false;
    mk_client(url, &SocketSettings::default(), Protocol::default_control_port(), &never_cancel)
        .await
        .map_err(|e| eyre::eyre!("failed to connect to {url:?}: {e}"))
}

/// Build a [`TransferServer`] handle for one side of the transfer: a
/// connected [`RemoteTransferProxy`] for a remote location, or a fresh
/// [`LocalTransferServer`] (backed by its own, disk-only `SharedState`)
/// for a local path.
async fn server_for(location: &Location) -> Result<(Box<dyn TransferServer>, String)> {
    match location {
        Location::Local(path) => {
            let state = SharedState::new(vec![], 1 << 20, SocketSettings::default());
            Ok((Box::new(LocalTransferServer::new(state)), path.clone()))
        }
        Location::Remote { control, path } => {
            let channel = connect(control).await?;
            Ok((Box::new(RemoteTransferProxy::new(channel)), path.clone()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let args = Args::parse();

    if args.pull && args.push {
        bail!("--push and --pull are mutually exclusive");
    }
    let pull = args.pull;

    let mode = parse_mode(&args.mode)
        .ok_or_else(|| eyre::eyre!("unknown open mode '{}'", args.mode))?;

    let source = spec::parse(&args.source)?;
    let destination = spec::parse(&args.destination)?;

    let (src_server, src_path) = server_for(&source).await?;
    let (dst_server, dst_path) = server_for(&destination).await?;

    let (dst_uuid, already_have) = dst_server.request_file_write(&dst_path, mode).await?;
    info!("destination opened {dst_path}: uuid={dst_uuid} alreadyHave={already_have}");

    let (src_uuid, remaining) = src_server
        .request_file_read(&src_path, already_have)
        .await?;
    info!("source opened {src_path}: uuid={src_uuid} remaining={remaining}");

    let result = if pull {
        let src_addrs = src_server.data_channel_addr().await?;
        dst_server
            .get_file(&src_uuid, &dst_uuid, remaining, &src_addrs)
            .await?
    } else {
        let dst_addrs = dst_server.data_channel_addr().await?;
        src_server
            .send_file(&src_uuid, &dst_uuid, remaining, &dst_addrs)
            .await?
    };

    if result.finished {
        println!(
            "transferred {} bytes in {:.3}s",
            result.bytes_transferred,
            result.duration.as_secs_f64()
        );
        Ok(())
    } else {
        bail!(
            "transfer did not complete: {} ({} bytes transferred)",
            result.reason,
            result.bytes_transferred
        );
    }
}
