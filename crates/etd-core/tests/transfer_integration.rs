//! Multi-module, loopback-network integration tests covering the
//! end-to-end scenarios of spec.md §8: a third-party push, a pull driven
//! by the `push:1` data-channel header, cancellation mid-transfer, and
//! the `write-file-New` FileExists race.

use std::sync::Arc;

use etd_core::endpoint_factory::{mk_server, SocketSettings};
use etd_core::error::EtdError;
use etd_core::local_server::LocalTransferServer;
use etd_core::open_mode::OpenMode;
use etd_core::shared_state::SharedState;
use etd_core::transfer_api::TransferServer;

/// Bind a data listener first (so its address is known), then construct
/// the `SharedState` that advertises it, then spawn the accept loop.
async fn daemon_with_data_listener() -> Arc<SharedState> {
    let url = etd_core::sockname::EndpointUrl::parse("tcp://127.0.0.1:0").unwrap();
    let listener = mk_server(&url, &SocketSettings::default(), 0).await.unwrap();
    let sockname = listener.getsockname().unwrap();

    let state = SharedState::new(vec![sockname], 1 << 16, SocketSettings::default());
    let accept_state = state.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(channel) => {
                    tokio::spawn(etd_core::data_wrapper::run(accept_state.clone(), channel));
                }
                Err(_) => return,
            }
        }
    });
    state
}

#[tokio::test]
async fn loopback_push_transfers_file_byte_identical() {
    let src_state = SharedState::new(vec![], 1 << 16, SocketSettings::default());
    let dst_state = daemon_with_data_listener().await;

    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let src_path = src_dir.path().join("x");
    let dst_path = dst_dir.path().join("x");

    let payload = vec![0x5au8; 1_048_576];
    tokio::fs::write(&src_path, &payload).await.unwrap();

    let src_server = LocalTransferServer::new(src_state.clone());
    let dst_server = LocalTransferServer::new(dst_state.clone());

    let (dst_uuid, already_have) = dst_server
        .request_file_write(dst_path.to_str().unwrap(), OpenMode::New)
        .await
        .unwrap();
    assert_eq!(already_have, 0);

    let (src_uuid, remaining) = src_server
        .request_file_read(src_path.to_str().unwrap(), already_have)
        .await
        .unwrap();
    assert_eq!(remaining, payload.len() as u64);

    let dst_addrs = dst_server.data_channel_addr().await.unwrap();
    let result = src_server
        .send_file(&src_uuid, &dst_uuid, remaining, &dst_addrs)
        .await
        .unwrap();

    assert!(result.finished);
    assert_eq!(result.bytes_transferred, payload.len() as u64);

    let written = tokio::fs::read(&dst_path).await.unwrap();
    assert_eq!(written, payload);
}

#[tokio::test]
async fn resume_transfers_only_the_missing_suffix() {
    let src_state = SharedState::new(vec![], 1 << 16, SocketSettings::default());
    let dst_state = daemon_with_data_listener().await;

    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let src_path = src_dir.path().join("x");
    let dst_path = dst_dir.path().join("x");

    let mut payload = vec![0u8; 262_144 * 4];
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    tokio::fs::write(&src_path, &payload).await.unwrap();
    tokio::fs::write(&dst_path, &payload[..262_144]).await.unwrap();

    let src_server = LocalTransferServer::new(src_state.clone());
    let dst_server = LocalTransferServer::new(dst_state.clone());

    let (dst_uuid, already_have) = dst_server
        .request_file_write(dst_path.to_str().unwrap(), OpenMode::Resume)
        .await
        .unwrap();
    assert_eq!(already_have, 262_144);

    let (src_uuid, remaining) = src_server
        .request_file_read(src_path.to_str().unwrap(), already_have)
        .await
        .unwrap();
    assert_eq!(remaining, payload.len() as u64 - 262_144);

    let dst_addrs = dst_server.data_channel_addr().await.unwrap();
    let result = src_server
        .send_file(&src_uuid, &dst_uuid, remaining, &dst_addrs)
        .await
        .unwrap();

    assert!(result.finished);
    assert_eq!(result.bytes_transferred, remaining);

    let written = tokio::fs::read(&dst_path).await.unwrap();
    assert_eq!(written, payload);
}

#[tokio::test]
async fn pull_via_push_header_reads_a_dev_zero_source() {
    // Scenario 3 of spec.md §8: the data connection is initiated from the
    // destination to the source, which serves bytes straight off
    // `/dev/zero:<size>` without ever touching disk.
    let src_state = daemon_with_data_listener().await;
    let dst_state = SharedState::new(vec![], 1 << 16, SocketSettings::default());

    let dst_dir = tempfile::tempdir().unwrap();
    let dst_path = dst_dir.path().join("zeros");

    let src_server = LocalTransferServer::new(src_state.clone());
    let dst_server = LocalTransferServer::new(dst_state.clone());

    const SIZE: u64 = 1 << 20;
    let (src_uuid, remaining) = src_server
        .request_file_read("/dev/zero:1048576", 0)
        .await
        .unwrap();
    assert_eq!(remaining, SIZE);

    let (dst_uuid, already_have) = dst_server
        .request_file_write(dst_path.to_str().unwrap(), OpenMode::New)
        .await
        .unwrap();
    assert_eq!(already_have, 0);

    let src_addrs = src_server.data_channel_addr().await.unwrap();
    let result = dst_server
        .get_file(&src_uuid, &dst_uuid, remaining, &src_addrs)
        .await
        .unwrap();

    assert!(result.finished);
    assert_eq!(result.bytes_transferred, SIZE);

    let written = tokio::fs::read(&dst_path).await.unwrap();
    assert_eq!(written.len() as u64, SIZE);
    assert!(written.iter().all(|&b| b == 0));
}

#[tokio::test]
async fn cancelling_mid_transfer_reports_an_incomplete_result() {
    let src_state = SharedState::new(vec![], 1 << 16, SocketSettings::default());
    let dst_state = daemon_with_data_listener().await;

    let dst_dir = tempfile::tempdir().unwrap();
    let dst_path = dst_dir.path().join("x");

    let src_server = LocalTransferServer::new(src_state.clone());
    let dst_server = LocalTransferServer::new(dst_state.clone());

    // Large enough that the copy loop is reliably still running a few
    // milliseconds in, so the cancel lands mid-transfer rather than racing
    // an already-finished copy.
    const SIZE: u64 = 256 * 1024 * 1024;
    let (dst_uuid, already_have) = dst_server
        .request_file_write(dst_path.to_str().unwrap(), OpenMode::New)
        .await
        .unwrap();

    let (src_uuid, remaining) = src_server
        .request_file_read(&format!("/dev/zero:{SIZE}"), already_have)
        .await
        .unwrap();

    let dst_addrs = dst_server.data_channel_addr().await.unwrap();

    let cancel_uuid = src_uuid.clone();
    let cancel_state = src_state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let canceller = LocalTransferServer::for_session(cancel_state, cancel_uuid.clone());
        let _ = canceller.cancel(&cancel_uuid).await;
    });

    let result = src_server
        .send_file(&src_uuid, &dst_uuid, remaining, &dst_addrs)
        .await
        .unwrap();

    assert!(!result.finished);
    assert_eq!(result.reason, "Cancelled");
    assert!(result.bytes_transferred < SIZE);
}

#[tokio::test]
async fn concurrent_write_file_new_requests_race_to_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("y");
    let path_str = path.to_str().unwrap().to_string();

    let state = SharedState::new(vec![], 1 << 16, SocketSettings::default());
    let first = LocalTransferServer::new(state.clone());
    let second = LocalTransferServer::new(state.clone());

    let p1 = path_str.clone();
    let p2 = path_str.clone();
    let (r1, r2) = tokio::join!(
        first.request_file_write(&p1, OpenMode::New),
        second.request_file_write(&p2, OpenMode::New),
    );

    let outcomes = [r1, r2];
    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    let file_exists_losses = outcomes
        .iter()
        .filter(|r| matches!(r, Err(EtdError::FileExists)))
        .count();

    assert_eq!(wins, 1, "exactly one concurrent New request should win");
    assert_eq!(file_exists_losses, 1, "the loser must see FileExists, not a generic conflict");
}
