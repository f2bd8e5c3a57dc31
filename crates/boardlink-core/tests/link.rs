mod common;

use std::time::Duration;

use boardlink_core::protocol::{
    sync_payload, BootloaderCommand, CheckResult, CommandPacket, ConnectionMode, DeviceLink,
    FramingPolicy, LinkConfig, ProtocolError,
};
use boardlink_core::transport::Signals;
use common::{attached_device, failure_frame, init_tracing, read_request, response_frame};
use pretty_assertions::assert_eq;
use tokio::io::AsyncWriteExt;

fn fast_config() -> LinkConfig {
    LinkConfig {
        sync_timeout_ms: 20,
        ..LinkConfig::default()
    }
}

#[tokio::test]
async fn test_sync_collects_initial_plus_seven_probes() {
    init_tracing();
    let (device, mut remote) = attached_device().await;
    let link = DeviceLink::new(device, LinkConfig::default());

    let fake = tokio::spawn(async move {
        let request = read_request(&mut remote.stream).await;
        let packet = CommandPacket::from_bytes(&request).unwrap();
        assert_eq!(packet.opcode, BootloaderCommand::Sync);
        assert_eq!(packet.payload, sync_payload());

        // The ROM echoes sync several times; send more than are read
        let values = [5, 5, 5, 5, 5, 5, 5, 0, 9, 9];
        for value in values {
            let frame = response_frame(0x08, value, &[0, 0]);
            remote.stream.write_all(&frame).await.unwrap();
        }
        remote
    });

    let outcome = link.sync().await.unwrap();
    assert_eq!(outcome.responses, 8);
    assert!(outcome.stub_detected);
    assert!(link.sync_stub_detected());

    // The ninth echo is still there for the next reader
    let _remote = fake.await.unwrap();
    let frame = link.read_one(Duration::from_secs(1)).await.unwrap();
    assert_eq!(&frame[4..8], &[9, 0, 0, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_sync_runs_every_probe_past_failures() {
    init_tracing();
    let (device, mut remote) = attached_device().await;
    let config = LinkConfig {
        sync_timeout_ms: 50,
        ..LinkConfig::default()
    };
    let link = DeviceLink::new(device, config);

    let fake = tokio::spawn(async move {
        read_request(&mut remote.stream).await;

        // Good echo, failure status, then a stray byte
        let mut burst = response_frame(0x08, 5, &[0, 0]);
        burst.extend(failure_frame(0x08, [0x01, 0x05]));
        burst.push(0x42);
        remote.stream.write_all(&burst).await.unwrap();

        // Silent long enough for exactly one probe to time out
        tokio::time::sleep(Duration::from_millis(75)).await;
        for value in [5, 5, 5, 0] {
            let frame = response_frame(0x08, value, &[0, 0]);
            remote.stream.write_all(&frame).await.unwrap();
        }
        remote
    });

    let outcome = link.sync().await.unwrap();
    assert_eq!(outcome.responses, 5);
    assert!(outcome.stub_detected);
    assert!(link.sync_stub_detected());

    // All eight reads happened, so nothing is left over
    let _remote = fake.await.unwrap();
    assert_eq!(
        link.read_one(Duration::from_millis(50)).await,
        Err(ProtocolError::Timeout)
    );
}

#[tokio::test]
async fn test_sync_survives_silent_device() {
    let (device, _remote) = attached_device().await;
    let link = DeviceLink::new(device, fast_config());

    let outcome = link.sync().await.unwrap();
    assert_eq!(outcome.responses, 0);
    assert!(!outcome.stub_detected);
}

#[tokio::test]
async fn test_sync_requires_connection() {
    let (device, _remote) = attached_device().await;
    device.close().await.unwrap();
    let link = DeviceLink::new(device, fast_config());
    assert_eq!(link.sync().await, Err(ProtocolError::NotConnected));
}

#[tokio::test]
async fn test_concurrent_reads_share_one_result() {
    let (device, mut remote) = attached_device().await;
    let link = DeviceLink::new(device, LinkConfig::default());
    let frame = response_frame(0x0A, 0x1234, &[0, 0]);

    let (a, b, _) = tokio::join!(
        link.read_one(Duration::from_secs(1)),
        link.read_one(Duration::from_secs(1)),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remote.stream.write_all(&frame).await.unwrap();
        }
    );
    let a = a.unwrap();
    assert_eq!(a, b.unwrap());
    assert_eq!(a[1], 0x0A);

    // Consumed by the waiting callers, not left as an orphan
    assert_eq!(
        link.read_one(Duration::from_millis(30)).await,
        Err(ProtocolError::Timeout)
    );
}

#[tokio::test]
async fn test_late_result_goes_to_next_caller() {
    init_tracing();
    let (device, mut remote) = attached_device().await;
    let link = DeviceLink::new(device, LinkConfig::default());

    assert_eq!(
        link.read_one(Duration::from_millis(30)).await,
        Err(ProtocolError::Timeout)
    );

    let frame = response_frame(0x0A, 0xCAFE, &[0, 0]);
    remote.stream.write_all(&frame).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let orphan = link.read_one(Duration::from_millis(30)).await.unwrap();
    assert_eq!(&orphan[4..6], &[0xFE, 0xCA]);

    assert_eq!(
        link.read_one(Duration::from_millis(30)).await,
        Err(ProtocolError::Timeout)
    );
}

#[tokio::test]
async fn test_read_reg() {
    let (device, mut remote) = attached_device().await;
    let link = DeviceLink::new(device, LinkConfig::default());

    let fake = tokio::spawn(async move {
        let request = read_request(&mut remote.stream).await;
        let packet = CommandPacket::from_bytes(&request).unwrap();
        assert_eq!(packet.opcode, BootloaderCommand::ReadReg);
        assert_eq!(packet.payload, vec![0x00, 0x10, 0x00, 0x60]);
        let frame = response_frame(0x0A, 0xDEAD_BEEF, &[0, 0]);
        remote.stream.write_all(&frame).await.unwrap();
        remote
    });

    assert_eq!(link.read_reg(0x6000_1000).await.unwrap(), 0xDEAD_BEEF);
    fake.await.unwrap();
}

#[tokio::test]
async fn test_command_without_waiting() {
    let (device, mut remote) = attached_device().await;
    let link = DeviceLink::new(device, LinkConfig::default());

    let response = link
        .command(
            Some(BootloaderCommand::RunUserCode),
            &[],
            0,
            false,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    assert_eq!(response, None);

    let request = read_request(&mut remote.stream).await;
    assert_eq!(request, vec![0x00, 0xD3, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
}

#[tokio::test]
async fn test_frameless_command_without_waiting_reads_nothing() {
    let (device, mut remote) = attached_device().await;
    let link = DeviceLink::new(device, LinkConfig::default());

    let frame = response_frame(0x08, 3, &[0, 0]);
    remote.stream.write_all(&frame).await.unwrap();
    let response = link
        .command(None, &[], 0, false, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(response, None);

    // Still there for the next read
    let frame = link.read_one(Duration::from_secs(1)).await.unwrap();
    assert_eq!(&frame[4..8], &[3, 0, 0, 0]);
}

#[tokio::test]
async fn test_check_command_value_and_data() {
    let (device, mut remote) = attached_device().await;
    let link = DeviceLink::new(device, LinkConfig::default());

    let fake = tokio::spawn(async move {
        read_request(&mut remote.stream).await;
        let frame = response_frame(0x13, 77, &[0, 0]);
        remote.stream.write_all(&frame).await.unwrap();

        read_request(&mut remote.stream).await;
        let frame = response_frame(0x13, 77, &[0xAA, 0xBB, 0, 0]);
        remote.stream.write_all(&frame).await.unwrap();
        remote
    });

    let short = link
        .check_command("short", Some(BootloaderCommand::SpiFlashMd5), &[1, 2], 0)
        .await
        .unwrap();
    assert_eq!(short, CheckResult::Value(77));

    let long = link
        .check_command("long", Some(BootloaderCommand::SpiFlashMd5), &[1, 2, 3, 4], 0)
        .await
        .unwrap();
    assert_eq!(long, CheckResult::Data(vec![0xAA, 0xBB]));
    fake.await.unwrap();
}

#[tokio::test]
async fn test_check_command_reports_status_bytes() {
    let (device, mut remote) = attached_device().await;
    let link = DeviceLink::new(device, LinkConfig::default());

    let fake = tokio::spawn(async move {
        read_request(&mut remote.stream).await;
        let frame = response_frame(0x09, 0, &[0x01, 0x05]);
        remote.stream.write_all(&frame).await.unwrap();

        read_request(&mut remote.stream).await;
        remote
            .stream
            .write_all(&failure_frame(0x09, [0x01, 0x07]))
            .await
            .unwrap();
        remote
    });

    let err = link.write_reg(0x6000_1000, 1, 0xFFFF_FFFF, 0).await.unwrap_err();
    assert_eq!(
        err,
        ProtocolError::DeviceError {
            command: "write target memory".to_string(),
            status: vec![0x01, 0x05],
        }
    );

    let err = link
        .check_command("failing", Some(BootloaderCommand::WriteReg), &[], 0)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ProtocolError::DeviceError {
            command: "failing".to_string(),
            status: vec![0x01, 0x07],
        }
    );
    fake.await.unwrap();
}

#[tokio::test]
async fn test_framing_error_reaches_caller() {
    let (device, mut remote) = attached_device().await;
    let link = DeviceLink::new(device, LinkConfig::default());

    remote.stream.write_all(&[0x42]).await.unwrap();
    let err = link.read_one(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Framing(_)));

    let frame = response_frame(0x08, 0, &[0, 0]);
    remote.stream.write_all(&frame).await.unwrap();
    let frame = link.read_one(Duration::from_secs(1)).await.unwrap();
    assert_eq!(frame[0], 0x01);
}

#[tokio::test]
async fn test_stray_byte_between_responses_loses_neither() {
    let (device, mut remote) = attached_device().await;
    let link = DeviceLink::new(device, LinkConfig::default());

    let mut data = response_frame(0x08, 7, &[0, 0]);
    data.push(0x42);
    data.extend(response_frame(0x08, 9, &[0, 0]));
    remote.stream.write_all(&data).await.unwrap();

    let first = link.read_one(Duration::from_secs(1)).await.unwrap();
    assert_eq!(&first[4..8], &[7, 0, 0, 0]);
    let err = link.read_one(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Framing(_)));
    let second = link.read_one(Duration::from_secs(1)).await.unwrap();
    assert_eq!(&second[4..8], &[9, 0, 0, 0]);
}

#[tokio::test]
async fn test_skip_policy_ignores_noise() {
    let (device, mut remote) = attached_device().await;
    let config = LinkConfig {
        framing_policy: FramingPolicy::Skip,
        ..LinkConfig::default()
    };
    let link = DeviceLink::new(device, config);

    let mut noisy = b"boot noise".to_vec();
    noisy.extend(response_frame(0x08, 0, &[0, 0]));
    remote.stream.write_all(&noisy).await.unwrap();
    let frame = link.read_one(Duration::from_secs(1)).await.unwrap();
    assert_eq!(frame[1], 0x08);
}

#[tokio::test]
async fn test_write_failure_is_transport_error() {
    let (device, remote) = attached_device().await;
    let link = DeviceLink::new(device, LinkConfig::default());
    remote
        .fail_on_send
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = link
        .execute(BootloaderCommand::ReadReg, &[0, 0, 0, 0])
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Transport(_)));
}

#[tokio::test]
async fn test_download_mode_signal_sequence() {
    let (device, remote) = attached_device().await;
    let link = DeviceLink::new(device, fast_config());

    link.enter_download_mode().await.unwrap();
    link.exit_download_mode().await.unwrap();

    let signals = remote.signals.lock().unwrap().clone();
    assert_eq!(
        signals,
        vec![
            Signals::default().with_dtr(false).with_rts(true),
            Signals::default().with_dtr(true).with_rts(false),
            Signals::default().with_dtr(false),
            Signals::default().with_rts(true),
            Signals::default().with_rts(false),
        ]
    );
}

#[tokio::test]
async fn test_connect_without_reset_or_sync() {
    let (device, remote) = attached_device().await;
    let link = DeviceLink::new(device, fast_config());

    let outcome = link.connect(ConnectionMode::NoResetNoSync).await.unwrap();
    assert_eq!(outcome, None);
    assert!(remote.signals.lock().unwrap().is_empty());

    let outcome = link.connect(ConnectionMode::DefaultReset).await.unwrap();
    assert_eq!(outcome.map(|o| o.responses), Some(0));
    assert_eq!(remote.signals.lock().unwrap().len(), 3);
}
