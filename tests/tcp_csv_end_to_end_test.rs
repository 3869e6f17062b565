//! Configuration file to CSV rows through a real TCP socket.

use daq_recorder::config::RecorderConfig;
use daq_recorder::error::RecorderError;
use daq_recorder::recorder::RecorderState;
use daq_recorder::supervisor::RecorderSupervisor;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_test::assert_ok;

/// Serve a line-oriented FS740 look-alike on an ephemeral port.
async fn spawn_fs740(model: &'static str) -> u16 {
    let listener = assert_ok!(TcpListener::bind("127.0.0.1:0").await);
    let port = assert_ok!(listener.local_addr()).port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let reply = match line.trim() {
                        "*IDN?" => format!("Stanford Research Systems,{},s/n004242,ver1.08", model),
                        request if request.starts_with("MEAS2:FREQ?") => "1.00000000005E+07".to_string(),
                        _ => "NAN".to_string(),
                    };
                    if write.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

fn config(port: u16, output_dir: &std::path::Path) -> String {
    format!(
        r#"
        [application]
        name = "e2e"
        log_level = "debug"

        [storage]
        backend = "csv"
        output_dir = "{}"

        [[devices]]
        id = "fs740"
        table = "clock"
        interval = "100ms"
        expected_identity = "FS740"
        identity_field = 1

        [devices.transport]
        kind = "tcp"
        host = "127.0.0.1"
        port = {}
        timeout = "1s"

        [devices.measurement]
        command = "measure_frequency"
        args = {{ channel = 2 }}
        "#,
        output_dir.display().to_string().replace('\\', "/"),
        port
    )
}

#[tokio::test]
async fn test_records_reach_csv_over_tcp() {
    let port = spawn_fs740("FS740").await;
    let dir = assert_ok!(tempfile::tempdir());
    let config = assert_ok!(RecorderConfig::from_toml_str(&config(port, dir.path())));

    let mut supervisor = assert_ok!(RecorderSupervisor::from_config(&config));
    let reports = assert_ok!(supervisor.check().await);
    assert_eq!(reports[0].identity, "FS740");

    assert_ok!(supervisor.start().await);
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_ok!(supervisor.stop().await);

    let status = &supervisor.status()[0];
    assert_eq!(status.status.state, RecorderState::Stopped);
    assert_eq!(status.endpoint, format!("127.0.0.1:{}", port));
    assert!(status.status.records_published >= 2);

    let csv = assert_ok!(std::fs::read_to_string(dir.path().join("clock.csv")));
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("timestamp,frequency"));
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len() as u64, status.status.records_published);
    assert!(rows.iter().all(|row| row.ends_with(",10000000.0005")));
}

#[tokio::test]
async fn test_wrong_model_over_tcp_fails_start() {
    let port = spawn_fs740("FS725").await;
    let dir = assert_ok!(tempfile::tempdir());
    let config = assert_ok!(RecorderConfig::from_toml_str(&config(port, dir.path())));

    let mut supervisor = assert_ok!(RecorderSupervisor::from_config(&config));
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, RecorderError::PreflightFailed(_)));
    assert!(err.to_string().contains("FS725"));
    assert!(!dir.path().join("clock.csv").exists());
}
