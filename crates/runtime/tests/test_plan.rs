use std::time::Duration;

use anyhow::Result;
use chatline_config::ClientConfig;
use chatline_runtime::ClientServices;
use chatline_sync::{SyncState, SyncUpdate};

#[tokio::test]
async fn initialise_uses_configured_typing_timings() -> Result<()> {
    let mut config = ClientConfig::default();
    config.typing.expiry_ms = 1500;
    config.typing.emit_interval_ms = 250;

    let services = ClientServices::initialise(&config)?;

    assert_eq!(services.settings.typing_ttl, Duration::from_millis(1500));
    assert_eq!(services.settings.typing_emit_interval, Duration::from_millis(250));
    assert_eq!(services.orchestrator().state(), SyncState::Disconnected);
    Ok(())
}

#[test]
fn initialise_rejects_invalid_api_base_url() {
    let mut config = ClientConfig::default();
    config.api.base_url = "not a url".into();

    let error = match ClientServices::initialise(&config) {
        Ok(_) => panic!("expected an invalid base url to be rejected"),
        Err(error) => error,
    };
    let message = format!("{error:?}");
    assert!(
        message.contains("failed to build REST client"),
        "expected REST client context, got {message}"
    );
}

#[test]
fn initialise_rejects_unsupported_push_scheme() {
    let mut config = ClientConfig::default();
    config.push.url = "ftp://localhost/ws".into();

    let error = match ClientServices::initialise(&config) {
        Ok(_) => panic!("expected an ftp push endpoint to be rejected"),
        Err(error) => error,
    };
    assert!(format!("{error:?}").contains("invalid push endpoint"));
}

#[tokio::test]
async fn session_against_unreachable_backend_stays_connecting() -> Result<()> {
    let mut config = ClientConfig::default();
    config.api.base_url = "http://127.0.0.1:9/api".into();
    config.api.request_timeout_seconds = 1;
    config.push.url = "ws://127.0.0.1:9/ws".into();
    config.push.reconnect_attempts = 1;
    config.push.reconnect_delay_ms = 10;

    let services = ClientServices::initialise(&config)?;
    let mut orchestrator = services.orchestrator();
    let mut notifications = orchestrator
        .take_notifications()
        .expect("notifications are available once");
    orchestrator.start_session("u1")?;

    let notification = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let input = orchestrator.next_input().await.expect("session is active");
            let update = orchestrator.apply(input);
            assert!(!matches!(update, Some(SyncUpdate::StateChanged(SyncState::Connected { .. }))));
            if let Ok(notification) = notifications.try_recv() {
                break notification;
            }
        }
    })
    .await?;

    assert!(notification.to_string().starts_with("error:"));
    assert_eq!(orchestrator.state(), SyncState::Connecting);
    orchestrator.end_session();
    Ok(())
}
