mod common;

use approx::assert_relative_eq;
use common::{wait_for_event, TestScope};
use shared::config_storage::ConfigStorage;
use shared::devices::simulated::SimulatedFaults;
use shared_wasm::command::{SaveConfigRequest, ValueRequest};
use shared_wasm::{FieldSetResult, LedChannel, ScopeCommand, ScopeEvent};
use tempfile::TempDir;

#[tokio::test]
async fn test_set_exposure_updates_and_broadcasts() {
    let mut scope = TestScope::start().await;
    let mut events = scope.subscribe();

    scope
        .send(ScopeCommand::SetExposure(ValueRequest { value: 12.0 }))
        .await
        .unwrap();

    match scope.reply().await {
        ScopeEvent::ExposureSet(result) => assert!(result.is_success()),
        other => panic!("unexpected reply {other:?}"),
    }
    let update = wait_for_event(&mut events, |e| {
        matches!(e, ScopeEvent::SettingsUpdate(p) if p.exposure_value.is_some())
    })
    .await;
    let ScopeEvent::SettingsUpdate(patch) = update else {
        unreachable!()
    };
    assert_eq!(patch.exposure_value, Some(12.0));
    assert_relative_eq!(scope.state.settings.snapshot().await.exposure_ms, 12.0);
}

#[tokio::test]
async fn test_device_failure_reports_error_without_revert() {
    let mut scope = TestScope::start().await;
    SimulatedFaults::set(&scope.stage.faults.camera_settings, true);

    scope
        .send(ScopeCommand::SetExposure(ValueRequest { value: 25.0 }))
        .await
        .unwrap();

    match scope.reply().await {
        ScopeEvent::ExposureSet(FieldSetResult::Error { message }) => {
            assert!(message.contains("not responding"), "{message}");
        }
        other => panic!("unexpected reply {other:?}"),
    }
    assert_relative_eq!(scope.state.settings.snapshot().await.exposure_ms, 25.0);
}

#[tokio::test]
async fn test_invalid_value_rejected_before_device() {
    let mut scope = TestScope::start().await;

    scope
        .send(ScopeCommand::SetLed2(ValueRequest { value: 150.0 }))
        .await
        .unwrap();

    assert!(matches!(
        scope.reply().await,
        ScopeEvent::Led2Set(FieldSetResult::Error { .. })
    ));
    assert_relative_eq!(
        scope.state.settings.snapshot().await.led_level(LedChannel::Transmitted),
        0.0
    );
}

#[tokio::test]
async fn test_led_reaches_hardware() {
    let mut scope = TestScope::start().await;

    scope
        .send(ScopeCommand::SetLed(ValueRequest { value: 72.5 }))
        .await
        .unwrap();

    assert!(matches!(
        scope.reply().await,
        ScopeEvent::LedSet(FieldSetResult::Success { .. })
    ));
    assert_relative_eq!(scope.stage.led_level(LedChannel::Reflected), 72.5);
}

#[tokio::test]
async fn test_unsupported_magnification() {
    let mut scope = TestScope::start().await;

    scope
        .send(ScopeCommand::SetMagnification(ValueRequest { value: 30.0 }))
        .await
        .unwrap();
    assert!(matches!(
        scope.reply().await,
        ScopeEvent::MagnificationSet(FieldSetResult::Error { .. })
    ));

    scope
        .send(ScopeCommand::SetMagnification(ValueRequest { value: 40.0 }))
        .await
        .unwrap();
    assert!(matches!(
        scope.reply().await,
        ScopeEvent::MagnificationSet(FieldSetResult::Success { .. })
    ));
    assert_eq!(scope.state.settings.snapshot().await.magnification.value(), 40);
}

#[tokio::test]
async fn test_save_config_persists_and_restores() {
    let dir = TempDir::new().unwrap();
    let storage = ConfigStorage::with_path(dir.path().to_path_buf());
    {
        let mut scope = TestScope::start_with_storage(Some(storage.clone())).await;
        scope
            .send(ScopeCommand::SetGain(ValueRequest { value: 3.0 }))
            .await
            .unwrap();
        scope.reply().await;
        scope
            .send(ScopeCommand::SaveConfig(Some(SaveConfigRequest {
                x_step_um: Some(250.0),
                y_step_um: None,
                z_step_um: Some(5.0),
            })))
            .await
            .unwrap();
        match scope.reply().await {
            ScopeEvent::ConfigSaved(status) => assert_eq!(status.status, "success"),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    let scope = TestScope::start_with_storage(Some(storage)).await;
    let settings = scope.state.settings.snapshot().await;
    assert_relative_eq!(settings.gain, 3.0);
    assert_relative_eq!(settings.x_step_um, 250.0);
    assert_relative_eq!(settings.z_step_um, 5.0);
}

#[tokio::test]
async fn test_save_config_rejects_small_step() {
    let mut scope = TestScope::start().await;

    scope
        .send(ScopeCommand::SaveConfig(Some(SaveConfigRequest {
            x_step_um: Some(10.0),
            ..Default::default()
        })))
        .await
        .unwrap();

    match scope.reply().await {
        ScopeEvent::ConfigSaved(status) => {
            assert_eq!(status.status, "error");
            assert!(status.message.contains("minimum"));
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn test_get_settings_snapshot_is_idempotent() {
    let mut scope = TestScope::start().await;

    scope.send(ScopeCommand::GetSettings).await.unwrap();
    let first = scope.reply().await;
    scope.send(ScopeCommand::GetSettings).await.unwrap();
    let second = scope.reply().await;

    assert_eq!(first, second);
    assert!(matches!(first, ScopeEvent::SettingsUpdate(_)));
}

#[tokio::test]
async fn test_close_marks_session() {
    let mut scope = TestScope::start().await;

    scope.send(ScopeCommand::Close).await.unwrap();

    assert!(scope.session.closed);
    assert!(matches!(scope.reply().await, ScopeEvent::Closed(_)));
}
