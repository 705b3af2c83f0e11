mod common;

use approx::assert_relative_eq;
use common::{wait_for_event, TestScope};
use shared_wasm::command::{FocusJogRequest, JogRequest, ValueRequest};
use shared_wasm::{Axis, FieldSetResult, ScopeCommand, ScopeEvent};
use std::time::Duration;

#[tokio::test]
async fn test_move_z_ticks_then_reconciles() {
    let mut scope = TestScope::start().await;
    let mut events = scope.subscribe();

    scope
        .send(ScopeCommand::MoveZ(FocusJogRequest { steps: 50.0 }))
        .await
        .unwrap();
    assert_relative_eq!(scope.state.motion.position(Axis::Z).target_mm, 0.05);

    let settled = wait_for_event(&mut events, |e| {
        matches!(e, ScopeEvent::MotorPositions(p) if !p.motor_status && (p.z_pos - 0.05).abs() < 1e-9)
    })
    .await;
    let ScopeEvent::MotorPositions(tick) = settled else {
        unreachable!()
    };
    assert_relative_eq!(tick.x_pos, 0.0);

    let reconciled = wait_for_event(&mut events, |e| {
        matches!(e, ScopeEvent::TargetPositionsUpdate(_))
    })
    .await;
    let ScopeEvent::TargetPositionsUpdate(targets) = reconciled else {
        unreachable!()
    };
    // 0.05 mm is not a whole number of steps
    assert_relative_eq!(targets.z_target, 0.05, epsilon = 1e-3);
    assert_eq!(scope.stage.position_steps(Axis::Z), 51);
    assert_relative_eq!(
        scope.state.settings.snapshot().await.z_target,
        targets.z_target
    );
}

#[tokio::test]
async fn test_stop_halts_every_axis() {
    let mut scope = TestScope::start().await;
    let mut events = scope.subscribe();

    scope
        .send(ScopeCommand::SetXPos(ValueRequest { value: 15.0 }))
        .await
        .unwrap();
    assert!(matches!(
        scope.reply().await,
        ScopeEvent::XPosSet(FieldSetResult::Success { .. })
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(scope.state.motion.is_moving());

    scope.send(ScopeCommand::StopMove).await.unwrap();
    assert!(!scope.state.motion.is_moving());
    wait_for_event(&mut events, |e| {
        matches!(e, ScopeEvent::MoveStatus(s) if !s.status)
    })
    .await;

    let stopped_at = scope.stage.position_steps(Axis::X);
    assert!(stopped_at > 0 && stopped_at < 15 * 1024);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scope.stage.position_steps(Axis::X), stopped_at);
    let position = scope.state.motion.position(Axis::X);
    assert_relative_eq!(position.target_mm, position.current_mm);
}

#[tokio::test]
async fn test_out_of_range_target_rejected() {
    let mut scope = TestScope::start().await;

    scope
        .send(ScopeCommand::SetZPos(ValueRequest { value: 50.0 }))
        .await
        .unwrap();

    match scope.reply().await {
        ScopeEvent::ZPosSet(FieldSetResult::Error { message }) => {
            assert!(message.contains("travel range"), "{message}");
        }
        other => panic!("unexpected reply {other:?}"),
    }
    assert!(!scope.state.motion.is_moving());
}

#[tokio::test]
async fn test_jog_below_minimum_is_command_error() {
    let mut scope = TestScope::start().await;

    let err = scope
        .send(ScopeCommand::MoveX(JogRequest { step_size_um: 10.0 }))
        .await
        .unwrap_err();

    assert_eq!(err.command, "move_x");
    assert!(err.message.contains("minimum"));
}

#[tokio::test]
async fn test_negative_jog_moves_backwards() {
    let mut scope = TestScope::start().await;

    scope
        .send(ScopeCommand::MoveY(JogRequest {
            step_size_um: -100.0,
        }))
        .await
        .unwrap();
    scope
        .state
        .motion
        .wait_idle(Axis::Y, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(scope.stage.position_steps(Axis::Y), -102);
    assert_relative_eq!(
        scope.state.settings.snapshot().await.y_target,
        -0.1,
        epsilon = 1e-3
    );
}
