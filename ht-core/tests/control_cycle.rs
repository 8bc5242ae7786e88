//! Full control cycles against the scripted hardware channel

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use ht_core::engine::RecordingSleeper;
use ht_core::{ControlLoop, MemoryTelemetry, ScriptedChannel, Settings};
use ht_protocol::{Actuator, Command, CommandRejection, ControlState, HeatSource, Mode, SensorStatus, Timestamp};

const CYCLE_SECS: i64 = 5;

fn t(cycle: i64) -> Timestamp {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + TimeDelta::seconds(cycle * CYCLE_SECS)
}

struct Rig {
    channel: Arc<ScriptedChannel>,
    telemetry: Arc<MemoryTelemetry>,
    control: ControlLoop,
}

impl Rig {
    fn new() -> Self {
        let channel = Arc::new(ScriptedChannel::new());
        let telemetry = Arc::new(MemoryTelemetry::new());
        let control = ControlLoop::new(&Settings::default(), channel.clone())
            .with_sleeper(Arc::new(RecordingSleeper::new()))
            .with_telemetry(telemetry.clone());
        Self {
            channel,
            telemetry,
            control,
        }
    }
}

fn set(channel: &ScriptedChannel, collector: f64, tank: f64) {
    channel.set_value("collector", collector);
    for id in ["tank_top", "tank_middle", "tank_bottom"] {
        channel.set_value(id, tank);
    }
}

#[test]
fn test_transient_failure_is_retried_within_cycle() {
    let Rig { channel, mut control, .. } = Rig::new();
    channel.set_value("collector", 30.0);
    channel.set_value("tank_top", 50.0);
    channel.set_value("tank_bottom", 50.0);
    channel.fail_then("tank_middle", 2, 50.0);

    let report = control.run_cycle_blocking(vec![], t(0));
    assert_eq!(report.attempts["tank_middle"], 3);
    assert_eq!(report.attempts["collector"], 1);
    assert_eq!(report.health.healthy_count, 4);
    assert_eq!(control.snapshot().temperatures["tank_middle"], Some(50.0));
}

#[test]
fn test_collector_degrades_then_fails() {
    let Rig { channel, mut control, .. } = Rig::new();
    set(&channel, 60.0, 50.0);
    control.run_cycle_blocking(vec![], t(0));
    assert_eq!(control.snapshot().state, ControlState::Circulating);

    channel.fail_always("collector");
    let report = control.run_cycle_blocking(vec![], t(1));
    assert_eq!(report.health.degraded_sensors, vec!["collector".to_string()]);
    assert_eq!(control.snapshot().temperatures["collector"], Some(60.0));
    // Fallback keeps circulation going
    assert_eq!(report.decision.state, ControlState::Circulating);

    // 300 s after the last good read the fallback is gone
    let mut cycle = 2;
    while control.health().status("collector") != SensorStatus::Failed {
        control.run_cycle_blocking(vec![], t(cycle));
        cycle += 1;
    }
    assert_eq!(cycle - 1, 60);
    assert_eq!(control.snapshot().temperatures["collector"], None);
    assert_eq!(control.snapshot().state, ControlState::Idle);
    assert!(!control.snapshot().actuators.pump_on);
}

#[test]
fn test_alerts_follow_cadence() {
    let Rig { channel, telemetry, mut control } = Rig::new();
    set(&channel, 30.0, 50.0);
    channel.fail_always("tank_bottom");

    for cycle in 0..26 {
        control.run_cycle_blocking(vec![], t(cycle));
    }

    let alert_counts: Vec<u32> = telemetry
        .alerts()
        .iter()
        .filter(|a| a.sensor_id == "tank_bottom")
        .map(|a| a.consecutive_errors)
        .collect();
    assert_eq!(alert_counts, vec![5, 15, 25]);
    assert_eq!(telemetry.health_messages().len(), 26);
}

#[test]
fn test_fault_and_recovery() {
    let Rig { channel, mut control, .. } = Rig::new();
    set(&channel, 60.0, 50.0);
    control.run_cycle_blocking(vec![], t(0));

    channel.fail_always("collector");
    channel.fail_always("tank_middle");
    let mut cycle = 1;
    while control.snapshot().state != ControlState::Faulted {
        control.run_cycle_blocking(vec![], t(cycle));
        cycle += 1;
        assert!(cycle < 100, "never faulted");
    }
    let snap = control.snapshot();
    assert!(!snap.actuators.pump_on);
    assert!(!snap.actuators.heater_on);

    let report = control.run_cycle_blocking(
        vec![Command::SetMode { mode: Mode::Manual }, Command::SetActuator {
            actuator: Actuator::Pump,
            on: true,
        }],
        t(cycle),
    );
    assert_eq!(report.commands[1].result, Err(CommandRejection::Faulted));
    assert_eq!(report.decision.state, ControlState::Faulted);

    channel.set_value("tank_middle", 50.0);
    let report = control.run_cycle_blocking(vec![], t(cycle + 1));
    assert_eq!(report.decision.state, ControlState::ManualOverride);
}

#[test]
fn test_solar_heating_scenario() {
    let Rig { channel, mut control, .. } = Rig::new();
    set(&channel, 35.0, 20.0);
    control.run_cycle_blocking(vec![], t(0));
    assert_eq!(control.snapshot().state, ControlState::Circulating);

    // Tank warms from 20 to 30 in one-degree steps, collector 15 above
    for step in 1..=10 {
        let tank = 20.0 + step as f64;
        set(&channel, tank + 15.0, tank);
        control.run_cycle_blocking(vec![], t(step));
    }

    let ledger = control.ledger();
    assert_eq!(ledger.today_mwh(HeatSource::Solar), 4_200_000);
    assert_eq!(ledger.today_mwh(HeatSource::Cartridge), 0);
    assert_eq!(ledger.today_mwh(HeatSource::Pellet), 0);

    let energy = control.snapshot().energy;
    assert!((energy.total_today() - 4.2).abs() < 1e-9);

    control.reset_hour();
    assert_eq!(control.ledger().total_hour_mwh(), 0);
    assert_eq!(control.ledger().total_today_mwh(), 4_200_000);
}

#[test]
fn test_usage_is_not_collected() {
    let Rig { channel, mut control, .. } = Rig::new();
    set(&channel, 20.0, 55.0);
    control.run_cycle_blocking(vec![], t(0));
    set(&channel, 20.0, 50.0);
    let report = control.run_cycle_blocking(vec![], t(1));
    assert_eq!(report.energy.delta_mwh, None);
    assert_eq!(control.ledger().total_today_mwh(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_cycle_reads_all_sensors() {
    let Rig { channel, mut control, .. } = Rig::new();
    set(&channel, 60.0, 50.0);

    let report = control.run_cycle(vec![], t(0)).await;
    assert_eq!(report.attempts.len(), 4);
    assert_eq!(report.decision.state, ControlState::Circulating);
    assert_eq!(control.snapshot().cycle, 1);
}
