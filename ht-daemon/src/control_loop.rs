//! Control Loop Scheduler
//!
//! Drives `ht_core::ControlLoop` on a fixed interval. The loop task is the
//! only owner of the control state; everyone else talks to it through a
//! [`ControlHandle`]:
//!
//! - reads go to the latest published `Arc<SystemSnapshot>` (watch channel)
//! - writes are queued on an mpsc channel and applied at the start of the
//!   next cycle, each with a oneshot reply carrying the outcome
//!
//! Shutdown lets the running cycle finish and schedules no further cycles.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Timelike, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use ht_core::constants::daemon::{COMMAND_REPLY_TIMEOUT_MS, LOG_EVERY_NTH_ERROR};
use ht_core::ControlLoop;
use ht_error::{HeliothermError, Result};
use ht_protocol::{Command, CommandRejection, ControlState, SystemSnapshot};

/// Pending operator commands before the loop starts refusing new ones
const COMMAND_QUEUE_DEPTH: usize = 64;

pub struct QueuedCommand {
    pub command: Command,
    pub reply: oneshot::Sender<std::result::Result<(), CommandRejection>>,
}

/// Cloneable client side of the control loop
#[derive(Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<QueuedCommand>,
    snapshots: watch::Receiver<Arc<SystemSnapshot>>,
}

impl ControlHandle {
    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<SystemSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Queue a command for the next cycle and wait for its outcome
    pub async fn submit(&self, command: Command) -> Result<std::result::Result<(), CommandRejection>> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .try_send(QueuedCommand { command, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => HeliothermError::generic("command queue full"),
                mpsc::error::TrySendError::Closed(_) => HeliothermError::ControlLoopUnavailable,
            })?;

        match tokio::time::timeout(Duration::from_millis(COMMAND_REPLY_TIMEOUT_MS), outcome).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(HeliothermError::ControlLoopUnavailable),
            Err(_) => Err(HeliothermError::Timeout("waiting for the control loop to apply a command".to_string())),
        }
    }
}

/// Loop side of the channels
pub struct LoopChannels {
    pub commands: mpsc::Receiver<QueuedCommand>,
    pub snapshots: watch::Sender<Arc<SystemSnapshot>>,
}

pub fn channels(initial: SystemSnapshot) -> (ControlHandle, LoopChannels) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial));
    (
        ControlHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        },
        LoopChannels {
            commands: command_rx,
            snapshots: snapshot_tx,
        },
    )
}

/// Local wall-clock hour and day boundaries for the energy accumulators
#[derive(Debug, Default)]
pub struct Rollover {
    last: Option<(NaiveDate, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Boundaries {
    pub hour: bool,
    pub day: bool,
}

impl Rollover {
    /// Compare against the previous observation; the first one only sets the baseline
    pub fn observe(&mut self, date: NaiveDate, hour: u32) -> Boundaries {
        let previous = self.last.replace((date, hour));
        match previous {
            Some((d, h)) => Boundaries {
                day: d != date,
                hour: d != date || h != hour,
            },
            None => Boundaries::default(),
        }
    }

    pub fn observe_local(&mut self, now: DateTime<Local>) -> Boundaries {
        self.observe(now.date_naive(), now.hour())
    }
}

pub async fn run_control_loop(
    mut control: ControlLoop,
    mut channels: LoopChannels,
    mut shutdown: watch::Receiver<bool>,
    cycle_interval: Duration,
) {
    info!(interval_ms = cycle_interval.as_millis() as u64, "CONTROL: loop starting");

    let mut ticker = tokio::time::interval(cycle_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rollover = Rollover::default();
    let mut faulted_cycles: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        let local = Local::now();
        let boundaries = rollover.observe_local(local);
        if boundaries.hour {
            control.reset_hour();
            debug!("CYCLE: hour boundary, hourly energy reset");
        }
        if boundaries.day {
            control.reset_day();
            info!(date = %local.date_naive(), "CYCLE: day boundary, daily energy reset");
        }

        let mut queued = Vec::new();
        while let Ok(command) = channels.commands.try_recv() {
            queued.push(command);
        }
        let (commands, replies): (Vec<_>, Vec<_>) = queued.into_iter().map(|q| (q.command, q.reply)).unzip();

        let report = control.run_cycle(commands, Utc::now()).await;

        for (outcome, reply) in report.commands.iter().zip(replies) {
            if let Err(rejection) = outcome.result {
                info!(command = ?outcome.command, %rejection, "CONTROL: command rejected");
            }
            // Client may have given up waiting
            let _ = reply.send(outcome.result);
        }

        if report.decision.state == ControlState::Faulted {
            faulted_cycles += 1;
            if faulted_cycles == 1 || faulted_cycles % LOG_EVERY_NTH_ERROR == 0 {
                error!(
                    cycles = faulted_cycles,
                    failed = ?report.health.failed_sensors,
                    "CONTROL: automatic control suspended, required sensors failed"
                );
            }
        } else if faulted_cycles > 0 {
            info!(cycles = faulted_cycles, "CONTROL: recovered from fault");
            faulted_cycles = 0;
        }

        if let Some(rejected) = report.decision.rejected {
            debug!(target_state = %rejected.target, remaining_ms = rejected.remaining_ms, "CYCLE: transition deferred");
        }

        channels.snapshots.send_replace(Arc::new(control.snapshot().clone()));
    }

    // Anything still queued will never run
    channels.commands.close();
    while let Ok(queued) = channels.commands.try_recv() {
        drop(queued.reply);
    }
    info!("SHUTDOWN: control loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ht_core::engine::RecordingSleeper;
    use ht_core::{ScriptedChannel, Settings};
    use ht_protocol::{Actuator, Mode};

    fn spawn_loop() -> (ControlHandle, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let channel = Arc::new(ScriptedChannel::new());
        channel.set_value("collector", 30.0);
        for id in ["tank_top", "tank_middle", "tank_bottom"] {
            channel.set_value(id, 50.0);
        }
        let control =
            ControlLoop::new(&Settings::default(), channel).with_sleeper(Arc::new(RecordingSleeper::new()));
        let (handle, loop_channels) = channels(control.snapshot().clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_control_loop(
            control,
            loop_channels,
            shutdown_rx,
            Duration::from_millis(20),
        ));
        (handle, shutdown_tx, task)
    }

    #[test]
    fn test_rollover_boundaries() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let next = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let mut r = Rollover::default();
        assert_eq!(r.observe(day, 10), Boundaries::default());
        assert_eq!(r.observe(day, 10), Boundaries::default());
        assert_eq!(r.observe(day, 11), Boundaries { hour: true, day: false });
        assert_eq!(r.observe(next, 0), Boundaries { hour: true, day: true });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_commands_applied_and_snapshot_published() {
        let (handle, shutdown, task) = spawn_loop();

        let rejected = handle
            .submit(Command::SetActuator {
                actuator: Actuator::Pump,
                on: true,
            })
            .await
            .unwrap();
        assert_eq!(rejected, Err(CommandRejection::NotInManualMode { mode: Mode::Auto }));

        let accepted = handle.submit(Command::SetMode { mode: Mode::Manual }).await.unwrap();
        assert_eq!(accepted, Ok(()));

        let mut snapshots = handle.snapshots.clone();
        snapshots
            .wait_for(|s| s.state == ControlState::ManualOverride)
            .await
            .unwrap();
        assert_eq!(handle.snapshot().actuators.mode, Mode::Manual);
        assert!(handle.snapshot().cycle >= 2);

        shutdown.send_replace(true);
        task.await.unwrap();

        let after = handle.submit(Command::SetMode { mode: Mode::Auto }).await;
        assert!(matches!(after, Err(HeliothermError::ControlLoopUnavailable)));
    }
}
