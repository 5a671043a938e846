//! Background expiration sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::lifecycle::SessionManager;

/// Run [`SessionManager::sweep`] every `interval` until `cancel` fires.
///
/// The first sweep happens one full interval after spawning. A sweep that
/// overruns its slot delays the next one instead of bursting.
pub fn spawn_sweeper(
    manager: Arc<SessionManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = time::Instant::now() + interval;
        let mut ticker = time::interval_at(start, interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = manager.sweep();
                }
                () = cancel.cancelled() => {
                    debug!("expiration sweeper stopped");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lifecycle::{NewSession, SessionManagerConfig};
    use dojo_core::environment::EnvironmentSpec;
    use dojo_core::ids::{StepId, UserId, WorkshopId};
    use dojo_core::workshop::{StepDefinition, SuccessCriterion};
    use dojo_sandbox::Provisioner;
    use dojo_sandbox::scripted::ScriptedProvisioner;

    fn request() -> NewSession {
        NewSession {
            workshop_id: WorkshopId::from("w"),
            user_id: UserId::from("u"),
            steps: vec![StepDefinition {
                id: StepId::from("a"),
                title: String::new(),
                points: 10,
                criterion: SuccessCriterion::ExitCode {
                    expected: 0,
                    command_pattern: None,
                },
                hint: None,
            }],
            ttl: Some(chrono::Duration::minutes(1)),
            environment: EnvironmentSpec::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_expires_without_polling() {
        let p = Arc::new(ScriptedProvisioner::echo());
        let clock = Arc::new(ManualClock::starting_now());
        let provisioner: Arc<dyn Provisioner> = p.clone();
        let mgr = Arc::new(
            SessionManager::new(provisioner, SessionManagerConfig::default())
                .with_clock(clock.clone()),
        );
        let _ = mgr.create_session(request()).await.unwrap();
        assert_eq!(mgr.live_count(), 1);

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(Arc::clone(&mgr), Duration::from_secs(5), cancel.clone());

        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(mgr.live_count(), 1);

        clock.advance(chrono::Duration::minutes(2));
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mgr.live_count(), 0);
        assert_eq!(p.teardown_calls(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_reaps_after_retention() {
        let p: Arc<dyn Provisioner> = Arc::new(ScriptedProvisioner::echo());
        let clock = Arc::new(ManualClock::starting_now());
        let mgr = Arc::new(
            SessionManager::new(p, SessionManagerConfig::default()).with_clock(clock.clone()),
        );
        let id = mgr.create_session(request()).await.unwrap().session.id;
        let _ = mgr.end_session(&id, None).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(Arc::clone(&mgr), Duration::from_secs(1), cancel.clone());

        clock.advance(chrono::Duration::hours(1));
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mgr.session_count(), 0);
        assert!(mgr.get_status(&id).await.is_err());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_stops_loop() {
        let p: Arc<dyn Provisioner> = Arc::new(ScriptedProvisioner::echo());
        let mgr = Arc::new(SessionManager::new(p, SessionManagerConfig::default()));
        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(mgr, Duration::from_secs(3600), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
