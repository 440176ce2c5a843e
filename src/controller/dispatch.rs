//! Trigger dispatcher
//!
//! Turns machine watch events and a periodic resync timer into reconciliation
//! passes. Passes run one at a time; triggers that arrive while a pass is
//! running are coalesced into a single follow-up pass. Retryable failures are
//! retried after an exponential backoff; fatal failures stop the loop.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconciler::{PassError, PassReport, Reconciler, Trigger};
use crate::crd::Machine;
use crate::error::FailureKind;
use crate::retry::{Backoff, RetryConfig};

/// Server-side watch timeout, kept below common proxy idle timeouts
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Delay before re-polling a watcher that returned an error
const WATCH_ERROR_DELAY: Duration = Duration::from_secs(5);

/// What the dispatcher does after a pass
#[derive(Debug)]
pub enum Next {
    /// Wait for the next trigger
    Idle,
    /// Run another pass after the delay
    RetryAfter(Duration),
    /// Stop dispatching
    Halt(PassError),
}

/// Decide what follows a pass, updating the consecutive-failure backoff
pub fn next_step(result: Result<PassReport, PassError>, backoff: &mut Backoff) -> Next {
    match result {
        Ok(_) => {
            backoff.reset();
            Next::Idle
        }
        Err(err) if err.kind() == FailureKind::Fatal => Next::Halt(err),
        Err(err) => {
            // The pass's own suggestion is a floor under the backoff
            let delay = backoff
                .next_delay()
                .max(err.suggested_retry().unwrap_or_default());
            if backoff.exhausted() {
                return Next::Halt(err);
            }
            warn!(
                error = %err,
                attempt = backoff.failures(),
                delay_ms = delay.as_millis(),
                "reconciliation failed, retrying"
            );
            Next::RetryAfter(delay)
        }
    }
}

/// Map a watcher event to a trigger
///
/// The initial listing is collapsed into one resync once it completes.
fn trigger_for(event: &Event<Machine>) -> Option<Trigger> {
    match event {
        Event::Apply(machine) | Event::Delete(machine) => Some(Trigger::changed(machine)),
        Event::InitDone => Some(Trigger::Resync),
        Event::Init | Event::InitApply(_) => None,
    }
}

/// Stream of triggers from a watch on machines in `namespace`
///
/// Watch errors are logged and the watch resumes after a short delay; the
/// resync timer covers anything missed meanwhile.
pub fn machine_triggers(client: Client, namespace: &str) -> impl Stream<Item = Trigger> + Send {
    let api: Api<Machine> = Api::namespaced(client, namespace);
    let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);

    watcher::watcher(api, config).filter_map(|event| async move {
        match event {
            Ok(event) => trigger_for(&event),
            Err(e) => {
                warn!(error = %e, "machine watcher error, will retry");
                tokio::time::sleep(WATCH_ERROR_DELAY).await;
                None
            }
        }
    })
}

/// Runs reconciliation passes for one scope
pub struct Dispatcher {
    reconciler: Arc<Reconciler>,
    resync_interval: Duration,
    retry: RetryConfig,
}

impl Dispatcher {
    /// Create a dispatcher using the reconciler's resync and retry settings
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let config = reconciler.config();
        Self {
            resync_interval: config.resync_interval,
            retry: config.retry.clone(),
            reconciler,
        }
    }

    /// Dispatch passes until `shutdown` fires or a fatal failure occurs
    ///
    /// The first resync tick fires immediately, so startup always runs a
    /// pass. A pass in flight is allowed to finish before shutdown returns.
    /// If the trigger stream ends, dispatching continues on the resync timer.
    ///
    /// # Errors
    ///
    /// The [`PassError`] of a fatal failure, or of the last retryable
    /// failure once the retry budget is exhausted.
    pub async fn run<S>(self, triggers: S, shutdown: CancellationToken) -> Result<(), PassError>
    where
        S: Stream<Item = Trigger> + Send,
    {
        let mut triggers = std::pin::pin!(triggers);
        let mut triggers_open = true;

        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut backoff = Backoff::new(self.retry.clone());
        let mut pending: Option<Trigger> = None;
        let mut retry_at: Option<Instant> = None;

        info!(
            pool = %self.reconciler.config().pool_id,
            namespace = %self.reconciler.config().namespace,
            resync_secs = self.resync_interval.as_secs(),
            "dispatcher started"
        );

        loop {
            if retry_at.is_none() && pending.is_some() {
                // Fold everything already queued into this pass
                while triggers_open {
                    match triggers.next().now_or_never() {
                        Some(Some(trigger)) => pending = Some(trigger),
                        Some(None) => triggers_open = false,
                        None => break,
                    }
                }

                if let Some(trigger) = pending.take() {
                    let result = self.reconciler.reconcile(&trigger).await;
                    match next_step(result, &mut backoff) {
                        Next::Idle => {}
                        Next::RetryAfter(delay) => retry_at = Some(Instant::now() + delay),
                        Next::Halt(err) => {
                            error!(error = %err, "reconciliation halted");
                            return Err(err);
                        }
                    }
                }
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("dispatcher shutting down");
                    return Ok(());
                }

                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    retry_at = None;
                    pending.get_or_insert(Trigger::Resync);
                }

                _ = resync.tick() => {
                    if retry_at.is_none() {
                        debug!("periodic resync");
                        pending.get_or_insert(Trigger::Resync);
                    }
                }

                next = triggers.next(), if triggers_open => match next {
                    Some(trigger) => {
                        debug!(trigger = %trigger, "trigger received");
                        pending = Some(trigger);
                    }
                    None => {
                        warn!("trigger stream ended, continuing on resync only");
                        triggers_open = false;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::controller::PassStep;
    use crate::crd::{MachinePhase, MachineRecord, MachineSpec};
    use crate::provider::{InMemoryPool, PoolCall, PoolOperation};
    use crate::source::{MachineSource, StaticMachineSource};
    use crate::Error;
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const POOL: &str = "api-int";
    const NAMESPACE: &str = "default";

    fn master(name: &str) -> MachineRecord {
        MachineRecord::new(NAMESPACE, name)
            .with_role("master")
            .with_phase(MachinePhase::Running)
            .with_instance_id(name)
    }

    fn list_calls(pool: &InMemoryPool) -> usize {
        pool.calls()
            .iter()
            .filter(|c| matches!(c, PoolCall::List))
            .count()
    }

    fn dispatcher(source: Arc<dyn MachineSource>, pool: &InMemoryPool) -> Dispatcher {
        let config = ControllerConfig::new(POOL).namespace(NAMESPACE);
        let reconciler = Reconciler::new(source, Arc::new(pool.clone()), config)
            .expect("config should be valid");
        Dispatcher::new(Arc::new(reconciler))
    }

    fn pass_error(error: Error) -> PassError {
        PassError::new(
            PassStep::FetchMachines,
            error,
            PassReport::default(),
            Duration::from_secs(1),
        )
    }

    mod next_step_policy {
        use super::*;

        #[test]
        fn test_success_resets_backoff() {
            let mut backoff = Backoff::new(RetryConfig::default());
            backoff.next_delay();
            backoff.next_delay();

            let next = next_step(Ok(PassReport::default()), &mut backoff);

            assert!(matches!(next, Next::Idle));
            assert_eq!(backoff.failures(), 0);
        }

        #[test]
        fn test_retryable_failure_backs_off() {
            let mut backoff = Backoff::new(RetryConfig::default());

            let next = next_step(Err(pass_error(Error::provider("Throttling"))), &mut backoff);

            match next {
                Next::RetryAfter(delay) => assert!(delay <= Duration::from_millis(1500)),
                other => panic!("expected retry, got {:?}", other),
            }
            assert_eq!(backoff.failures(), 1);
        }

        /// Story: a provider asking for a longer pause gets at least that long
        #[test]
        fn story_provider_hint_floors_the_backoff() {
            let mut backoff = Backoff::new(RetryConfig::default());

            let next = next_step(
                Err(pass_error(Error::throttled(
                    "RequestLimitExceeded",
                    Duration::from_secs(30),
                ))),
                &mut backoff,
            );

            match next {
                Next::RetryAfter(delay) => assert!(delay >= Duration::from_secs(30)),
                other => panic!("expected retry, got {:?}", other),
            }
        }

        /// Story: a misconfigured controller stops instead of retrying forever
        #[test]
        fn story_fatal_failure_halts() {
            let mut backoff = Backoff::new(RetryConfig::default());

            let next = next_step(
                Err(pass_error(Error::configuration("no load balancer pool id configured"))),
                &mut backoff,
            );

            assert!(matches!(next, Next::Halt(_)));
            assert_eq!(backoff.failures(), 0);
        }

        #[test]
        fn test_exhausted_retries_halt() {
            let mut backoff = Backoff::new(RetryConfig::with_max_attempts(1));

            let next = next_step(Err(pass_error(Error::provider("down"))), &mut backoff);

            assert!(matches!(next, Next::Halt(_)));
        }
    }

    mod watch_events {
        use super::*;

        fn machine(name: &str) -> Machine {
            Machine {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(NAMESPACE.to_string()),
                    ..Default::default()
                },
                spec: MachineSpec::default(),
                status: None,
            }
        }

        #[test]
        fn test_changes_and_deletes_trigger_passes() {
            let expected = Some(Trigger::MachineChanged {
                namespace: NAMESPACE.to_string(),
                name: "master001".to_string(),
            });
            assert_eq!(trigger_for(&Event::Apply(machine("master001"))), expected);
            assert_eq!(trigger_for(&Event::Delete(machine("master001"))), expected);
        }

        #[test]
        fn test_initial_listing_collapses_to_one_resync() {
            assert_eq!(trigger_for(&Event::Init), None);
            assert_eq!(trigger_for(&Event::InitApply(machine("master001"))), None);
            assert_eq!(trigger_for(&Event::InitDone), Some(Trigger::Resync));
        }
    }

    mod dispatch_loop {
        use super::*;

        /// Story: starting the controller converges the pool without any event
        #[tokio::test(start_paused = true)]
        async fn story_startup_runs_a_pass() {
            let pool = InMemoryPool::new(POOL);
            let source = StaticMachineSource::new(vec![master("master001"), master("master002")]);
            let (_tx, rx) = mpsc::unbounded::<Trigger>();
            let shutdown = CancellationToken::new();

            let handle = tokio::spawn(dispatcher(Arc::new(source), &pool).run(rx, shutdown.clone()));
            tokio::time::sleep(Duration::from_secs(1)).await;

            assert_eq!(
                pool.members(POOL),
                ["master001", "master002"].iter().map(|s| s.to_string()).collect()
            );

            shutdown.cancel();
            assert!(handle.await.expect("task should not panic").is_ok());
        }

        /// Story: a burst of machine events costs one pass, not one per event
        #[tokio::test(start_paused = true)]
        async fn story_burst_of_triggers_is_coalesced() {
            let pool = InMemoryPool::new(POOL);
            let source = StaticMachineSource::new(vec![master("master001")]);
            let (tx, rx) = mpsc::unbounded();
            for i in 0..5 {
                tx.unbounded_send(Trigger::MachineChanged {
                    namespace: NAMESPACE.to_string(),
                    name: format!("master00{}", i),
                })
                .expect("channel open");
            }
            let shutdown = CancellationToken::new();

            let handle = tokio::spawn(dispatcher(Arc::new(source), &pool).run(rx, shutdown.clone()));
            tokio::time::sleep(Duration::from_secs(1)).await;

            assert_eq!(list_calls(&pool), 1);

            shutdown.cancel();
            assert!(handle.await.expect("task should not panic").is_ok());
        }

        /// Story: a provider hiccup is retried after a backoff, not in a hot loop
        #[tokio::test(start_paused = true)]
        async fn story_failed_pass_is_retried_with_backoff() {
            let pool = InMemoryPool::new(POOL);
            pool.fail_next(PoolOperation::List, Error::provider("Throttling"));
            let source = StaticMachineSource::new(vec![master("master001")]);
            let (_tx, rx) = mpsc::unbounded::<Trigger>();
            let shutdown = CancellationToken::new();

            let handle = tokio::spawn(dispatcher(Arc::new(source), &pool).run(rx, shutdown.clone()));

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(list_calls(&pool), 1);
            assert!(pool.members(POOL).is_empty());

            tokio::time::sleep(Duration::from_secs(2)).await;
            assert_eq!(list_calls(&pool), 2);
            assert!(pool.members(POOL).contains("master001"));

            shutdown.cancel();
            assert!(handle.await.expect("task should not panic").is_ok());
        }

        /// Story: new triggers during the backoff wait for the retry
        #[tokio::test(start_paused = true)]
        async fn story_triggers_during_backoff_wait_for_retry() {
            let pool = InMemoryPool::new(POOL);
            pool.fail_next(PoolOperation::List, Error::provider("Throttling"));
            let source = StaticMachineSource::new(vec![master("master001")]);
            let (tx, rx) = mpsc::unbounded();
            let shutdown = CancellationToken::new();

            let handle = tokio::spawn(dispatcher(Arc::new(source), &pool).run(rx, shutdown.clone()));
            tokio::time::sleep(Duration::from_millis(100)).await;

            tx.unbounded_send(Trigger::Resync).expect("channel open");
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(list_calls(&pool), 1);

            tokio::time::sleep(Duration::from_secs(2)).await;
            assert_eq!(list_calls(&pool), 2);

            shutdown.cancel();
            assert!(handle.await.expect("task should not panic").is_ok());
        }

        /// Source that reports a configuration problem on every call
        struct MisconfiguredSource;

        #[async_trait]
        impl MachineSource for MisconfiguredSource {
            async fn list_machines(&self, _scope: &str) -> Result<Vec<MachineRecord>, Error> {
                Err(Error::configuration("machine API group not served"))
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_fatal_failure_stops_dispatcher() {
            let pool = InMemoryPool::new(POOL);
            let (_tx, rx) = mpsc::unbounded::<Trigger>();

            let result = dispatcher(Arc::new(MisconfiguredSource), &pool)
                .run(rx, CancellationToken::new())
                .await;

            let err = result.unwrap_err();
            assert_eq!(err.kind(), FailureKind::Fatal);
            assert!(pool.calls().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn test_closed_trigger_stream_falls_back_to_resync() {
            let pool = InMemoryPool::new(POOL);
            let source = StaticMachineSource::new(vec![master("master001")]);
            let (tx, rx) = mpsc::unbounded::<Trigger>();
            drop(tx);
            let shutdown = CancellationToken::new();

            let handle = tokio::spawn(dispatcher(Arc::new(source), &pool).run(rx, shutdown.clone()));
            tokio::time::sleep(Duration::from_secs(130)).await;

            // startup pass plus two resync ticks
            assert_eq!(list_calls(&pool), 3);

            shutdown.cancel();
            assert!(handle.await.expect("task should not panic").is_ok());
        }
    }
}
