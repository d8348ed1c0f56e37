//! Self-healing driver for the analytics graph.
//!
//! State machine: Idle -> Running -> Faulted -> Idle. A bus error or
//! end-of-stream tears the graph down and rebuilds it from the same cameras
//! and handlers. Handlers (and the registry behind them) survive restarts.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use super::{BusMessage, GraphFactory, MediaGraph, SharedHandler};
use crate::config::CameraConfig;
use crate::error::RelayError;

const BUS_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    Faulted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RestartPolicy {
    /// Pause between teardown and rebuild.
    pub backoff: Duration,
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(500),
            max_restarts: None,
        }
    }
}

/// How one run of the graph ended.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Shutdown,
    EndOfStream,
    Fault(String),
}

pub struct Supervisor {
    factory: Arc<dyn GraphFactory>,
    cameras: Vec<CameraConfig>,
    handlers: Vec<SharedHandler>,
    policy: RestartPolicy,
    shutdown: Arc<AtomicBool>,
    state: Arc<Mutex<SupervisorState>>,
    restarts: Arc<AtomicU32>,
}

impl Supervisor {
    pub fn new(
        factory: Arc<dyn GraphFactory>,
        cameras: Vec<CameraConfig>,
        handlers: Vec<SharedHandler>,
        policy: RestartPolicy,
    ) -> Self {
        Self {
            factory,
            cameras,
            handlers,
            policy,
            shutdown: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(SupervisorState::Idle)),
            restarts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn state(&self) -> Result<SupervisorState> {
        read_state(&self.state)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: SupervisorState) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("supervisor state lock poisoned"))?;
        if *state != next {
            log::debug!("supervisor: {:?} -> {:?}", *state, next);
            *state = next;
        }
        Ok(())
    }

    /// Build, start and drive the graph until it stops for any reason.
    ///
    /// A build failure is an error on the first run and a fault afterwards.
    pub fn run_once(&mut self, first: bool) -> Result<RunOutcome> {
        self.set_state(SupervisorState::Idle)?;
        let mut graph = match self.factory.build(&self.cameras, &self.handlers) {
            Ok(graph) => graph,
            Err(err) if first => return Err(err.context("build analytics graph")),
            Err(err) => return Ok(RunOutcome::Fault(format!("rebuild failed: {:#}", err))),
        };
        if let Err(err) = graph.start() {
            let _ = graph.stop();
            if first {
                return Err(err.context("start analytics graph"));
            }
            return Ok(RunOutcome::Fault(format!("restart failed: {:#}", err)));
        }
        self.set_state(SupervisorState::Running)?;
        log::info!("analytics graph running with {} channel(s)", self.cameras.len());

        let outcome = self.drive(graph.as_mut());
        if let Err(err) = graph.stop() {
            log::warn!("analytics graph teardown: {:#}", err);
        }
        outcome
    }

    fn drive(&self, graph: &mut dyn MediaGraph) -> Result<RunOutcome> {
        while !self.shutdown.load(Ordering::SeqCst) {
            match graph.next_message(BUS_POLL) {
                None => continue,
                Some(BusMessage::Eos) => return Ok(RunOutcome::EndOfStream),
                Some(BusMessage::Error { message, debug }) => {
                    log::error!("analytics graph error: {}", message);
                    if let Some(debug) = debug {
                        log::debug!("debug information: {}", debug);
                    }
                    return Ok(RunOutcome::Fault(message));
                }
                Some(BusMessage::Fatal { channel, reason }) => {
                    return Err(RelayError::AnnotatorFatal { channel, reason }.into());
                }
            }
        }
        Ok(RunOutcome::Shutdown)
    }

    /// Run until shutdown, a fatal annotator error or the restart limit.
    pub fn run(&mut self) -> Result<()> {
        let mut first = true;
        loop {
            let outcome = match self.run_once(first) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.set_state(SupervisorState::Faulted)?;
                    return Err(err);
                }
            };
            first = false;
            let reason = match outcome {
                RunOutcome::Shutdown => {
                    self.set_state(SupervisorState::Idle)?;
                    log::info!("supervisor stopped");
                    return Ok(());
                }
                RunOutcome::EndOfStream => "end of stream".to_string(),
                RunOutcome::Fault(message) => message,
            };

            self.set_state(SupervisorState::Faulted)?;
            let restarts = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(limit) = self.policy.max_restarts {
                if restarts > limit {
                    return Err(RelayError::RestartLimit { restarts: limit }.into());
                }
            }
            let fault = RelayError::PipelineFault { message: reason };
            log::warn!("{}; rebuilding analytics graph (restart #{})", fault, restarts);
            if !self.sleep_backoff() {
                self.set_state(SupervisorState::Idle)?;
                return Ok(());
            }
        }
    }

    /// Returns false if shutdown was requested during the pause.
    fn sleep_backoff(&self) -> bool {
        let deadline = Instant::now() + self.policy.backoff;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
        }
    }

    /// Run on a dedicated thread.
    pub fn spawn(mut self) -> Result<SupervisorHandle> {
        let shutdown = self.shutdown.clone();
        let state = self.state.clone();
        let restarts = self.restarts.clone();
        let join = std::thread::Builder::new()
            .name("pipeline-supervisor".to_string())
            .spawn(move || self.run())
            .context("spawn supervisor thread")?;
        Ok(SupervisorHandle {
            shutdown,
            state,
            restarts,
            join,
        })
    }
}

fn read_state(state: &Mutex<SupervisorState>) -> Result<SupervisorState> {
    state
        .lock()
        .map(|s| *s)
        .map_err(|_| anyhow!("supervisor state lock poisoned"))
}

pub struct SupervisorHandle {
    shutdown: Arc<AtomicBool>,
    state: Arc<Mutex<SupervisorState>>,
    restarts: Arc<AtomicU32>,
    join: JoinHandle<Result<()>>,
}

impl SupervisorHandle {
    pub fn state(&self) -> Result<SupervisorState> {
        read_state(&self.state)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn request_stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the supervisor thread and return its result.
    pub fn join(self) -> Result<()> {
        self.join
            .join()
            .map_err(|_| anyhow!("supervisor thread panicked"))?
    }

    pub fn stop(self) -> Result<()> {
        self.request_stop();
        self.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::pipeline::{FrameHandler, SyntheticFactory, SyntheticScript};
    use crate::registry::ChannelRegistry;

    struct Forward(Arc<ChannelRegistry>, usize);

    impl FrameHandler for Forward {
        fn on_frame(&mut self, frame: Frame) -> Result<()> {
            self.0.enqueue(self.1, frame)?;
            Ok(())
        }
    }

    struct Fatal;

    impl FrameHandler for Fatal {
        fn on_frame(&mut self, _frame: Frame) -> Result<()> {
            Err(RelayError::AnnotatorFatal {
                channel: 0,
                reason: "tracker gave up".into(),
            }
            .into())
        }
    }

    fn fast(script: SyntheticScript) -> SyntheticScript {
        SyntheticScript {
            fps: 200,
            width: 32,
            height: 16,
            ..script
        }
    }

    fn cams(n: usize) -> Vec<CameraConfig> {
        (0..n)
            .map(|_| CameraConfig {
                path: "stub://cam".to_string(),
                ..CameraConfig::default()
            })
            .collect()
    }

    fn quick_policy(max_restarts: Option<u32>) -> RestartPolicy {
        RestartPolicy {
            backoff: Duration::from_millis(5),
            max_restarts,
        }
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn fault_rebuilds_without_touching_registry() {
        let registry = Arc::new(ChannelRegistry::new(2));
        registry.mark_active(0).unwrap();
        registry.set_cached(1, Arc::new(Frame::blank(4, 4))).unwrap();
        let handlers: Vec<SharedHandler> = (0..2)
            .map(|ch| Arc::new(Mutex::new(Forward(registry.clone(), ch))) as SharedHandler)
            .collect();
        let factory = Arc::new(SyntheticFactory::with_runs(vec![
            fast(SyntheticScript {
                fault_after: Some(2),
                ..SyntheticScript::default()
            }),
            fast(SyntheticScript::default()),
        ]));

        let supervisor = Supervisor::new(factory.clone(), cams(2), handlers, quick_policy(None));
        let handle = supervisor.spawn().unwrap();
        wait_for(|| handle.restarts() >= 1 && factory.builds() >= 2);
        wait_for(|| handle.state().unwrap() == SupervisorState::Running);

        assert!(registry.is_active(0).unwrap());
        assert!(!registry.is_active(1).unwrap());
        assert!(registry.cached(1).unwrap().is_some());
        wait_for(|| registry.queued(0).unwrap() > 2);
        assert_eq!(registry.queued(1).unwrap(), 0);

        handle.stop().unwrap();
    }

    #[test]
    fn end_of_stream_also_restarts() {
        let factory = Arc::new(SyntheticFactory::new(fast(SyntheticScript {
            frames_per_run: Some(1),
            ..SyntheticScript::default()
        })));
        let registry = Arc::new(ChannelRegistry::new(1));
        let handlers: Vec<SharedHandler> = vec![Arc::new(Mutex::new(Forward(registry, 0)))];
        let handle = Supervisor::new(factory.clone(), cams(1), handlers, quick_policy(None))
            .spawn()
            .unwrap();
        wait_for(|| factory.builds() >= 3);
        handle.stop().unwrap();
    }

    #[test]
    fn restart_limit_ends_with_error() {
        let factory = Arc::new(SyntheticFactory::new(fast(SyntheticScript {
            fault_after: Some(0),
            ..SyntheticScript::default()
        })));
        let registry = Arc::new(ChannelRegistry::new(1));
        let handlers: Vec<SharedHandler> = vec![Arc::new(Mutex::new(Forward(registry, 0)))];
        let mut supervisor = Supervisor::new(factory.clone(), cams(1), handlers, quick_policy(Some(2)));
        let err = supervisor.run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::RestartLimit { restarts: 2 })
        ));
        assert_eq!(factory.builds(), 3);
        assert_eq!(supervisor.state().unwrap(), SupervisorState::Faulted);
    }

    #[test]
    fn annotator_fatal_stops_supervisor() {
        let factory = Arc::new(SyntheticFactory::new(fast(SyntheticScript::default())));
        let handlers: Vec<SharedHandler> = vec![Arc::new(Mutex::new(Fatal))];
        let mut supervisor = Supervisor::new(factory.clone(), cams(1), handlers, quick_policy(None));
        let err = supervisor.run().unwrap_err();
        let relay = err.downcast_ref::<RelayError>().expect("typed error");
        assert!(relay.is_fatal());
        assert_eq!(factory.builds(), 1);
        assert_eq!(supervisor.restarts(), 0);
    }

    #[test]
    fn first_build_failure_is_fatal() {
        let factory = Arc::new(SyntheticFactory::default());
        let mut supervisor = Supervisor::new(factory, cams(1), Vec::new(), quick_policy(None));
        assert!(supervisor.run().is_err());
    }

    #[test]
    fn shutdown_flag_ends_run_cleanly() {
        let factory = Arc::new(SyntheticFactory::new(fast(SyntheticScript::default())));
        let registry = Arc::new(ChannelRegistry::new(1));
        let handlers: Vec<SharedHandler> = vec![Arc::new(Mutex::new(Forward(registry, 0)))];
        let supervisor = Supervisor::new(factory, cams(1), handlers, quick_policy(None));
        let flag = supervisor.shutdown_flag();
        let handle = supervisor.spawn().unwrap();
        wait_for(|| handle.state().unwrap() == SupervisorState::Running);
        flag.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
