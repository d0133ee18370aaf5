//! Session state machine and restart loop.
//!
//! Every attempt gets a fresh [`Pipeline`] from the factory and a fresh fault
//! channel. Each setup step is raced against the stop request and the fault
//! channel, so a crash mid-setup or a ctrl-c during a 30 s wait ends the
//! attempt immediately. Whatever ends an attempt, its pipeline is torn down
//! exactly once before anything else happens.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::RestartPolicy;
use crate::error::{Error, Result};
use crate::fault::{Fault, FaultReceiver, FaultSender, fault_channel, panic_message};

/// The components of one attempt, driven step by step.
#[async_trait]
pub trait Pipeline: Send {
	/// Launch, navigate and wait for the page to be ready.
	async fn open_browser(&mut self) -> Result<()>;

	/// Audio tap, relay, transcoder and recorder.
	async fn arm_capture(&mut self) -> Result<()>;

	async fn await_producer(&mut self, timeout: Duration) -> Result<()>;

	/// Releases everything in reverse dependency order. Must tolerate
	/// partially built state and repeated calls.
	async fn teardown(&mut self);

	fn health(&self) -> HealthReport;
}

/// Builds the pipeline for one attempt, wired to that attempt's faults.
pub trait PipelineFactory: Send + Sync {
	fn build(&self, faults: FaultSender) -> Box<dyn Pipeline>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
	pub producer_connected: bool,
	pub transcoder_running: bool,
	pub audio_enabled: bool,
	pub chunks: u64,
	pub megabytes: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Init,
	BrowserReady,
	CaptureArmed,
	Streaming,
	Error,
	Restarting,
	Stopped,
}

impl fmt::Display for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			SessionState::Init => "init",
			SessionState::BrowserReady => "browser_ready",
			SessionState::CaptureArmed => "capture_armed",
			SessionState::Streaming => "streaming",
			SessionState::Error => "error",
			SessionState::Restarting => "restarting",
			SessionState::Stopped => "stopped",
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
	pub state: SessionState,
	pub restart_count: u32,
	pub current_backoff: Duration,
}

/// Restart counter and the delay before the next restart.
#[derive(Debug, Clone)]
pub struct Backoff {
	policy: RestartPolicy,
	count: u32,
	delay: Duration,
}

impl Backoff {
	pub fn new(policy: RestartPolicy) -> Self {
		let delay = policy.initial_delay;
		Self { policy, count: 0, delay }
	}

	pub fn count(&self) -> u32 {
		self.count
	}

	pub fn delay(&self) -> Duration {
		self.delay
	}

	pub fn is_exhausted(&self) -> bool {
		self.count >= self.policy.max_restarts
	}

	/// Counts a restart and returns how long to wait before it, or `None`
	/// once the bound is reached.
	pub fn schedule(&mut self) -> Option<Duration> {
		if self.is_exhausted() {
			return None;
		}
		let wait = self.delay;
		self.count += 1;
		self.delay = self.next_delay(wait);
		Some(wait)
	}

	/// `wait * multiplier`, capped at `max_delay` even when the product does
	/// not fit a [`Duration`].
	fn next_delay(&self, wait: Duration) -> Duration {
		let max = self.policy.max_delay;
		Duration::try_from_secs_f64(wait.as_secs_f64() * self.policy.multiplier)
			.map_or(max, |next| next.min(max))
	}

	pub fn reset(&mut self) {
		self.count = 0;
		self.delay = self.policy.initial_delay;
	}
}

/// How [`RecoveryManager::run`] ended.
#[derive(Debug)]
pub enum Outcome {
	/// A stop was requested.
	Stopped,
	/// The restart bound was hit.
	Exhausted { restarts: u32 },
	/// A step failed in a way restarting cannot fix.
	Failed(Error),
}

impl Outcome {
	pub fn exit_code(&self) -> i32 {
		match self {
			Outcome::Stopped => 0,
			Outcome::Exhausted { .. } | Outcome::Failed(_) => 1,
		}
	}
}

/// Requests a stop from outside the run loop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StopHandle {
	tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
	pub fn stop(&self) {
		self.tx.send_replace(true);
	}
}

/// Why an attempt ended.
enum AttemptEnd {
	Stopped,
	Failed(Error),
	Fault(Fault),
}

pub struct RecoveryManager {
	factory: Arc<dyn PipelineFactory>,
	policy: RestartPolicy,
	producer_timeout: Duration,
	health_interval: Duration,
	status: watch::Sender<SessionStatus>,
	stop: Arc<watch::Sender<bool>>,
}

impl RecoveryManager {
	pub fn new(
		factory: impl PipelineFactory + 'static,
		policy: RestartPolicy,
		producer_timeout: Duration,
		health_interval: Duration,
	) -> Self {
		let (status, _) = watch::channel(SessionStatus {
			state: SessionState::Init,
			restart_count: 0,
			current_backoff: policy.initial_delay,
		});
		let (stop, _) = watch::channel(false);
		Self {
			factory: Arc::new(factory),
			policy,
			producer_timeout,
			health_interval,
			status,
			stop: Arc::new(stop),
		}
	}

	pub fn status(&self) -> watch::Receiver<SessionStatus> {
		self.status.subscribe()
	}

	pub fn stop_handle(&self) -> StopHandle {
		StopHandle {
			tx: Arc::clone(&self.stop),
		}
	}

	/// Runs attempts until a stop, a non-retryable error or exhaustion.
	pub async fn run(self) -> Outcome {
		let mut stop = self.stop.subscribe();
		let mut backoff = Backoff::new(self.policy.clone());

		loop {
			if *stop.borrow() {
				self.publish(SessionState::Stopped, &backoff);
				return Outcome::Stopped;
			}

			self.publish(SessionState::Init, &backoff);
			let (faults, mut fault_rx) = fault_channel();
			// Keeps the channel open even if the pipeline drops every sender.
			let _keepalive = faults.clone();
			let mut pipeline = self.factory.build(faults);

			let end = self
				.attempt(pipeline.as_mut(), &mut fault_rx, &mut stop, &mut backoff)
				.await;

			if !matches!(end, AttemptEnd::Stopped) {
				self.publish(SessionState::Error, &backoff);
			}
			teardown(pipeline.as_mut()).await;
			drop(pipeline);

			match end {
				AttemptEnd::Stopped => {
					info!(target = "pixelcast.recovery", "stopped on request");
					self.publish(SessionState::Stopped, &backoff);
					return Outcome::Stopped;
				}
				AttemptEnd::Failed(e) if !e.is_retryable() => {
					error!(target = "pixelcast.recovery", error = %e, "not retrying");
					self.publish(SessionState::Stopped, &backoff);
					return Outcome::Failed(e);
				}
				AttemptEnd::Failed(e) => {
					error!(target = "pixelcast.recovery", error = %e, "pipeline step failed");
				}
				AttemptEnd::Fault(fault) => {
					error!(target = "pixelcast.recovery", %fault, "pipeline fault");
				}
			}

			let Some(wait) = backoff.schedule() else {
				error!(
					target = "pixelcast.recovery",
					max_restarts = self.policy.max_restarts,
					"maximum restart attempts reached"
				);
				self.publish(SessionState::Stopped, &backoff);
				return Outcome::Exhausted {
					restarts: backoff.count(),
				};
			};

			self.status.send_replace(SessionStatus {
				state: SessionState::Restarting,
				restart_count: backoff.count(),
				current_backoff: wait,
			});
			info!(
				target = "pixelcast.recovery",
				attempt = backoff.count(),
				max_restarts = self.policy.max_restarts,
				delay_ms = wait.as_millis() as u64,
				"restarting"
			);

			tokio::select! {
				_ = tokio::time::sleep(wait) => {}
				_ = stop.wait_for(|stopped| *stopped) => {
					info!(target = "pixelcast.recovery", "stopped during backoff");
					self.publish(SessionState::Stopped, &backoff);
					return Outcome::Stopped;
				}
			}
		}
	}

	async fn attempt(
		&self,
		pipeline: &mut dyn Pipeline,
		faults: &mut FaultReceiver,
		stop: &mut watch::Receiver<bool>,
		backoff: &mut Backoff,
	) -> AttemptEnd {
		if let Err(end) = race("open_browser", pipeline.open_browser(), faults, stop).await {
			return end;
		}
		self.publish(SessionState::BrowserReady, backoff);

		if let Err(end) = race("arm_capture", pipeline.arm_capture(), faults, stop).await {
			return end;
		}
		self.publish(SessionState::CaptureArmed, backoff);

		let timeout = self.producer_timeout;
		if let Err(end) = race("await_producer", pipeline.await_producer(timeout), faults, stop).await {
			return end;
		}

		backoff.reset();
		self.publish(SessionState::Streaming, backoff);
		info!(target = "pixelcast.recovery", "streaming");

		let mut health = tokio::time::interval_at(Instant::now() + self.health_interval, self.health_interval);
		health.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				biased;
				_ = stop.wait_for(|stopped| *stopped) => return AttemptEnd::Stopped,
				Some(fault) = faults.recv() => return AttemptEnd::Fault(fault),
				_ = health.tick() => log_health(&pipeline.health()),
			}
		}
	}

	fn publish(&self, state: SessionState, backoff: &Backoff) {
		self.status.send_replace(SessionStatus {
			state,
			restart_count: backoff.count(),
			current_backoff: backoff.delay(),
		});
	}
}

/// Runs one setup step unless a stop or fault gets there first.
async fn race<F>(
	step: &'static str,
	future: F,
	faults: &mut FaultReceiver,
	stop: &mut watch::Receiver<bool>,
) -> std::result::Result<(), AttemptEnd>
where
	F: Future<Output = Result<()>> + Send,
{
	tokio::select! {
		biased;
		_ = stop.wait_for(|stopped| *stopped) => Err(AttemptEnd::Stopped),
		Some(fault) = faults.recv() => Err(AttemptEnd::Fault(fault)),
		result = AssertUnwindSafe(future).catch_unwind() => match result {
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) => Err(AttemptEnd::Failed(e)),
			Err(payload) => Err(AttemptEnd::Fault(Fault::TaskPanicked {
				task: step.to_string(),
				message: panic_message(payload.as_ref()),
			})),
		},
	}
}

async fn teardown(pipeline: &mut dyn Pipeline) {
	if let Err(payload) = AssertUnwindSafe(pipeline.teardown()).catch_unwind().await {
		warn!(
			target = "pixelcast.recovery",
			panic = %panic_message(payload.as_ref()),
			"teardown panicked"
		);
	}
}

fn log_health(report: &HealthReport) {
	if report.producer_connected {
		info!(
			target = "pixelcast.recovery",
			chunks = report.chunks,
			megabytes = format_args!("{:.2}", report.megabytes),
			audio = report.audio_enabled,
			transcoder = report.transcoder_running,
			"health: stream active"
		);
	} else {
		warn!(
			target = "pixelcast.recovery",
			chunks = report.chunks,
			transcoder = report.transcoder_running,
			"health: producer disconnected"
		);
	}
}

#[cfg(test)]
mod tests {
	use std::collections::VecDeque;

	use parking_lot::Mutex;

	use super::*;

	const PRODUCER_TIMEOUT: Duration = Duration::from_secs(30);
	const HEALTH: Duration = Duration::from_secs(60);

	#[derive(Debug, Clone, Copy)]
	enum Plan {
		Stream,
		LaunchFails,
		BadConfig,
		NoProducer,
		PanicOnArm,
		/// Streams, then the transcoder dies after the given delay.
		CrashWhileStreaming(Duration),
	}

	#[derive(Default)]
	struct Log {
		/// Whole seconds since the factory was created.
		builds: Vec<u64>,
		teardowns: usize,
	}

	struct FakeFactory {
		plans: Mutex<VecDeque<Plan>>,
		fallback: Plan,
		log: Arc<Mutex<Log>>,
		started: Instant,
	}

	impl FakeFactory {
		fn new(plans: &[Plan], fallback: Plan) -> (Self, Arc<Mutex<Log>>) {
			let log = Arc::new(Mutex::new(Log::default()));
			let factory = Self {
				plans: Mutex::new(plans.iter().copied().collect()),
				fallback,
				log: Arc::clone(&log),
				started: Instant::now(),
			};
			(factory, log)
		}
	}

	impl PipelineFactory for FakeFactory {
		fn build(&self, faults: FaultSender) -> Box<dyn Pipeline> {
			self.log.lock().builds.push(self.started.elapsed().as_secs());
			let plan = self.plans.lock().pop_front().unwrap_or(self.fallback);
			Box::new(FakePipeline {
				plan,
				faults,
				log: Arc::clone(&self.log),
				torn_down: false,
			})
		}
	}

	struct FakePipeline {
		plan: Plan,
		faults: FaultSender,
		log: Arc<Mutex<Log>>,
		torn_down: bool,
	}

	#[async_trait]
	impl Pipeline for FakePipeline {
		async fn open_browser(&mut self) -> Result<()> {
			match self.plan {
				Plan::LaunchFails => Err(Error::Launch("chromium exited with status 1".into())),
				Plan::BadConfig => Err(Error::Config("stream key is missing".into())),
				_ => Ok(()),
			}
		}

		async fn arm_capture(&mut self) -> Result<()> {
			if let Plan::PanicOnArm = self.plan {
				panic!("arm exploded");
			}
			Ok(())
		}

		async fn await_producer(&mut self, timeout: Duration) -> Result<()> {
			match self.plan {
				Plan::NoProducer => {
					tokio::time::sleep(timeout).await;
					Err(Error::timeout("recorder connection", timeout))
				}
				Plan::CrashWhileStreaming(after) => {
					let faults = self.faults.clone();
					tokio::spawn(async move {
						tokio::time::sleep(after).await;
						faults.raise(Fault::TranscoderExited { code: Some(1) });
					});
					Ok(())
				}
				_ => Ok(()),
			}
		}

		async fn teardown(&mut self) {
			assert!(!self.torn_down, "pipeline torn down twice");
			self.torn_down = true;
			self.log.lock().teardowns += 1;
		}

		fn health(&self) -> HealthReport {
			HealthReport {
				producer_connected: true,
				..HealthReport::default()
			}
		}
	}

	fn policy(max_restarts: u32, initial_secs: u64, multiplier: f64, max_secs: u64) -> RestartPolicy {
		RestartPolicy {
			max_restarts,
			initial_delay: Duration::from_secs(initial_secs),
			max_delay: Duration::from_secs(max_secs),
			multiplier,
		}
	}

	fn manager(factory: FakeFactory, policy: RestartPolicy) -> RecoveryManager {
		RecoveryManager::new(factory, policy, PRODUCER_TIMEOUT, HEALTH)
	}

	async fn wait_for_state(status: &mut watch::Receiver<SessionStatus>, state: SessionState) -> SessionStatus {
		*status.wait_for(|s| s.state == state).await.unwrap()
	}

	#[test]
	fn backoff_grows_geometrically_up_to_the_cap() {
		let policy = RestartPolicy::default();
		let mut backoff = Backoff::new(policy.clone());
		for n in 0..policy.max_restarts {
			let expected = Duration::from_secs_f64(5.0 * 1.5f64.powi(n as i32)).min(policy.max_delay);
			assert_eq!(backoff.schedule(), Some(expected), "restart {n}");
			assert_eq!(backoff.count(), n + 1);
		}
		assert!(backoff.is_exhausted());
		assert_eq!(backoff.schedule(), None);

		backoff.reset();
		assert_eq!(backoff.count(), 0);
		assert_eq!(backoff.schedule(), Some(Duration::from_secs(5)));
	}

	#[test]
	fn huge_multiplier_caps_instead_of_overflowing() {
		for multiplier in [1e20, f64::MAX, f64::INFINITY] {
			let mut backoff = Backoff::new(policy(3, 5, multiplier, 600));
			assert_eq!(backoff.schedule(), Some(Duration::from_secs(5)));
			assert_eq!(backoff.schedule(), Some(Duration::from_secs(600)), "x{multiplier}");
			assert_eq!(backoff.schedule(), Some(Duration::from_secs(600)));
			assert_eq!(backoff.schedule(), None);
		}
	}

	#[test]
	fn zero_restarts_means_no_retry() {
		let mut backoff = Backoff::new(policy(0, 1, 2.0, 10));
		assert_eq!(backoff.schedule(), None);
	}

	#[test]
	fn only_a_requested_stop_exits_cleanly() {
		assert_eq!(Outcome::Stopped.exit_code(), 0);
		assert_eq!(Outcome::Exhausted { restarts: 10 }.exit_code(), 1);
		assert_eq!(Outcome::Failed(Error::Config("x".into())).exit_code(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn missing_producer_schedules_first_restart() {
		let (factory, log) = FakeFactory::new(&[Plan::NoProducer], Plan::Stream);
		let manager = manager(factory, RestartPolicy::default());
		let mut status = manager.status();
		let stop = manager.stop_handle();
		let run = tokio::spawn(manager.run());

		let restarting = wait_for_state(&mut status, SessionState::Restarting).await;
		assert_eq!(restarting.restart_count, 1);
		assert_eq!(restarting.current_backoff, Duration::from_secs(5));
		assert_eq!(log.lock().teardowns, 1);

		let streaming = wait_for_state(&mut status, SessionState::Streaming).await;
		assert_eq!(streaming.restart_count, 0);
		assert_eq!(log.lock().builds, vec![0, 35]);

		stop.stop();
		assert!(matches!(run.await.unwrap(), Outcome::Stopped));
		assert_eq!(log.lock().teardowns, 2);
	}

	#[tokio::test(start_paused = true)]
	async fn exhaustion_stops_with_failure_after_full_teardown() {
		let (factory, log) = FakeFactory::new(&[], Plan::LaunchFails);
		let manager = manager(factory, policy(3, 1, 2.0, 3));
		let mut status = manager.status();

		let outcome = manager.run().await;
		assert!(matches!(outcome, Outcome::Exhausted { restarts: 3 }));
		assert_eq!(outcome.exit_code(), 1);
		assert_eq!(status.borrow_and_update().state, SessionState::Stopped);

		let log = log.lock();
		assert_eq!(
			log.builds,
			vec![0, 1, 3, 6],
			"delays 1s, 2s, then capped at 3s"
		);
		assert_eq!(log.teardowns, 4);
	}

	#[tokio::test(start_paused = true)]
	async fn streaming_resets_backoff() {
		let (factory, log) = FakeFactory::new(
			&[Plan::LaunchFails, Plan::CrashWhileStreaming(Duration::from_secs(1))],
			Plan::Stream,
		);
		let manager = manager(factory, policy(10, 5, 2.0, 60));
		let mut status = manager.status();
		let stop = manager.stop_handle();
		let run = tokio::spawn(manager.run());

		// Third build only happens after the crash while streaming.
		loop {
			let current = wait_for_state(&mut status, SessionState::Streaming).await;
			if log.lock().builds.len() == 3 {
				assert_eq!(current.restart_count, 0);
				break;
			}
			status.changed().await.unwrap();
		}

		// Without the reset the second delay would have been 10s.
		assert_eq!(log.lock().builds, vec![0, 5, 11]);

		stop.stop();
		assert!(matches!(run.await.unwrap(), Outcome::Stopped));
		assert_eq!(log.lock().teardowns, 3);
	}

	#[tokio::test(start_paused = true)]
	async fn stop_while_streaming_tears_down_once() {
		let (factory, log) = FakeFactory::new(&[], Plan::Stream);
		let manager = manager(factory, RestartPolicy::default());
		let mut status = manager.status();
		let stop = manager.stop_handle();
		let run = tokio::spawn(manager.run());

		wait_for_state(&mut status, SessionState::Streaming).await;
		stop.stop();

		let outcome = run.await.unwrap();
		assert!(matches!(outcome, Outcome::Stopped));
		assert_eq!(outcome.exit_code(), 0);
		assert_eq!(status.borrow().state, SessionState::Stopped);
		assert_eq!(log.lock().builds.len(), 1);
		assert_eq!(log.lock().teardowns, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn configuration_errors_are_not_retried() {
		let (factory, log) = FakeFactory::new(&[Plan::BadConfig], Plan::Stream);
		let outcome = manager(factory, RestartPolicy::default()).run().await;

		assert!(matches!(outcome, Outcome::Failed(Error::Config(_))));
		assert_eq!(log.lock().builds.len(), 1);
		assert_eq!(log.lock().teardowns, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn panicking_step_is_a_fault_and_restarts() {
		let (factory, log) = FakeFactory::new(&[Plan::PanicOnArm], Plan::Stream);
		let manager = manager(factory, RestartPolicy::default());
		let mut status = manager.status();
		let stop = manager.stop_handle();
		let run = tokio::spawn(manager.run());

		let restarting = wait_for_state(&mut status, SessionState::Restarting).await;
		assert_eq!(restarting.restart_count, 1);
		wait_for_state(&mut status, SessionState::Streaming).await;
		assert_eq!(log.lock().builds.len(), 2);

		stop.stop();
		assert!(matches!(run.await.unwrap(), Outcome::Stopped));
	}

	#[tokio::test(start_paused = true)]
	async fn stop_during_backoff_does_not_wait_it_out() {
		let (factory, log) = FakeFactory::new(&[], Plan::LaunchFails);
		let manager = manager(factory, policy(10, 60, 1.5, 60));
		let mut status = manager.status();
		let stop = manager.stop_handle();
		let started = Instant::now();
		let run = tokio::spawn(manager.run());

		wait_for_state(&mut status, SessionState::Restarting).await;
		stop.stop();

		assert!(matches!(run.await.unwrap(), Outcome::Stopped));
		assert!(started.elapsed() < Duration::from_secs(60));
		assert_eq!(log.lock().builds.len(), 1);
		assert_eq!(log.lock().teardowns, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn stop_requested_before_run_builds_nothing() {
		let (factory, log) = FakeFactory::new(&[], Plan::Stream);
		let manager = manager(factory, RestartPolicy::default());
		manager.stop_handle().stop();

		assert!(matches!(manager.run().await, Outcome::Stopped));
		assert!(log.lock().builds.is_empty());
	}
}
