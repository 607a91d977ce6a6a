use std::any::Any;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

use crate::bounded_executor::{self, BoxedJob, PoolEvent};
use crate::config::{Mode, RunConfig};
use crate::inventory::Target;
use crate::report::{Aggregator, OutputMode, Reporter, Summary};
use crate::session::{CancelScope, Connector, Session, SessionError};

/// How long a timed-out task waits for its session to unwind after
/// cancellation before abandoning it.
pub const CANCEL_GRACE: Duration = Duration::from_millis(250);

/// Result of dispatching one target.
#[derive(Debug)]
pub struct TaskOutcome {
    pub target: Target,
    pub result: Result<(), SessionError>,
    /// Captured output, present only on success when capture was requested.
    pub output: Option<String>,
    pub elapsed: Duration,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Fans one [`Mode`] out over many targets.
pub struct Dispatcher {
    connector: Arc<dyn Connector>,
    forks: usize,
    timeout: Duration,
    mode: Arc<Mode>,
    capture_output: bool,
}

impl Dispatcher {
    /// `config` is already validated; `forks` is at least one.
    pub fn new(connector: Arc<dyn Connector>, config: &RunConfig) -> Self {
        Self {
            connector,
            forks: config.forks,
            timeout: config.timeout,
            mode: Arc::new(config.mode.clone()),
            capture_output: config.output == OutputMode::Detail,
        }
    }

    /// Run every target once and report outcomes as they arrive.
    ///
    /// Per-target failures never abort the run; only an internal executor
    /// fault does.
    pub fn run<W: Write>(
        &self,
        targets: &[Target],
        reporter: &mut Reporter<W>,
    ) -> Result<Summary> {
        let aggregator = Aggregator::new(targets.len());

        let jobs: Vec<BoxedJob<TaskOutcome>> = targets
            .iter()
            .cloned()
            .map(|target| {
                let connector = Arc::clone(&self.connector);
                let mode = Arc::clone(&self.mode);
                let timeout = self.timeout;
                let capture = self.capture_output;
                Box::new(move || run_task(target, connector, mode, timeout, capture))
                    as BoxedJob<TaskOutcome>
            })
            .collect();

        bounded_executor::run_bounded_with_events(self.forks, jobs, |event| match event {
            PoolEvent::Admitted { index } => {
                debug!(target = %targets[index], "task admitted");
            }
            PoolEvent::Completed { output, .. } => {
                let progress = aggregator.record(output);
                if let Err(err) = reporter.report(output, progress) {
                    warn!(error = %err, "failed to write progress");
                }
            }
        })?;

        let summary = aggregator.finish();
        debug_assert_eq!(summary.success + summary.failure, summary.total);
        Ok(summary)
    }
}

/// Closes the session however the task body exits.
struct SessionGuard(Box<dyn Session>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn execute(
    target: &Target,
    connector: &dyn Connector,
    mode: &Mode,
    scope: &CancelScope,
) -> Result<String, SessionError> {
    let mut session = SessionGuard(connector.connect(target, scope)?);
    scope.check()?;
    match mode {
        Mode::Exec { command } => session.0.run(command),
        Mode::Copy { pairs } => {
            let mut report = String::new();
            for pair in pairs {
                scope.check()?;
                session.0.copy_tree(&pair.src, &pair.dst)?;
                report.push_str(&format!("copied {} -> {}\n", pair.src.display(), pair.dst));
            }
            Ok(report)
        }
    }
}

/// One admitted task: connect, execute, close, all under a fresh deadline.
///
/// The session work runs on its own thread. When the deadline passes, the
/// scope is cancelled and the session gets [`CANCEL_GRACE`] to unwind; a
/// session that is still stuck after that is left to finish on its own and
/// the task reports the timeout anyway. Its drop guard closes it whenever
/// the stuck call returns.
pub fn run_task(
    target: Target,
    connector: Arc<dyn Connector>,
    mode: Arc<Mode>,
    timeout: Duration,
    capture_output: bool,
) -> TaskOutcome {
    let started = Instant::now();
    let scope = CancelScope::new(timeout);

    let (tx, rx) = mpsc::channel();
    let spawned = {
        let target = target.clone();
        let scope = scope.clone();
        thread::Builder::new()
            .name(format!("task-{target}"))
            .spawn(move || {
                let res = panic::catch_unwind(AssertUnwindSafe(|| {
                    execute(&target, connector.as_ref(), &mode, &scope)
                }))
                .unwrap_or_else(|payload| Err(SessionError::Panicked(panic_message(payload))));
                let _ = tx.send(res);
            })
    };

    let result = match spawned {
        Err(e) => Err(SessionError::Session(format!("spawn task thread: {e}"))),
        Ok(_detached) => match rx.recv_timeout(scope.remaining()) {
            Ok(res) => res,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(target = %target, ?timeout, "task deadline exceeded, aborting session");
                scope.cancel();
                if rx.recv_timeout(CANCEL_GRACE).is_err() {
                    warn!(target = %target, "session ignored cancellation; abandoning it");
                }
                Err(SessionError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SessionError::Panicked(
                "task worker exited without a result".into(),
            )),
        },
    };

    let elapsed = started.elapsed();
    let (result, output) = match result {
        Ok(out) => (Ok(()), capture_output.then_some(out)),
        Err(err) => (Err(err), None),
    };
    match &result {
        Ok(()) => debug!(target = %target, ?elapsed, "task succeeded"),
        Err(err) => debug!(target = %target, ?elapsed, error = %err, "task failed"),
    }

    TaskOutcome {
        target,
        result,
        output,
        elapsed,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
