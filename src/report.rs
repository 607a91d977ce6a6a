use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::ValueEnum;

use crate::config::Mode;
use crate::dispatch::TaskOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputMode {
    /// One progress line, rewritten in place.
    #[default]
    Status,
    /// One block per finished host with its output or error.
    Detail,
}

/// Snapshot of the running counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub success: usize,
    pub failure: usize,
    pub total: usize,
}

impl Progress {
    pub fn done(&self) -> usize {
        self.success + self.failure
    }
}

/// Final totals of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub success: usize,
    pub failure: usize,
    pub total: usize,
}

/// Running success/failure counters for one run.
///
/// Scoped to a single dispatch; every outcome is recorded exactly once.
#[derive(Debug)]
pub struct Aggregator {
    total: usize,
    success: AtomicUsize,
    failure: AtomicUsize,
}

impl Aggregator {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            success: AtomicUsize::new(0),
            failure: AtomicUsize::new(0),
        }
    }

    pub fn record(&self, outcome: &TaskOutcome) -> Progress {
        if outcome.is_success() {
            self.success.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failure.fetch_add(1, Ordering::SeqCst);
        }
        self.progress()
    }

    pub fn progress(&self) -> Progress {
        Progress {
            success: self.success.load(Ordering::SeqCst),
            failure: self.failure.load(Ordering::SeqCst),
            total: self.total,
        }
    }

    pub fn finish(self) -> Summary {
        Summary {
            success: self.success.into_inner(),
            failure: self.failure.into_inner(),
            total: self.total,
        }
    }
}

/// Console writer. Owned by the single reporting thread, so writes never
/// interleave.
pub struct Reporter<W: Write> {
    out: W,
    mode: OutputMode,
    // A status line is on screen without a trailing newline.
    line_open: bool,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, mode: OutputMode) -> Self {
        Self {
            out,
            mode,
            line_open: false,
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn header(&mut self, mode: &Mode, total: usize) -> io::Result<()> {
        writeln!(self.out, "模式: {}, 目标主机数: {total}", mode.label())?;
        match mode {
            Mode::Exec { command } => writeln!(self.out, "命令: {command}")?,
            Mode::Copy { pairs } => {
                for pair in pairs {
                    writeln!(self.out, "复制: {} -> {}", pair.src.display(), pair.dst)?;
                }
            }
        }
        self.out.flush()
    }

    pub fn report(&mut self, outcome: &TaskOutcome, progress: Progress) -> io::Result<()> {
        match self.mode {
            OutputMode::Status => {
                if let Err(err) = &outcome.result {
                    self.close_line()?;
                    writeln!(self.out, "[{}] 失败: {err}", outcome.target)?;
                }
                write!(
                    self.out,
                    "\r进度: [{}/{}] 成功:{} 失败:{}",
                    progress.done(),
                    progress.total,
                    progress.success,
                    progress.failure
                )?;
                self.line_open = true;
            }
            OutputMode::Detail => match &outcome.result {
                Ok(()) => {
                    writeln!(self.out, "[{}] 成功:", outcome.target)?;
                    if let Some(output) = outcome.output.as_deref() {
                        let output = output.trim_end_matches('\n');
                        if !output.is_empty() {
                            writeln!(self.out, "{output}")?;
                        }
                    }
                }
                Err(err) => writeln!(self.out, "[{}] 失败: {err}", outcome.target)?,
            },
        }
        self.out.flush()
    }

    pub fn summary(&mut self, summary: &Summary) -> io::Result<()> {
        self.close_line()?;
        writeln!(
            self.out,
            "执行完成: 成功:{} 失败:{} 总数:{}",
            summary.success, summary.failure, summary.total
        )?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn close_line(&mut self) -> io::Result<()> {
        if self.line_open {
            writeln!(self.out)?;
            self.line_open = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Target;
    use crate::session::SessionError;
    use std::time::Duration;

    fn target(address: &str) -> Target {
        Target {
            group: "web".into(),
            address: address.into(),
            port: 22,
            user: "root".into(),
            password: String::new(),
        }
    }

    fn ok(address: &str, output: &str) -> TaskOutcome {
        TaskOutcome {
            target: target(address),
            result: Ok(()),
            output: Some(output.to_string()),
            elapsed: Duration::from_millis(3),
        }
    }

    fn failed(address: &str) -> TaskOutcome {
        TaskOutcome {
            target: target(address),
            result: Err(SessionError::Timeout(Duration::from_secs(1))),
            output: None,
            elapsed: Duration::from_secs(1),
        }
    }

    fn text(reporter: Reporter<Vec<u8>>) -> String {
        String::from_utf8(reporter.into_inner()).expect("utf-8 output")
    }

    #[test]
    fn aggregator_counts_never_exceed_total() {
        let agg = Aggregator::new(3);
        let p1 = agg.record(&ok("a", ""));
        let p2 = agg.record(&failed("b"));
        assert_eq!(p1.done(), 1);
        assert_eq!(p2, Progress { success: 1, failure: 1, total: 3 });
        assert!(agg.progress().done() <= 3);

        agg.record(&ok("c", ""));
        let summary = agg.finish();
        assert_eq!(summary.success + summary.failure, summary.total);
    }

    #[test]
    fn status_mode_rewrites_one_progress_line() {
        let mut r = Reporter::new(Vec::new(), OutputMode::Status);
        r.report(&ok("a", "up"), Progress { success: 1, failure: 0, total: 2 })
            .unwrap();
        r.report(&ok("b", "up"), Progress { success: 2, failure: 0, total: 2 })
            .unwrap();
        r.summary(&Summary { success: 2, failure: 0, total: 2 }).unwrap();

        let out = text(r);
        assert!(out.contains("\r进度: [1/2] 成功:1 失败:0"), "{out:?}");
        assert!(out.contains("\r进度: [2/2] 成功:2 失败:0\n"), "{out:?}");
        assert!(out.ends_with("执行完成: 成功:2 失败:0 总数:2\n"), "{out:?}");
        assert!(!out.contains("up"), "status mode must not print output: {out:?}");
    }

    #[test]
    fn status_mode_prints_failures_on_their_own_line() {
        let mut r = Reporter::new(Vec::new(), OutputMode::Status);
        r.report(&ok("a", ""), Progress { success: 1, failure: 0, total: 2 })
            .unwrap();
        r.report(&failed("b"), Progress { success: 1, failure: 1, total: 2 })
            .unwrap();

        let out = text(r);
        assert!(out.contains("\n[b:22] 失败: timed out after 1s\n"), "{out:?}");
        assert!(out.ends_with("\r进度: [2/2] 成功:1 失败:1"), "{out:?}");
    }

    #[test]
    fn detail_mode_prints_one_block_per_target() {
        let mut r = Reporter::new(Vec::new(), OutputMode::Detail);
        r.report(&ok("a", "hi\n"), Progress { success: 1, failure: 0, total: 2 })
            .unwrap();
        r.report(&failed("b"), Progress { success: 1, failure: 1, total: 2 })
            .unwrap();

        let out = text(r);
        assert_eq!(out, "[a:22] 成功:\nhi\n[b:22] 失败: timed out after 1s\n");
    }
}
