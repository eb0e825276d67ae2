//! # Crash reports
//!
//! A [`CrashReport`] ties together everything below it: the target's threads,
//! their register states, their backtraces, and the target's image list, and
//! renders the whole as a human-readable crash log or as JSON.
//!
//! Thread state and backtrace are captured lazily and cached as a dependent
//! pair: setting a thread's state by hand throws away any backtrace computed
//! from the previous state. The one exception to caching is the calling
//! thread of a self-report, whose registers change between any two calls; it
//! is recaptured on every access and its backtrace is never served stale.

use std::io;

use serde::Serialize;
use tracing::debug;

use crate::addr::Addr;
use crate::arch::{self, ThreadState};
use crate::backtrace::{self, BacktraceFrame};
use crate::errors::{Result, TraceError};
use crate::symbols::SymbolSet;
use crate::task::{self, Task, ThreadId};

/// Rendering choices for [`CrashReport::render`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    /// start each backtrace that crossed a signal handler at the first frame
    /// of the interrupted code, hiding the handler machinery above it
    pub truncate_at_signal: bool,
}

#[derive(Debug)]
struct ThreadRecord {
    tid: ThreadId,
    state: Option<ThreadState>,
    /// state was supplied by the caller rather than captured
    explicit_state: bool,
    backtrace: Option<Vec<BacktraceFrame>>,
}

impl ThreadRecord {
    fn invalidate(&mut self) {
        self.state = None;
        self.explicit_state = false;
        self.backtrace = None;
    }
}

/// An in-progress crash report for one target process
#[derive(Debug)]
pub struct CrashReport {
    task: Task,
    symbols: SymbolSet,
    threads: Vec<ThreadRecord>,
    crashed: Option<usize>,
}

impl CrashReport {
    /// Builds a report skeleton for `task`
    ///
    /// `crashed_tid` marks the thread the report is about; it may be absent
    /// for reports that describe a healthy process. With `suspend` set the
    /// whole target stays stopped until the report is dropped.
    ///
    /// # Errors
    ///
    /// [`TraceError::InvalidArgument`] when `crashed_tid` names no thread of
    /// the target; [`TraceError::SuspendSelf`] when asked to suspend the
    /// calling process; scan failures propagate.
    pub fn new(task: Task, crashed_tid: Option<ThreadId>, suspend: bool) -> Result<Self> {
        let symbols = SymbolSet::for_task(task, suspend)?;
        let threads: Vec<ThreadRecord> = task
            .threads()?
            .into_iter()
            .map(|tid| ThreadRecord {
                tid,
                state: None,
                explicit_state: false,
                backtrace: None,
            })
            .collect();

        let crashed = match crashed_tid {
            None => None,
            Some(wanted) => Some(
                threads
                    .iter()
                    .position(|r| r.tid == wanted)
                    .ok_or_else(|| {
                        TraceError::InvalidArgument(format!(
                            "thread {wanted} is not part of the target"
                        ))
                    })?,
            ),
        };

        Ok(CrashReport {
            task,
            symbols,
            threads,
            crashed,
        })
    }

    /// A report about the calling process, never suspending it
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::new`].
    pub fn for_self() -> Result<Self> {
        Self::new(Task::current(), None, false)
    }

    #[must_use]
    pub fn task(&self) -> Task {
        self.task
    }

    #[must_use]
    pub fn symbols(&self) -> &SymbolSet {
        &self.symbols
    }

    /// The threads this report covers, in tid order
    #[must_use]
    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.iter().map(|r| r.tid).collect()
    }

    #[must_use]
    pub fn crashed_thread(&self) -> Option<ThreadId> {
        self.crashed.map(|i| self.threads[i].tid)
    }

    /// Re-designates the crashed thread
    ///
    /// # Errors
    ///
    /// [`TraceError::InvalidArgument`] when `tid` names no thread of the
    /// target.
    pub fn set_crashed_thread(&mut self, tid: Option<ThreadId>) -> Result<()> {
        self.crashed = match tid {
            None => None,
            Some(wanted) => Some(
                self.threads
                    .iter()
                    .position(|r| r.tid == wanted)
                    .ok_or_else(|| {
                        TraceError::InvalidArgument(format!(
                            "thread {wanted} is not part of the target"
                        ))
                    })?,
            ),
        };
        Ok(())
    }

    /// The register state of `tid`, capturing it on first access
    ///
    /// The calling thread of a self-report is recaptured on every call
    /// unless its state was set explicitly.
    ///
    /// # Errors
    ///
    /// [`TraceError::NoSuchThread`] for a tid outside the report; capture
    /// failures propagate.
    pub fn thread_state(&mut self, tid: ThreadId) -> Result<ThreadState> {
        let idx = self.index_of(tid)?;
        if self.threads[idx].explicit_state {
            if let Some(state) = &self.threads[idx].state {
                return Ok(state.clone());
            }
        }

        if self.task.is_current() && tid == ThreadId::current() {
            // our own registers are stale the moment they are captured
            let state = arch::capture_current()?;
            self.threads[idx].state = Some(state.clone());
            self.threads[idx].backtrace = None;
            return Ok(state);
        }

        if let Some(state) = &self.threads[idx].state {
            return Ok(state.clone());
        }
        let state = self.capture(tid)?;
        self.threads[idx].state = Some(state.clone());
        Ok(state)
    }

    /// Replaces the state of `tid`, for example with registers recovered
    /// from a signal handler or a foreign collector
    ///
    /// Any backtrace computed from the previous state is discarded; the two
    /// are only ever consistent as a pair.
    ///
    /// # Errors
    ///
    /// [`TraceError::NoSuchThread`] for a tid outside the report.
    pub fn set_thread_state(&mut self, tid: ThreadId, state: ThreadState) -> Result<()> {
        let idx = self.index_of(tid)?;
        let record = &mut self.threads[idx];
        record.invalidate();
        record.state = Some(state);
        record.explicit_state = true;
        Ok(())
    }

    /// The backtrace of `tid`, computing and caching it on first access
    ///
    /// The calling thread of a self-report is walked fresh on every call
    /// (and never cached) unless its state was set explicitly.
    ///
    /// # Errors
    ///
    /// [`TraceError::NoSuchThread`] for a tid outside the report; capture
    /// and walk failures propagate.
    pub fn thread_backtrace(&mut self, tid: ThreadId) -> Result<Vec<BacktraceFrame>> {
        let idx = self.index_of(tid)?;
        if let Some(frames) = &self.threads[idx].backtrace {
            return Ok(frames.clone());
        }

        let state = self.thread_state(tid)?;
        let frames = backtrace::backtrace_vec(&self.symbols, &state)?;
        let live_self =
            self.task.is_current() && tid == ThreadId::current() && !self.threads[idx].explicit_state;
        if !live_self {
            self.threads[idx].backtrace = Some(frames.clone());
        }
        Ok(frames)
    }

    /// The cached backtrace of `tid`, if one is stored
    ///
    /// The calling thread of a self-report never has one unless its state
    /// was set explicitly.
    #[must_use]
    pub fn cached_backtrace(&self, tid: ThreadId) -> Option<&[BacktraceFrame]> {
        self.threads
            .iter()
            .find(|r| r.tid == tid)
            .and_then(|r| r.backtrace.as_deref())
    }

    /// Renders the full crash log: backtraces, the crashed thread's
    /// registers, and the image list
    ///
    /// # Errors
    ///
    /// Write failures propagate; threads that cannot be captured are noted
    /// in the output instead of failing the render.
    pub fn render<W: io::Write>(&mut self, w: &mut W, opts: &ReportOptions) -> Result<()> {
        self.render_backtraces(w, opts)?;
        self.render_register_state(w)?;
        self.render_images(w)?;
        Ok(())
    }

    /// Renders one section per thread, frames numbered from the top
    ///
    /// # Errors
    ///
    /// Write failures propagate.
    pub fn render_backtraces<W: io::Write>(
        &mut self,
        w: &mut W,
        opts: &ReportOptions,
    ) -> Result<()> {
        let tids = self.threads();
        for (n, tid) in tids.into_iter().enumerate() {
            let crashed = self.crashed_thread() == Some(tid);
            writeln!(
                w,
                "Thread {n}{} (tid {tid}):",
                if crashed { " crashed" } else { "" }
            )?;
            match self.thread_backtrace(tid) {
                Ok(frames) => {
                    let start = if opts.truncate_at_signal {
                        resume_index(&frames)
                    } else {
                        0
                    };
                    for (i, frame) in frames.iter().enumerate().skip(start) {
                        render_frame(w, i - start, frame)?;
                    }
                }
                Err(e) => {
                    debug!("no backtrace for thread {tid}: {e}");
                    writeln!(w, "    <unavailable: {e}>")?;
                }
            }
            writeln!(w)?;
        }
        Ok(())
    }

    /// Renders the crashed thread's register dump; silent when no thread is
    /// marked crashed
    ///
    /// # Errors
    ///
    /// Write failures propagate.
    pub fn render_register_state<W: io::Write>(&mut self, w: &mut W) -> Result<()> {
        let Some(tid) = self.crashed_thread() else {
            return Ok(());
        };
        let state = match self.thread_state(tid) {
            Ok(state) => state,
            Err(e) => {
                writeln!(w, "Registers of tid {tid}: <unavailable: {e}>\n")?;
                return Ok(());
            }
        };
        writeln!(w, "Registers ({}), tid {tid}:", state.arch.name())?;
        for chunk in state.regs.chunks(4) {
            for (name, value) in chunk {
                write!(w, "  {name:>7}: {value:#018x}")?;
            }
            writeln!(w)?;
        }
        writeln!(w)?;
        Ok(())
    }

    /// Renders the image list, one line per image in load order
    ///
    /// # Errors
    ///
    /// Write failures propagate.
    pub fn render_images<W: io::Write>(&mut self, w: &mut W) -> Result<()> {
        writeln!(w, "Binary images:")?;
        for img in self.symbols.images() {
            let (lo, hi) = img.address_range();
            let name = img.library().unwrap_or("<anonymous>");
            let path = img
                .path()
                .map_or_else(|| "(memory only)".into(), |p| p.display().to_string());
            writeln!(w, "  {lo} - {hi}  {name:<28} {path}")?;
        }
        Ok(())
    }

    /// The whole report as a JSON document, capturing whatever is still
    /// missing; threads that cannot be observed appear with null fields
    ///
    /// # Errors
    ///
    /// Serialization failures propagate.
    pub fn to_json(&mut self) -> Result<serde_json::Value> {
        let tids = self.threads();
        let mut threads = Vec::with_capacity(tids.len());
        for tid in tids {
            let state = self.thread_state(tid).ok();
            let frames = self.thread_backtrace(tid).ok();
            threads.push(ThreadDoc {
                tid: tid.raw(),
                crashed: self.crashed_thread() == Some(tid),
                state,
                frames,
            });
        }

        let images: Vec<ImageDoc> = self
            .symbols
            .images()
            .iter()
            .map(|img| {
                let (lo, hi) = img.address_range();
                ImageDoc {
                    path: img.path().map(|p| p.display().to_string()),
                    library: img.library().map(str::to_owned),
                    base: img.base(),
                    range: (lo, hi),
                    machine: img.machine(),
                    is_64: img.is_64(),
                }
            })
            .collect();

        Ok(serde_json::to_value(ReportDoc {
            pid: self.task.raw_pid(),
            crashed_tid: self.crashed_thread().map(|t| t.raw()),
            threads,
            images,
        })?)
    }

    fn index_of(&self, tid: ThreadId) -> Result<usize> {
        self.threads
            .iter()
            .position(|r| r.tid == tid)
            .ok_or(TraceError::NoSuchThread(tid.raw()))
    }

    fn capture(&self, tid: ThreadId) -> Result<ThreadState> {
        if self.task.is_current() {
            return arch::capture_sibling(tid);
        }
        if self.symbols.holds_stopped(tid) {
            return arch::capture_stopped(tid);
        }
        task::with_stopped_thread(tid, false, arch::capture_stopped)
    }
}

/// First frame of the interrupted code when the walk crossed a signal
/// handler, else zero
fn resume_index(frames: &[BacktraceFrame]) -> usize {
    frames
        .iter()
        .position(|f| f.flags.signal_handler)
        .map_or(0, |i| (i + 1).min(frames.len().saturating_sub(1)))
}

fn render_frame<W: io::Write>(w: &mut W, n: usize, frame: &BacktraceFrame) -> Result<()> {
    let lib = frame.library.as_deref().unwrap_or("???");
    write!(w, "  {n:3}  {lib:<24} {}", frame.pc)?;
    if let Some(symbol) = &frame.symbol {
        write!(w, "  {symbol} + {}", frame.offset)?;
    }
    let f = &frame.flags;
    if f.pc_invalid || f.fp_invalid || f.signal_handler {
        let mut marks = Vec::new();
        if f.pc_invalid {
            marks.push("bad pc");
        }
        if f.fp_invalid {
            marks.push("bad fp");
        }
        if f.signal_handler {
            marks.push("signal handler");
        }
        write!(w, "  [{}]", marks.join(", "))?;
    }
    writeln!(w)?;
    Ok(())
}

#[derive(Serialize)]
struct ReportDoc {
    pid: i32,
    crashed_tid: Option<i32>,
    threads: Vec<ThreadDoc>,
    images: Vec<ImageDoc>,
}

#[derive(Serialize)]
struct ThreadDoc {
    tid: i32,
    crashed: bool,
    state: Option<ThreadState>,
    frames: Option<Vec<BacktraceFrame>>,
}

#[derive(Serialize)]
struct ImageDoc {
    path: Option<String>,
    library: Option<String>,
    base: Addr,
    range: (Addr, Addr),
    machine: u16,
    is_64: bool,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::Arch;
    use crate::backtrace::FrameFlags;

    fn blocked_thread() -> (
        ThreadId,
        std::sync::mpsc::Sender<()>,
        std::thread::JoinHandle<()>,
    ) {
        let (tid_tx, tid_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            tid_tx.send(ThreadId::current()).unwrap();
            let _ = done_rx.recv();
        });
        let tid = tid_rx.recv().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        (tid, done_tx, handle)
    }

    #[test]
    fn test_self_report_basics() {
        let mut report = CrashReport::for_self().unwrap();
        assert!(report.crashed_thread().is_none());
        assert!(report.threads().contains(&ThreadId::current()));

        let frames = report.thread_backtrace(ThreadId::current()).unwrap();
        assert!(!frames.is_empty());
    }

    #[test]
    fn test_live_calling_thread_is_never_cached() {
        let mut report = CrashReport::for_self().unwrap();
        let tid = ThreadId::current();
        let _ = report.thread_backtrace(tid).unwrap();
        assert!(report.cached_backtrace(tid).is_none());
    }

    #[test]
    fn test_sibling_thread_is_cached() {
        let (tid, done, handle) = blocked_thread();
        let mut report = CrashReport::for_self().unwrap();

        let first = report.thread_backtrace(tid).unwrap();
        assert!(!first.is_empty());
        let cached = report.cached_backtrace(tid).unwrap();
        assert_eq!(cached, &first[..]);

        // a second call serves the cached pair unchanged
        let second = report.thread_backtrace(tid).unwrap();
        assert_eq!(second, first);

        done.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_every_thread_yields_at_least_one_frame() {
        // even threads that cannot be observed (concurrently running test
        // threads) must show up with a flagged frame, never an empty trace
        let mut report = CrashReport::for_self().unwrap();
        for tid in report.threads() {
            match report.thread_backtrace(tid) {
                Ok(frames) => assert!(!frames.is_empty(), "thread {tid} has no frames"),
                // threads may exit between enumeration and capture
                Err(TraceError::NoSuchThread(_)) => {}
                Err(e) => panic!("backtrace of thread {tid} failed: {e}"),
            }
        }
    }

    #[test]
    fn test_unknown_crashed_tid_is_rejected() {
        let err =
            CrashReport::new(Task::current(), Some(ThreadId::from_raw(i32::MAX - 1)), false)
                .unwrap_err();
        assert!(matches!(err, TraceError::InvalidArgument(_)));
    }

    #[test]
    fn test_explicit_state_invalidates_and_caches() {
        let mut report = CrashReport::for_self().unwrap();
        let tid = ThreadId::current();

        let state = arch::capture_current().unwrap();
        report.set_thread_state(tid, state.clone()).unwrap();
        assert!(report.cached_backtrace(tid).is_none());

        // with an explicit state even the calling thread caches
        let frames = report.thread_backtrace(tid).unwrap();
        assert_eq!(report.cached_backtrace(tid).unwrap(), &frames[..]);
        assert_eq!(report.thread_state(tid).unwrap(), state);

        // replacing the state throws the pair away together
        report.set_thread_state(tid, state).unwrap();
        assert!(report.cached_backtrace(tid).is_none());
    }

    #[test]
    fn test_render_produces_all_sections() {
        let mut report = CrashReport::for_self().unwrap();
        report
            .set_crashed_thread(Some(ThreadId::current()))
            .unwrap();

        let mut out = Vec::new();
        report
            .render(&mut out, &ReportOptions::default())
            .unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("Thread 0"));
        assert!(text.contains("crashed"));
        assert!(text.contains("Registers"));
        assert!(text.contains("Binary images:"));
        let exe = Task::current().exe_path().unwrap();
        assert!(text.contains(&exe.display().to_string()));
    }

    #[test]
    fn test_json_document_shape() {
        let mut report = CrashReport::for_self().unwrap();
        let doc = report.to_json().unwrap();

        assert_eq!(doc["pid"], Task::current().raw_pid());
        assert!(doc["threads"].as_array().is_some_and(|t| !t.is_empty()));
        assert!(doc["images"].as_array().is_some_and(|i| !i.is_empty()));
        assert!(doc["crashed_tid"].is_null());
    }

    #[test]
    fn test_resume_index_skips_handler_frames() {
        let mk = |signal| BacktraceFrame {
            pc: Addr::from(0x1000u64),
            fp: Addr::from(0x2000u64),
            flags: FrameFlags {
                signal_handler: signal,
                ..FrameFlags::default()
            },
            symbol: None,
            library: None,
            offset: 0,
        };
        let frames = vec![mk(false), mk(false), mk(true), mk(false), mk(false)];
        assert_eq!(resume_index(&frames), 3);

        let no_signal = vec![mk(false), mk(false)];
        assert_eq!(resume_index(&no_signal), 0);

        // a signal frame at the very end never truncates everything away
        let tail = vec![mk(false), mk(true)];
        assert_eq!(resume_index(&tail), 1);
    }

    #[test]
    fn test_state_routing_for_sibling() {
        let (tid, done, handle) = blocked_thread();
        let mut report = CrashReport::for_self().unwrap();
        let state = report.thread_state(tid).unwrap();
        assert_eq!(state.arch, Arch::native().unwrap());
        assert!(!state.sp.is_null());
        done.send(()).unwrap();
        handle.join().unwrap();
    }
}
