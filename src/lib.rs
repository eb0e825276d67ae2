//! # crashtrace
//!
//! Reconstructs call stacks and crash reports from live or stopped Linux
//! processes, including the calling process itself.
//!
//! The crate is a stack of small layers, each usable on its own:
//!
//! - [`task`]: handles for target processes and their threads, plus
//!   whole-process suspension
//! - [`taskmem`]: reading and mapping target memory
//! - [`elf`] and [`image`]: parsing mapped or on-disk ELF objects of either
//!   width and byte order into one normalized [`image::BinaryImage`] model
//! - [`discovery`]: scanning a target's address space for its images and
//!   locating its dynamic linker
//! - [`symbols`]: name and address resolution across all images of a target
//! - [`arch`] and [`backtrace`]: register-state capture and frame-pointer
//!   stack walking, including across signal handlers
//! - [`report`]: aggregation of all of the above into a renderable crash
//!   report
//!
//! # Quick start
//!
//! ```no_run
//! use crashtrace::{CrashReport, ReportOptions, ThreadId};
//!
//! # fn main() -> crashtrace::Result<()> {
//! let mut report = CrashReport::for_self()?;
//! report.set_crashed_thread(Some(ThreadId::current()))?;
//! report.render(&mut std::io::stderr(), &ReportOptions::default())?;
//! # Ok(())
//! # }
//! ```
//!
//! Inspecting another process works the same way through
//! [`CrashReport::new`], usually with `suspend` set so the target holds
//! still; attaching requires the usual ptrace privileges.
//!
//! # Scope
//!
//! Stack walking follows frame pointers only. Code compiled without frame
//! pointers yields truncated backtraces, which the crate reports as success
//! with fewer frames rather than as an error.

pub mod addr;
pub mod arch;
pub mod backtrace;
pub mod discovery;
pub mod elf;
pub mod errors;
pub mod image;
pub mod report;
pub mod symbols;
pub mod task;
pub mod taskmem;

pub use addr::Addr;
pub use arch::{Arch, StateFlavor, ThreadState};
pub use backtrace::{backtrace_from_state, backtrace_vec, BacktraceFrame, FrameFlags};
pub use discovery::{CpuType, ImageScanner};
pub use errors::{ErrorKind, Result, TraceError};
pub use image::BinaryImage;
pub use report::{CrashReport, ReportOptions};
pub use symbols::{SymbolInfo, SymbolKind, SymbolSet};
pub use task::{SuspendGuard, Task, ThreadId};
