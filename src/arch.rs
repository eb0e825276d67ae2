//! # Architectures and thread state
//!
//! The closed set of CPU families stack walking understands, plus the ways a
//! thread's register state can be obtained: from the calling thread itself,
//! from a ptrace-stopped thread, from a sibling thread of the calling
//! process, or parsed out of a raw register blob some other collector
//! produced.
//!
//! Adding an architecture means adding one [`Arch`] variant and extending
//! the tables below; nothing outside this module switches on machine values.

use std::num::ParseIntError;

use nix::libc;
use nix::sys::ptrace;
use serde::Serialize;
use tracing::trace;

use crate::addr::Addr;
use crate::elf;
use crate::errors::{Result, TraceError};
use crate::task::{Task, ThreadId};
use crate::taskmem;

/// A CPU family stack walking supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Arch {
    X86,
    X86_64,
    Arm,
    Aarch64,
}

/// machine value, required width (`None` accepts both), family
const SELECTION: &[(u16, Option<bool>, Arch)] = &[
    (elf::EM_386, Some(false), Arch::X86),
    (elf::EM_X86_64, Some(true), Arch::X86_64),
    (elf::EM_ARM, None, Arch::Arm),
    (elf::EM_AARCH64, Some(true), Arch::Aarch64),
];

impl Arch {
    /// Selects the family for an image's machine and width
    ///
    /// # Errors
    ///
    /// [`TraceError::UnsupportedMachine`] for anything outside the table.
    pub fn from_image(machine: u16, is_64: bool) -> Result<Self> {
        SELECTION
            .iter()
            .find(|(m, w, _)| *m == machine && w.map_or(true, |w| w == is_64))
            .map(|(_, _, a)| *a)
            .ok_or(TraceError::UnsupportedMachine(machine))
    }

    /// The family of the build host
    ///
    /// # Errors
    ///
    /// [`TraceError::UnsupportedHostArch`] on hosts outside the table.
    pub fn native() -> Result<Self> {
        if cfg!(target_arch = "x86_64") {
            Ok(Arch::X86_64)
        } else if cfg!(target_arch = "x86") {
            Ok(Arch::X86)
        } else if cfg!(target_arch = "aarch64") {
            Ok(Arch::Aarch64)
        } else if cfg!(target_arch = "arm") {
            Ok(Arch::Arm)
        } else {
            Err(TraceError::UnsupportedHostArch)
        }
    }

    #[must_use]
    pub fn word_size(self) -> u64 {
        match self {
            Arch::X86 | Arch::Arm => 4,
            Arch::X86_64 | Arch::Aarch64 => 8,
        }
    }

    /// Smallest legal instruction alignment, used to reject garbage PCs
    #[must_use]
    pub fn pc_alignment(self) -> u64 {
        match self {
            Arch::X86 | Arch::X86_64 => 1,
            // Thumb allows halfword-aligned code
            Arch::Arm => 2,
            Arch::Aarch64 => 4,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
            Arch::Arm => "arm",
            Arch::Aarch64 => "aarch64",
        }
    }

    /// Whether this family links through a register rather than the stack
    #[must_use]
    pub fn has_link_register(self) -> bool {
        matches!(self, Arch::Arm | Arch::Aarch64)
    }

    /// Where a frame stores its return address, relative to its frame pointer
    pub(crate) fn ret_slot(self, fp: Addr) -> Addr {
        match self {
            Arch::X86 => fp + 4u64,
            Arch::X86_64 | Arch::Aarch64 => fp + 8u64,
            Arch::Arm => fp,
        }
    }

    /// Where a frame stores its caller's frame pointer
    pub(crate) fn prev_fp_slot(self, fp: Addr) -> Addr {
        match self {
            Arch::X86 | Arch::X86_64 | Arch::Aarch64 => fp,
            // gcc AAPCS frame records grow downward from fp
            Arch::Arm => fp - 4u64,
        }
    }
}

/// A captured register state of one thread
///
/// `lr` is null on families without a link register. `regs` carries the full
/// dump in the architecture's conventional order, for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadState {
    pub arch: Arch,
    pub pc: Addr,
    pub sp: Addr,
    pub fp: Addr,
    pub lr: Addr,
    pub regs: Vec<(&'static str, u64)>,
}

/// Layout tag for raw register blobs handed in from outside
///
/// Each variant names one kernel `user_regs_struct` layout; the blob must be
/// in the target's native byte order, which for a live target equals ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFlavor {
    X86,
    X86_64,
    Arm,
    Aarch64,
}

impl StateFlavor {
    #[must_use]
    pub fn arch(self) -> Arch {
        match self {
            StateFlavor::X86 => Arch::X86,
            StateFlavor::X86_64 => Arch::X86_64,
            StateFlavor::Arm => Arch::Arm,
            StateFlavor::Aarch64 => Arch::Aarch64,
        }
    }

    /// Required blob size in bytes
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            StateFlavor::X86 => 17 * 4,
            StateFlavor::X86_64 => 27 * 8,
            StateFlavor::Arm => 18 * 4,
            StateFlavor::Aarch64 => 34 * 8,
        }
    }
}

/// Parses a raw `user_regs_struct` blob into a [`ThreadState`]
///
/// # Errors
///
/// [`TraceError::InvalidArgument`] when the blob is shorter than the flavor
/// requires.
pub fn state_from_raw(flavor: StateFlavor, blob: &[u8]) -> Result<ThreadState> {
    if blob.len() < flavor.size() {
        return Err(TraceError::InvalidArgument(format!(
            "register blob of {} bytes, {} needed",
            blob.len(),
            flavor.size()
        )));
    }
    let w32 = |i: usize| {
        let b: [u8; 4] = blob[i * 4..i * 4 + 4].try_into().unwrap_or_default();
        u64::from(u32::from_ne_bytes(b))
    };
    let w64 = |i: usize| {
        let b: [u8; 8] = blob[i * 8..i * 8 + 8].try_into().unwrap_or_default();
        u64::from_ne_bytes(b)
    };

    Ok(match flavor {
        StateFlavor::X86_64 => {
            let named = [
                ("r15", 0), ("r14", 1), ("r13", 2), ("r12", 3), ("rbp", 4),
                ("rbx", 5), ("r11", 6), ("r10", 7), ("r9", 8), ("r8", 9),
                ("rax", 10), ("rcx", 11), ("rdx", 12), ("rsi", 13), ("rdi", 14),
                ("rip", 16), ("eflags", 18), ("rsp", 19),
            ];
            ThreadState {
                arch: Arch::X86_64,
                pc: Addr::from(w64(16)),
                sp: Addr::from(w64(19)),
                fp: Addr::from(w64(4)),
                lr: Addr::NULL,
                regs: named.iter().map(|&(n, i)| (n, w64(i))).collect(),
            }
        }
        StateFlavor::X86 => {
            let named = [
                ("ebx", 0), ("ecx", 1), ("edx", 2), ("esi", 3), ("edi", 4),
                ("ebp", 5), ("eax", 6), ("eip", 12), ("eflags", 14), ("esp", 15),
            ];
            ThreadState {
                arch: Arch::X86,
                pc: Addr::from(w32(12)),
                sp: Addr::from(w32(15)),
                fp: Addr::from(w32(5)),
                lr: Addr::NULL,
                regs: named.iter().map(|&(n, i)| (n, w32(i))).collect(),
            }
        }
        StateFlavor::Arm => {
            const NAMES: [&str; 16] = [
                "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9",
                "r10", "fp", "ip", "sp", "lr", "pc",
            ];
            let mut regs: Vec<(&'static str, u64)> =
                NAMES.iter().enumerate().map(|(i, &n)| (n, w32(i))).collect();
            regs.push(("cpsr", w32(16)));
            ThreadState {
                arch: Arch::Arm,
                pc: Addr::from(w32(15)),
                sp: Addr::from(w32(13)),
                fp: Addr::from(w32(11)),
                lr: Addr::from(w32(14)),
                regs,
            }
        }
        StateFlavor::Aarch64 => {
            let mut regs: Vec<(&'static str, u64)> = Vec::with_capacity(34);
            const NAMES: [&str; 31] = [
                "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9",
                "x10", "x11", "x12", "x13", "x14", "x15", "x16", "x17", "x18",
                "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
                "x28", "fp", "lr",
            ];
            for (i, &n) in NAMES.iter().enumerate() {
                regs.push((n, w64(i)));
            }
            regs.push(("sp", w64(31)));
            regs.push(("pc", w64(32)));
            regs.push(("pstate", w64(33)));
            ThreadState {
                arch: Arch::Aarch64,
                pc: Addr::from(w64(32)),
                sp: Addr::from(w64(31)),
                fp: Addr::from(w64(29)),
                lr: Addr::from(w64(30)),
                regs,
            }
        }
    })
}

/// Captures the register state of the calling thread
///
/// The captured PC points into this function, so self backtraces start here
/// and climb into the caller.
///
/// # Errors
///
/// [`TraceError::UnsupportedHostArch`] on hosts without a capture path.
#[inline(never)]
pub fn capture_current() -> Result<ThreadState> {
    #[cfg(target_arch = "x86_64")]
    {
        let mut ctx: libc::ucontext_t = unsafe { std::mem::zeroed() };
        if unsafe { libc::getcontext(&mut ctx) } != 0 {
            return Err(TraceError::Io(std::io::Error::last_os_error()));
        }
        let g = &ctx.uc_mcontext.gregs;
        let r = |i: i32| g[i as usize] as u64;
        let named = [
            ("rax", libc::REG_RAX), ("rbx", libc::REG_RBX), ("rcx", libc::REG_RCX),
            ("rdx", libc::REG_RDX), ("rsi", libc::REG_RSI), ("rdi", libc::REG_RDI),
            ("rbp", libc::REG_RBP), ("rsp", libc::REG_RSP), ("r8", libc::REG_R8),
            ("r9", libc::REG_R9), ("r10", libc::REG_R10), ("r11", libc::REG_R11),
            ("r12", libc::REG_R12), ("r13", libc::REG_R13), ("r14", libc::REG_R14),
            ("r15", libc::REG_R15), ("rip", libc::REG_RIP), ("eflags", libc::REG_EFL),
        ];
        Ok(ThreadState {
            arch: Arch::X86_64,
            pc: Addr::from(r(libc::REG_RIP)),
            sp: Addr::from(r(libc::REG_RSP)),
            fp: Addr::from(r(libc::REG_RBP)),
            lr: Addr::NULL,
            regs: named.iter().map(|&(n, i)| (n, r(i))).collect(),
        })
    }
    #[cfg(target_arch = "aarch64")]
    {
        let mut ctx: libc::ucontext_t = unsafe { std::mem::zeroed() };
        if unsafe { libc::getcontext(&mut ctx) } != 0 {
            return Err(TraceError::Io(std::io::Error::last_os_error()));
        }
        let m = &ctx.uc_mcontext;
        let mut regs: Vec<(&'static str, u64)> = Vec::with_capacity(34);
        const NAMES: [&str; 31] = [
            "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10",
            "x11", "x12", "x13", "x14", "x15", "x16", "x17", "x18", "x19",
            "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28",
            "fp", "lr",
        ];
        for (i, &n) in NAMES.iter().enumerate() {
            regs.push((n, m.regs[i]));
        }
        regs.push(("sp", m.sp));
        regs.push(("pc", m.pc));
        regs.push(("pstate", m.pstate));
        Ok(ThreadState {
            arch: Arch::Aarch64,
            pc: Addr::from(m.pc),
            sp: Addr::from(m.sp),
            fp: Addr::from(m.regs[29]),
            lr: Addr::from(m.regs[30]),
            regs,
        })
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        Err(TraceError::UnsupportedHostArch)
    }
}

/// Captures the register state of a ptrace-stopped thread
///
/// The caller guarantees `tid` is attached and stopped, typically through a
/// [`crate::task::SuspendGuard`].
///
/// # Errors
///
/// Ptrace failures propagate; [`TraceError::UnsupportedHostArch`] on hosts
/// without a capture path.
pub fn capture_stopped(tid: ThreadId) -> Result<ThreadState> {
    #[cfg(target_arch = "x86_64")]
    {
        let r = ptrace::getregs(tid.pid())?;
        let named = [
            ("rax", r.rax), ("rbx", r.rbx), ("rcx", r.rcx), ("rdx", r.rdx),
            ("rsi", r.rsi), ("rdi", r.rdi), ("rbp", r.rbp), ("rsp", r.rsp),
            ("r8", r.r8), ("r9", r.r9), ("r10", r.r10), ("r11", r.r11),
            ("r12", r.r12), ("r13", r.r13), ("r14", r.r14), ("r15", r.r15),
            ("rip", r.rip), ("eflags", r.eflags),
        ];
        Ok(ThreadState {
            arch: Arch::X86_64,
            pc: Addr::from(r.rip),
            sp: Addr::from(r.rsp),
            fp: Addr::from(r.rbp),
            lr: Addr::NULL,
            regs: named.to_vec(),
        })
    }
    #[cfg(target_arch = "aarch64")]
    {
        let r = ptrace::getregset::<ptrace::regset::NT_PRSTATUS>(tid.pid())?;
        let mut blob = Vec::with_capacity(34 * 8);
        for v in r.regs {
            blob.extend_from_slice(&v.to_ne_bytes());
        }
        blob.extend_from_slice(&r.sp.to_ne_bytes());
        blob.extend_from_slice(&r.pc.to_ne_bytes());
        blob.extend_from_slice(&r.pstate.to_ne_bytes());
        state_from_raw(StateFlavor::Aarch64, &blob)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = tid;
        Err(TraceError::UnsupportedHostArch)
    }
}

/// Captures a minimal state of a sibling thread of the calling process
///
/// A process cannot ptrace itself, so for threads other than the calling one
/// the kernel's `/proc/<tid>/syscall` file supplies the blocked thread's SP
/// and PC. A thread that is actually running has no stable state; a few
/// retries catch the common case of a thread briefly between blocks. The
/// result has no frame pointer, so backtraces from it carry one frame.
///
/// # Errors
///
/// [`TraceError::NoSuchThread`] when the thread is gone; I/O errors
/// propagate.
pub fn capture_sibling(tid: ThreadId) -> Result<ThreadState> {
    let arch = Arch::native()?;
    let path = format!("/proc/{tid}/syscall");
    for attempt in 0..4 {
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TraceError::NoSuchThread(tid.raw()))
            }
            Err(e) => return Err(e.into()),
        };
        let line = content.trim();
        if line == "running" {
            trace!("thread {tid} is running, retry {attempt}");
            std::thread::yield_now();
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            break;
        }
        let sp = parse_hex(fields[fields.len() - 2])?;
        let pc = parse_hex(fields[fields.len() - 1])?;
        return Ok(ThreadState {
            arch,
            pc: Addr::from(pc),
            sp: Addr::from(sp),
            fp: Addr::NULL,
            lr: Addr::NULL,
            regs: vec![("sp", sp), ("pc", pc)],
        });
    }
    // a persistently running thread still gets a pc-less placeholder
    Ok(ThreadState {
        arch,
        pc: Addr::INVALID,
        sp: Addr::NULL,
        fp: Addr::NULL,
        lr: Addr::NULL,
        regs: Vec::new(),
    })
}

fn parse_hex(s: &str) -> Result<u64> {
    let trimmed = s.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).map_err(|e: ParseIntError| {
        TraceError::InvalidFormat(format!("bad hex field {s:?}: {e}"))
    })
}

/// Reads one target-width word at `addr`, promoted to 64 bits
///
/// # Errors
///
/// Same contract as [`taskmem::read_exact`].
pub(crate) fn read_word(task: Task, arch: Arch, addr: Addr) -> Result<u64> {
    let bytes = taskmem::read_vec(task, addr, arch.word_size() as usize)?;
    Ok(if arch.word_size() == 8 {
        u64::from_ne_bytes(bytes[..8].try_into().unwrap_or_default())
    } else {
        u64::from(u32::from_ne_bytes(bytes[..4].try_into().unwrap_or_default()))
    })
}

/// Whether `pc` could plausibly be an instruction address in `task`
pub(crate) fn validate_pc(task: Task, arch: Arch, pc: Addr) -> bool {
    !pc.is_null()
        && !pc.is_invalid()
        && pc.is_aligned(arch.pc_alignment())
        && taskmem::read_vec(task, pc, 1).is_ok()
}

/// The interrupted context recovered from a signal-handler frame
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResumedContext {
    pub pc: Addr,
    pub sp: Addr,
    pub fp: Addr,
    /// set when the interrupted pc itself is garbage (the crash was a jump
    /// to a bad address) but the return location could still be recovered
    pub recovered_ret: Option<Addr>,
}

/// per-family field offsets inside the saved machine context, plus the
/// candidate distances from a handler's frame pointer to that context
struct SignalLayout {
    base_hypotheses: &'static [u64],
    fp_off: u64,
    sp_off: u64,
    pc_off: u64,
    /// saved link register, for leaf recovery on the far side
    lr_off: Option<u64>,
}

const fn signal_layout(arch: Arch) -> SignalLayout {
    match arch {
        // offsets into the x86_64 gregs array (rbp 10, rsp 15, rip 16)
        Arch::X86_64 => SignalLayout {
            base_hypotheses: &[56, 64, 72, 88, 40],
            fp_off: 80,
            sp_off: 120,
            pc_off: 128,
            lr_off: None,
        },
        // i386 sigcontext: ebp 24, esp 28, eip 56 from its start
        Arch::X86 => SignalLayout {
            base_hypotheses: &[24, 28, 32, 36, 40],
            fp_off: 24,
            sp_off: 28,
            pc_off: 56,
            lr_off: None,
        },
        // arm sigcontext: r11 56, r13 64, r14 68, r15 72 from its start
        Arch::Arm => SignalLayout {
            base_hypotheses: &[156, 160, 164, 152, 168],
            fp_off: 56,
            sp_off: 64,
            pc_off: 72,
            lr_off: Some(68),
        },
        // aarch64 mcontext: regs[29] 240, lr 248, sp 256, pc 264
        Arch::Aarch64 => SignalLayout {
            base_hypotheses: &[304, 320, 336, 352, 368, 384, 400, 416],
            fp_off: 240,
            sp_off: 256,
            pc_off: 264,
            lr_off: Some(248),
        },
    }
}

/// Recovers the interrupted thread context across a signal-handler frame
///
/// The kernel parks a machine context on the stack between the interrupted
/// frame and the handler, at a distance that shifts between kernel and libc
/// versions. Each candidate distance is tried and the recovered values are
/// checked for self-consistency; only a fully plausible context is
/// accepted, so a wrong hypothesis terminates the walk instead of producing
/// fantasy frames.
///
/// When the interrupted pc is itself unreadable (the signal was a jump into
/// garbage) the far side is re-checked as a crashed leaf: a valid return
/// location in the saved link register, or on top of the interrupted stack
/// for the x86 families, rescues the walk.
pub(crate) fn cross_signal_frame(task: Task, arch: Arch, handler_fp: Addr) -> Option<ResumedContext> {
    let layout = signal_layout(arch);
    let mut leaf: Option<ResumedContext> = None;
    for &hyp in layout.base_hypotheses {
        let base = handler_fp + hyp;
        let Ok(fp) = read_word(task, arch, base + layout.fp_off) else {
            continue;
        };
        let Ok(sp) = read_word(task, arch, base + layout.sp_off) else {
            continue;
        };
        let Ok(pc) = read_word(task, arch, base + layout.pc_off) else {
            continue;
        };
        let mut ctx = ResumedContext {
            pc: Addr::from(pc),
            sp: Addr::from(sp),
            fp: Addr::from(fp),
            recovered_ret: None,
        };
        if !frame_is_plausible(arch, handler_fp, ctx) {
            continue;
        }
        if validate_pc(task, arch, ctx.pc) {
            trace!("signal context found {hyp} bytes above handler frame");
            return Some(ctx);
        }
        if leaf.is_none() {
            let ret_slot = layout.lr_off.map_or(ctx.sp, |off| base + off);
            if let Ok(ret) = read_word(task, arch, ret_slot) {
                let ret = Addr::from(ret);
                if validate_pc(task, arch, ret) {
                    trace!("signal context holds a crashed leaf, resuming at {ret}");
                    ctx.recovered_ret = Some(ret);
                    leaf = Some(ctx);
                }
            }
        }
    }
    // a valid-pc hypothesis always wins over a leaf interpretation
    leaf
}

fn frame_is_plausible(arch: Arch, handler_fp: Addr, ctx: ResumedContext) -> bool {
    ctx.fp > handler_fp
        && !ctx.fp.is_invalid()
        && ctx.fp.is_aligned(arch.word_size())
        && ctx.sp > handler_fp
        && ctx.sp <= ctx.fp
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_arch_selection() {
        assert_eq!(Arch::from_image(elf::EM_X86_64, true).unwrap(), Arch::X86_64);
        assert_eq!(Arch::from_image(elf::EM_386, false).unwrap(), Arch::X86);
        assert_eq!(Arch::from_image(elf::EM_AARCH64, true).unwrap(), Arch::Aarch64);
        // EM_ARM ignores the width bit
        assert_eq!(Arch::from_image(elf::EM_ARM, false).unwrap(), Arch::Arm);
        assert_eq!(Arch::from_image(elf::EM_ARM, true).unwrap(), Arch::Arm);

        assert!(matches!(
            Arch::from_image(elf::EM_X86_64, false),
            Err(TraceError::UnsupportedMachine(m)) if m == elf::EM_X86_64
        ));
        assert!(matches!(
            Arch::from_image(0xbeef, true),
            Err(TraceError::UnsupportedMachine(0xbeef))
        ));
    }

    #[test]
    fn test_frame_slots() {
        let fp = Addr::from(0x1000u64);
        assert_eq!(Arch::X86_64.ret_slot(fp), Addr::from(0x1008u64));
        assert_eq!(Arch::X86_64.prev_fp_slot(fp), fp);
        assert_eq!(Arch::X86.ret_slot(fp), Addr::from(0x1004u64));
        assert_eq!(Arch::Arm.ret_slot(fp), fp);
        assert_eq!(Arch::Arm.prev_fp_slot(fp), Addr::from(0xffcu64));
        assert_eq!(Arch::Aarch64.ret_slot(fp), Addr::from(0x1008u64));
        assert_eq!(Arch::Aarch64.prev_fp_slot(fp), fp);
    }

    #[test]
    fn test_state_from_raw_x86_64() {
        let mut blob = vec![0u8; StateFlavor::X86_64.size()];
        let put = |blob: &mut [u8], idx: usize, val: u64| {
            blob[idx * 8..idx * 8 + 8].copy_from_slice(&val.to_ne_bytes());
        };
        put(&mut blob, 16, 0x4444_0000); // rip
        put(&mut blob, 19, 0x7fff_1000); // rsp
        put(&mut blob, 4, 0x7fff_2000); // rbp

        let state = state_from_raw(StateFlavor::X86_64, &blob).unwrap();
        assert_eq!(state.arch, Arch::X86_64);
        assert_eq!(state.pc.u64(), 0x4444_0000);
        assert_eq!(state.sp.u64(), 0x7fff_1000);
        assert_eq!(state.fp.u64(), 0x7fff_2000);
        assert!(state.lr.is_null());
        assert!(state.regs.iter().any(|&(n, v)| n == "rip" && v == 0x4444_0000));
    }

    #[test]
    fn test_state_from_raw_arm() {
        let mut blob = vec![0u8; StateFlavor::Arm.size()];
        let put = |blob: &mut [u8], idx: usize, val: u32| {
            blob[idx * 4..idx * 4 + 4].copy_from_slice(&val.to_ne_bytes());
        };
        put(&mut blob, 15, 0x8000); // pc
        put(&mut blob, 14, 0x8100); // lr
        put(&mut blob, 13, 0xbef0_0000); // sp
        put(&mut blob, 11, 0xbef0_0010); // fp

        let state = state_from_raw(StateFlavor::Arm, &blob).unwrap();
        assert_eq!(state.arch, Arch::Arm);
        assert_eq!(state.pc.u64(), 0x8000);
        assert_eq!(state.lr.u64(), 0x8100);
        assert_eq!(state.sp.u64(), 0xbef0_0000);
        assert_eq!(state.fp.u64(), 0xbef0_0010);
    }

    #[test]
    fn test_state_from_raw_rejects_short_blob() {
        let err = state_from_raw(StateFlavor::Aarch64, &[0u8; 16]).unwrap_err();
        assert!(matches!(err, TraceError::InvalidArgument(_)));
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_capture_current_is_sane() {
        let state = capture_current().unwrap();
        assert!(!state.pc.is_null() && !state.pc.is_invalid());
        assert!(!state.sp.is_null());
        assert!(validate_pc(Task::current(), state.arch, state.pc));
        assert!(!state.regs.is_empty());
    }

    #[test]
    fn test_capture_sibling_of_blocked_thread() {
        let (tid_tx, tid_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            tid_tx.send(ThreadId::current()).unwrap();
            // block until the test is done looking at us
            let _ = done_rx.recv();
        });

        let tid = tid_rx.recv().unwrap();
        // give the thread a moment to block in recv
        std::thread::sleep(std::time::Duration::from_millis(50));
        let state = capture_sibling(tid).unwrap();
        assert!(!state.sp.is_null());

        done_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_capture_sibling_of_dead_thread_fails() {
        let err = capture_sibling(ThreadId::from_raw(i32::MAX - 1)).unwrap_err();
        assert!(matches!(err, TraceError::NoSuchThread(_)));
    }

    #[test]
    fn test_validate_pc() {
        let task = Task::current();
        let arch = Arch::native().unwrap();
        assert!(validate_pc(task, arch, Addr::from(test_validate_pc as usize)));
        assert!(!validate_pc(task, arch, Addr::NULL));
        assert!(!validate_pc(task, arch, Addr::INVALID));
        assert!(!validate_pc(task, arch, Addr::from(64u64)));
    }
}
