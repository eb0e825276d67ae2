//! # Stack walking
//!
//! Reconstructs call stacks by following the frame-pointer chain of a
//! captured [`ThreadState`]. The walk is defensive throughout: every frame
//! pointer must be aligned, lie inside the thread's stack region, and be
//! strictly greater than its predecessor, so cycles and garbage chains
//! terminate instead of looping. Running off the walkable part of a stack is
//! a truncated-but-successful result, never an error.
//!
//! When a step produces an implausible next frame the walker tries one more
//! thing before giving up: treating the current frame as a signal handler
//! and looking for the kernel-saved machine context above it, which lets
//! backtraces cross signal delivery into the interrupted code.

use serde::Serialize;
use tracing::trace;

use crate::addr::Addr;
use crate::arch::{self, Arch, ThreadState};
use crate::errors::Result;
use crate::symbols::SymbolSet;
use crate::task::Task;

/// Hard cap on frames per walk; a frame-pointer chain longer than this is
/// assumed to be corrupt
const MAX_FRAMES: usize = 512;

/// retry bound for the probe-then-fetch loop in [`backtrace_vec`]
const MAX_GROW_RETRIES: usize = 10;

/// Diagnostic flags on one reconstructed frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameFlags {
    /// the frame pointer could not be trusted at this frame
    pub fp_invalid: bool,
    /// the program counter does not point at mapped code
    pub pc_invalid: bool,
    /// this frame was executing a signal handler
    pub signal_handler: bool,
}

/// One reconstructed stack frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktraceFrame {
    pub pc: Addr,
    pub fp: Addr,
    pub flags: FrameFlags,
    /// demangled symbol name, when resolvable
    pub symbol: Option<String>,
    /// library identity of the image containing `pc`
    pub library: Option<String>,
    /// distance from the symbol's start to `pc`
    pub offset: u64,
}

impl Default for BacktraceFrame {
    fn default() -> Self {
        BacktraceFrame {
            pc: Addr::INVALID,
            fp: Addr::INVALID,
            flags: FrameFlags::default(),
            symbol: None,
            library: None,
            offset: 0,
        }
    }
}

/// The memory range a thread's stack occupies
#[derive(Debug, Clone, Copy)]
struct StackRange {
    lo: Addr,
    hi: Addr,
}

impl StackRange {
    /// The mapped region containing `sp`, or a generous synthetic range when
    /// the map cannot be consulted
    fn around(task: Task, sp: Addr) -> StackRange {
        if let Ok(maps) = proc_maps::get_process_maps(task.raw_pid()) {
            for r in &maps {
                let lo = Addr::from(r.start());
                let hi = Addr::from(r.start() + r.size());
                if sp >= lo && sp < hi {
                    return StackRange { lo, hi };
                }
            }
        }
        StackRange {
            lo: sp,
            hi: sp.checked_add(8 * 1024 * 1024),
        }
    }

    fn contains(&self, addr: Addr) -> bool {
        addr >= self.lo && addr < self.hi
    }
}

/// internal raw frame before symbol annotation
struct RawFrame {
    pc: Addr,
    fp: Addr,
    flags: FrameFlags,
    /// return addresses point one past their call; crash and resume PCs are
    /// exact and must not be adjusted before symbolization
    adjust: bool,
}

/// Reconstructs the stack of `state`, storing up to `frames.len()` frames
///
/// Returns the total number of frames the stack holds, which may exceed the
/// slice's capacity; calling with an empty slice is the supported way to
/// probe for the required size. Stored frames are symbol-annotated, probed
/// ones are only counted.
///
/// # Errors
///
/// Fails only on setup problems such as an unsupported architecture in the
/// state; a stack that cannot be walked far yields a short result instead.
pub fn backtrace_from_state(
    syms: &SymbolSet,
    state: &ThreadState,
    frames: &mut [BacktraceFrame],
) -> Result<usize> {
    let raw = walk(syms.task(), state);
    let stored = raw.len().min(frames.len());
    annotate(syms, &raw[..stored], &mut frames[..stored]);
    Ok(raw.len())
}

/// Reconstructs the full stack of `state` into a vector
///
/// # Errors
///
/// Same contract as [`backtrace_from_state`].
pub fn backtrace_vec(syms: &SymbolSet, state: &ThreadState) -> Result<Vec<BacktraceFrame>> {
    let mut capacity = 64;
    for _ in 0..MAX_GROW_RETRIES {
        let mut frames = vec![BacktraceFrame::default(); capacity];
        let count = backtrace_from_state(syms, state, &mut frames)?;
        if count <= frames.len() {
            frames.truncate(count);
            return Ok(frames);
        }
        capacity = count;
    }
    // a stack that keeps growing under us; return what fits the last size
    let mut frames = vec![BacktraceFrame::default(); capacity];
    let count = backtrace_from_state(syms, state, &mut frames)?;
    frames.truncate(count.min(capacity));
    Ok(frames)
}

fn walk(task: Task, state: &ThreadState) -> Vec<RawFrame> {
    let arch = state.arch;
    let mut frames: Vec<RawFrame> = Vec::new();
    if state.pc.is_invalid() && state.sp.is_null() {
        // placeholder state of a thread that could not be observed; one
        // fully flagged frame keeps the thread visible in reports
        frames.push(RawFrame {
            pc: state.pc,
            fp: state.fp,
            flags: FrameFlags {
                fp_invalid: true,
                pc_invalid: true,
                signal_handler: false,
            },
            adjust: false,
        });
        return frames;
    }
    let stack = StackRange::around(task, state.sp);

    let mut pc = state.pc;
    let mut fp = state.fp;
    let mut adjust = false;

    // crashed leaf: the pc is garbage but the return location survives in
    // the link register (or on top of the stack for x86)
    if !arch::validate_pc(task, arch, pc) {
        // the synthesized top frame carries both bad marks: nothing about
        // the crash site can be trusted
        frames.push(RawFrame {
            pc,
            fp,
            flags: FrameFlags {
                fp_invalid: true,
                pc_invalid: true,
                signal_handler: false,
            },
            adjust: false,
        });
        let recovered = if arch.has_link_register() {
            Some(state.lr)
        } else {
            arch::read_word(task, arch, state.sp).ok().map(Addr::from)
        };
        match recovered {
            Some(ret) if arch::validate_pc(task, arch, ret) => {
                trace!("recovered return address {ret} past invalid pc");
                pc = ret;
                adjust = true;
            }
            _ => return frames,
        }
    }

    // fp of the last frame the loop pushed; the synthesized leaf frame above
    // shares its fp with the first real one and must not trip this check
    let mut prev_fp: Option<Addr> = None;

    while frames.len() < MAX_FRAMES {
        let mut flags = FrameFlags::default();

        let fp_ok = !fp.is_null()
            && !fp.is_invalid()
            && fp.is_aligned(arch.word_size())
            && stack.contains(fp)
            && prev_fp.map_or(true, |p| fp > p);

        if !fp_ok {
            flags.fp_invalid = !fp.is_null();
            frames.push(RawFrame { pc, fp, flags, adjust });
            break;
        }

        let step = arch::read_word(task, arch, arch.ret_slot(fp))
            .and_then(|ret| Ok((ret, arch::read_word(task, arch, arch.prev_fp_slot(fp))?)));
        let Ok((ret, next_fp)) = step else {
            flags.fp_invalid = true;
            frames.push(RawFrame { pc, fp, flags, adjust });
            break;
        };

        prev_fp = Some(fp);

        if ret == 0 && next_fp == 0 {
            // the outermost frame zeroes its record; clean end of stack
            frames.push(RawFrame { pc, fp, flags, adjust });
            break;
        }

        let ret = Addr::from(ret);
        let next_fp = Addr::from(next_fp);
        let plausible = arch::validate_pc(task, arch, ret)
            && next_fp > fp
            && next_fp.is_aligned(arch.word_size());

        if plausible {
            frames.push(RawFrame { pc, fp, flags, adjust });
            pc = ret;
            fp = next_fp;
            adjust = true;
            continue;
        }

        // the chain looks broken; a kernel signal frame above us explains
        // that and tells us where the interrupted code left off
        if let Some(ctx) = arch::cross_signal_frame(task, arch, fp) {
            flags.signal_handler = true;
            frames.push(RawFrame { pc, fp, flags, adjust });
            if let Some(ret) = ctx.recovered_ret {
                // the signal was a jump into garbage; show the bad pc, then
                // resume at the return location saved by the doomed call
                frames.push(RawFrame {
                    pc: ctx.pc,
                    fp: ctx.fp,
                    flags: FrameFlags {
                        pc_invalid: true,
                        ..FrameFlags::default()
                    },
                    adjust: false,
                });
                pc = ret;
                adjust = true;
            } else {
                pc = ctx.pc;
                adjust = false;
            }
            fp = ctx.fp;
            continue;
        }

        frames.push(RawFrame { pc, fp, flags, adjust });
        break;
    }

    frames
}

fn annotate(syms: &SymbolSet, raw: &[RawFrame], out: &mut [BacktraceFrame]) {
    let queries: Vec<Addr> = raw
        .iter()
        .map(|f| {
            if f.adjust && !f.pc.is_null() && !f.pc.is_invalid() {
                // return addresses point past the call; step back inside it
                f.pc - 1u64
            } else {
                f.pc
            }
        })
        .collect();
    let infos = syms.lookup_addrs(&queries);

    for ((frame, info), slot) in raw.iter().zip(infos).zip(out.iter_mut()) {
        *slot = BacktraceFrame {
            pc: frame.pc,
            fp: frame.fp,
            flags: frame.flags,
            symbol: None,
            library: None,
            offset: 0,
        };
        let Some(info) = info else {
            continue;
        };
        slot.symbol = Some(rustc_demangle::demangle(&info.name).to_string());
        slot.library = syms
            .image(info.image)
            .and_then(|img| img.library().map(str::to_owned));
        slot.offset = frame.pc.u64().saturating_sub(info.addr.u64());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::StateFlavor;

    fn trace_logs() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn fake_state(pc: u64, sp: Addr, fp: Addr) -> ThreadState {
        ThreadState {
            arch: Arch::X86_64,
            pc: Addr::from(pc),
            sp,
            fp,
            lr: Addr::NULL,
            regs: Vec::new(),
        }
    }

    fn code_addr(offset: u64) -> u64 {
        // a real, mapped, executable address to stand in for a pc
        (test_walks_synthetic_frame_chain as usize as u64) + offset
    }

    /// lays out classic x86_64 frame records inside `buf`:
    /// `[fp] = previous fp`, `[fp + 8] = return address`
    fn build_chain(buf: &mut [u64], records: &[(usize, usize, u64)]) {
        let base = buf.as_ptr() as u64;
        for &(at, prev, ret) in records {
            buf[at] = if prev == 0 { 0 } else { base + prev as u64 * 8 };
            buf[at + 1] = ret;
        }
    }

    #[test]
    fn test_walks_synthetic_frame_chain() {
        trace_logs();
        let mut buf = vec![0u64; 64];
        let base = buf.as_ptr() as u64;
        build_chain(
            &mut buf,
            &[
                (8, 16, code_addr(0x10)),
                (16, 24, code_addr(0x20)),
                (24, 0, 0),
            ],
        );

        let syms = SymbolSet::for_self().unwrap();
        let state = fake_state(
            code_addr(4),
            Addr::from(base),
            Addr::from(base + 8 * 8),
        );
        let frames = backtrace_vec(&syms, &state).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].pc.u64(), code_addr(4));
        assert_eq!(frames[1].pc.u64(), code_addr(0x10));
        assert_eq!(frames[2].pc.u64(), code_addr(0x20));
        assert!(frames.iter().all(|f| !f.flags.fp_invalid));
        // all pcs live in our executable, so annotation must have found it
        assert!(frames.iter().all(|f| f.symbol.is_some()));
        assert!(frames[1].fp > frames[0].fp);
    }

    #[test]
    fn test_probe_then_fetch_agree() {
        let mut buf = vec![0u64; 64];
        let base = buf.as_ptr() as u64;
        build_chain(
            &mut buf,
            &[(8, 16, code_addr(0x10)), (16, 0, 0)],
        );

        let syms = SymbolSet::for_self().unwrap();
        let state = fake_state(code_addr(4), Addr::from(base), Addr::from(base + 64));

        let total = backtrace_from_state(&syms, &state, &mut []).unwrap();
        assert_eq!(total, 2);

        let mut one = vec![BacktraceFrame::default(); 1];
        let reported = backtrace_from_state(&syms, &state, &mut one).unwrap();
        assert_eq!(reported, total);
        assert_eq!(one[0].pc.u64(), code_addr(4));

        let all = backtrace_vec(&syms, &state).unwrap();
        assert_eq!(all.len(), total);
        assert_eq!(all[0].pc, one[0].pc);
    }

    #[test]
    fn test_garbage_fp_truncates_cleanly() {
        let syms = SymbolSet::for_self().unwrap();
        let local = 0u64;
        let sp = Addr::from(std::ptr::addr_of!(local) as usize);

        // unaligned fp: one frame, flagged, and still success
        let state = fake_state(code_addr(4), sp, sp + 3u64);
        let frames = backtrace_vec(&syms, &state).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].flags.fp_invalid);

        // null fp: clean single frame, nothing flagged
        let state = fake_state(code_addr(4), sp, Addr::NULL);
        let frames = backtrace_vec(&syms, &state).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].flags.fp_invalid);
        assert!(!frames[0].flags.pc_invalid);
    }

    #[test]
    fn test_invalid_pc_is_flagged_and_recovered_via_stack() {
        // x86 leaf recovery: the return address sits on top of the stack
        let mut buf = vec![0u64; 64];
        let base = buf.as_ptr() as u64;
        buf[0] = code_addr(0x10); // [sp]: return into the caller
        build_chain(&mut buf, &[(8, 0, 0)]);

        let syms = SymbolSet::for_self().unwrap();
        let state = fake_state(0x40, Addr::from(base), Addr::from(base + 64));
        let frames = backtrace_vec(&syms, &state).unwrap();

        assert!(frames.len() >= 2);
        assert!(frames[0].flags.pc_invalid);
        assert!(frames[0].flags.fp_invalid);
        assert_eq!(frames[0].pc.u64(), 0x40);
        assert_eq!(frames[1].pc.u64(), code_addr(0x10));
    }

    #[test]
    fn test_crossing_a_synthetic_signal_frame() {
        trace_logs();
        // handler frame whose record is garbage, with a plausible saved
        // machine context placed where the kernel puts one
        let mut buf = vec![0u64; 256];
        let base = buf.as_ptr() as u64;
        let at = |i: usize| base + i as u64 * 8;

        let handler_fp = 8usize;
        buf[handler_fp] = 0x10; // non-increasing prev fp, breaks the chain
        buf[handler_fp + 1] = 0x3; // unaligned garbage return

        // context at handler_fp + 56 bytes (first hypothesis):
        // rbp at +80, rsp at +120, rip at +128 within it
        let ctx = handler_fp + 56 / 8;
        let resumed_fp = 160usize;
        buf[ctx + 80 / 8] = at(resumed_fp);
        buf[ctx + 120 / 8] = at(resumed_fp - 2);
        buf[ctx + 128 / 8] = code_addr(0x30);
        buf[resumed_fp] = 0;
        buf[resumed_fp + 1] = 0;

        let syms = SymbolSet::for_self().unwrap();
        let state = fake_state(code_addr(4), Addr::from(base), Addr::from(at(handler_fp)));
        let frames = backtrace_vec(&syms, &state).unwrap();

        assert_eq!(frames.len(), 2);
        assert!(frames[0].flags.signal_handler);
        assert_eq!(frames[1].pc.u64(), code_addr(0x30));
        assert!(frames[1].fp > frames[0].fp);
    }

    #[test]
    fn test_signal_frame_with_crashed_leaf() {
        trace_logs();
        // like the signal test above, but the interrupted pc is garbage and
        // the return location sits on the interrupted stack (x86 leaf)
        let mut buf = vec![0u64; 256];
        let base = buf.as_ptr() as u64;
        let at = |i: usize| base + i as u64 * 8;

        let handler_fp = 8usize;
        buf[handler_fp] = 0x10;
        buf[handler_fp + 1] = 0x3;

        let ctx = handler_fp + 56 / 8;
        let resumed_fp = 160usize;
        let resumed_sp = resumed_fp - 4;
        buf[ctx + 80 / 8] = at(resumed_fp);
        buf[ctx + 120 / 8] = at(resumed_sp);
        buf[ctx + 128 / 8] = 0x40; // jumped into garbage
        buf[resumed_sp] = code_addr(0x50); // return pushed by the doomed call
        buf[resumed_fp] = 0;
        buf[resumed_fp + 1] = 0;

        let syms = SymbolSet::for_self().unwrap();
        let state = fake_state(code_addr(4), Addr::from(base), Addr::from(at(handler_fp)));
        let frames = backtrace_vec(&syms, &state).unwrap();

        assert_eq!(frames.len(), 3);
        assert!(frames[0].flags.signal_handler);
        assert!(frames[1].flags.pc_invalid);
        assert_eq!(frames[1].pc.u64(), 0x40);
        assert_eq!(frames[2].pc.u64(), code_addr(0x50));
    }

    #[test]
    fn test_placeholder_state_yields_one_flagged_frame() {
        let syms = SymbolSet::for_self().unwrap();
        let state = ThreadState {
            arch: Arch::X86_64,
            pc: Addr::INVALID,
            sp: Addr::NULL,
            fp: Addr::NULL,
            lr: Addr::NULL,
            regs: Vec::new(),
        };
        let frames = backtrace_vec(&syms, &state).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].flags.pc_invalid);
        assert!(frames[0].flags.fp_invalid);
        assert!(frames[0].symbol.is_none());
    }

    #[test]
    fn test_self_backtrace_has_consistent_frames() {
        let syms = SymbolSet::for_self().unwrap();
        let state = arch::capture_current().unwrap();
        let frames = backtrace_vec(&syms, &state).unwrap();

        assert!(!frames.is_empty());
        assert_eq!(frames[0].pc, state.pc);
        for pair in frames.windows(2) {
            if !pair[1].flags.fp_invalid && !pair[0].flags.signal_handler {
                assert!(pair[1].fp > pair[0].fp);
            }
        }
    }

    #[test]
    fn test_raw_blob_state_walks_like_a_native_one() {
        let mut buf = vec![0u64; 64];
        let base = buf.as_ptr() as u64;
        build_chain(&mut buf, &[(8, 16, code_addr(0x10)), (16, 0, 0)]);

        let mut blob = vec![0u8; StateFlavor::X86_64.size()];
        let put = |blob: &mut [u8], idx: usize, val: u64| {
            blob[idx * 8..idx * 8 + 8].copy_from_slice(&val.to_ne_bytes());
        };
        put(&mut blob, 16, code_addr(4)); // rip
        put(&mut blob, 19, base); // rsp
        put(&mut blob, 4, base + 8 * 8); // rbp

        let state = crate::arch::state_from_raw(StateFlavor::X86_64, &blob).unwrap();
        let syms = SymbolSet::for_self().unwrap();
        let frames = backtrace_vec(&syms, &state).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].pc.u64(), code_addr(0x10));
    }
}
