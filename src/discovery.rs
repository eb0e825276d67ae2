//! # Image discovery
//!
//! Walks a target's memory map and turns every mapped ELF object into a
//! [`BinaryImage`], and locates the dynamic linker inside a target without
//! relying on debugger rendezvous structures. Both work on the calling
//! process and on foreign processes alike; images that fail to parse are
//! skipped with a log line rather than failing the whole scan.

use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use proc_maps::get_process_maps;
use tracing::{debug, trace};

use crate::addr::Addr;
use crate::elf;
use crate::errors::{Result, TraceError};
use crate::image::BinaryImage;
use crate::task::Task;
use crate::taskmem;

/// CPU family filter for image scans
///
/// `Any` accepts every family this crate understands, which matters for
/// targets running under binary translation where the interesting images are
/// not of the host's architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuType {
    #[default]
    Any,
    X86,
    X86_64,
    Arm,
    Aarch64,
}

impl CpuType {
    /// Whether an image with this ELF machine and width belongs to the family
    #[must_use]
    pub fn matches(self, machine: u16, is_64: bool) -> bool {
        match self {
            CpuType::Any => matches!(
                machine,
                elf::EM_386 | elf::EM_X86_64 | elf::EM_ARM | elf::EM_AARCH64
            ),
            CpuType::X86 => machine == elf::EM_386 && !is_64,
            CpuType::X86_64 => machine == elf::EM_X86_64 && is_64,
            CpuType::Arm => machine == elf::EM_ARM && !is_64,
            CpuType::Aarch64 => machine == elf::EM_AARCH64 && is_64,
        }
    }

    /// The family of the build host
    #[must_use]
    pub fn native() -> Self {
        if cfg!(target_arch = "x86_64") {
            CpuType::X86_64
        } else if cfg!(target_arch = "x86") {
            CpuType::X86
        } else if cfg!(target_arch = "aarch64") {
            CpuType::Aarch64
        } else if cfg!(target_arch = "arm") {
            CpuType::Arm
        } else {
            CpuType::Any
        }
    }

    /// The ELF machine value, `None` for [`CpuType::Any`]
    #[must_use]
    pub fn machine(self) -> Option<u16> {
        match self {
            CpuType::Any => None,
            CpuType::X86 => Some(elf::EM_386),
            CpuType::X86_64 => Some(elf::EM_X86_64),
            CpuType::Arm => Some(elf::EM_ARM),
            CpuType::Aarch64 => Some(elf::EM_AARCH64),
        }
    }
}

/// Discovers binary images in a target's address space
///
/// Holds per-instance memoized state (the calling process's own linker
/// location), so sharing one scanner across lookups is cheaper than creating
/// one per call. No global state is involved.
#[derive(Debug, Default)]
pub struct ImageScanner {
    local_linker: OnceCell<Option<Addr>>,
}

impl ImageScanner {
    #[must_use]
    pub fn new() -> Self {
        ImageScanner::default()
    }

    /// Parses every mapped ELF object of `task`, sorted by load address
    ///
    /// File-backed objects get their path recorded (enabling file-based
    /// symbol tables later); the vDSO is included as a memory-only image.
    /// Mappings that look like images but fail to parse are skipped.
    ///
    /// # Errors
    ///
    /// Fails when the target's memory map cannot be read at all.
    pub fn images_from_task(&self, task: Task) -> Result<Vec<BinaryImage>> {
        let maps = get_process_maps(task.raw_pid())?;

        // one candidate per backing file: the lowest mapping of page zero
        let mut candidates: Vec<(Addr, Option<PathBuf>)> = Vec::new();
        for region in &maps {
            if region.offset != 0 {
                continue;
            }
            let base = Addr::from(region.start());
            match region.filename() {
                Some(p) if p.is_absolute() => {
                    if candidates.iter().any(|(_, c)| c.as_deref() == Some(p)) {
                        continue;
                    }
                    candidates.push((base, Some(p.to_owned())));
                }
                Some(p) if p.ends_with("[vdso]") => candidates.push((base, None)),
                _ => {}
            }
        }

        let mut images = Vec::new();
        for (base, path) in candidates {
            match BinaryImage::from_task(task, base, path.clone()) {
                Ok(img) => images.push(img),
                Err(e) => {
                    // plenty of file mappings are not images at all
                    debug!("skipping mapping at {base}: {e}");
                }
            }
        }
        images.sort_by_key(BinaryImage::base);
        Ok(images)
    }

    /// [`Self::images_from_task`] for the calling process
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::images_from_task`].
    pub fn images_from_self(&self) -> Result<Vec<BinaryImage>> {
        self.images_from_task(Task::current())
    }

    /// Finds the dynamic linker image loaded in `task`
    ///
    /// Tries the cheap route first: the calling process's own linker base,
    /// which matches whenever target and caller run the same linker at the
    /// same address. Otherwise scans the target's mappings for a loaded
    /// `ET_DYN` object of the requested family. Under `CpuType::Any` a
    /// non-native candidate wins over a native one, so translated targets
    /// report their emulated linker rather than the translator's.
    ///
    /// # Errors
    ///
    /// [`TraceError::NotFound`] when no linker candidate exists, for example
    /// in a statically linked target.
    pub fn locate_linker(&self, task: Task, cpu: CpuType) -> Result<Addr> {
        if let Some(base) = self.local_linker_base() {
            if let Some((machine, is_64)) = probe_header(task, base) {
                if cpu.matches(machine, is_64) && is_linker_at(task, base) {
                    trace!("target shares our linker at {base}");
                    return Ok(base);
                }
            }
        }

        let maps = get_process_maps(task.raw_pid())?;
        let mut fallback: Option<(Addr, u16)> = None;
        let native = CpuType::native();
        for region in &maps {
            if region.offset != 0 || !region.is_read() {
                continue;
            }
            let base = Addr::from(region.start());
            let Some((machine, is_64, etype)) = probe_full_header(task, base) else {
                continue;
            };
            if etype != elf::ET_DYN || !cpu.matches(machine, is_64) {
                continue;
            }
            let named = region
                .filename()
                .is_some_and(|p| p.file_name().is_some_and(is_linker_name));
            if !named {
                continue;
            }
            let foreign = !native.matches(machine, is_64);
            if cpu == CpuType::Any && foreign {
                // a translated target's own linker beats the translator's
                return Ok(base);
            }
            if fallback.is_none() {
                fallback = Some((base, machine));
            }
        }

        fallback
            .map(|(base, _)| base)
            .ok_or_else(|| TraceError::NotFound("no dynamic linker in target".into()))
    }

    /// Base of the calling process's own dynamic linker, probed once
    fn local_linker_base(&self) -> Option<Addr> {
        *self.local_linker.get_or_init(|| {
            let maps = get_process_maps(Task::current().raw_pid()).ok()?;
            maps.iter()
                .filter(|r| {
                    r.offset == 0
                        && r.filename()
                            .and_then(Path::file_name)
                            .is_some_and(is_linker_name)
                })
                .map(|r| Addr::from(r.start()))
                .min()
        })
    }
}

/// Whether a file name looks like a dynamic linker
pub(crate) fn is_linker_name(name: &std::ffi::OsStr) -> bool {
    let Some(name) = name.to_str() else {
        return false;
    };
    name.starts_with("ld-linux") || name.starts_with("ld-musl") || name.starts_with("ld.so")
        || name == "ld64.so.1"
        || name == "ld64.so.2"
}

/// Reads and validates an ELF header at `base`, returning machine and width
fn probe_header(task: Task, base: Addr) -> Option<(u16, bool)> {
    probe_full_header(task, base).map(|(m, w, _)| (m, w))
}

fn probe_full_header(task: Task, base: Addr) -> Option<(u16, bool, u16)> {
    let head = taskmem::read_vec(task, base, 64).ok()?;
    let ehdr = elf::parse_ehdr(&head).ok()?;
    Some((ehdr.machine, ehdr.is_64, ehdr.etype))
}

/// Whether the object at `base` in `task` is backed by a linker-named file
fn is_linker_at(task: Task, base: Addr) -> bool {
    let Ok(maps) = get_process_maps(task.raw_pid()) else {
        return false;
    };
    maps.iter().any(|r| {
        Addr::from(r.start()) == base
            && r.filename()
                .and_then(Path::file_name)
                .is_some_and(is_linker_name)
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cpu_type_matching() {
        assert!(CpuType::Any.matches(elf::EM_X86_64, true));
        assert!(CpuType::Any.matches(elf::EM_ARM, false));
        assert!(CpuType::X86_64.matches(elf::EM_X86_64, true));
        assert!(!CpuType::X86_64.matches(elf::EM_X86_64, false));
        assert!(!CpuType::X86.matches(elf::EM_X86_64, true));
        assert!(!CpuType::Aarch64.matches(elf::EM_ARM, false));
        assert!(CpuType::native().matches(
            CpuType::native().machine().unwrap_or(elf::EM_X86_64),
            cfg!(target_pointer_width = "64"),
        ));
    }

    #[test]
    fn test_images_from_self_include_executable() {
        let scanner = ImageScanner::new();
        let images = scanner.images_from_self().unwrap();
        assert!(!images.is_empty());

        let exe = Task::current().exe_path().unwrap();
        assert!(images.iter().any(|i| i.path() == Some(exe.as_path())));

        // sorted, and each image really spans its own base
        for pair in images.windows(2) {
            assert!(pair[0].base() <= pair[1].base());
        }
        for img in &images {
            assert!(img.contains_addr(img.base()));
        }
    }

    #[test]
    fn test_locate_linker_in_self() {
        // test binaries are dynamically linked by default
        let scanner = ImageScanner::new();
        let base = scanner
            .locate_linker(Task::current(), CpuType::native())
            .unwrap();
        assert!(!base.is_null() && !base.is_invalid());

        let any = scanner.locate_linker(Task::current(), CpuType::Any).unwrap();
        assert_eq!(any, base);
    }

    #[test]
    fn test_linker_name_heuristic() {
        use std::ffi::OsStr;
        assert!(is_linker_name(OsStr::new("ld-linux-x86-64.so.2")));
        assert!(is_linker_name(OsStr::new("ld-musl-aarch64.so.1")));
        assert!(is_linker_name(OsStr::new("ld.so.1")));
        assert!(!is_linker_name(OsStr::new("libc.so.6")));
        assert!(!is_linker_name(OsStr::new("libld.so")));
    }
}
