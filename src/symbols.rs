//! # Symbol resolution
//!
//! A [`SymbolSet`] owns the parsed images of one target and answers
//! name-to-address and address-to-name queries across all of them. It can
//! optionally keep the target suspended for its whole lifetime, which keeps
//! the image list from shifting under long query sequences.
//!
//! Bulk queries resolve each element independently: one unresolvable entry
//! yields `None` in its slot and never poisons its neighbors.

use tracing::debug;

use crate::addr::Addr;
use crate::discovery::ImageScanner;
use crate::elf;
use crate::errors::{Result, TraceError};
use crate::image::BinaryImage;
use crate::task::{SuspendGuard, Task, ThreadId};

/// Visibility of a resolved symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SymbolKind {
    /// global or weak binding, part of the image's interface
    Public,
    /// local binding, internal to its compilation unit
    Private,
}

/// One resolved symbol
#[derive(Debug, Clone, serde::Serialize)]
pub struct SymbolInfo {
    pub kind: SymbolKind,
    /// index into the owning [`SymbolSet`]'s image list
    pub image: usize,
    pub name: String,
    pub addr: Addr,
    /// distance from the symbol's start to the queried address; zero for
    /// name lookups
    pub offset: u64,
}

/// All images of one target, queryable by symbol name or address
#[derive(Debug)]
pub struct SymbolSet {
    task: Task,
    images: Vec<BinaryImage>,
    executable: Option<usize>,
    linker: Option<usize>,
    _suspension: Option<SuspendGuard>,
}

impl SymbolSet {
    /// Scans `task` and builds its symbol set
    ///
    /// With `suspend` set, all threads of the target stay stopped until the
    /// set is dropped.
    ///
    /// # Errors
    ///
    /// [`TraceError::SuspendSelf`] when asked to suspend the calling
    /// process; scan and attach failures propagate unchanged.
    pub fn for_task(task: Task, suspend: bool) -> Result<Self> {
        if suspend && task.is_current() {
            return Err(TraceError::SuspendSelf);
        }
        let suspension = if suspend {
            Some(SuspendGuard::attach(task)?)
        } else {
            None
        };

        let images = ImageScanner::new().images_from_task(task)?;
        let exe = task.exe_path().ok();
        let executable = images
            .iter()
            .position(|i| exe.as_deref().is_some() && i.path() == exe.as_deref())
            .or_else(|| {
                images
                    .iter()
                    .position(|i| i.object_kind() == elf::ET_EXEC)
            });
        let linker = images.iter().position(|i| {
            i.path()
                .and_then(std::path::Path::file_name)
                .is_some_and(crate::discovery::is_linker_name)
        });

        Ok(SymbolSet {
            task,
            images,
            executable,
            linker,
            _suspension: suspension,
        })
    }

    /// The calling process's own symbol set; never suspends
    ///
    /// # Errors
    ///
    /// Scan failures propagate unchanged.
    pub fn for_self() -> Result<Self> {
        Self::for_task(Task::current(), false)
    }

    #[must_use]
    pub fn task(&self) -> Task {
        self.task
    }

    #[must_use]
    pub fn images(&self) -> &[BinaryImage] {
        &self.images
    }

    #[must_use]
    pub fn image(&self, idx: usize) -> Option<&BinaryImage> {
        self.images.get(idx)
    }

    /// Index of the target's main executable image, when identified
    #[must_use]
    pub fn executable_index(&self) -> Option<usize> {
        self.executable
    }

    /// Index of the target's dynamic linker image, when identified
    #[must_use]
    pub fn linker_index(&self) -> Option<usize> {
        self.linker
    }

    pub(crate) fn holds_stopped(&self, tid: ThreadId) -> bool {
        self._suspension.as_ref().is_some_and(|g| g.holds(tid))
    }

    /// Resolves `name` to an address, optionally restricted to one library
    ///
    /// Without a library the executable is searched first, then every other
    /// image in load order. With one, images are matched on their library
    /// identity; when the requested `libfoo.so` yields nothing, its
    /// `libfoo_debug.so` and then `libfoo_profile.so` build variants are
    /// tried, in that order.
    ///
    /// # Errors
    ///
    /// Image-level failures while searching propagate; an absent symbol is
    /// `Ok(None)`.
    pub fn lookup_name(&self, name: &str, library: Option<&str>) -> Result<Option<SymbolInfo>> {
        let Some(wanted) = library else {
            return self.lookup_name_in(name, None);
        };
        for candidate in library_candidates(wanted) {
            if let Some(info) = self.lookup_name_in(name, Some(&candidate))? {
                return Ok(Some(info));
            }
        }
        Ok(None)
    }

    fn lookup_name_in(&self, name: &str, library: Option<&str>) -> Result<Option<SymbolInfo>> {
        for idx in self.search_order() {
            let img = &self.images[idx];
            if let Some(wanted) = library {
                if img.library() != Some(wanted) {
                    continue;
                }
            }
            match img.symbol_by_name(name) {
                Ok(Some(found)) => {
                    return Ok(Some(SymbolInfo {
                        kind: kind_of(found.binding),
                        image: idx,
                        name: found.name,
                        addr: found.addr,
                        offset: 0,
                    }));
                }
                Ok(None) => {}
                Err(TraceError::NotFound(_)) => {
                    // images without any symbol table just do not answer
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Resolves `addr` to the nearest preceding symbol of its image
    ///
    /// Only the image whose loadable range covers `addr` is consulted, and
    /// within it only the section containing the address, so a symbol from
    /// an unrelated section can never be reported with a huge bogus offset.
    ///
    /// # Errors
    ///
    /// Image-level failures propagate; an address in no image, or in an
    /// image without symbols, is `Ok(None)`.
    pub fn lookup_addr(&self, addr: Addr) -> Result<Option<SymbolInfo>> {
        let Some((idx, img)) = self.image_containing(addr) else {
            return Ok(None);
        };
        let section = img.section_containing(addr).map(|s| s.index);
        if section.is_none() && !img.sections().is_empty() {
            // in a segment gap of an image whose sections we do know; a
            // nearest symbol from some other section would be a lie
            return Ok(None);
        }
        let found = match img.nearest_symbol(addr, section) {
            Ok(found) => found,
            Err(TraceError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(found.map(|f| SymbolInfo {
            kind: kind_of(f.binding),
            image: idx,
            offset: addr - f.addr,
            name: f.name,
            addr: f.addr,
        }))
    }

    /// The first symbol after `addr` within the image containing it
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::lookup_addr`].
    pub fn next_symbol(&self, addr: Addr) -> Result<Option<SymbolInfo>> {
        let Some((idx, img)) = self.image_containing(addr) else {
            return Ok(None);
        };
        let found = match img.next_symbol_after(addr) {
            Ok(found) => found,
            Err(TraceError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(found.map(|f| SymbolInfo {
            kind: kind_of(f.binding),
            image: idx,
            offset: 0,
            name: f.name,
            addr: f.addr,
        }))
    }

    /// Resolves many addresses, one slot per input, failures as `None`
    #[must_use]
    pub fn lookup_addrs(&self, addrs: &[Addr]) -> Vec<Option<SymbolInfo>> {
        addrs
            .iter()
            .map(|&a| match self.lookup_addr(a) {
                Ok(info) => info,
                Err(e) => {
                    debug!("address lookup for {a} failed: {e}");
                    None
                }
            })
            .collect()
    }

    /// Resolves many names, one slot per input, failures as `None`
    #[must_use]
    pub fn lookup_names(&self, names: &[&str], library: Option<&str>) -> Vec<Option<SymbolInfo>> {
        names
            .iter()
            .map(|&n| match self.lookup_name(n, library) {
                Ok(info) => info,
                Err(e) => {
                    debug!("name lookup for {n} failed: {e}");
                    None
                }
            })
            .collect()
    }

    /// The image whose loadable segments cover `addr`
    #[must_use]
    pub fn image_containing(&self, addr: Addr) -> Option<(usize, &BinaryImage)> {
        self.images
            .iter()
            .enumerate()
            .find(|(_, img)| img.contains_addr(addr))
    }

    fn search_order(&self) -> impl Iterator<Item = usize> + '_ {
        let exe = self.executable;
        exe.into_iter()
            .chain((0..self.images.len()).filter(move |i| Some(*i) != exe))
    }
}

fn kind_of(binding: u8) -> SymbolKind {
    match binding {
        elf::STB_GLOBAL | elf::STB_WEAK => SymbolKind::Public,
        _ => SymbolKind::Private,
    }
}

/// The requested library name followed by its `_debug` and `_profile` build
/// variants, in the order lookups try them
fn library_candidates(requested: &str) -> Vec<String> {
    let mut names = vec![requested.to_owned()];
    if let Some(pos) = requested.find(".so") {
        let (stem, tail) = requested.split_at(pos);
        names.push(format!("{stem}_debug{tail}"));
        names.push(format!("{stem}_profile{tail}"));
    }
    names
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lookup_main_by_name() {
        // Rust binaries carry an unmangled C main
        let syms = SymbolSet::for_self().unwrap();
        let info = syms.lookup_name("main", None).unwrap().unwrap();
        assert!(!info.addr.is_null());
        assert_eq!(info.offset, 0);
        assert_eq!(info.name, "main");
    }

    #[test]
    fn test_lookup_addr_of_own_function() {
        let syms = SymbolSet::for_self().unwrap();
        let here = Addr::from(test_lookup_addr_of_own_function as usize);
        let info = syms.lookup_addr(here).unwrap().unwrap();
        assert!(info.addr <= here);
        assert_eq!(here - info.addr, info.offset);
        assert_eq!(Some(info.image), syms.executable_index());
    }

    #[test]
    fn test_library_filter() {
        let syms = SymbolSet::for_self().unwrap();
        let libc = syms
            .images()
            .iter()
            .filter_map(BinaryImage::library)
            .find(|l| l.starts_with("libc.so"))
            .map(str::to_owned);
        let Some(libc) = libc else {
            // statically linked test runner, nothing to filter on
            return;
        };
        let info = syms.lookup_name("malloc", Some(&libc)).unwrap().unwrap();
        assert_eq!(
            syms.images()[info.image].library(),
            Some(libc.as_str())
        );
        // a wrong library filter must find nothing
        assert!(syms
            .lookup_name("malloc", Some("libdoesnotexist.so"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_library_variant_order() {
        // the exact name wins, then _debug, then _profile
        assert_eq!(
            library_candidates("libfoo.so"),
            ["libfoo.so", "libfoo_debug.so", "libfoo_profile.so"]
        );
        assert_eq!(
            library_candidates("libfoo.so.6"),
            ["libfoo.so.6", "libfoo_debug.so.6", "libfoo_profile.so.6"]
        );
        // no .so suffix, no variants to try
        assert_eq!(library_candidates("libfoo"), ["libfoo"]);
    }

    #[test]
    fn test_bulk_lookups_isolate_failures() {
        let syms = SymbolSet::for_self().unwrap();
        let here = Addr::from(test_bulk_lookups_isolate_failures as usize);
        let results = syms.lookup_addrs(&[here, Addr::from(16u64), Addr::INVALID]);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_none());

        let names = syms.lookup_names(&["main", "no_such_symbol_anywhere"], None);
        assert!(names[0].is_some());
        assert!(names[1].is_none());
    }

    #[test]
    fn test_suspending_self_is_rejected() {
        let syms = SymbolSet::for_task(Task::current(), true);
        assert!(matches!(syms, Err(TraceError::SuspendSelf)));
    }

    #[test]
    fn test_linker_is_identified() {
        let syms = SymbolSet::for_self().unwrap();
        // dynamically linked test binaries map their interpreter
        let Some(idx) = syms.linker_index() else {
            return;
        };
        let img = syms.image(idx).unwrap();
        assert_eq!(img.object_kind(), elf::ET_DYN);
        assert_ne!(syms.executable_index(), Some(idx));
    }

    #[test]
    fn test_next_symbol_moves_forward() {
        let syms = SymbolSet::for_self().unwrap();
        let here = Addr::from(test_next_symbol_moves_forward as usize);
        let cur = syms.lookup_addr(here).unwrap().unwrap();
        let next = syms.next_symbol(cur.addr).unwrap().unwrap();
        assert!(next.addr > cur.addr);
        assert_eq!(cur.image, next.image);
    }
}
