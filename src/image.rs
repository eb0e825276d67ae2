//! # Binary image model
//!
//! A [`BinaryImage`] is one parsed ELF image: from a file on disk, from the
//! calling process, or from an address inside an arbitrary process. At
//! construction the raw program headers (one of two widths, two byte orders)
//! are normalized once into canonical 64-bit native-order [`Segment`] and
//! [`Section`] records; everything above reads only those. The original
//! unparsed program-header record is kept on each segment.
//!
//! The symbol table is loaded lazily, once: from the backing file when one is
//! known (giving the full `.symtab`), otherwise from the target's memory
//! through its `PT_DYNAMIC` segment, which is how memory-only images such as
//! the vDSO still resolve symbols. Symbol queries are one linear walk of the
//! table per call.

use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, trace};

use crate::addr::Addr;
use crate::elf::{self, ByteView, Ehdr, RawShdr};
use crate::errors::{Result, TraceError};
use crate::task::Task;
use crate::taskmem::{self, OwnedRegion};

/// parsing limits for headers read out of untrusted target memory
const MAX_PHNUM: u16 = 1024;
const MAX_SHNUM: u16 = 4096;
const MAX_SYMBOLS: u64 = 1 << 20;
const MAX_STRTAB: u64 = 64 << 20;

/// A loadable or metadata segment, width-promoted to 64-bit fields
///
/// Addresses are the link-time values exactly as stored in the image; apply
/// [`BinaryImage::slide`] to get runtime addresses.
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    /// synthesized stable name: the executable load segment is `text`, the
    /// writable one `data`, read-only ones `rodata`, plus `dynamic`,
    /// `interp` and friends for the metadata segments
    pub name: String,
    pub kind: u32,
    pub flags: u32,
    pub vmaddr: Addr,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    /// the unparsed program-header record exactly as stored in the image
    pub raw: Vec<u8>,
}

impl Segment {
    #[must_use]
    pub fn is_loadable(&self) -> bool {
        self.kind == elf::PT_LOAD
    }

    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.flags & elf::PF_X != 0
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.flags & elf::PF_W != 0
    }
}

/// An allocated section, always referencing its owning segment
#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub name: String,
    /// index of the owning segment in the image's segment list
    pub segment: usize,
    /// index in the image's section table (0 is reserved, real sections
    /// start at 1 — the same off-by-one symbol entries carry)
    pub index: u16,
    pub addr: Addr,
    pub size: u64,
    pub offset: u64,
    pub kind: u32,
    pub flags: u64,
}

impl Section {
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.flags & elf::SHF_EXECINSTR != 0
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.flags & elf::SHF_WRITE != 0
    }
}

/// One entry of the image's symbol table, as seen during iteration
///
/// `value` is the stored link-time value; `section` is the ELF section table
/// index where 0 means "no section" and real sections start at 1 — callers
/// correlating with [`BinaryImage::sections`] must match on
/// [`Section::index`], not list positions.
#[derive(Debug, Clone, Copy)]
pub struct SymbolEntry<'a> {
    pub name: &'a str,
    pub value: u64,
    pub size: u64,
    pub binding: u8,
    pub sym_type: u8,
    pub section: u16,
}

/// A resolved symbol with its runtime address
#[derive(Debug, Clone, Serialize)]
pub struct FoundSymbol {
    pub name: String,
    pub addr: Addr,
    pub size: u64,
    pub binding: u8,
    pub section: u16,
}

#[derive(Debug, Clone, Copy)]
struct RemoteDyn {
    symtab: Addr,
    strtab: Addr,
    strsz: u64,
    syment: u64,
    hash: Option<Addr>,
}

#[derive(Debug)]
struct SymbolData {
    syms: Vec<u8>,
    strs: Vec<u8>,
    count: usize,
    entsize: usize,
}

/// One parsed binary image
#[derive(Debug)]
pub struct BinaryImage {
    path: Option<PathBuf>,
    task: Option<Task>,
    /// runtime address of the ELF header; for file images the link-time
    /// address of the header-bearing segment
    base: Addr,
    slide: i64,
    is_64: bool,
    little: bool,
    machine: u16,
    etype: u16,
    entry: u64,
    segments: Vec<Segment>,
    sections: Vec<Section>,
    /// full section table including non-allocated sections, for symbol
    /// table access; empty when the table is unreachable
    raw_sections: Vec<(String, RawShdr)>,
    remote_dyn: Option<RemoteDyn>,
    library: Option<String>,
    file: Option<OwnedRegion>,
    symbols: OnceCell<Option<SymbolData>>,
}

impl BinaryImage {
    /// Parses an image from a file on disk; the slide of a file image is
    /// always zero
    ///
    /// # Errors
    ///
    /// [`TraceError::InvalidFormat`] for files that are not valid ELF,
    /// [`TraceError::NotFound`] when no loadable segment exists, I/O errors
    /// unchanged.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = taskmem::map_file(path)?;
        let ehdr = elf::parse_ehdr(&file)?;
        let segments = normalize_segments(&ehdr, &file, ehdr.phoff as usize)?;
        let header_seg = header_segment(&segments)?;
        let base = segments[header_seg].vmaddr;

        let mut img = BinaryImage {
            path: Some(path.to_owned()),
            task: None,
            base,
            slide: 0,
            is_64: ehdr.is_64,
            little: ehdr.little,
            machine: ehdr.machine,
            etype: ehdr.etype,
            entry: ehdr.entry,
            segments,
            sections: Vec::new(),
            raw_sections: Vec::new(),
            remote_dyn: None,
            library: None,
            file: Some(file),
            symbols: OnceCell::new(),
        };
        img.build_sections_from_file()?;
        img.library = img.compute_library();
        Ok(img)
    }

    /// Parses the image loaded at `base` inside `task`
    ///
    /// The header and program headers are read from target memory and
    /// normalized; when `path` names a readable file, section and symbol
    /// tables come from it (they are not mapped at runtime for ordinary
    /// images), otherwise they are recovered from the target through
    /// `PT_DYNAMIC`.
    ///
    /// # Errors
    ///
    /// [`TraceError::InvalidFormat`] when the bytes at `base` are not an ELF
    /// header; [`TraceError::NotFound`] when no loadable segment exists;
    /// memory-access failures propagate unchanged.
    pub fn from_task(task: Task, base: Addr, path: Option<PathBuf>) -> Result<Self> {
        let head = taskmem::read_vec(task, base, 64)?;
        let ehdr = elf::parse_ehdr(&head)?;
        if ehdr.phnum == 0 || ehdr.phnum > MAX_PHNUM {
            return Err(TraceError::InvalidFormat(format!(
                "implausible phnum {}",
                ehdr.phnum
            )));
        }
        let phentsize = ehdr.phentsize as usize;
        if phentsize < elf::phdr_stored_size(ehdr.is_64) || ehdr.phoff > 0x10_0000 {
            return Err(TraceError::InvalidFormat(
                "implausible program header table".into(),
            ));
        }

        let ph_bytes = taskmem::read_vec(
            task,
            base + ehdr.phoff,
            phentsize * ehdr.phnum as usize,
        )?;
        let segments = normalize_segments(&ehdr, &ph_bytes, 0)?;
        let header_seg = header_segment(&segments)?;
        let slide = base.u64() as i64 - segments[header_seg].vmaddr.u64() as i64;

        let file = path.as_deref().and_then(|p| match taskmem::map_file(p) {
            Ok(region) if file_matches(&region, &ehdr) => Some(region),
            Ok(_) => {
                debug!("{} does not match the in-memory image, ignoring", p.display());
                None
            }
            Err(e) => {
                debug!("cannot map {}: {e}", p.display());
                None
            }
        });

        let mut img = BinaryImage {
            path,
            task: Some(task),
            base,
            slide,
            is_64: ehdr.is_64,
            little: ehdr.little,
            machine: ehdr.machine,
            etype: ehdr.etype,
            entry: ehdr.entry,
            segments,
            sections: Vec::new(),
            raw_sections: Vec::new(),
            remote_dyn: None,
            library: None,
            file,
            symbols: OnceCell::new(),
        };

        if img.file.is_some() {
            img.build_sections_from_file()?;
        } else {
            img.build_sections_from_memory(&ehdr);
        }
        img.remote_dyn = img.read_remote_dynamic();
        img.library = img.compute_library();
        Ok(img)
    }

    /// Parses the calling process's main executable at its runtime address
    ///
    /// # Errors
    ///
    /// Fails when the executable cannot be located in our own mappings.
    pub fn from_self_executable() -> Result<Self> {
        let task = Task::current();
        let exe = task.exe_path()?;
        let base = image_base(task, &exe)?;
        Self::from_task(task, base, Some(exe))
    }

    // ---- identity ------------------------------------------------------

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runtime address of the ELF header
    #[must_use]
    pub fn base(&self) -> Addr {
        self.base
    }

    /// Runtime load address minus link-time address; zero for file images
    #[must_use]
    pub fn slide(&self) -> i64 {
        self.slide
    }

    #[must_use]
    pub fn is_64(&self) -> bool {
        self.is_64
    }

    /// Whether the image's byte order differs from ours
    #[must_use]
    pub fn byte_swapped(&self) -> bool {
        self.little != cfg!(target_endian = "little")
    }

    #[must_use]
    pub fn machine(&self) -> u16 {
        self.machine
    }

    #[must_use]
    pub fn object_kind(&self) -> u16 {
        self.etype
    }

    #[must_use]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Cached library identity: `DT_SONAME` when present, else the path
    /// basename
    #[must_use]
    pub fn library(&self) -> Option<&str> {
        self.library.as_deref()
    }

    // ---- segments and sections ----------------------------------------

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn segment_by_index(&self, idx: usize) -> Option<&Segment> {
        self.segments.get(idx)
    }

    #[must_use]
    pub fn segment_by_name(&self, name: &str) -> Option<(usize, &Segment)> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, s)| s.name == name)
    }

    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    #[must_use]
    pub fn section_by_index(&self, idx: usize) -> Option<&Section> {
        self.sections.get(idx)
    }

    #[must_use]
    pub fn section_by_name(&self, name: &str) -> Option<(usize, &Section)> {
        self.sections
            .iter()
            .enumerate()
            .find(|(_, s)| s.name == name)
    }

    /// Runtime address range of a segment
    #[must_use]
    pub fn segment_range(&self, seg: &Segment) -> (Addr, Addr) {
        let start = seg.vmaddr.slid(self.slide);
        (start, start.checked_add(seg.vmsize))
    }

    /// Runtime address range of a section
    #[must_use]
    pub fn section_range(&self, sec: &Section) -> (Addr, Addr) {
        let start = sec.addr.slid(self.slide);
        (start, start.checked_add(sec.size))
    }

    /// Whether `addr` falls inside any loadable segment at runtime
    #[must_use]
    pub fn contains_addr(&self, addr: Addr) -> bool {
        self.segments.iter().any(|s| {
            let (start, end) = self.segment_range(s);
            s.is_loadable() && addr >= start && addr < end
        })
    }

    /// The allocated section containing `addr` at runtime, if any
    #[must_use]
    pub fn section_containing(&self, addr: Addr) -> Option<&Section> {
        self.sections.iter().find(|sec| {
            let (start, end) = self.section_range(sec);
            addr >= start && addr < end
        })
    }

    /// Runtime address range spanned by all loadable segments
    #[must_use]
    pub fn address_range(&self) -> (Addr, Addr) {
        let mut lo = Addr::INVALID;
        let mut hi = Addr::NULL;
        for seg in self.segments.iter().filter(|s| s.is_loadable()) {
            let (start, end) = self.segment_range(seg);
            lo = lo.min(start);
            hi = hi.max(end);
        }
        (lo, hi)
    }

    // ---- symbols -------------------------------------------------------

    /// Walks the symbol table end to end, calling `f` per entry
    ///
    /// Returns the number of entries visited; `f` returning `false` stops
    /// the walk early. Entry values are link-time, see [`SymbolEntry`].
    ///
    /// # Errors
    ///
    /// [`TraceError::NotFound`] when the image has no reachable symbol
    /// table.
    pub fn each_symbol(&self, mut f: impl FnMut(SymbolEntry<'_>) -> bool) -> Result<usize> {
        let data = self.symbol_data()?;
        let sym_view = ByteView::new(&data.syms, self.little, self.is_64);
        let str_view = ByteView::new(&data.strs, self.little, self.is_64);

        let mut visited = 0;
        for i in 0..data.count {
            let Ok(raw) = elf::parse_sym(&sym_view, i * data.entsize) else {
                break;
            };
            let name = str_view.cstr_at(raw.name_off as usize).unwrap_or("");
            visited += 1;
            let entry = SymbolEntry {
                name,
                value: raw.value,
                size: raw.size,
                binding: raw.binding(),
                sym_type: raw.sym_type(),
                section: raw.shndx,
            };
            if !f(entry) {
                break;
            }
        }
        Ok(visited)
    }

    /// Finds a defined symbol by exact name
    ///
    /// # Errors
    ///
    /// [`TraceError::NotFound`] when the image has no symbol table.
    pub fn symbol_by_name(&self, name: &str) -> Result<Option<FoundSymbol>> {
        let slide = self.slide;
        let mut found = None;
        self.each_symbol(|e| {
            if e.section != elf::SHN_UNDEF && e.name == name {
                found = Some(FoundSymbol {
                    name: e.name.to_owned(),
                    addr: Addr::from(e.value).slid(slide),
                    size: e.size,
                    binding: e.binding,
                    section: e.section,
                });
                return false;
            }
            true
        })?;
        Ok(found)
    }

    /// The symbol with the greatest start address not exceeding `addr`,
    /// optionally restricted to one section of the image
    ///
    /// # Errors
    ///
    /// [`TraceError::NotFound`] when the image has no symbol table.
    pub fn nearest_symbol(&self, addr: Addr, section: Option<u16>) -> Result<Option<FoundSymbol>> {
        let slide = self.slide;
        let mut best: Option<FoundSymbol> = None;
        self.each_symbol(|e| {
            if !symbol_is_addressable(&e) {
                return true;
            }
            if let Some(wanted) = section {
                if e.section != wanted {
                    return true;
                }
            }
            let start = Addr::from(e.value).slid(slide);
            if start <= addr && best.as_ref().map_or(true, |b| start > b.addr) {
                best = Some(FoundSymbol {
                    name: e.name.to_owned(),
                    addr: start,
                    size: e.size,
                    binding: e.binding,
                    section: e.section,
                });
            }
            true
        })?;
        Ok(best)
    }

    /// The symbol with the least start address strictly greater than `addr`
    ///
    /// # Errors
    ///
    /// [`TraceError::NotFound`] when the image has no symbol table.
    pub fn next_symbol_after(&self, addr: Addr) -> Result<Option<FoundSymbol>> {
        let slide = self.slide;
        let mut best: Option<FoundSymbol> = None;
        self.each_symbol(|e| {
            if !symbol_is_addressable(&e) {
                return true;
            }
            let start = Addr::from(e.value).slid(slide);
            if start > addr && best.as_ref().map_or(true, |b| start < b.addr) {
                best = Some(FoundSymbol {
                    name: e.name.to_owned(),
                    addr: start,
                    size: e.size,
                    binding: e.binding,
                    section: e.section,
                });
            }
            true
        })?;
        Ok(best)
    }

    // ---- construction helpers -----------------------------------------

    fn symbol_data(&self) -> Result<&SymbolData> {
        self.symbols
            .get_or_init(|| match self.load_symbols() {
                Ok(data) => data,
                Err(e) => {
                    debug!("could not load symbol table: {e}");
                    None
                }
            })
            .as_ref()
            .ok_or_else(|| TraceError::NotFound("image has no symbol table".into()))
    }

    fn load_symbols(&self) -> Result<Option<SymbolData>> {
        if let Some(file) = &self.file {
            return self.load_symbols_from_file(file);
        }
        if let Some(dyn_info) = self.remote_dyn {
            return self.load_symbols_from_memory(dyn_info);
        }
        Ok(None)
    }

    fn load_symbols_from_file(&self, file: &OwnedRegion) -> Result<Option<SymbolData>> {
        // prefer the full static table over the dynamic one
        let table = self
            .raw_sections
            .iter()
            .find(|(_, s)| s.sh_type == elf::SHT_SYMTAB)
            .or_else(|| {
                self.raw_sections
                    .iter()
                    .find(|(_, s)| s.sh_type == elf::SHT_DYNSYM)
            });
        let Some((name, shdr)) = table else {
            return Ok(None);
        };
        trace!("loading symbols from file section {name}");

        let strtab = self
            .raw_sections
            .get(shdr.link as usize)
            .map(|(_, s)| s)
            .ok_or_else(|| TraceError::InvalidFormat("dangling symtab string link".into()))?;

        let syms = file_slice(file, shdr.offset, shdr.size)?.to_vec();
        let strs = file_slice(file, strtab.offset, strtab.size)?.to_vec();
        let entsize = effective_entsize(shdr.entsize, self.is_64);
        Ok(Some(SymbolData {
            count: syms.len() / entsize,
            syms,
            strs,
            entsize,
        }))
    }

    fn load_symbols_from_memory(&self, d: RemoteDyn) -> Result<Option<SymbolData>> {
        let Some(task) = self.task else {
            return Ok(None);
        };
        let entsize = effective_entsize(d.syment, self.is_64);

        // DT_HASH publishes the symbol count; without it, the classic layout
        // heuristic bounds the table by the string table that follows it
        let count = match d.hash {
            Some(hash) => {
                let nchain = taskmem::read_vec(task, hash + 4u64, 4)?;
                u64::from(ByteView::new(&nchain, self.little, self.is_64).u32_at(0)?)
            }
            None if d.strtab > d.symtab => (d.strtab - d.symtab) / entsize as u64,
            None => 0,
        };
        if count == 0 || count > MAX_SYMBOLS || d.strsz == 0 || d.strsz > MAX_STRTAB {
            return Ok(None);
        }

        let syms = taskmem::read_vec(task, d.symtab, count as usize * entsize)?;
        let strs = taskmem::read_vec(task, d.strtab, d.strsz as usize)?;
        Ok(Some(SymbolData {
            count: count as usize,
            syms,
            strs,
            entsize,
        }))
    }

    fn build_sections_from_file(&mut self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let ehdr = elf::parse_ehdr(file)?;
        if ehdr.shoff == 0 || ehdr.shnum == 0 || ehdr.shnum > MAX_SHNUM {
            return Ok(());
        }
        let named = read_section_table(
            &ehdr,
            file_slice(file, ehdr.shoff, table_size(ehdr.shentsize, ehdr.shnum))?,
            |shstr| file_slice(file, shstr.offset, shstr.size).map(<[u8]>::to_vec),
        )?;
        self.sections = allocated_sections(&named, &self.segments);
        self.raw_sections = named;
        Ok(())
    }

    fn build_sections_from_memory(&mut self, ehdr: &Ehdr) {
        // section headers live past the loaded segments for ordinary images;
        // only fully mapped ones like the vDSO keep them reachable
        match self.try_sections_from_memory(ehdr) {
            Ok(()) => {}
            Err(e) => {
                trace!("no in-memory section table: {e}");
                self.raw_sections.clear();
                self.sections.clear();
            }
        }
    }

    fn try_sections_from_memory(&mut self, ehdr: &Ehdr) -> Result<()> {
        let Some(task) = self.task else {
            return Ok(());
        };
        if ehdr.shoff == 0 || ehdr.shnum == 0 || ehdr.shnum > MAX_SHNUM {
            return Err(TraceError::NotFound("no section table".into()));
        }
        let size = table_size(ehdr.shentsize, ehdr.shnum);
        let sh_addr = self
            .fileoff_to_runtime(ehdr.shoff, size)
            .ok_or_else(|| TraceError::NotFound("section table not mapped".into()))?;
        let bytes = taskmem::read_vec(task, sh_addr, size as usize)?;

        let named = read_section_table(ehdr, &bytes, |shstr| {
            let addr = self
                .fileoff_to_runtime(shstr.offset, shstr.size)
                .ok_or_else(|| TraceError::NotFound("shstrtab not mapped".into()))?;
            taskmem::read_vec(task, addr, shstr.size as usize)
        })?;
        self.sections = allocated_sections(&named, &self.segments);
        self.raw_sections = named;
        Ok(())
    }

    /// Runtime address of file offset `off`, when some loadable segment maps
    /// the whole `off..off+len` range
    fn fileoff_to_runtime(&self, off: u64, len: u64) -> Option<Addr> {
        let end = off.checked_add(len)?;
        self.segments
            .iter()
            .find(|s| {
                s.is_loadable()
                    && s.fileoff <= off
                    && s.fileoff
                        .checked_add(s.filesize)
                        .map_or(false, |seg_end| end <= seg_end)
            })
            .and_then(|s| {
                let addr = s.vmaddr.checked_add(off - s.fileoff);
                if addr.is_invalid() {
                    None
                } else {
                    Some(addr.slid(self.slide))
                }
            })
    }

    fn read_remote_dynamic(&self) -> Option<RemoteDyn> {
        let task = self.task?;
        let seg = self.segments.iter().find(|s| s.kind == elf::PT_DYNAMIC)?;
        let len = seg.filesize.min(64 * 1024) as usize;
        if len == 0 {
            return None;
        }
        let bytes = taskmem::read_vec(task, seg.vmaddr.slid(self.slide), len).ok()?;
        let view = ByteView::new(&bytes, self.little, self.is_64);
        let entsize = elf::dyn_stored_size(self.is_64);

        let mut symtab = None;
        let mut strtab = None;
        let mut strsz = 0;
        let mut syment = 0;
        let mut hash = None;
        for off in (0..len.saturating_sub(entsize - 1)).step_by(entsize) {
            let Ok(d) = elf::parse_dyn(&view, off) else {
                break;
            };
            match d.tag {
                elf::DT_NULL => break,
                elf::DT_SYMTAB => symtab = Some(self.fixup_dyn_ptr(d.val)),
                elf::DT_STRTAB => strtab = Some(self.fixup_dyn_ptr(d.val)),
                elf::DT_STRSZ => strsz = d.val,
                elf::DT_SYMENT => syment = d.val,
                elf::DT_HASH => hash = Some(self.fixup_dyn_ptr(d.val)),
                _ => {}
            }
        }

        Some(RemoteDyn {
            symtab: symtab?,
            strtab: strtab?,
            strsz,
            syment,
            hash,
        })
    }

    /// In-memory dynamic entries may hold link-time or already-relocated
    /// pointers depending on who processed them; values below the load base
    /// are link-time and get the slide applied
    fn fixup_dyn_ptr(&self, val: u64) -> Addr {
        if self.slide > 0 && val < self.base.u64() {
            Addr::from(val).slid(self.slide)
        } else {
            Addr::from(val)
        }
    }

    fn compute_library(&self) -> Option<String> {
        if let Some(soname) = self.read_soname() {
            return Some(soname);
        }
        self.path
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
    }

    fn read_soname(&self) -> Option<String> {
        // from the file when we have it
        if let Some(file) = &self.file {
            let seg = self.segments.iter().find(|s| s.kind == elf::PT_DYNAMIC)?;
            let bytes = file_slice(file, seg.fileoff, seg.filesize).ok()?;
            let view = ByteView::new(bytes, self.little, self.is_64);
            let entsize = elf::dyn_stored_size(self.is_64);

            let mut strtab_vaddr = None;
            let mut soname_off = None;
            for off in (0..bytes.len().saturating_sub(entsize - 1)).step_by(entsize) {
                let d = elf::parse_dyn(&view, off).ok()?;
                match d.tag {
                    elf::DT_NULL => break,
                    elf::DT_STRTAB => strtab_vaddr = Some(d.val),
                    elf::DT_SONAME => soname_off = Some(d.val),
                    _ => {}
                }
            }
            let (strtab_vaddr, soname_off) = (strtab_vaddr?, soname_off?);
            let strtab_file = self
                .segments
                .iter()
                .find(|s| {
                    s.is_loadable()
                        && strtab_vaddr >= s.vmaddr.u64()
                        && strtab_vaddr < s.vmaddr.u64() + s.filesize
                })
                .map(|s| s.fileoff + (strtab_vaddr - s.vmaddr.u64()))?;
            let tail = file_slice(file, strtab_file + soname_off, 0).ok()?;
            let view = ByteView::new(tail, self.little, self.is_64);
            return view.cstr_at(0).ok().map(str::to_owned);
        }

        // from target memory for memory-only images
        let d = self.remote_dyn?;
        let task = self.task?;
        let soname_off = {
            let seg = self.segments.iter().find(|s| s.kind == elf::PT_DYNAMIC)?;
            let len = seg.filesize.min(64 * 1024) as usize;
            let bytes = taskmem::read_vec(task, seg.vmaddr.slid(self.slide), len).ok()?;
            let view = ByteView::new(&bytes, self.little, self.is_64);
            let entsize = elf::dyn_stored_size(self.is_64);
            let mut off = None;
            for pos in (0..len.saturating_sub(entsize - 1)).step_by(entsize) {
                let e = elf::parse_dyn(&view, pos).ok()?;
                if e.tag == elf::DT_NULL {
                    break;
                }
                if e.tag == elf::DT_SONAME {
                    off = Some(e.val);
                }
            }
            off?
        };
        if soname_off >= d.strsz {
            return None;
        }
        let len = (d.strsz - soname_off).min(256) as usize;
        let bytes = taskmem::read_vec(task, d.strtab + soname_off, len).ok()?;
        let view = ByteView::new(&bytes, self.little, self.is_64);
        view.cstr_at(0).ok().map(str::to_owned)
    }
}

fn symbol_is_addressable(e: &SymbolEntry<'_>) -> bool {
    e.section != elf::SHN_UNDEF
        && e.value != 0
        && !e.name.is_empty()
        && matches!(
            e.sym_type,
            elf::STT_NOTYPE | elf::STT_OBJECT | elf::STT_FUNC
        )
}

fn effective_entsize(stored: u64, wide: bool) -> usize {
    let natural = elf::sym_stored_size(wide);
    if stored as usize >= natural {
        stored as usize
    } else {
        natural
    }
}

fn table_size(entsize: u16, num: u16) -> u64 {
    u64::from(entsize) * u64::from(num)
}

fn file_slice(file: &OwnedRegion, off: u64, len: u64) -> Result<&[u8]> {
    let off = usize::try_from(off)
        .map_err(|_| TraceError::InvalidFormat(format!("offset {off:#x} out of file")))?;
    let bytes = file.bytes();
    if len == 0 {
        // open-ended tail, for NUL-terminated reads
        return bytes
            .get(off..)
            .ok_or_else(|| TraceError::InvalidFormat(format!("offset {off:#x} out of file")));
    }
    off.checked_add(len as usize)
        .and_then(|end| bytes.get(off..end))
        .ok_or_else(|| TraceError::InvalidFormat(format!("range at {off:#x} out of file")))
}

fn file_matches(file: &OwnedRegion, mem: &Ehdr) -> bool {
    match elf::parse_ehdr(file) {
        Ok(e) => e.is_64 == mem.is_64 && e.little == mem.little && e.machine == mem.machine,
        Err(_) => false,
    }
}

/// Lowest loadable region of `path` inside `task`, from its memory map
pub(crate) fn image_base(task: Task, path: &Path) -> Result<Addr> {
    let maps = proc_maps::get_process_maps(task.raw_pid())?;
    maps.iter()
        .filter(|r| r.offset == 0 && r.filename() == Some(path))
        .map(|r| Addr::from(r.start()))
        .min()
        .ok_or_else(|| TraceError::NotFound(format!("{} is not mapped", path.display())))
}

fn normalize_segments(ehdr: &Ehdr, bytes: &[u8], table_off: usize) -> Result<Vec<Segment>> {
    let view = ehdr.view(bytes);
    let entsize = ehdr.phentsize as usize;
    let stored = elf::phdr_stored_size(ehdr.is_64);
    if entsize < stored {
        return Err(TraceError::InvalidFormat(format!(
            "phentsize {entsize} too small"
        )));
    }
    // entsize and phnum are both u16-bounded, the product cannot overflow
    if table_off.checked_add(entsize * ehdr.phnum as usize).is_none() {
        return Err(TraceError::InvalidFormat(
            "program header table out of range".into(),
        ));
    }

    let mut segments = Vec::with_capacity(ehdr.phnum as usize);
    for i in 0..ehdr.phnum as usize {
        let off = table_off + i * entsize;
        let raw = elf::parse_phdr(&view, off)?;
        let raw_bytes = view.bytes_at(off, stored)?.to_vec();
        segments.push(Segment {
            name: String::new(),
            kind: raw.p_type,
            flags: raw.flags,
            vmaddr: Addr::from(raw.vaddr),
            vmsize: raw.memsz,
            fileoff: raw.offset,
            filesize: raw.filesz,
            raw: raw_bytes,
        });
    }
    name_segments(&mut segments);
    Ok(segments)
}

fn name_segments(segments: &mut [Segment]) {
    let mut used: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for seg in segments.iter_mut() {
        let base = match seg.kind {
            elf::PT_LOAD if seg.flags & elf::PF_X != 0 => "text",
            elf::PT_LOAD if seg.flags & elf::PF_W != 0 => "data",
            elf::PT_LOAD => "rodata",
            elf::PT_DYNAMIC => "dynamic",
            elf::PT_INTERP => "interp",
            elf::PT_PHDR => "phdr",
            elf::PT_NOTE => "note",
            elf::PT_TLS => "tls",
            elf::PT_GNU_EH_FRAME => "ehframe",
            elf::PT_GNU_STACK => "stack",
            elf::PT_GNU_RELRO => "relro",
            other => {
                seg.name = format!("seg{other:#x}");
                continue;
            }
        };
        let n = used.entry(base.to_owned()).or_insert(0);
        seg.name = if *n == 0 {
            base.to_owned()
        } else {
            format!("{base}{n}")
        };
        *n += 1;
    }
}

/// The loadable segment that carries the ELF header (file offset zero); its
/// runtime position defines the image's slide
fn header_segment(segments: &[Segment]) -> Result<usize> {
    segments
        .iter()
        .position(|s| s.is_loadable() && s.fileoff == 0)
        .or_else(|| {
            segments
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_loadable())
                .min_by_key(|(_, s)| s.vmaddr)
                .map(|(i, _)| i)
        })
        .ok_or_else(|| TraceError::NotFound("image has no loadable segment".into()))
}

fn read_section_table(
    ehdr: &Ehdr,
    bytes: &[u8],
    load_shstrtab: impl FnOnce(&RawShdr) -> Result<Vec<u8>>,
) -> Result<Vec<(String, RawShdr)>> {
    let view = ehdr.view(bytes);
    let entsize = ehdr.shentsize as usize;
    if entsize < elf::shdr_stored_size(ehdr.is_64) {
        return Err(TraceError::InvalidFormat(format!(
            "shentsize {entsize} too small"
        )));
    }

    let mut raw = Vec::with_capacity(ehdr.shnum as usize);
    for i in 0..ehdr.shnum as usize {
        raw.push(elf::parse_shdr(&view, i * entsize)?);
    }

    let shstr = raw
        .get(ehdr.shstrndx as usize)
        .ok_or_else(|| TraceError::InvalidFormat("bad shstrndx".into()))?;
    let strtab = load_shstrtab(shstr)?;
    let str_view = ByteView::new(&strtab, ehdr.little, ehdr.is_64);

    Ok(raw
        .iter()
        .map(|s| {
            let name = str_view
                .cstr_at(s.name_off as usize)
                .unwrap_or("")
                .to_owned();
            (name, *s)
        })
        .collect())
}

/// Builds allocated [`Section`] records, each tied to the loadable segment
/// that covers its link-time address range
fn allocated_sections(named: &[(String, RawShdr)], segments: &[Segment]) -> Vec<Section> {
    let mut sections = Vec::new();
    for (idx, (name, s)) in named.iter().enumerate().skip(1) {
        if s.flags & elf::SHF_ALLOC == 0 {
            continue;
        }
        let owner = segments.iter().position(|seg| {
            seg.is_loadable()
                && s.addr >= seg.vmaddr.u64()
                && s.addr + s.size <= seg.vmaddr.u64() + seg.vmsize
        });
        let Some(owner) = owner else {
            continue;
        };
        sections.push(Section {
            name: name.clone(),
            segment: owner,
            index: idx as u16,
            addr: Addr::from(s.addr),
            size: s.size,
            offset: s.offset,
            kind: s.sh_type,
            flags: s.flags,
        });
    }
    sections
}
