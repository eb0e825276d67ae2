//! # Raw ELF format layer
//!
//! Constants and bounds-checked, byte-swap-aware readers for the on-disk and
//! in-memory ELF structures. Images come in two widths (ELFCLASS32/64) and
//! two byte orders (ELFDATA2LSB/MSB); everything here reads the stored form
//! and promotes to native-order 64-bit values, so no caller above this layer
//! ever touches raw header bytes directly. Forgetting to byte-swap is not a
//! mistake callers can make.

use crate::errors::{Result, TraceError};

pub const EI_NIDENT: usize = 16;
pub const ELFCLASS32: u8 = 1;
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ELFDATA2MSB: u8 = 2;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const EM_386: u16 = 3;
pub const EM_ARM: u16 = 40;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;
pub const PT_PHDR: u32 = 6;
pub const PT_TLS: u32 = 7;
pub const PT_GNU_EH_FRAME: u32 = 0x6474_e550;
pub const PT_GNU_STACK: u32 = 0x6474_e551;
pub const PT_GNU_RELRO: u32 = 0x6474_e552;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_DYNSYM: u32 = 11;

pub const SHF_WRITE: u64 = 1;
pub const SHF_ALLOC: u64 = 2;
pub const SHF_EXECINSTR: u64 = 4;

pub const SHN_UNDEF: u16 = 0;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const DT_NULL: i64 = 0;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_STRSZ: i64 = 10;
pub const DT_SYMENT: i64 = 11;
pub const DT_SONAME: i64 = 14;
pub const DT_GNU_HASH: i64 = 0x6fff_fef5;

/// Byte-swap- and width-aware view over raw image bytes
///
/// All reads are bounds-checked and return the value in native byte order.
/// `word_at` reads a natural word of the image (4 or 8 bytes) and always
/// promotes to `u64`.
#[derive(Debug, Clone, Copy)]
pub struct ByteView<'a> {
    data: &'a [u8],
    little: bool,
    wide: bool,
}

impl<'a> ByteView<'a> {
    #[must_use]
    pub fn new(data: &'a [u8], little: bool, wide: bool) -> Self {
        ByteView { data, little, wide }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether values are stored in the byte order opposite to ours
    #[must_use]
    pub fn swapped(&self) -> bool {
        self.little != cfg!(target_endian = "little")
    }

    #[must_use]
    pub fn is_wide(&self) -> bool {
        self.wide
    }

    pub fn bytes_at(&self, off: usize, n: usize) -> Result<&'a [u8]> {
        off.checked_add(n)
            .and_then(|end| self.data.get(off..end))
            .ok_or_else(|| TraceError::InvalidFormat(format!("truncated at offset {off:#x}")))
    }

    pub fn u8_at(&self, off: usize) -> Result<u8> {
        Ok(self.bytes_at(off, 1)?[0])
    }

    pub fn u16_at(&self, off: usize) -> Result<u16> {
        let b: [u8; 2] = self.bytes_at(off, 2)?.try_into().unwrap();
        Ok(if self.little {
            u16::from_le_bytes(b)
        } else {
            u16::from_be_bytes(b)
        })
    }

    pub fn u32_at(&self, off: usize) -> Result<u32> {
        let b: [u8; 4] = self.bytes_at(off, 4)?.try_into().unwrap();
        Ok(if self.little {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        })
    }

    pub fn u64_at(&self, off: usize) -> Result<u64> {
        let b: [u8; 8] = self.bytes_at(off, 8)?.try_into().unwrap();
        Ok(if self.little {
            u64::from_le_bytes(b)
        } else {
            u64::from_be_bytes(b)
        })
    }

    /// Reads one natural word of the image, promoted to 64 bits
    pub fn word_at(&self, off: usize) -> Result<u64> {
        if self.wide {
            self.u64_at(off)
        } else {
            Ok(u64::from(self.u32_at(off)?))
        }
    }

    /// A NUL-terminated string starting at `off`
    pub fn cstr_at(&self, off: usize) -> Result<&'a str> {
        let tail = self
            .data
            .get(off..)
            .ok_or_else(|| TraceError::InvalidFormat(format!("string offset {off:#x} oob")))?;
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end])
            .map_err(|_| TraceError::InvalidFormat(format!("non-utf8 string at {off:#x}")))
    }
}

/// The normalized ELF file header, always 64-bit fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ehdr {
    pub is_64: bool,
    pub little: bool,
    pub etype: u16,
    pub machine: u16,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

impl Ehdr {
    /// Size of the stored header for this width
    #[must_use]
    pub fn stored_size(&self) -> usize {
        if self.is_64 {
            64
        } else {
            52
        }
    }

    #[must_use]
    pub fn view<'a>(&self, data: &'a [u8]) -> ByteView<'a> {
        ByteView::new(data, self.little, self.is_64)
    }
}

/// Parses and validates the file header
///
/// # Errors
///
/// [`TraceError::InvalidFormat`] for a bad magic number, class or data
/// encoding; the spec calls this the invalid-format failure mode.
pub fn parse_ehdr(data: &[u8]) -> Result<Ehdr> {
    if data.len() < EI_NIDENT {
        return Err(TraceError::InvalidFormat("header shorter than e_ident".into()));
    }
    if &data[0..4] != b"\x7fELF" {
        return Err(TraceError::InvalidFormat(format!(
            "bad magic {:02x?}",
            &data[0..4]
        )));
    }
    let is_64 = match data[4] {
        ELFCLASS32 => false,
        ELFCLASS64 => true,
        c => return Err(TraceError::InvalidFormat(format!("bad EI_CLASS {c}"))),
    };
    let little = match data[5] {
        ELFDATA2LSB => true,
        ELFDATA2MSB => false,
        d => return Err(TraceError::InvalidFormat(format!("bad EI_DATA {d}"))),
    };

    let v = ByteView::new(data, little, is_64);
    let etype = v.u16_at(16)?;
    let machine = v.u16_at(18)?;

    let (entry, phoff, shoff, tail) = if is_64 {
        (v.u64_at(24)?, v.u64_at(32)?, v.u64_at(40)?, 52usize)
    } else {
        (
            u64::from(v.u32_at(24)?),
            u64::from(v.u32_at(28)?),
            u64::from(v.u32_at(32)?),
            40usize,
        )
    };

    Ok(Ehdr {
        is_64,
        little,
        etype,
        machine,
        entry,
        phoff,
        shoff,
        phentsize: v.u16_at(tail + 2)?,
        phnum: v.u16_at(tail + 4)?,
        shentsize: v.u16_at(tail + 6)?,
        shnum: v.u16_at(tail + 8)?,
        shstrndx: v.u16_at(tail + 10)?,
    })
}

/// One program header, width-promoted and byte-order corrected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPhdr {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

pub fn parse_phdr(v: &ByteView<'_>, off: usize) -> Result<RawPhdr> {
    if v.is_wide() {
        Ok(RawPhdr {
            p_type: v.u32_at(off)?,
            flags: v.u32_at(off + 4)?,
            offset: v.u64_at(off + 8)?,
            vaddr: v.u64_at(off + 16)?,
            filesz: v.u64_at(off + 32)?,
            memsz: v.u64_at(off + 40)?,
            align: v.u64_at(off + 48)?,
        })
    } else {
        Ok(RawPhdr {
            p_type: v.u32_at(off)?,
            offset: u64::from(v.u32_at(off + 4)?),
            vaddr: u64::from(v.u32_at(off + 8)?),
            filesz: u64::from(v.u32_at(off + 16)?),
            memsz: u64::from(v.u32_at(off + 20)?),
            flags: v.u32_at(off + 24)?,
            align: u64::from(v.u32_at(off + 28)?),
        })
    }
}

#[must_use]
pub fn phdr_stored_size(wide: bool) -> usize {
    if wide {
        56
    } else {
        32
    }
}

/// One section header, width-promoted and byte-order corrected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawShdr {
    pub name_off: u32,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub entsize: u64,
}

pub fn parse_shdr(v: &ByteView<'_>, off: usize) -> Result<RawShdr> {
    if v.is_wide() {
        Ok(RawShdr {
            name_off: v.u32_at(off)?,
            sh_type: v.u32_at(off + 4)?,
            flags: v.u64_at(off + 8)?,
            addr: v.u64_at(off + 16)?,
            offset: v.u64_at(off + 24)?,
            size: v.u64_at(off + 32)?,
            link: v.u32_at(off + 40)?,
            info: v.u32_at(off + 44)?,
            entsize: v.u64_at(off + 56)?,
        })
    } else {
        Ok(RawShdr {
            name_off: v.u32_at(off)?,
            sh_type: v.u32_at(off + 4)?,
            flags: u64::from(v.u32_at(off + 8)?),
            addr: u64::from(v.u32_at(off + 12)?),
            offset: u64::from(v.u32_at(off + 16)?),
            size: u64::from(v.u32_at(off + 20)?),
            link: v.u32_at(off + 24)?,
            info: v.u32_at(off + 28)?,
            entsize: u64::from(v.u32_at(off + 36)?),
        })
    }
}

#[must_use]
pub fn shdr_stored_size(wide: bool) -> usize {
    if wide {
        64
    } else {
        40
    }
}

/// One symbol table entry, width-promoted and byte-order corrected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSym {
    pub name_off: u32,
    pub value: u64,
    pub size: u64,
    pub info: u8,
    pub other: u8,
    /// index into the image's section table; 0 means "no section", real
    /// sections start at 1
    pub shndx: u16,
}

impl RawSym {
    #[must_use]
    pub fn binding(&self) -> u8 {
        self.info >> 4
    }

    #[must_use]
    pub fn sym_type(&self) -> u8 {
        self.info & 0xf
    }

    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.shndx != SHN_UNDEF
    }
}

pub fn parse_sym(v: &ByteView<'_>, off: usize) -> Result<RawSym> {
    if v.is_wide() {
        Ok(RawSym {
            name_off: v.u32_at(off)?,
            info: v.u8_at(off + 4)?,
            other: v.u8_at(off + 5)?,
            shndx: v.u16_at(off + 6)?,
            value: v.u64_at(off + 8)?,
            size: v.u64_at(off + 16)?,
        })
    } else {
        Ok(RawSym {
            name_off: v.u32_at(off)?,
            value: u64::from(v.u32_at(off + 4)?),
            size: u64::from(v.u32_at(off + 8)?),
            info: v.u8_at(off + 12)?,
            other: v.u8_at(off + 13)?,
            shndx: v.u16_at(off + 14)?,
        })
    }
}

#[must_use]
pub fn sym_stored_size(wide: bool) -> usize {
    if wide {
        24
    } else {
        16
    }
}

/// One dynamic table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDyn {
    pub tag: i64,
    pub val: u64,
}

pub fn parse_dyn(v: &ByteView<'_>, off: usize) -> Result<RawDyn> {
    if v.is_wide() {
        Ok(RawDyn {
            tag: v.u64_at(off)? as i64,
            val: v.u64_at(off + 8)?,
        })
    } else {
        Ok(RawDyn {
            tag: i64::from(v.u32_at(off)? as i32),
            val: u64::from(v.u32_at(off + 4)?),
        })
    }
}

#[must_use]
pub fn dyn_stored_size(wide: bool) -> usize {
    if wide {
        16
    } else {
        8
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ident(class: u8, data: u8) -> Vec<u8> {
        let mut v = vec![0u8; EI_NIDENT];
        v[0..4].copy_from_slice(b"\x7fELF");
        v[4] = class;
        v[5] = data;
        v[6] = 1;
        v
    }

    #[test]
    fn test_word_round_trip_both_orders() {
        let value: u64 = 0x0102_0304_0506_0708;
        let le = value.to_le_bytes();
        let be = value.to_be_bytes();
        assert_eq!(ByteView::new(&le, true, true).word_at(0).unwrap(), value);
        assert_eq!(ByteView::new(&be, false, true).word_at(0).unwrap(), value);

        let narrow: u32 = 0xdead_beef;
        let le = narrow.to_le_bytes();
        let be = narrow.to_be_bytes();
        assert_eq!(
            ByteView::new(&le, true, false).word_at(0).unwrap(),
            u64::from(narrow)
        );
        assert_eq!(
            ByteView::new(&be, false, false).word_at(0).unwrap(),
            u64::from(narrow)
        );
    }

    #[test]
    fn test_reads_are_bounds_checked() {
        let v = ByteView::new(&[1, 2, 3], true, true);
        assert!(v.u16_at(2).is_err());
        assert!(v.u64_at(0).is_err());
        assert!(v.u8_at(2).is_ok());
    }

    #[test]
    fn test_bad_magic_is_invalid_format() {
        let err = parse_ehdr(b"\x7fBAD----========").unwrap_err();
        assert!(matches!(err, TraceError::InvalidFormat(_)));
    }

    #[test]
    fn test_parse_minimal_headers_both_widths() {
        // 64-bit little-endian header with phnum = 2
        let mut h = ident(ELFCLASS64, ELFDATA2LSB);
        h.resize(64, 0);
        h[16..18].copy_from_slice(&ET_DYN.to_le_bytes());
        h[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        h[24..32].copy_from_slice(&0x1000u64.to_le_bytes()); // e_entry
        h[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        h[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        h[56..58].copy_from_slice(&2u16.to_le_bytes()); // e_phnum
        let e = parse_ehdr(&h).unwrap();
        assert!(e.is_64);
        assert!(e.little);
        assert_eq!(e.machine, EM_X86_64);
        assert_eq!(e.entry, 0x1000);
        assert_eq!(e.phnum, 2);

        // 32-bit big-endian header
        let mut h = ident(ELFCLASS32, ELFDATA2MSB);
        h.resize(52, 0);
        h[16..18].copy_from_slice(&ET_EXEC.to_be_bytes());
        h[18..20].copy_from_slice(&EM_ARM.to_be_bytes());
        h[24..28].copy_from_slice(&0x8000u32.to_be_bytes()); // e_entry
        h[44..46].copy_from_slice(&1u16.to_be_bytes()); // e_phnum
        let e = parse_ehdr(&h).unwrap();
        assert!(!e.is_64);
        assert!(!e.little);
        assert_eq!(e.machine, EM_ARM);
        assert_eq!(e.entry, 0x8000);
        assert_eq!(e.phnum, 1);
    }

    #[test]
    fn test_parse_sym_both_widths() {
        let mut b = vec![0u8; 24];
        b[0..4].copy_from_slice(&7u32.to_le_bytes()); // st_name
        b[4] = (STB_GLOBAL << 4) | STT_FUNC; // st_info
        b[6..8].copy_from_slice(&3u16.to_le_bytes()); // st_shndx
        b[8..16].copy_from_slice(&0x4000u64.to_le_bytes()); // st_value
        b[16..24].copy_from_slice(&0x20u64.to_le_bytes()); // st_size
        let s = parse_sym(&ByteView::new(&b, true, true), 0).unwrap();
        assert_eq!(s.name_off, 7);
        assert_eq!(s.binding(), STB_GLOBAL);
        assert_eq!(s.sym_type(), STT_FUNC);
        assert_eq!(s.value, 0x4000);
        assert_eq!(s.size, 0x20);
        assert!(s.is_defined());

        let mut b = vec![0u8; 16];
        b[0..4].copy_from_slice(&9u32.to_be_bytes());
        b[4..8].copy_from_slice(&0x8000u32.to_be_bytes());
        b[8..12].copy_from_slice(&0x10u32.to_be_bytes());
        b[12] = (STB_LOCAL << 4) | STT_OBJECT;
        let s = parse_sym(&ByteView::new(&b, false, false), 0).unwrap();
        assert_eq!(s.name_off, 9);
        assert_eq!(s.value, 0x8000);
        assert_eq!(s.size, 0x10);
        assert_eq!(s.binding(), STB_LOCAL);
        assert!(!s.is_defined());
    }

    #[test]
    fn test_cstr_at() {
        let v = ByteView::new(b"\0libc.so.6\0rest", true, true);
        assert_eq!(v.cstr_at(1).unwrap(), "libc.so.6");
        assert_eq!(v.cstr_at(0).unwrap(), "");
    }
}
