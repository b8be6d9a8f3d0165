//! 64-bit little-endian ELF parsing: entry point, PIE flag, and the
//! file-relative address of `main` (or `main.main`).
//!
//! Never fails loudly. Any I/O or format error yields a [`BinaryImage`] whose
//! `main_offset` equals `entry_offset`, which callers treat as "count everything".

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use anyhow::{bail, Context, Result};
use binrw::BinRead;
use log::warn;

const ET_DYN: u16 = 3;

#[derive(BinRead, Debug)]
#[br(little)]
struct Elf64Header {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
struct Elf64SectionHeader {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_addr: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u64,
    sh_entsize: u64,
}

#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
struct Elf64Sym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

const SHDR_SIZE: u64 = 64;
const SYM_SIZE: u64 = 24;

/// Binary image descriptor populated once at install time and read-only afterward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryImage {
    pub entry_offset: u64,
    pub main_offset: u64,
    pub is_pie: bool,
}

/// Parse `path` and resolve a [`BinaryImage`]. Falls back to an entry-point-only
/// image (and logs why) on any I/O or format error.
pub fn resolve_binary_image(path: &str) -> BinaryImage {
    match try_resolve(path) {
        Ok(image) => image,
        Err(e) => {
            warn!("falling back to entry point for {path:?}: {e:#}");
            BinaryImage::default()
        }
    }
}

fn try_resolve(path: &str) -> Result<BinaryImage> {
    let mut file = File::open(path).with_context(|| format!("opening {path}"))?;
    let header = Elf64Header::read(&mut file).context("reading ELF header")?;
    if header.e_ident[..4] != *b"\x7fELF" {
        bail!("bad ELF magic in {path}");
    }

    let mut image = BinaryImage {
        entry_offset: header.e_entry,
        main_offset: header.e_entry,
        is_pie: header.e_type == ET_DYN,
    };

    if header.e_shoff == 0 || header.e_shstrndx == 0 {
        return Ok(image);
    }

    let Some(shstrtab_hdr) = read_shdr(&mut file, header.e_shoff, header.e_shstrndx as u64)?
    else {
        return Ok(image);
    };
    if shstrtab_hdr.sh_size == 0 {
        return Ok(image);
    }
    let shstrtab = read_exact_at(&mut file, shstrtab_hdr.sh_offset, shstrtab_hdr.sh_size as usize)?;

    let mut symtab_hdr = None;
    let mut strtab_hdr = None;
    for i in 0..header.e_shnum as u64 {
        let Some(shdr) = read_shdr(&mut file, header.e_shoff, i)? else {
            continue;
        };
        match section_name(&shstrtab, shdr.sh_name) {
            Some(".symtab") if symtab_hdr.is_none() => symtab_hdr = Some(shdr),
            Some(".strtab") if strtab_hdr.is_none() => strtab_hdr = Some(shdr),
            _ => {}
        }
    }

    let (Some(symtab_hdr), Some(strtab_hdr)) = (symtab_hdr, strtab_hdr) else {
        return Ok(image);
    };
    if symtab_hdr.sh_size == 0 || strtab_hdr.sh_size == 0 {
        return Ok(image);
    }

    let strtab = read_exact_at(&mut file, strtab_hdr.sh_offset, strtab_hdr.sh_size as usize)?;

    let nsyms = symtab_hdr.sh_size / SYM_SIZE;
    file.seek(SeekFrom::Start(symtab_hdr.sh_offset))?;
    for _ in 0..nsyms {
        let Ok(sym) = Elf64Sym::read(&mut file) else {
            break;
        };
        if sym.st_value == 0 {
            continue;
        }
        match section_name(&strtab, sym.st_name) {
            Some("main") | Some("main.main") => {
                image.main_offset = sym.st_value;
                break;
            }
            _ => {}
        }
    }

    Ok(image)
}

fn read_shdr(file: &mut File, shoff: u64, index: u64) -> Result<Option<Elf64SectionHeader>> {
    if file.seek(SeekFrom::Start(shoff + index * SHDR_SIZE)).is_err() {
        return Ok(None);
    }
    Ok(Elf64SectionHeader::read(file).ok())
}

fn section_name(table: &[u8], offset: u32) -> Option<&str> {
    let offset = offset as usize;
    if offset >= table.len() {
        return None;
    }
    let end = table[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| offset + p)
        .unwrap_or(table.len());
    std::str::from_utf8(&table[offset..end]).ok()
}

fn read_exact_at(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}
