//! ELF dynamic-section reading.
//!
//! Library dependencies are read straight from the `DT_NEEDED` entries of the
//! file instead of running `ldd`, which would execute the binary through the
//! host's dynamic linker. Reading the headers works for any architecture and
//! never touches the host's libraries.

use anyhow::{Context, Result};
use elf::abi;
use elf::endian::AnyEndian;
use elf::string_table::StringTable;
use elf::ElfBytes;
use std::fs;
use std::path::Path;

/// Dynamic linking facts of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicInfo {
    /// `DT_NEEDED` library names, in declaration order.
    pub needed: Vec<String>,
    /// Program interpreter from `PT_INTERP`, if any.
    pub interpreter: Option<String>,
}

/// Read the dynamic linking info of `path`.
///
/// Returns `Ok(None)` for files that are not ELF at all (shell scripts, data).
/// Static ELF binaries yield an empty [`DynamicInfo`].
pub fn read_dynamic_info(path: &Path) -> Result<Option<DynamicInfo>> {
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    parse_dynamic_info(&data).with_context(|| format!("Malformed ELF file {}", path.display()))
}

/// Parse dynamic linking info out of an in-memory ELF image.
pub fn parse_dynamic_info(data: &[u8]) -> Result<Option<DynamicInfo>> {
    let file = match ElfBytes::<AnyEndian>::minimal_parse(data) {
        Ok(f) => f,
        // bad magic / truncated header: not an ELF file
        Err(_) => return Ok(None),
    };

    let mut info = DynamicInfo {
        interpreter: interpreter(&file)?,
        ..Default::default()
    };

    let dynamic = match file.dynamic().map_err(anyhow::Error::msg)? {
        Some(d) => d,
        None => return Ok(Some(info)),
    };

    let offsets: Vec<usize> = dynamic
        .iter()
        .filter(|d| d.d_tag == abi::DT_NEEDED)
        .map(|d| d.d_val() as usize)
        .collect();
    if offsets.is_empty() {
        return Ok(Some(info));
    }

    let strings = dynamic_strings(&file)?
        .context("ELF has DT_NEEDED entries but no dynamic string table")?;
    for off in offsets {
        let name = strings.get(off).map_err(anyhow::Error::msg)?;
        if !info.needed.iter().any(|n| n == name) {
            info.needed.push(name.to_string());
        }
    }

    Ok(Some(info))
}

/// Convenience wrapper returning only the `DT_NEEDED` names.
pub fn needed_libraries(path: &Path) -> Result<Vec<String>> {
    Ok(read_dynamic_info(path)?
        .map(|info| info.needed)
        .unwrap_or_default())
}

fn dynamic_strings<'data>(
    file: &ElfBytes<'data, AnyEndian>,
) -> Result<Option<StringTable<'data>>> {
    if let Some((_, strs)) = file.dynamic_symbol_table().map_err(anyhow::Error::msg)? {
        return Ok(Some(strs));
    }
    // stripped .dynsym, fall back to the section name
    let shdr = match file
        .section_header_by_name(".dynstr")
        .map_err(anyhow::Error::msg)?
    {
        Some(s) => s,
        None => return Ok(None),
    };
    Ok(Some(
        file.section_data_as_strtab(&shdr)
            .map_err(anyhow::Error::msg)?,
    ))
}

fn interpreter(file: &ElfBytes<'_, AnyEndian>) -> Result<Option<String>> {
    let Some(segments) = file.segments() else {
        return Ok(None);
    };
    let Some(phdr) = segments.iter().find(|p| p.p_type == abi::PT_INTERP) else {
        return Ok(None);
    };
    let raw = file.segment_data(&phdr).map_err(anyhow::Error::msg)?;
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    Ok(Some(String::from_utf8_lossy(&raw[..end]).into_owned()))
}
