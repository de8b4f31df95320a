//! In-memory loader for relocatable ELF x86-64 objects found in import
//! archives.
//!
//! An object is placed in one mapping: its code sections first, followed by
//! call stubs for branches that cannot reach their target, then data
//! sections, common symbols and GOT slots. Once relocated, the code pages
//! are made read-execute.

use std::collections::{HashMap, HashSet};
use std::ptr::{self, NonNull};

use object::elf;
use object::{
    Architecture, BinaryFormat, Object, ObjectSection, ObjectSymbol, RelocationFlags,
    RelocationTarget, SectionIndex, SectionKind, SymbolIndex, SymbolKind, SymbolSection,
};

use crate::error::LinkError;
use crate::system::{self, page_align};

/// `jmp qword ptr [rip + 0]` followed by the absolute target.
const STUB_SIZE: usize = 16;
const GOT_SLOT_SIZE: usize = 8;

/// Pages owned by one loaded object.
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory; access is serialized by the owner
unsafe impl Send for Mapping {}

impl Mapping {
    fn new(len: usize, owner: &str) -> Result<Self, LinkError> {
        let ptr = system::map_memory(len)
            .ok_or_else(|| LinkError::archive(owner, format!("cannot map {len} bytes")))?;
        Ok(Self { ptr, len })
    }

    fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base() && address + len <= self.base() + self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: allocated by `map_memory` with this length
        unsafe { system::unmap_memory(self.ptr, self.len) };
    }
}

/// Bump allocator over a range of the mapping.
struct Cursor {
    next: usize,
    end: usize,
}

impl Cursor {
    fn take(&mut self, size: usize, align: usize) -> Option<usize> {
        let at = self.next.next_multiple_of(align.max(1));
        if at + size > self.end {
            return None;
        }
        self.next = at + size;
        Some(at)
    }
}

/// An object that is laid out in memory and knows its own symbols but
/// still waits for its imports.
pub struct ObjectImage<'data> {
    name: String,
    file: object::File<'data>,
    memory: Mapping,
    code_len: usize,
    sections: HashMap<SectionIndex, usize>,
    addresses: HashMap<SymbolIndex, usize>,
    definitions: Vec<(String, usize)>,
    undefined: Vec<String>,
    weak: HashSet<String>,
    stubs: Cursor,
    got: Cursor,
    stub_slots: HashMap<usize, usize>,
    got_slots: HashMap<usize, usize>,
}

/// A fully linked object. Its code stays mapped as long as this lives.
pub struct LoadedObject {
    pub name: String,
    pub definitions: Vec<(String, usize)>,
    _memory: Mapping,
}

fn loadable(kind: SectionKind) -> Option<bool> {
    match kind {
        SectionKind::Text => Some(true),
        SectionKind::Data
        | SectionKind::ReadOnlyData
        | SectionKind::ReadOnlyDataWithRel
        | SectionKind::ReadOnlyString
        | SectionKind::UninitializedData => Some(false),
        _ => None,
    }
}

fn is_got_relocation(r_type: u32) -> bool {
    matches!(
        r_type,
        elf::R_X86_64_GOTPCREL | elf::R_X86_64_GOTPCRELX | elf::R_X86_64_REX_GOTPCRELX
    )
}

impl<'data> ObjectImage<'data> {
    pub fn layout(name: &str, data: &'data [u8]) -> Result<Self, LinkError> {
        let file = object::File::parse(data)
            .map_err(|err| LinkError::relocation(name, format!("unreadable object: {err}")))?;
        if file.format() != BinaryFormat::Elf || file.architecture() != Architecture::X86_64 {
            return Err(LinkError::relocation(
                name,
                format!(
                    "{:?} {:?} objects cannot be loaded, only ELF x86-64",
                    file.format(),
                    file.architecture()
                ),
            ));
        }

        // ── Sizing ──
        let mut placed = Vec::new();
        let mut code_size = 0usize;
        let mut data_size = 0usize;
        let mut stub_count = 0usize;
        let mut got_count = 0usize;
        for section in file.sections() {
            let Some(is_code) = loadable(section.kind()) else {
                continue;
            };
            if section.size() == 0 || section.name().is_ok_and(|n| n == ".eh_frame") {
                continue;
            }
            let size = section.size() as usize;
            let align = section.align().max(1) as usize;
            let offset = if is_code {
                let at = code_size.next_multiple_of(align);
                code_size = at + size;
                at
            } else {
                let at = data_size.next_multiple_of(align);
                data_size = at + size;
                at
            };
            for (_, reloc) in section.relocations() {
                if let RelocationFlags::Elf { r_type } = reloc.flags() {
                    if r_type == elf::R_X86_64_PLT32 {
                        stub_count += 1;
                    } else if is_got_relocation(r_type) {
                        got_count += 1;
                    }
                }
            }
            placed.push((section.index(), is_code, offset));
        }
        let mut common = Vec::new();
        for symbol in file.symbols() {
            if symbol.section() == SymbolSection::Common {
                let align = symbol.address().max(1) as usize;
                let at = data_size.next_multiple_of(align);
                data_size = at + symbol.size() as usize;
                common.push((symbol.index(), at));
            }
        }

        let stub_start = code_size.next_multiple_of(STUB_SIZE);
        let code_len = page_align(stub_start + stub_count * STUB_SIZE);
        let got_start = data_size.next_multiple_of(GOT_SLOT_SIZE);
        let total = code_len + got_start + got_count * GOT_SLOT_SIZE;
        let memory = Mapping::new(total, name)?;
        let base = memory.base();

        // ── Placement ──
        let mut sections = HashMap::new();
        for (index, is_code, offset) in placed {
            let address = if is_code {
                base + offset
            } else {
                base + code_len + offset
            };
            let section = file
                .section_by_index(index)
                .map_err(|err| LinkError::relocation(name, err.to_string()))?;
            if section.kind() != SectionKind::UninitializedData {
                let bytes = section
                    .data()
                    .map_err(|err| LinkError::relocation(name, err.to_string()))?;
                // SAFETY: the sizing pass reserved `size` bytes at `address`
                unsafe {
                    ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len())
                };
            }
            sections.insert(index, address);
        }

        let mut image = Self {
            name: name.to_string(),
            file,
            code_len,
            sections,
            addresses: HashMap::new(),
            definitions: Vec::new(),
            undefined: Vec::new(),
            weak: HashSet::new(),
            stubs: Cursor {
                next: base + stub_start,
                end: base + code_len,
            },
            got: Cursor {
                next: base + code_len + got_start,
                end: base + total,
            },
            stub_slots: HashMap::new(),
            got_slots: HashMap::new(),
            memory,
        };
        for (index, offset) in common {
            image.addresses.insert(index, base + code_len + offset);
        }
        image.collect_symbols();
        Ok(image)
    }

    fn collect_symbols(&mut self) {
        for symbol in self.file.symbols() {
            let address = match symbol.section() {
                SymbolSection::Section(index) => match self.sections.get(&index) {
                    Some(base) => *base + symbol.address() as usize,
                    None => continue,
                },
                SymbolSection::Absolute => symbol.address() as usize,
                SymbolSection::Common => match self.addresses.get(&symbol.index()) {
                    Some(address) => *address,
                    None => continue,
                },
                SymbolSection::Undefined => {
                    if let Ok(name) = symbol.name() {
                        if !name.is_empty() && !self.undefined.iter().any(|u| u == name) {
                            if symbol.is_weak() {
                                self.weak.insert(name.to_string());
                            }
                            self.undefined.push(name.to_string());
                        }
                    }
                    continue;
                }
                _ => continue,
            };
            self.addresses.insert(symbol.index(), address);
            let exported = symbol.is_global()
                && !matches!(symbol.kind(), SymbolKind::Section | SymbolKind::File);
            if let (true, Ok(name)) = (exported, symbol.name()) {
                if !name.is_empty() {
                    self.definitions.push((name.to_string(), address));
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Global symbols this object defines, at their final addresses.
    pub fn definitions(&self) -> &[(String, usize)] {
        &self.definitions
    }

    pub fn undefined(&self) -> &[String] {
        &self.undefined
    }

    pub fn is_weak(&self, name: &str) -> bool {
        self.weak.contains(name)
    }

    /// Applies every relocation against `imports`, then seals the code.
    /// Weak imports missing from `imports` resolve to zero.
    pub fn link(mut self, imports: &HashMap<String, usize>) -> Result<LoadedObject, LinkError> {
        let missing: Vec<String> = self
            .undefined
            .iter()
            .filter(|n| !imports.contains_key(*n) && !self.weak.contains(*n))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(LinkError::UnresolvedSymbols {
                unit: self.name.clone(),
                names: missing,
            });
        }

        let mut fixups = Vec::new();
        for section in self.file.sections() {
            let Some(base) = self.sections.get(&section.index()).copied() else {
                continue;
            };
            for (offset, reloc) in section.relocations() {
                let RelocationFlags::Elf { r_type } = reloc.flags() else {
                    return Err(LinkError::relocation(&self.name, "non-ELF relocation"));
                };
                let target = match reloc.target() {
                    RelocationTarget::Symbol(index) => self.symbol_address(index, imports)?,
                    RelocationTarget::Section(index) => {
                        self.sections.get(&index).copied().ok_or_else(|| {
                            LinkError::relocation(
                                &self.name,
                                format!("relocation against unloaded section {}", index.0),
                            )
                        })?
                    }
                    RelocationTarget::Absolute => 0,
                    _ => {
                        return Err(LinkError::relocation(
                            &self.name,
                            "unsupported relocation target",
                        ));
                    }
                };
                fixups.push((base + offset as usize, r_type, target, reloc.addend()));
            }
        }
        for (place, r_type, target, addend) in fixups {
            self.apply(place, r_type, target, addend)?;
        }

        // SAFETY: the first `code_len` bytes are ours and fully written
        unsafe { system::make_executable(self.memory.ptr, self.code_len) }
            .map_err(|err| LinkError::archive(&self.name, err.to_string()))?;
        log::debug!(
            "loaded {} ({} definitions) at {:#x}",
            self.name,
            self.definitions.len(),
            self.memory.base()
        );
        Ok(LoadedObject {
            name: self.name,
            definitions: self.definitions,
            _memory: self.memory,
        })
    }

    fn symbol_address(
        &self,
        index: SymbolIndex,
        imports: &HashMap<String, usize>,
    ) -> Result<usize, LinkError> {
        if let Some(address) = self.addresses.get(&index) {
            return Ok(*address);
        }
        let symbol = self
            .file
            .symbol_by_index(index)
            .map_err(|err| LinkError::relocation(&self.name, err.to_string()))?;
        let name = symbol
            .name()
            .map_err(|err| LinkError::relocation(&self.name, err.to_string()))?;
        match imports.get(name) {
            Some(address) => Ok(*address),
            None if self.weak.contains(name) => Ok(0),
            None => Err(LinkError::UnresolvedSymbols {
                unit: self.name.clone(),
                names: vec![name.to_string()],
            }),
        }
    }

    fn apply(&mut self, place: usize, r_type: u32, target: usize, addend: i64) -> Result<(), LinkError> {
        let s = target as i64;
        let p = place as i64;
        match r_type {
            elf::R_X86_64_NONE => Ok(()),
            elf::R_X86_64_64 => self.patch(place, &(s.wrapping_add(addend) as u64).to_le_bytes()),
            elf::R_X86_64_PC64 => self.patch(place, &(s + addend - p).to_le_bytes()),
            elf::R_X86_64_PC32 => {
                let value = self.fit_i32(s + addend - p, r_type)?;
                self.patch(place, &value.to_le_bytes())
            }
            elf::R_X86_64_PLT32 => {
                let value = match i32::try_from(s + addend - p) {
                    Ok(value) => value,
                    Err(_) => {
                        let stub = self.stub(target)? as i64;
                        self.fit_i32(stub + addend - p, r_type)?
                    }
                };
                self.patch(place, &value.to_le_bytes())
            }
            elf::R_X86_64_GOTPCREL | elf::R_X86_64_GOTPCRELX | elf::R_X86_64_REX_GOTPCRELX => {
                let slot = self.got_slot(target)? as i64;
                let value = self.fit_i32(slot + addend - p, r_type)?;
                self.patch(place, &value.to_le_bytes())
            }
            elf::R_X86_64_32 => {
                let value = u32::try_from(s + addend).map_err(|_| self.overflow(r_type))?;
                self.patch(place, &value.to_le_bytes())
            }
            elf::R_X86_64_32S => {
                let value = self.fit_i32(s + addend, r_type)?;
                self.patch(place, &value.to_le_bytes())
            }
            other => Err(LinkError::relocation(
                &self.name,
                format!("unsupported relocation type {other}"),
            )),
        }
    }

    fn fit_i32(&self, value: i64, r_type: u32) -> Result<i32, LinkError> {
        i32::try_from(value).map_err(|_| self.overflow(r_type))
    }

    fn overflow(&self, r_type: u32) -> LinkError {
        LinkError::relocation(
            &self.name,
            format!("relocation type {r_type} cannot reach its target"),
        )
    }

    fn stub(&mut self, target: usize) -> Result<usize, LinkError> {
        if let Some(stub) = self.stub_slots.get(&target) {
            return Ok(*stub);
        }
        let stub = self
            .stubs
            .take(STUB_SIZE, STUB_SIZE)
            .ok_or_else(|| LinkError::relocation(&self.name, "out of call stubs"))?;
        let mut code = [0u8; 14];
        code[..6].copy_from_slice(&[0xff, 0x25, 0, 0, 0, 0]);
        code[6..].copy_from_slice(&(target as u64).to_le_bytes());
        self.patch(stub, &code)?;
        self.stub_slots.insert(target, stub);
        Ok(stub)
    }

    fn got_slot(&mut self, target: usize) -> Result<usize, LinkError> {
        if let Some(slot) = self.got_slots.get(&target) {
            return Ok(*slot);
        }
        let slot = self
            .got
            .take(GOT_SLOT_SIZE, GOT_SLOT_SIZE)
            .ok_or_else(|| LinkError::relocation(&self.name, "out of GOT slots"))?;
        self.patch(slot, &(target as u64).to_le_bytes())?;
        self.got_slots.insert(target, slot);
        Ok(slot)
    }

    fn patch(&mut self, at: usize, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.memory.contains(at, bytes.len()) {
            return Err(LinkError::relocation(
                &self.name,
                format!("relocation at {at:#x} lies outside the object"),
            ));
        }
        // SAFETY: bounds checked against the writable mapping above
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), at as *mut u8, bytes.len()) };
        Ok(())
    }
}

#[cfg(all(test, target_os = "linux", target_arch = "x86_64"))]
pub(crate) mod tests {
    use super::*;
    use object::write::{self, Object as WriteObject, StandardSection};
    use object::{Endianness, SymbolFlags, SymbolScope};

    pub(crate) struct ElfBuilder {
        object: WriteObject<'static>,
    }

    impl ElfBuilder {
        pub(crate) fn new() -> Self {
            Self {
                object: WriteObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little),
            }
        }

        pub(crate) fn function(&mut self, name: &str, code: &[u8]) -> (write::SectionId, u64) {
            let text = self.object.section_id(StandardSection::Text);
            let offset = self.object.append_section_data(text, code, 16);
            self.object.add_symbol(write::Symbol {
                name: name.as_bytes().to_vec(),
                value: offset,
                size: code.len() as u64,
                kind: SymbolKind::Text,
                scope: SymbolScope::Linkage,
                weak: false,
                section: write::SymbolSection::Section(text),
                flags: SymbolFlags::None,
            });
            (text, offset)
        }

        pub(crate) fn data(&mut self, name: &str, bytes: &[u8]) -> write::SymbolId {
            let section = self.object.section_id(StandardSection::Data);
            let offset = self.object.append_section_data(section, bytes, 8);
            self.object.add_symbol(write::Symbol {
                name: name.as_bytes().to_vec(),
                value: offset,
                size: bytes.len() as u64,
                kind: SymbolKind::Data,
                scope: SymbolScope::Linkage,
                weak: false,
                section: write::SymbolSection::Section(section),
                flags: SymbolFlags::None,
            })
        }

        pub(crate) fn import(&mut self, name: &str) -> write::SymbolId {
            self.object.add_symbol(write::Symbol {
                name: name.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::Unknown,
                scope: SymbolScope::Unknown,
                weak: false,
                section: write::SymbolSection::Undefined,
                flags: SymbolFlags::None,
            })
        }

        pub(crate) fn relocate(
            &mut self,
            section: write::SectionId,
            offset: u64,
            symbol: write::SymbolId,
            r_type: u32,
        ) {
            self.object
                .add_relocation(
                    section,
                    write::Relocation {
                        offset,
                        symbol,
                        addend: -4,
                        flags: RelocationFlags::Elf { r_type },
                    },
                )
                .unwrap();
        }

        pub(crate) fn finish(self) -> Vec<u8> {
            self.object.write().unwrap()
        }
    }

    /// `mov eax, imm32; ret`
    pub(crate) fn return_constant(value: i32) -> Vec<u8> {
        let mut code = vec![0xb8];
        code.extend_from_slice(&value.to_le_bytes());
        code.push(0xc3);
        code
    }

    /// `jmp rel32` with the displacement left for a relocation at offset 1.
    pub(crate) const TAIL_CALL: [u8; 5] = [0xe9, 0, 0, 0, 0];

    extern "C" fn host_double(x: i32) -> i32 {
        x * 2
    }

    fn call0(object: &LoadedObject, name: &str) -> i32 {
        let address = object
            .definitions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| *a)
            .unwrap();
        // SAFETY: the test object defines `name` as `int(void)`
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(address) };
        f()
    }

    #[test]
    fn loads_and_runs_a_function() {
        let mut elf = ElfBuilder::new();
        elf.function("answer", &return_constant(42));
        let bytes = elf.finish();

        let image = ObjectImage::layout("answer.o", &bytes).unwrap();
        assert!(image.undefined().is_empty());
        assert_eq!(image.definitions().len(), 1);
        let object = image.link(&HashMap::new()).unwrap();
        assert_eq!(call0(&object, "answer"), 42);
    }

    #[test]
    fn far_calls_go_through_stubs() {
        let mut elf = ElfBuilder::new();
        let (text, offset) = elf.function("twice", &TAIL_CALL);
        let host = elf.import("host_double");
        elf.relocate(text, offset + 1, host, elf::R_X86_64_PLT32);
        let bytes = elf.finish();

        let image = ObjectImage::layout("twice.o", &bytes).unwrap();
        assert_eq!(image.undefined(), ["host_double"]);
        let imports = HashMap::from([("host_double".to_string(), host_double as usize)]);
        let object = image.link(&imports).unwrap();

        let address = object.definitions[0].1;
        // SAFETY: `twice` tail-calls `int host_double(int)`
        let twice: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(address) };
        assert_eq!(twice(21), 42);
    }

    #[test]
    fn data_through_the_got() {
        let mut elf = ElfBuilder::new();
        let value = elf.data("value", &7u32.to_le_bytes());
        // mov rax, [rip + value@GOTPCREL]; mov eax, [rax]; ret
        let code = [0x48, 0x8b, 0x05, 0, 0, 0, 0, 0x8b, 0x00, 0xc3];
        let (text, offset) = elf.function("read_value", &code);
        elf.relocate(text, offset + 3, value, elf::R_X86_64_GOTPCREL);
        let bytes = elf.finish();

        let object = ObjectImage::layout("value.o", &bytes)
            .unwrap()
            .link(&HashMap::new())
            .unwrap();
        assert_eq!(call0(&object, "read_value"), 7);
    }

    #[test]
    fn missing_imports_and_foreign_relocations_fail() {
        let mut elf = ElfBuilder::new();
        let (text, offset) = elf.function("twice", &TAIL_CALL);
        let host = elf.import("host_double");
        elf.relocate(text, offset + 1, host, elf::R_X86_64_PLT32);
        let bytes = elf.finish();
        let err = ObjectImage::layout("twice.o", &bytes)
            .unwrap()
            .link(&HashMap::new())
            .err()
            .unwrap();
        assert!(matches!(err, LinkError::UnresolvedSymbols { names, .. } if names == ["host_double"]));

        let mut elf = ElfBuilder::new();
        let value = elf.data("tls_value", &[0; 4]);
        let (text, offset) = elf.function("read_tls", &[0x8b, 0x04, 0x25, 0, 0, 0, 0, 0xc3]);
        elf.relocate(text, offset + 3, value, elf::R_X86_64_TPOFF32);
        let bytes = elf.finish();
        let err = ObjectImage::layout("tls.o", &bytes)
            .unwrap()
            .link(&HashMap::new())
            .err()
            .unwrap();
        assert!(matches!(err, LinkError::IncompatibleRelocation { .. }));
    }

    #[test]
    fn rejects_other_formats() {
        let mut coff = WriteObject::new(BinaryFormat::Coff, Architecture::X86_64, Endianness::Little);
        let text = coff.section_id(StandardSection::Text);
        coff.append_section_data(text, &return_constant(1), 16);
        let bytes = coff.write().unwrap();
        assert!(matches!(
            ObjectImage::layout("answer.obj", &bytes),
            Err(LinkError::IncompatibleRelocation { .. })
        ));
    }
}
