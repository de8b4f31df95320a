//! Platform compatibility shims run once on every new region.
//!
//! On Windows the TLS and unwinding runtimes find the module that owns a
//! code address through its image header. Regions never pass through the
//! system loader, so [`PeImageHeader`] synthesizes a minimal DOS + PE32+
//! header as the data object `__ImageBase` and relocates its `ImageBase`
//! field against itself. Once the region is finalized that field holds the
//! region's own load address.

use cranelift_codegen::isa::TargetIsa;

use crate::error::LinkError;

pub const IMAGE_BASE_SYMBOL: &str = "__ImageBase";

const DOS_HEADER_SIZE: usize = 64;
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const COFF_HEADER_SIZE: usize = 20;
const OPTIONAL_HEADER_SIZE: u16 = 240;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const DATA_DIRECTORY_COUNT: u32 = 16;

const OPTIONAL_HEADER_OFFSET: usize = DOS_HEADER_SIZE + PE_SIGNATURE.len() + COFF_HEADER_SIZE;
/// Offset of `OptionalHeader.ImageBase` from the start of the header.
pub const IMAGE_BASE_OFFSET: usize = OPTIONAL_HEADER_OFFSET + 24;
pub const PE_HEADER_SIZE: usize = OPTIONAL_HEADER_OFFSET + OPTIONAL_HEADER_SIZE as usize;

pub const MACHINE_AMD64: u16 = 0x8664;
pub const MACHINE_ARM64: u16 = 0xaa64;

/// What a shim may do to a region that was just created.
pub trait RegionData {
    fn isa(&self) -> &dyn TargetIsa;

    /// Defines an exported read-only object. Every offset in
    /// `self_pointers` receives the object's own final address.
    fn define_data(
        &mut self,
        name: &str,
        bytes: Vec<u8>,
        align: u64,
        self_pointers: &[u32],
    ) -> Result<(), LinkError>;
}

pub trait PlatformShim: Send + Sync {
    fn name(&self) -> &'static str;
    fn prepare_region(&self, region: &mut dyn RegionData) -> Result<(), LinkError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImageHeaderMode {
    /// A PE header on Windows targets, nothing elsewhere.
    #[default]
    Auto,
    Always,
    Never,
}

impl ImageHeaderMode {
    pub fn shim(self, isa: &dyn TargetIsa) -> Box<dyn PlatformShim> {
        let windows = isa.triple().to_string().contains("windows");
        match self {
            ImageHeaderMode::Always => Box::new(PeImageHeader),
            ImageHeaderMode::Auto if windows => Box::new(PeImageHeader),
            ImageHeaderMode::Auto | ImageHeaderMode::Never => Box::new(NoShim),
        }
    }
}

pub struct NoShim;

impl PlatformShim for NoShim {
    fn name(&self) -> &'static str {
        "none"
    }

    fn prepare_region(&self, _region: &mut dyn RegionData) -> Result<(), LinkError> {
        Ok(())
    }
}

pub struct PeImageHeader;

impl PlatformShim for PeImageHeader {
    fn name(&self) -> &'static str {
        "pe-image-header"
    }

    fn prepare_region(&self, region: &mut dyn RegionData) -> Result<(), LinkError> {
        let machine = match region.isa().name() {
            "x64" => MACHINE_AMD64,
            "aarch64" => MACHINE_ARM64,
            other => {
                return Err(LinkError::relocation(
                    IMAGE_BASE_SYMBOL,
                    format!("no PE machine type for '{other}'"),
                ));
            }
        };
        region.define_data(
            IMAGE_BASE_SYMBOL,
            pe_header(machine),
            16,
            &[IMAGE_BASE_OFFSET as u32],
        )
    }
}

fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// DOS header, signature, COFF header and PE32+ optional header with no
/// sections and empty data directories. `ImageBase` is left zero.
pub fn pe_header(machine: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(PE_HEADER_SIZE);

    // ── DOS header ──
    out.extend_from_slice(b"MZ");
    out.resize(0x3c, 0);
    write_u32(&mut out, DOS_HEADER_SIZE as u32); // e_lfanew

    // ── COFF file header ──
    out.extend_from_slice(PE_SIGNATURE);
    write_u16(&mut out, machine);
    write_u16(&mut out, 0); // NumberOfSections
    write_u32(&mut out, 0); // TimeDateStamp
    write_u32(&mut out, 0); // PointerToSymbolTable
    write_u32(&mut out, 0); // NumberOfSymbols
    write_u16(&mut out, OPTIONAL_HEADER_SIZE);
    write_u16(&mut out, 0x0022); // EXECUTABLE_IMAGE | LARGE_ADDRESS_AWARE

    // ── Optional header ──
    write_u16(&mut out, PE32_PLUS_MAGIC);
    out.extend_from_slice(&[0, 0]); // linker version
    write_u32(&mut out, 0); // SizeOfCode
    write_u32(&mut out, 0); // SizeOfInitializedData
    write_u32(&mut out, 0); // SizeOfUninitializedData
    write_u32(&mut out, 0); // AddressOfEntryPoint
    write_u32(&mut out, 0); // BaseOfCode
    write_u64(&mut out, 0); // ImageBase, relocated
    write_u32(&mut out, 0x1000); // SectionAlignment
    write_u32(&mut out, 0x200); // FileAlignment
    write_u16(&mut out, 6); // MajorOperatingSystemVersion
    write_u16(&mut out, 0);
    write_u16(&mut out, 0); // MajorImageVersion
    write_u16(&mut out, 0);
    write_u16(&mut out, 6); // MajorSubsystemVersion
    write_u16(&mut out, 0);
    write_u32(&mut out, 0); // Win32VersionValue
    write_u32(&mut out, 0x1000); // SizeOfImage
    write_u32(&mut out, 0x200); // SizeOfHeaders
    write_u32(&mut out, 0); // CheckSum
    write_u16(&mut out, 3); // IMAGE_SUBSYSTEM_WINDOWS_CUI
    write_u16(&mut out, 0x0160); // HIGH_ENTROPY_VA | DYNAMIC_BASE | NX_COMPAT
    write_u64(&mut out, 0x100000); // SizeOfStackReserve
    write_u64(&mut out, 0x1000); // SizeOfStackCommit
    write_u64(&mut out, 0x100000); // SizeOfHeapReserve
    write_u64(&mut out, 0x1000); // SizeOfHeapCommit
    write_u32(&mut out, 0); // LoaderFlags
    write_u32(&mut out, DATA_DIRECTORY_COUNT);
    out.resize(PE_HEADER_SIZE, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_codegen::settings;

    fn u16_at(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn header_layout() {
        let header = pe_header(MACHINE_AMD64);
        assert_eq!(header.len(), PE_HEADER_SIZE);
        assert_eq!(PE_HEADER_SIZE, 328);
        assert_eq!(IMAGE_BASE_OFFSET, 112);
        assert_eq!(&header[..2], b"MZ");
        assert_eq!(u32_at(&header, 0x3c), 64);
        assert_eq!(&header[64..68], b"PE\0\0");
        assert_eq!(u16_at(&header, 68), MACHINE_AMD64);
        assert_eq!(u16_at(&header, 68 + 16), 240);
        assert_eq!(u16_at(&header, OPTIONAL_HEADER_OFFSET), 0x20b);
        assert_eq!(&header[IMAGE_BASE_OFFSET..IMAGE_BASE_OFFSET + 8], [0; 8]);
        assert_eq!(u32_at(&header, OPTIONAL_HEADER_OFFSET + 32), 0x1000);
        assert_eq!(u32_at(&header, OPTIONAL_HEADER_OFFSET + 108), 16);
    }

    struct Recorder {
        isa: cranelift_codegen::isa::OwnedTargetIsa,
        defined: Vec<(String, usize, Vec<u32>)>,
    }

    impl RegionData for Recorder {
        fn isa(&self) -> &dyn TargetIsa {
            &*self.isa
        }

        fn define_data(
            &mut self,
            name: &str,
            bytes: Vec<u8>,
            _align: u64,
            self_pointers: &[u32],
        ) -> Result<(), LinkError> {
            self.defined
                .push((name.to_string(), bytes.len(), self_pointers.to_vec()));
            Ok(())
        }
    }

    fn recorder() -> Recorder {
        let isa = cranelift_native::builder()
            .unwrap()
            .finish(settings::Flags::new(settings::builder()))
            .unwrap();
        Recorder {
            isa,
            defined: Vec::new(),
        }
    }

    #[test]
    fn shims_by_mode() {
        let mut region = recorder();
        ImageHeaderMode::Never
            .shim(&*region.isa.clone())
            .prepare_region(&mut region)
            .unwrap();
        assert!(region.defined.is_empty());

        let shim = ImageHeaderMode::Always.shim(&*region.isa.clone());
        assert_eq!(shim.name(), "pe-image-header");
        if matches!(region.isa.name(), "x64" | "aarch64") {
            shim.prepare_region(&mut region).unwrap();
            assert_eq!(
                region.defined,
                [(IMAGE_BASE_SYMBOL.to_string(), PE_HEADER_SIZE, vec![112])]
            );
        }

        let auto = ImageHeaderMode::Auto.shim(&*region.isa.clone());
        let expected = if cfg!(windows) { "pe-image-header" } else { "none" };
        assert_eq!(auto.name(), expected);
    }
}
