//! Semantic types and target data layout.

use cranelift_codegen::ir::{self, types};
use cranelift_codegen::isa::{CallConv, TargetIsa};

use crate::ast::IntKind;

/// The parts of the target that affect type layout and calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetLayout {
    pub pointer_bytes: u8,
    /// Width of `long`: 32 on Windows, 64 elsewhere.
    pub long_bits: u8,
    pub call_conv: CallConv,
    pub os: TargetOs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Linux,
    Windows,
    MacOs,
    Other,
}

impl TargetOs {
    pub fn host() -> Self {
        if cfg!(target_os = "linux") {
            TargetOs::Linux
        } else if cfg!(windows) {
            TargetOs::Windows
        } else if cfg!(target_os = "macos") {
            TargetOs::MacOs
        } else {
            TargetOs::Other
        }
    }
}

impl TargetLayout {
    /// Layout of the process this code runs in.
    pub fn host() -> Self {
        let call_conv = if cfg!(all(windows, target_arch = "x86_64")) {
            CallConv::WindowsFastcall
        } else if cfg!(all(target_vendor = "apple", target_arch = "aarch64")) {
            CallConv::AppleAarch64
        } else {
            CallConv::SystemV
        };
        Self {
            pointer_bytes: (usize::BITS / 8) as u8,
            long_bits: if cfg!(windows) { 32 } else { 64 },
            call_conv,
            os: TargetOs::host(),
        }
    }

    pub fn from_isa(isa: &dyn TargetIsa) -> Self {
        let triple = isa.triple().to_string();
        let os = if triple.contains("windows") {
            TargetOs::Windows
        } else if triple.contains("darwin") || triple.contains("apple") {
            TargetOs::MacOs
        } else if triple.contains("linux") {
            TargetOs::Linux
        } else {
            TargetOs::Other
        };
        Self {
            pointer_bytes: isa.pointer_bytes(),
            long_bits: if os == TargetOs::Windows { 32 } else { 64 },
            call_conv: isa.default_call_conv(),
            os,
        }
    }

    pub fn pointer_type(&self) -> ir::Type {
        ir::Type::int(self.pointer_bytes as u16 * 8).unwrap_or(types::I64)
    }

    pub fn int_bits(&self, kind: IntKind) -> u8 {
        match kind {
            IntKind::Char | IntKind::SChar | IntKind::UChar => 8,
            IntKind::Short | IntKind::UShort => 16,
            IntKind::Int | IntKind::UInt => 32,
            IntKind::Long | IntKind::ULong => self.long_bits,
            IntKind::LongLong | IntKind::ULongLong => 64,
        }
    }
}

impl Default for TargetLayout {
    fn default() -> Self {
        Self::host()
    }
}

pub fn is_signed(kind: IntKind) -> bool {
    matches!(
        kind,
        IntKind::Char | IntKind::SChar | IntKind::Short | IntKind::Int | IntKind::Long | IntKind::LongLong
    )
}

fn rank(kind: IntKind) -> u8 {
    match kind {
        IntKind::Char | IntKind::SChar | IntKind::UChar => 1,
        IntKind::Short | IntKind::UShort => 2,
        IntKind::Int | IntKind::UInt => 3,
        IntKind::Long | IntKind::ULong => 4,
        IntKind::LongLong | IntKind::ULongLong => 5,
    }
}

fn to_unsigned(kind: IntKind) -> IntKind {
    match kind {
        IntKind::Char | IntKind::SChar => IntKind::UChar,
        IntKind::Short => IntKind::UShort,
        IntKind::Int => IntKind::UInt,
        IntKind::Long => IntKind::ULong,
        IntKind::LongLong => IntKind::ULongLong,
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CType {
    Void,
    Bool,
    Int(IntKind),
    Float,
    Double,
    Pointer {
        pointee: Box<CType>,
        pointee_const: bool,
    },
    Array {
        element: Box<CType>,
        len: u64,
    },
}

impl CType {
    pub const INT: CType = CType::Int(IntKind::Int);

    pub fn pointer_to(pointee: CType, pointee_const: bool) -> CType {
        CType::Pointer {
            pointee: Box::new(pointee),
            pointee_const,
        }
    }

    pub fn size(&self, layout: &TargetLayout) -> u64 {
        match self {
            CType::Void => 1,
            CType::Bool => 1,
            CType::Int(kind) => layout.int_bits(*kind) as u64 / 8,
            CType::Float => 4,
            CType::Double => 8,
            CType::Pointer { .. } => layout.pointer_bytes as u64,
            CType::Array { element, len } => element.size(layout) * len,
        }
    }

    pub fn align(&self, layout: &TargetLayout) -> u64 {
        match self {
            CType::Array { element, .. } => element.align(layout),
            other => other.size(layout).max(1),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, CType::Void)
    }

    /// Integer types including `bool`.
    pub fn is_integer(&self) -> bool {
        matches!(self, CType::Bool | CType::Int(_))
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, CType::Float | CType::Double)
    }

    pub fn is_arithmetic(&self) -> bool {
        self.is_integer() || self.is_floating()
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, CType::Pointer { .. })
    }

    pub fn is_scalar(&self) -> bool {
        self.is_arithmetic() || self.is_pointer()
    }

    pub fn is_signed(&self) -> bool {
        match self {
            CType::Int(kind) => is_signed(*kind),
            CType::Float | CType::Double => true,
            _ => false,
        }
    }

    pub fn pointee(&self) -> Option<&CType> {
        match self {
            CType::Pointer { pointee, .. } => Some(pointee),
            _ => None,
        }
    }

    /// The IR type holding a value of this type; `None` for `void` and
    /// arrays.
    pub fn ir_type(&self, layout: &TargetLayout) -> Option<ir::Type> {
        Some(match self {
            CType::Void | CType::Array { .. } => return None,
            CType::Bool => types::I8,
            CType::Int(kind) => match layout.int_bits(*kind) {
                8 => types::I8,
                16 => types::I16,
                32 => types::I32,
                _ => types::I64,
            },
            CType::Float => types::F32,
            CType::Double => types::F64,
            CType::Pointer { .. } => layout.pointer_type(),
        })
    }

    /// Array-to-pointer decay.
    pub fn decay(&self, element_const: bool) -> CType {
        match self {
            CType::Array { element, .. } => CType::pointer_to((**element).clone(), element_const),
            other => other.clone(),
        }
    }

    /// Integral promotion.
    pub fn promoted(&self) -> CType {
        match self {
            CType::Bool => CType::INT,
            CType::Int(kind) if rank(*kind) < 3 => CType::INT,
            other => other.clone(),
        }
    }

    /// Common type of two arithmetic operands.
    pub fn usual_arithmetic(a: &CType, b: &CType, layout: &TargetLayout) -> CType {
        if matches!(a, CType::Double) || matches!(b, CType::Double) {
            return CType::Double;
        }
        if matches!(a, CType::Float) || matches!(b, CType::Float) {
            return CType::Float;
        }
        let (CType::Int(x), CType::Int(y)) = (a.promoted(), b.promoted()) else {
            return CType::INT;
        };
        if x == y {
            return CType::Int(x);
        }
        let (sx, sy) = (is_signed(x), is_signed(y));
        if sx == sy {
            return CType::Int(if rank(x) >= rank(y) { x } else { y });
        }
        let (signed, unsigned) = if sx { (x, y) } else { (y, x) };
        if rank(unsigned) >= rank(signed) {
            return CType::Int(unsigned);
        }
        if layout.int_bits(signed) > layout.int_bits(unsigned) {
            return CType::Int(signed);
        }
        CType::Int(to_unsigned(signed))
    }

    /// C spelling for diagnostics.
    pub fn spelling(&self) -> String {
        match self {
            CType::Void => "void".into(),
            CType::Bool => "bool".into(),
            CType::Int(kind) => int_spelling(*kind).into(),
            CType::Float => "float".into(),
            CType::Double => "double".into(),
            CType::Pointer {
                pointee,
                pointee_const,
            } => {
                let inner = pointee.spelling();
                if *pointee_const {
                    format!("const {inner} *")
                } else {
                    format!("{inner} *")
                }
            }
            CType::Array { element, len } => format!("{}[{len}]", element.spelling()),
        }
    }
}

impl std::fmt::Display for CType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.spelling())
    }
}

pub fn int_spelling(kind: IntKind) -> &'static str {
    match kind {
        IntKind::Char => "char",
        IntKind::SChar => "signed char",
        IntKind::UChar => "unsigned char",
        IntKind::Short => "short",
        IntKind::UShort => "unsigned short",
        IntKind::Int => "int",
        IntKind::UInt => "unsigned int",
        IntKind::Long => "long",
        IntKind::ULong => "unsigned long",
        IntKind::LongLong => "long long",
        IntKind::ULongLong => "unsigned long long",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lp64() -> TargetLayout {
        TargetLayout {
            pointer_bytes: 8,
            long_bits: 64,
            call_conv: CallConv::SystemV,
            os: TargetOs::Linux,
        }
    }

    #[test]
    fn sizes_follow_layout() {
        let layout = lp64();
        assert_eq!(CType::Int(IntKind::Long).size(&layout), 8);
        let llp64 = TargetLayout {
            long_bits: 32,
            os: TargetOs::Windows,
            ..layout
        };
        assert_eq!(CType::Int(IntKind::Long).size(&llp64), 4);
        let array = CType::Array {
            element: Box::new(CType::Int(IntKind::Short)),
            len: 5,
        };
        assert_eq!(array.size(&layout), 10);
        assert_eq!(array.align(&layout), 2);
    }

    #[test]
    fn arithmetic_conversions() {
        let layout = lp64();
        let int = CType::INT;
        let uint = CType::Int(IntKind::UInt);
        let long = CType::Int(IntKind::Long);
        assert_eq!(CType::usual_arithmetic(&int, &uint, &layout), uint);
        assert_eq!(CType::usual_arithmetic(&uint, &long, &layout), long);
        assert_eq!(
            CType::usual_arithmetic(&CType::Int(IntKind::Char), &CType::Bool, &layout),
            int
        );
        assert_eq!(CType::usual_arithmetic(&long, &CType::Float, &layout), CType::Float);
    }

    #[test]
    fn spelling() {
        let ty = CType::pointer_to(CType::Int(IntKind::Char), true);
        assert_eq!(ty.to_string(), "const char *");
    }
}
