//! Itanium C++ ABI name mangling for the dialect's types.
//!
//! Only namespaces, builtin types and pointers can appear, so the
//! substitution table holds namespace prefixes, `const`-qualified types
//! and pointer types.

use crate::ast::IntKind;
use crate::types::CType;

struct Mangler {
    out: String,
    substitutions: Vec<String>,
}

impl Mangler {
    fn new() -> Self {
        Self {
            out: String::from("_Z"),
            substitutions: Vec::new(),
        }
    }

    fn source_name(name: &str) -> String {
        format!("{}{name}", name.len())
    }

    /// `N <prefix>* <name> E` or a bare source name.
    fn name(&mut self, namespaces: &[String], name: &str) {
        if namespaces.is_empty() {
            self.out.push_str(&Self::source_name(name));
            return;
        }
        self.out.push('N');
        let mut prefix = String::new();
        for ns in namespaces {
            let part = Self::source_name(ns);
            self.out.push_str(&part);
            prefix.push_str(&part);
            self.substitutions.push(prefix.clone());
        }
        self.out.push_str(&Self::source_name(name));
        self.out.push('E');
    }

    fn substitution(index: usize) -> String {
        if index == 0 {
            return "S_".to_string();
        }
        let mut n = index - 1;
        let mut digits = Vec::new();
        loop {
            let d = (n % 36) as u8;
            digits.push(if d < 10 { b'0' + d } else { b'A' + d - 10 });
            n /= 36;
            if n == 0 {
                break;
            }
        }
        digits.reverse();
        format!("S{}_", String::from_utf8_lossy(&digits))
    }

    /// Returns `(key, emitted)`: the unsubstituted encoding used as the
    /// table key, and the text to emit.
    fn encode(&mut self, ty: &CType, is_const: bool) -> (String, String) {
        if is_const {
            let (inner_key, inner) = self.encode(ty, false);
            return self.substitutable(format!("K{inner_key}"), format!("K{inner}"));
        }
        match ty {
            CType::Pointer {
                pointee,
                pointee_const,
            } => {
                let (inner_key, inner) = self.encode(pointee, *pointee_const);
                self.substitutable(format!("P{inner_key}"), format!("P{inner}"))
            }
            CType::Array { element, .. } => {
                let (inner_key, inner) = self.encode(element, false);
                self.substitutable(format!("P{inner_key}"), format!("P{inner}"))
            }
            builtin => {
                let code = builtin_code(builtin).to_string();
                (code.clone(), code)
            }
        }
    }

    fn substitutable(&mut self, key: String, emitted: String) -> (String, String) {
        if let Some(index) = self.substitutions.iter().position(|s| *s == key) {
            return (key, Self::substitution(index));
        }
        self.substitutions.push(key.clone());
        (key, emitted)
    }
}

fn builtin_code(ty: &CType) -> &'static str {
    match ty {
        CType::Void => "v",
        CType::Bool => "b",
        CType::Float => "f",
        CType::Double => "d",
        CType::Int(kind) => match kind {
            IntKind::Char => "c",
            IntKind::SChar => "a",
            IntKind::UChar => "h",
            IntKind::Short => "s",
            IntKind::UShort => "t",
            IntKind::Int => "i",
            IntKind::UInt => "j",
            IntKind::Long => "l",
            IntKind::ULong => "m",
            IntKind::LongLong => "x",
            IntKind::ULongLong => "y",
        },
        CType::Pointer { .. } | CType::Array { .. } => "v",
    }
}

/// Mangled name of a function declared outside `extern "C"`.
pub fn mangle_function(namespaces: &[String], name: &str, params: &[CType], variadic: bool) -> String {
    let mut m = Mangler::new();
    m.name(namespaces, name);
    if params.is_empty() && !variadic {
        m.out.push('v');
    }
    for param in params {
        let (_, emitted) = m.encode(param, false);
        m.out.push_str(&emitted);
    }
    if variadic {
        m.out.push('z');
    }
    m.out
}

/// Namespace-scope variables are mangled; global ones keep their name.
pub fn mangle_variable(namespaces: &[String], name: &str) -> String {
    if namespaces.is_empty() {
        return name.to_string();
    }
    let mut m = Mangler::new();
    m.name(namespaces, name);
    m.out
}
