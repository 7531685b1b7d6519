// Sized value types shared by every stage of the pipeline

use serde::{Deserialize, Serialize};
use std::fmt;

/// On-wire size of a string value. Changing this must stay coherent across
/// the lexer (literal truncation), analyser (type sizes), code generator
/// (helper unrolling) and runtime (record parsing and map printing).
pub const STRING_SIZE: usize = 64;

/// Size of the `comm` builtin, matching the kernel's TASK_COMM_LEN.
pub const COMM_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    None,
    Integer,
    String,
    StackId,
    Cast(String),
    Pointer(String),
}

/// A value type together with its on-wire footprint in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizedType {
    pub kind: Kind,
    pub size: usize,
}

impl SizedType {
    pub fn none() -> Self {
        Self {
            kind: Kind::None,
            size: 0,
        }
    }

    pub fn integer() -> Self {
        Self {
            kind: Kind::Integer,
            size: 8,
        }
    }

    pub fn string(size: usize) -> Self {
        Self {
            kind: Kind::String,
            size,
        }
    }

    pub fn stack_id() -> Self {
        Self {
            kind: Kind::StackId,
            size: 4,
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == Kind::None
    }

    pub fn is_integer(&self) -> bool {
        self.kind == Kind::Integer
    }

    pub fn is_string(&self) -> bool {
        self.kind == Kind::String
    }

    /// Kinds must match; strings must additionally agree on size.
    pub fn compatible(&self, other: &SizedType) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.kind == Kind::String {
            return self.size == other.size;
        }
        true
    }
}

impl fmt::Display for SizedType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            Kind::None => write!(f, "none"),
            Kind::Integer => write!(f, "integer<{}>", self.size),
            Kind::String => write!(f, "string<{}>", self.size),
            Kind::StackId => write!(f, "stack_id"),
            Kind::Cast(name) => write!(f, "cast<{}>", name),
            Kind::Pointer(name) => write!(f, "pointer<{}>", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_compatibility_needs_equal_size() {
        assert!(SizedType::string(64).compatible(&SizedType::string(64)));
        assert!(!SizedType::string(64).compatible(&SizedType::string(16)));
        assert!(SizedType::integer().compatible(&SizedType::integer()));
        assert!(!SizedType::integer().compatible(&SizedType::string(64)));
    }

    #[test]
    fn display_names() {
        assert_eq!(SizedType::integer().to_string(), "integer<8>");
        assert_eq!(SizedType::string(64).to_string(), "string<64>");
        assert_eq!(SizedType::none().to_string(), "none");
    }
}
