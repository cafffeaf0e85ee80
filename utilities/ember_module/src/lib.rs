//! Ember module definitions.
//!
//! The types shared between modules and the registry: interface
//! variability, use-clause flags, module handles and the registry error
//! type. The [`parse`] module compiles the textual `def`/`use` declarations
//! attached to a module.
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]
use std::fmt::{Display, Formatter};

pub mod parse;

pub use parse::{parse_def, parse_use, DefClause, NameShape, ParsedDef, UseClause};

/// Policy of an interface on being extended by child interfaces.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, PartialEq, Eq)]
pub enum Variability {
    /// The interface cannot be extended.
    None = 0,
    /// One child may be loaded at a given time (`$`).
    Single = 1,
    /// Any number of children may be loaded concurrently (`[]`).
    Multi = 2,
}

impl Variability {
    /// Short description used by diagnostics.
    pub fn describe(self) -> &'static str {
        match self {
            Variability::None => "no extension",
            Variability::Single => "a single child",
            Variability::Multi => "an array of children",
        }
    }
}

/// Modifier sigils of a use clause.
///
/// `!` marks the interface as incompatible, `#` defers its activation
/// towards the end of the resolution and `&` requests activation right
/// after the current module. The latter two are advisory.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct UseFlags {
    /// The module must not be loaded together with a provider (`!`).
    pub incompat: bool,
    /// Defer activation towards the end of the resolution (`#`).
    pub end: bool,
    /// Activate immediately after the current module (`&`).
    pub after: bool,
}

/// Highest index a module slot can have; indices are packed into 23 bits.
pub const MODULE_INDEX_MAX: u32 = (1 << 23) - 1;

/// A handle to a registered module.
///
/// Handles carry the slot index together with a generation counter that is
/// bumped every time the slot is reused, so a handle kept across an
/// unregistration is detected as stale. [`ModuleHandle::to_raw`] packs both
/// into a non-negative `i32` (`iter` in bits 23..31, index below), matching
/// the registry's log output.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, PartialEq, Eq)]
pub struct ModuleHandle {
    index: u32,
    iter: u8,
}

impl ModuleHandle {
    /// Constructs a handle from a slot index and its generation counter.
    ///
    /// # Panics
    ///
    /// Panics if `index` exceeds [`MODULE_INDEX_MAX`].
    pub fn new(index: u32, iter: u8) -> Self {
        assert!(index <= MODULE_INDEX_MAX);
        Self { index, iter }
    }

    /// The module's slot index.
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// The generation counter the handle was created with.
    pub fn iter(self) -> u8 {
        self.iter
    }

    /// Packs the handle into its raw non-negative integer form.
    pub fn to_raw(self) -> i32 {
        (((self.iter as u32) << 23) | self.index) as i32
    }

    /// Unpacks a raw handle value; `None` if it encodes an error code.
    pub fn from_raw(raw: i32) -> Option<Self> {
        if raw < 0 {
            return None;
        }
        Some(Self {
            index: raw as u32 & MODULE_INDEX_MAX,
            iter: (raw as u32 >> 23) as u8,
        })
    }
}

impl Display for ModuleHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "mod#{}.{}", self.index, self.iter)
    }
}

/// Errors of the module registry.
///
/// Every variant maps onto a stable negative integer code via
/// [`ModError::code`]; [`error_string`] yields the static description for a
/// code so upstream logs stay diffable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModError {
    /// The module table is full.
    ModulesFull,
    /// Malformed module definition.
    DefSyntax {
        /// Byte offset of the offending clause.
        offset: usize,
    },
    /// Invalid character in an interface definition clause.
    DefChar {
        /// Byte offset of the offending byte.
        offset: usize,
    },
    /// The definition string misses the `|` separator.
    DefDelimiter {
        /// Byte offset of the offending byte.
        offset: usize,
    },
    /// A module declared more than the supported number of interfaces.
    TooManyProvides,
    /// The interface table is full.
    InterfacesFull,
    /// An interface was redeclared with a different extension relation.
    ExtendsMismatch {
        /// Canonical interface name.
        name: String,
    },
    /// An interface was redeclared with a different variability.
    ExtensionMismatch {
        /// Canonical interface name.
        name: String,
    },
    /// A variability marker appeared where none is accepted.
    UnexpectedVariability {
        /// Byte offset of the marker.
        offset: usize,
    },
    /// `[` without a closing `]`.
    BracketMismatch {
        /// Byte offset of the bracket.
        offset: usize,
    },
    /// Characters after a variability marker.
    TrailingCharacter {
        /// Byte offset of the first trailing byte.
        offset: usize,
    },
    /// Invalid character in a use string.
    UseChar {
        /// Byte offset of the offending byte.
        offset: usize,
    },
    /// More clauses in one use string than the registry supports.
    TooManyUses,
    /// The module's live-use store is full.
    LiveUsesFull,
    /// A `!` clause named an interface that is currently loaded.
    IncompatibleLoaded {
        /// Canonical interface name.
        name: String,
    },
    /// No module provides the required interface.
    NoProvider {
        /// Canonical interface name.
        name: String,
    },
    /// No provider of the interface could be activated.
    NoCompatibleProvider {
        /// Canonical interface name.
        name: String,
    },
    /// The module's load callback returned a negative value.
    LoadCallbackFailed {
        /// Module name.
        name: String,
        /// The callback's return value.
        code: i32,
    },
    /// A dependency of the module could not be resolved.
    DependencyFailed {
        /// Module name.
        name: String,
    },
    /// The module provides an interface that is currently referenced.
    ProvidedInterfaceInUse {
        /// Canonical interface name.
        name: String,
    },
    /// A conflicting provider is still required elsewhere.
    ConflictRequired {
        /// Canonical interface name.
        name: String,
    },
    /// A conflicting provider failed to unload.
    ConflictUnloadFailed {
        /// Canonical interface name.
        name: String,
    },
    /// The root module was re-entered during a resolution.
    RootReentrancy,
    /// The module is still referenced and cannot be unloaded.
    ModuleReferenced {
        /// Module name.
        name: String,
        /// Current reference count.
        count: u32,
    },
    /// The module is still in use and cannot be removed.
    ModuleInUse {
        /// Module name.
        name: String,
    },
    /// The handle does not refer to a registered module.
    InvalidHandle,
}

impl ModError {
    /// The stable integer code of the error.
    pub fn code(&self) -> i32 {
        match self {
            ModError::ModulesFull => -1,
            ModError::DefSyntax { .. } => -2,
            ModError::DefChar { .. } => -3,
            ModError::DefDelimiter { .. } => -4,
            ModError::TooManyProvides => -5,
            ModError::InterfacesFull => -12,
            ModError::ExtendsMismatch { .. } => -14,
            ModError::ExtensionMismatch { .. } => -15,
            ModError::UnexpectedVariability { .. } => -16,
            ModError::BracketMismatch { .. } => -17,
            ModError::TrailingCharacter { .. } => -18,
            ModError::UseChar { .. } => -41,
            ModError::TooManyUses => -42,
            ModError::LiveUsesFull => -43,
            ModError::IncompatibleLoaded { .. } => -61,
            ModError::NoProvider { .. } => -62,
            ModError::NoCompatibleProvider { .. } => -63,
            ModError::LoadCallbackFailed { .. } => -101,
            ModError::DependencyFailed { .. } => -102,
            ModError::ProvidedInterfaceInUse { .. } => -103,
            ModError::ConflictRequired { .. } => -104,
            ModError::ConflictUnloadFailed { .. } => -105,
            ModError::RootReentrancy => -121,
            ModError::ModuleReferenced { .. } => -141,
            ModError::ModuleInUse { .. } => -201,
            ModError::InvalidHandle => -202,
        }
    }
}

impl Display for ModError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ModError::ModulesFull => f.write_str(error_string(-1)),
            ModError::DefSyntax { offset } => {
                write!(f, "invalid interface definition at byte {}", offset)
            }
            ModError::DefChar { offset } => {
                write!(f, "invalid character in definition at byte {}", offset)
            }
            ModError::DefDelimiter { offset } => {
                write!(f, "expected '|' or end of definition at byte {}", offset)
            }
            ModError::TooManyProvides => f.write_str(error_string(-5)),
            ModError::InterfacesFull => f.write_str(error_string(-12)),
            ModError::ExtendsMismatch { name } => {
                write!(f, "extension relation mismatch for interface '{}'", name)
            }
            ModError::ExtensionMismatch { name } => {
                write!(f, "variability mismatch for interface '{}'", name)
            }
            ModError::UnexpectedVariability { offset } => {
                write!(f, "unexpected variability marker at byte {}", offset)
            }
            ModError::BracketMismatch { offset } => {
                write!(f, "expected ']' after '[' at byte {}", offset)
            }
            ModError::TrailingCharacter { offset } => {
                write!(f, "unexpected character after marker at byte {}", offset)
            }
            ModError::UseChar { offset } => {
                write!(f, "invalid character in use string at byte {}", offset)
            }
            ModError::TooManyUses => f.write_str(error_string(-42)),
            ModError::LiveUsesFull => f.write_str(error_string(-43)),
            ModError::IncompatibleLoaded { name } => {
                write!(f, "incompatible interface '{}' is already loaded", name)
            }
            ModError::NoProvider { name } => {
                write!(f, "no providers for interface '{}'", name)
            }
            ModError::NoCompatibleProvider { name } => {
                write!(f, "no suitable provider for interface '{}'", name)
            }
            ModError::LoadCallbackFailed { name, code } => {
                write!(f, "load callback of module '{}' returned {}", name, code)
            }
            ModError::DependencyFailed { name } => {
                write!(f, "failed to satisfy dependencies of module '{}'", name)
            }
            ModError::ProvidedInterfaceInUse { name } => {
                write!(f, "provided interface '{}' is already referenced", name)
            }
            ModError::ConflictRequired { name } => {
                write!(
                    f,
                    "conflicting provider of interface '{}' is still required",
                    name
                )
            }
            ModError::ConflictUnloadFailed { name } => {
                write!(
                    f,
                    "conflicting provider of interface '{}' failed to unload",
                    name
                )
            }
            ModError::RootReentrancy => f.write_str(error_string(-121)),
            ModError::ModuleReferenced { name, count } => {
                write!(f, "module '{}' is referenced {} times", name, count)
            }
            ModError::ModuleInUse { name } => {
                write!(f, "module '{}' is still in use", name)
            }
            ModError::InvalidHandle => f.write_str(error_string(-202)),
        }
    }
}

impl std::error::Error for ModError {}

/// Returns the static description of a registry error code.
pub fn error_string(err: i32) -> &'static str {
    match err {
        -1 => "Module table at maximum capacity, cannot add.",
        -2 => "Invalid interface definition.",
        -3 => "Invalid character in interface definition.",
        -4 => "Invalid definition for module, expected '|' or end of string.",
        -5 => "Too many provided interfaces for one module.",
        -11 => "Interface definition may only extend one interface.",
        -12 => "Maximum amount of interfaces defined.",
        -13 => "Mismatched definitions - expandable.",
        -14 => "Mismatched definitions - expands.",
        -15 => "Interface's extension mismatch.",
        -16 => "Did not expect variability marker for interface.",
        -17 => "Interface variability bracket mismatch.",
        -18 => "Unexpected character after interface variability.",
        -41 => "Invalid character in use string.",
        -42 => "Too many clauses in use string.",
        -43 => "Live use store of the module is full.",
        -61 => "Incompatible interface already loaded.",
        -62 => "No providing modules for required interface.",
        -63 => "Cannot find suitable provider for interface.",
        -71 => "No compatible providers found for given interface version.",
        -101 => "Module load function failed.",
        -102 => "Failed to satisfy dependencies for module.",
        -103 => "Cannot load module - provided interface already used.",
        -104 => "Cannot load module - conflicted interface provider required.",
        -105 => "Cannot load module - conflicted interface provider unload failure.",
        -121 => "The root module is not supposed to be active during any initialisation.",
        -141 => "Cannot unload module - module is in use.",
        -201 => "Cannot remove module as it is still in use.",
        -202 => "Invalid or stale module handle.",
        _ => "Invalid error.",
    }
}
