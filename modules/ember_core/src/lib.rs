//! Core module registry of the ember engine.
//!
//! Modules declare the interfaces they provide and the interfaces they use;
//! the registry computes a correct order for loading and unloading them,
//! picks providers by version, prevents conflicts and supports modules
//! arriving at run time, including from dynamic libraries (see [`dylib`]).
//!
//! ```
//! use ember_core::{ModuleDecl, Registry};
//!
//! let registry = Registry::new();
//! let main = registry
//!     .register_module(ModuleDecl {
//!         def: "app | entry-point".to_string(),
//!         ..Default::default()
//!     })
//!     .unwrap();
//! // The first use_interfaces call makes `app` the root module.
//! registry.use_interfaces(main, "").unwrap();
//! ```
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

pub mod dylib;
mod refbuf;
mod registry;
mod resolver;

pub use ember_module::{error_string, ModError, ModuleHandle, UseFlags, Variability};
pub use registry::{
    LoadFn, ModuleDecl, Registry, RegistryInner, Result, UnloadFn, INTERFACES_MAX, MODULES_MAX,
};
