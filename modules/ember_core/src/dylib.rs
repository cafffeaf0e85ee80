//! Loading modules from dynamic libraries.
//!
//! A library participates by exporting a [`DynModuleDecl`] under the
//! [`MODULE_DECLARATION_NAME`] symbol, most conveniently through
//! [`export_ember_module!`]. [`LibraryLoader`] opens the library, reads the
//! declaration and registers it with the registry; the library stays open
//! until the module is removed again.
use crate::registry::{ModuleDecl, RegistryInner};
use ember_module::{ModError, ModuleHandle};
use libloading::Library;
use log::info;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// Name of the module declaration a library must export.
pub const MODULE_DECLARATION_NAME: &str = "EMBER_MODULE_DECLARATION";

const MODULE_DECLARATION_NAME_WITH_NULL: &[u8] = b"EMBER_MODULE_DECLARATION\0";

/// Exports a module declaration from a library crate.
#[macro_export]
macro_rules! export_ember_module {
    ($decl:expr) => {
        #[no_mangle]
        #[doc(hidden)]
        pub static EMBER_MODULE_DECLARATION: $crate::dylib::DynModuleDecl = $decl;
    };
}

/// The module declaration exported by a dynamic library.
///
/// The `def` and `use` strings follow the same grammar as
/// [`ModuleDecl`](crate::ModuleDecl); the callbacks return a negative value
/// on failure.
#[derive(Copy, Clone, Debug)]
pub struct DynModuleDecl {
    /// Some words describing the module.
    pub comment: &'static str,
    /// Definition string.
    pub def: &'static str,
    /// Static use string.
    pub uses: &'static str,
    /// Initializes the module.
    pub load: Option<extern "C" fn() -> i32>,
    /// Frees what `load` set up.
    pub unload: Option<extern "C" fn() -> i32>,
}

/// Errors of the library loader.
#[derive(Debug)]
pub enum LibraryError {
    /// The library could not be opened.
    Open(libloading::Error),
    /// The library does not export a module declaration.
    MissingDeclaration(libloading::Error),
    /// The exported declaration was rejected by the registry.
    Registry(ModError),
    /// The slot index does not refer to an open library.
    UnknownLibrary(usize),
}

impl Display for LibraryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Open(err) => write!(f, "failed to open library: {}", err),
            LibraryError::MissingDeclaration(err) => {
                write!(f, "no module declaration exported: {}", err)
            }
            LibraryError::Registry(err) => write!(f, "module registration failed: {}", err),
            LibraryError::UnknownLibrary(index) => write!(f, "unknown library slot {}", index),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<ModError> for LibraryError {
    fn from(err: ModError) -> Self {
        LibraryError::Registry(err)
    }
}

struct LoadedLibrary {
    library: Library,
    path: PathBuf,
    handle: ModuleHandle,
}

/// Keeps dynamic libraries open for the modules loaded out of them.
///
/// Slots of unloaded libraries are reused; on drop the remaining libraries
/// close in reverse load order.
pub struct LibraryLoader {
    libs: Vec<Option<LoadedLibrary>>,
}

impl std::fmt::Debug for LibraryLoader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryLoader")
            .field("open", &self.libs.iter().filter(|l| l.is_some()).count())
            .finish()
    }
}

impl LibraryLoader {
    /// Constructs a loader with no open libraries.
    pub fn new() -> Self {
        Self { libs: Vec::new() }
    }

    /// Opens the library at `path` and registers its exported module.
    ///
    /// Returns the loader slot of the library; the module handle is
    /// available through [`LibraryLoader::handle`].
    ///
    /// # Safety
    ///
    /// Runs the library's initialisation routines and later its callbacks.
    /// The library must export a valid [`DynModuleDecl`] under
    /// [`MODULE_DECLARATION_NAME`] and stay sound for the duration.
    pub unsafe fn load(
        &mut self,
        registry: &mut RegistryInner,
        path: &Path,
    ) -> Result<usize, LibraryError> {
        // SAFETY: the caller vouches for the library's initialisation
        // routines.
        let library = unsafe { Library::new(path) }.map_err(LibraryError::Open)?;

        // SAFETY: the caller vouches that the symbol holds a DynModuleDecl
        // with 'static strings and callbacks.
        let decl = unsafe {
            library
                .get::<*const DynModuleDecl>(MODULE_DECLARATION_NAME_WITH_NULL)
                .map_err(LibraryError::MissingDeclaration)
                .map(|sym| **sym)
        }?;

        let load = decl.load;
        let unload = decl.unload;
        let handle = registry.register_module(ModuleDecl {
            comment: decl.comment.to_string(),
            def: decl.def.to_string(),
            uses: decl.uses.to_string(),
            load: load.map(|f| Box::new(move |_: &mut RegistryInner| f()) as crate::LoadFn),
            unload: unload.map(|f| Box::new(move |_: &mut RegistryInner| f()) as crate::UnloadFn),
        })?;

        info!("Dynamic library {} loaded.", path.display());
        let loaded = LoadedLibrary {
            library,
            path: path.to_path_buf(),
            handle,
        };
        for (i, slot) in self.libs.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(loaded);
                return Ok(i);
            }
        }
        self.libs.push(Some(loaded));
        Ok(self.libs.len() - 1)
    }

    /// The handle of the module registered from the library in `slot`.
    pub fn handle(&self, slot: usize) -> Option<ModuleHandle> {
        self.libs.get(slot).and_then(|l| l.as_ref()).map(|l| l.handle)
    }

    /// Unregisters the library's module and closes the library.
    ///
    /// Fails without closing anything if the module is still in use.
    pub fn unload(
        &mut self,
        registry: &mut RegistryInner,
        slot: usize,
    ) -> Result<(), LibraryError> {
        let lib = self
            .libs
            .get(slot)
            .and_then(|l| l.as_ref())
            .ok_or(LibraryError::UnknownLibrary(slot))?;
        // A stale handle means the module was removed by other means; the
        // library can close either way.
        match registry.unregister_module(lib.handle) {
            Ok(()) | Err(ModError::InvalidHandle) => {}
            Err(err) => return Err(LibraryError::Registry(err)),
        }

        let lib = self.libs[slot].take().unwrap_or_else(|| {
            panic!("library slot {} vanished during unload", slot)
        });
        info!("Dynamic library {} unloaded.", lib.path.display());
        drop(lib);

        while self.libs.last().is_some_and(|l| l.is_none()) {
            self.libs.pop();
        }
        Ok(())
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LibraryLoader {
    fn drop(&mut self) {
        let mut closed = 0;
        while let Some(slot) = self.libs.pop() {
            if let Some(lib) = slot {
                drop(lib);
                closed += 1;
            }
        }
        if closed == 1 {
            info!("Unloaded a dynamic library.");
        } else if closed > 1 {
            info!("Unloaded {} dynamic libraries.", closed);
        }
    }
}
