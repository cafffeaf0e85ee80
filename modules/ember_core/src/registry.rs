//! The module registry: interface table, module table and registration.
use crate::refbuf::{RefBuffer, RefKind};
use ember_module::parse::NameShape;
use ember_module::{parse_def, parse_use, ModError, ModuleHandle, UseFlags, Variability};
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Result type of registry operations.
pub type Result<T> = std::result::Result<T, ModError>;

/// Hard capacity of the interface table.
pub const INTERFACES_MAX: usize = 2047;

/// Hard capacity of the module table.
pub const MODULES_MAX: usize = 2047;

/// Saturation value of an interface's child counter.
const CHILD_COUNT_SAT: u8 = 31;

/// A module load callback.
///
/// The callback runs while the registry lock is held and receives the inner
/// registry, so it may register further modules or use interfaces without
/// re-entering through [`Registry`]. A negative return value fails the load.
pub type LoadFn = Box<dyn FnMut(&mut RegistryInner) -> i32 + Send>;

/// A module unload callback.
///
/// Must return a non-negative value; there is no recovery from a failed
/// unload.
pub type UnloadFn = Box<dyn FnMut(&mut RegistryInner) -> i32 + Send>;

/// A module registration record.
///
/// `def` names the module, its version and the provided interfaces; `uses`
/// lists the interfaces required whenever the module is loaded. Both follow
/// the grammar of [`ember_module::parse`].
#[derive(Default)]
pub struct ModuleDecl {
    /// Some words describing the module.
    pub comment: String,
    /// Definition string: `name [version] | provides...`.
    pub def: String,
    /// Static use string.
    pub uses: String,
    /// Initializes the module; absent means no initialisation is needed.
    pub load: Option<LoadFn>,
    /// Frees what [`ModuleDecl::load`] set up; calling `load` again after
    /// `unload` must be valid.
    pub unload: Option<UnloadFn>,
}

impl std::fmt::Debug for ModuleDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDecl")
            .field("comment", &self.comment)
            .field("def", &self.def)
            .field("uses", &self.uses)
            .field("load", &self.load.is_some())
            .field("unload", &self.unload.is_some())
            .finish()
    }
}

/// Providing modules of an interface.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Providers {
    /// Nobody provides the interface.
    None,
    /// Exactly one module provides it.
    One(u16),
    /// This many modules provide it; they are found by scanning the
    /// module table.
    Many(u16),
}

/// An entry of the interface table.
#[derive(Debug)]
pub(crate) struct InterfaceRecord {
    pub(crate) name: String,
    pub(crate) variability: Variability,
    pub(crate) parent: Option<u16>,
    /// Number of children, saturating at [`CHILD_COUNT_SAT`].
    pub(crate) child_count: u8,
    pub(crate) providers: Providers,
    pub(crate) loaded: bool,
    /// Whether the full shape is known from a definition; a defined record
    /// cannot be silently overridden.
    pub(crate) defined: bool,
}

/// A compiled use clause as stored per module.
#[derive(Clone, Debug)]
pub(crate) struct UseRecord {
    pub(crate) iface: u16,
    pub(crate) flags: UseFlags,
    /// Required version; live uses always store an empty string here.
    pub(crate) version: String,
}

/// One provided interface of a module.
#[derive(Debug)]
pub(crate) struct Provide {
    pub(crate) iface: u16,
    pub(crate) version: String,
}

pub(crate) struct ModuleRecord {
    #[allow(dead_code)]
    pub(crate) comment: String,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) provides: Vec<Provide>,
    pub(crate) uses_static: Vec<UseRecord>,
    pub(crate) uses_live: Vec<UseRecord>,
    pub(crate) load: Option<LoadFn>,
    pub(crate) unload: Option<UnloadFn>,
    pub(crate) loaded: bool,
    pub(crate) loading: bool,
}

impl std::fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("loaded", &self.loaded)
            .finish()
    }
}

/// A slot of the module table. The generation counter outlives the record,
/// so handles into a reused slot are detected as stale.
#[derive(Debug, Default)]
pub(crate) struct ModuleSlot {
    pub(crate) iter: u8,
    pub(crate) record: Option<ModuleRecord>,
}

/// The module registry.
pub struct Registry {
    inner: parking_lot::Mutex<RegistryInner>,
}

static_assertions::assert_impl_all!(Registry: Send, Sync);

impl Registry {
    /// Constructs an empty registry.
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(RegistryInner::new()),
        }
    }

    /// Runs `f` with the locked inner registry.
    ///
    /// Everything a load callback may do with its [`RegistryInner`]
    /// argument is available here as well.
    pub fn enter<R>(&self, f: impl FnOnce(&mut RegistryInner) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Registers a module. See [`RegistryInner::register_module`].
    pub fn register_module(&self, decl: ModuleDecl) -> Result<ModuleHandle> {
        self.inner.lock().register_module(decl)
    }

    /// Removes a module. See [`RegistryInner::unregister_module`].
    pub fn unregister_module(&self, handle: ModuleHandle) -> Result<()> {
        self.inner.lock().unregister_module(handle)
    }

    /// Activates interfaces on behalf of a module. See
    /// [`RegistryInner::use_interfaces`].
    pub fn use_interfaces(&self, handle: ModuleHandle, uses: &str) -> Result<()> {
        self.inner.lock().use_interfaces(handle, uses)
    }

    /// Releases previously used interfaces. See
    /// [`RegistryInner::unuse_interfaces`].
    pub fn unuse_interfaces(&self, handle: ModuleHandle, uses: &str) -> Result<()> {
        self.inner.lock().unuse_interfaces(handle, uses)
    }

    /// Unloads modules that are no longer referenced. See
    /// [`RegistryInner::cleanup`].
    pub fn cleanup(&self) {
        self.inner.lock().cleanup();
    }

    /// Approximate heap usage of the registry in bytes.
    pub fn memory_usage(&self) -> usize {
        self.inner.lock().memory_usage()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("(Registry)")
    }
}

/// How an interface name arrived at the table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum InternMode {
    /// Provides-clause of a definition: the clause fixes the variability.
    Def,
    /// Use clause: the variability stays whatever it is.
    Use,
}

/// The single-threaded interior of the [`Registry`].
pub struct RegistryInner {
    interfaces: Vec<InterfaceRecord>,
    interface_names: BTreeMap<String, u16>,
    /// Module slots; never truncated so generation counters survive
    /// removal. `mods_len` is the logical length.
    mods: Vec<ModuleSlot>,
    mods_len: usize,
    mods_count: usize,
    /// Live reference buffer of the current root resolution.
    top_use: Option<RefBuffer>,
    root_mod: Option<usize>,
    /// Depth of `use_interfaces` frames on the stack.
    use_level: u32,
    warned_interfaces_full: bool,
    warned_modules_full: bool,
}

impl std::fmt::Debug for RegistryInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryInner")
            .field("interfaces", &self.interfaces.len())
            .field("modules", &self.mods_count)
            .field("root", &self.root_mod)
            .finish()
    }
}

impl RegistryInner {
    pub(crate) fn new() -> Self {
        Self {
            interfaces: Vec::new(),
            interface_names: BTreeMap::new(),
            mods: Vec::new(),
            mods_len: 0,
            mods_count: 0,
            top_use: None,
            root_mod: None,
            use_level: 0,
            warned_interfaces_full: false,
            warned_modules_full: false,
        }
    }

    // Accessors shared with the resolver.

    pub(crate) fn iface(&self, idx: u16) -> &InterfaceRecord {
        &self.interfaces[idx as usize]
    }

    pub(crate) fn iface_mut(&mut self, idx: u16) -> &mut InterfaceRecord {
        &mut self.interfaces[idx as usize]
    }

    pub(crate) fn record(&self, n: usize) -> &ModuleRecord {
        self.mods[n]
            .record
            .as_ref()
            .unwrap_or_else(|| panic!("module slot {} is empty", n))
    }

    pub(crate) fn record_mut(&mut self, n: usize) -> &mut ModuleRecord {
        self.mods[n]
            .record
            .as_mut()
            .unwrap_or_else(|| panic!("module slot {} is empty", n))
    }

    pub(crate) fn record_opt(&self, n: usize) -> Option<&ModuleRecord> {
        self.mods.get(n).and_then(|s| s.record.as_ref())
    }

    pub(crate) fn record_opt_mut(&mut self, n: usize) -> Option<&mut ModuleRecord> {
        self.mods.get_mut(n).and_then(|s| s.record.as_mut())
    }

    pub(crate) fn mods_len(&self) -> usize {
        self.mods_len
    }

    pub(crate) fn slot(&self, n: usize) -> &ModuleSlot {
        &self.mods[n]
    }

    pub(crate) fn root_mod(&self) -> Option<usize> {
        self.root_mod
    }

    pub(crate) fn set_root_mod(&mut self, n: usize) {
        self.root_mod = Some(n);
    }

    pub(crate) fn use_level(&self) -> u32 {
        self.use_level
    }

    pub(crate) fn enter_use_level(&mut self) {
        self.use_level += 1;
    }

    pub(crate) fn leave_use_level(&mut self) {
        self.use_level -= 1;
    }

    pub(crate) fn top_use_is_live(&self) -> bool {
        self.top_use.is_some()
    }

    pub(crate) fn create_top_use(&mut self) {
        debug_assert!(self.top_use.is_none());
        self.top_use = Some(RefBuffer::new(self.interfaces.len(), self.mods_len));
    }

    /// Reference count, zero when no resolution is live.
    pub(crate) fn refs_count(&self, kind: RefKind, index: usize) -> u32 {
        self.top_use.as_ref().map_or(0, |b| b.count(kind, index))
    }

    pub(crate) fn refs_add(&mut self, kind: RefKind, index: usize) {
        self.top_use
            .as_mut()
            .unwrap_or_else(|| panic!("no live reference buffer"))
            .add_ref(kind, index);
    }

    pub(crate) fn refs_remove(&mut self, kind: RefKind, index: usize) {
        self.top_use
            .as_mut()
            .unwrap_or_else(|| panic!("no live reference buffer"))
            .remove_ref(kind, index);
    }

    /// Validates a handle against the module table.
    pub(crate) fn module_index(&self, handle: ModuleHandle) -> Result<usize> {
        let n = handle.index();
        if n < self.mods_len && self.mods[n].record.is_some() && self.mods[n].iter == handle.iter()
        {
            Ok(n)
        } else {
            Err(ModError::InvalidHandle)
        }
    }

    // Interface table.

    fn create_interface(
        &mut self,
        name: &str,
        variability: Variability,
        parent: Option<u16>,
    ) -> Result<u16> {
        if self.interfaces.len() >= INTERFACES_MAX {
            if !self.warned_interfaces_full {
                error!(
                    "Interface table at maximum capacity ({}), cannot add '{}'.",
                    INTERFACES_MAX, name
                );
                self.warned_interfaces_full = true;
            }
            return Err(ModError::InterfacesFull);
        }

        let idx = self.interfaces.len() as u16;
        self.interfaces.push(InterfaceRecord {
            name: name.to_string(),
            variability,
            parent,
            child_count: 0,
            providers: Providers::None,
            loaded: false,
            defined: false,
        });
        self.interface_names.insert(name.to_string(), idx);
        if let Some(p) = parent {
            self.bump_child(p);
        }
        if let Some(buf) = self.top_use.as_mut() {
            buf.expand_to(self.interfaces.len(), self.mods_len);
        }
        Ok(idx)
    }

    fn bump_child(&mut self, parent: u16) {
        let rec = &mut self.interfaces[parent as usize];
        if rec.child_count != CHILD_COUNT_SAT {
            rec.child_count += 1;
        }
    }

    /// Decrements a parent's child counter; leaving saturation requires an
    /// exact recount which must not see the child being removed.
    fn unbump_child(&mut self, parent: u16, removed_child: u16) {
        let rec = &mut self.interfaces[parent as usize];
        debug_assert!(rec.child_count != 0);
        if rec.child_count != CHILD_COUNT_SAT {
            rec.child_count -= 1;
            return;
        }
        let count = self
            .interfaces
            .iter()
            .enumerate()
            .filter(|(i, f)| *i != removed_child as usize && f.parent == Some(parent))
            .count();
        self.interfaces[parent as usize].child_count = count.min(CHILD_COUNT_SAT as usize) as u8;
    }

    fn has_providers(&self, idx: u16) -> bool {
        !matches!(self.interfaces[idx as usize].providers, Providers::None)
    }

    /// Resolves a parsed name shape to an interface index, creating every
    /// missing ancestor and validating the existing ones.
    pub(crate) fn intern_shape(&mut self, shape: &NameShape, mode: InternMode) -> Result<u16> {
        let mut parent = None;
        for &(prefix, implied) in &shape.parents {
            parent = Some(self.intern_parent(&shape.canonical[..prefix], implied, parent)?);
        }
        self.intern_leaf(shape, parent, mode)
    }

    /// Ensures an ancestor interface exists and accepts the extension.
    ///
    /// The sigil of the child name implies the parent's variability (`+`
    /// for multi, `=` for single children) and must agree with the
    /// existing record, under the same override-vs-error rules as a leaf
    /// redeclaration.
    fn intern_parent(
        &mut self,
        name: &str,
        implied: Variability,
        grandparent: Option<u16>,
    ) -> Result<u16> {
        let idx = match self.interface_names.get(name) {
            None => self.create_interface(name, implied, grandparent)?,
            Some(&idx) => {
                if self.iface(idx).variability != implied {
                    if self.has_providers(idx) || self.iface(idx).defined {
                        error!(
                            "Interface '{}' extension mismatch - expected {}.",
                            name,
                            self.iface(idx).variability.describe()
                        );
                        return Err(ModError::ExtensionMismatch {
                            name: name.to_string(),
                        });
                    }
                    if self.refs_count(RefKind::Interface, idx as usize) > 0 {
                        warn!("Overriding '{}' to expect {}.", name, implied.describe());
                    }
                    let rec = self.iface_mut(idx);
                    rec.variability = implied;
                    rec.child_count = 0;
                }
                self.check_extends(idx, grandparent)?;
                idx
            }
        };
        self.interfaces[idx as usize].defined = true;
        Ok(idx)
    }

    fn intern_leaf(
        &mut self,
        shape: &NameShape,
        parent: Option<u16>,
        mode: InternMode,
    ) -> Result<u16> {
        let idx = match self.interface_names.get(&shape.canonical) {
            None => {
                let variability = match mode {
                    InternMode::Def => shape.variability.unwrap_or(Variability::None),
                    InternMode::Use => Variability::None,
                };
                return self.create_interface(&shape.canonical, variability, parent);
            }
            Some(&idx) => idx,
        };

        if mode == InternMode::Def {
            let variability = shape.variability.unwrap_or(Variability::None);
            if self.iface(idx).variability != variability {
                if self.has_providers(idx) || self.iface(idx).defined {
                    error!(
                        "Interface '{}' extension mismatch - expected {}.",
                        shape.canonical,
                        self.iface(idx).variability.describe()
                    );
                    return Err(ModError::ExtensionMismatch {
                        name: shape.canonical.clone(),
                    });
                }
                if self.refs_count(RefKind::Interface, idx as usize) > 0 {
                    warn!(
                        "Overriding '{}' to expect {}.",
                        shape.canonical,
                        variability.describe()
                    );
                }
                let rec = self.iface_mut(idx);
                rec.variability = variability;
                rec.child_count = 0;
            }
        }
        self.check_extends(idx, parent)?;
        Ok(idx)
    }

    /// Validates that an existing record agrees on whether it extends a
    /// parent; an undefined, unreferenced record is overridden instead.
    fn check_extends(&mut self, idx: u16, parent: Option<u16>) -> Result<()> {
        let existing = self.iface(idx).parent;
        if existing.is_some() == parent.is_some() {
            // The parent is a prefix of the canonical name, so two extending
            // registrations cannot disagree on which interface it is.
            debug_assert!(existing == parent || parent.is_none());
            return Ok(());
        }

        if self.has_providers(idx) || self.refs_count(RefKind::Interface, idx as usize) > 0 {
            return Err(ModError::ExtendsMismatch {
                name: self.iface(idx).name.clone(),
            });
        }
        warn!(
            "Overriding '{}' expands to {}.",
            self.iface(idx).name,
            parent.is_some()
        );
        match (existing, parent) {
            (None, Some(p)) => {
                self.iface_mut(idx).parent = Some(p);
                self.bump_child(p);
            }
            (Some(old), None) => {
                self.iface_mut(idx).parent = None;
                self.unbump_child(old, idx);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Records `mod_idx` as a provider of `iface`.
    fn add_provider(&mut self, mod_idx: usize, iface: u16) {
        let rec = self.iface_mut(iface);
        rec.providers = match rec.providers {
            Providers::None => Providers::One(mod_idx as u16),
            Providers::One(_) => Providers::Many(2),
            Providers::Many(n) => Providers::Many(n + 1),
        };
        rec.defined = true;
    }

    /// Drops `mod_idx` from the providers of `iface`. Falling back from two
    /// providers to one requires scanning the module table for the sole
    /// remaining provider; the scan must skip the module being removed.
    fn remove_provider(&mut self, mod_idx: usize, iface: u16) {
        let providers = self.iface(iface).providers;
        let next = match providers {
            Providers::One(_) => Providers::None,
            Providers::Many(2) => {
                let remaining = (0..self.mods_len)
                    .find(|&i| {
                        i != mod_idx
                            && self.mods[i]
                                .record
                                .as_ref()
                                .is_some_and(|r| r.provides.iter().any(|p| p.iface == iface))
                    })
                    .unwrap_or_else(|| {
                        panic!(
                            "provider count for interface '{}' is out of sync",
                            self.iface(iface).name
                        )
                    });
                Providers::One(remaining as u16)
            }
            Providers::Many(n) => Providers::Many(n - 1),
            Providers::None => panic!(
                "removing a provider from interface '{}' which has none",
                self.iface(iface).name
            ),
        };
        self.iface_mut(iface).providers = next;
    }

    /// Withdraws every provider entry of module `n` and forgets its
    /// provides list.
    ///
    /// The root module stops competing with real providers the moment it
    /// becomes the root; its interfaces describe the application shell,
    /// not implementations to pick from.
    pub(crate) fn retire_provides(&mut self, n: usize) {
        let provides = std::mem::take(&mut self.record_mut(n).provides);
        for p in &provides {
            self.remove_provider(n, p.iface);
        }
    }

    // Module table.

    /// Registers a module and returns its handle.
    ///
    /// The definition and use strings are compiled immediately; every
    /// interface they mention is created in the interface table if missing.
    /// On any failure the registration rolls back without a trace, except
    /// that interfaces created by the attempt remain (undefined and
    /// providerless).
    pub fn register_module(&mut self, decl: ModuleDecl) -> Result<ModuleHandle> {
        // Allocate a slot, reusing gaps left by removed modules.
        let n = if self.mods_count == self.mods_len {
            if self.mods_len + 1 > MODULES_MAX {
                if !self.warned_modules_full {
                    error!(
                        "Module table at maximum capacity ({}), cannot add '{}'.",
                        MODULES_MAX, decl.def
                    );
                    self.warned_modules_full = true;
                }
                return Err(ModError::ModulesFull);
            }
            self.mods_len += 1;
            if self.mods.len() < self.mods_len {
                self.mods.push(ModuleSlot::default());
            }
            self.mods_len - 1
        } else {
            (0..self.mods_len)
                .find(|&i| self.mods[i].record.is_none())
                .unwrap_or_else(|| panic!("module count is out of sync"))
        };
        self.mods_count += 1;
        self.mods[n].iter = self.mods[n].iter.wrapping_add(1);
        let iter = self.mods[n].iter;

        match self.build_record(n, decl) {
            Ok(record) => {
                let summary = self.describe_module(&record);
                info!("Module {} (id {}) {} added.", record.name, n, summary);
                self.mods[n].record = Some(record);
                if let Some(buf) = self.top_use.as_mut() {
                    buf.expand_to(self.interfaces.len(), self.mods_len);
                }
                Ok(ModuleHandle::new(n as u32, iter))
            }
            Err(err) => {
                self.mods_count -= 1;
                Err(err)
            }
        }
    }

    /// Compiles a declaration into a module record, registering providers.
    fn build_record(&mut self, n: usize, decl: ModuleDecl) -> Result<ModuleRecord> {
        let mut provides = Vec::new();
        let result: Result<(String, String, Vec<UseRecord>)> = (|| {
            let def = parse_def(&decl.def)?;
            for clause in &def.provides {
                let iface = self.intern_shape(&clause.shape, InternMode::Def)?;
                self.add_provider(n, iface);
                provides.push(Provide {
                    iface,
                    version: clause.version.to_string(),
                });
            }

            let mut uses_static = Vec::new();
            for clause in parse_use(&decl.uses)? {
                let iface = self.intern_shape(&clause.shape, InternMode::Use)?;
                uses_static.push(UseRecord {
                    iface,
                    flags: clause.flags,
                    version: clause.version.to_string(),
                });
            }

            Ok((def.name.to_string(), def.version.to_string(), uses_static))
        })();

        match result {
            Ok((name, version, uses_static)) => Ok(ModuleRecord {
                comment: decl.comment,
                name,
                version,
                provides,
                uses_static,
                uses_live: Vec::new(),
                load: decl.load,
                unload: decl.unload,
                loaded: false,
                loading: false,
            }),
            Err(err) => {
                for p in &provides {
                    self.remove_provider(n, p.iface);
                }
                Err(err)
            }
        }
    }

    fn describe_module(&self, record: &ModuleRecord) -> String {
        let mut out = String::from("{ ");
        for p in &record.provides {
            let rec = self.iface(p.iface);
            let _ = write!(
                out,
                "{}{}; ",
                rec.name,
                match rec.variability {
                    Variability::None => "",
                    Variability::Single => "$",
                    Variability::Multi => "[]",
                }
            );
        }
        out.push('}');
        if !record.uses_static.is_empty() {
            out.push_str(" [ ");
            for (i, u) in record.uses_static.iter().enumerate() {
                let _ = write!(
                    out,
                    "{}{}{}{}",
                    self.iface(u.iface).name,
                    if u.version.is_empty() { "" } else { " " },
                    u.version,
                    if i + 1 < record.uses_static.len() {
                        ", "
                    } else {
                        ""
                    }
                );
            }
            out.push_str(" ]");
        }
        out
    }

    /// Removes a registered module.
    ///
    /// A loaded module is unloaded first; if references keep it alive the
    /// removal fails with [`ModError::ModuleInUse`] and the module stays
    /// registered.
    pub fn unregister_module(&mut self, handle: ModuleHandle) -> Result<()> {
        let n = self.module_index(handle)?;

        if self.record(n).loaded {
            if let Err(err) = self.unload_module(n) {
                debug_assert!(matches!(err, ModError::ModuleReferenced { .. }));
                return Err(ModError::ModuleInUse {
                    name: self.record(n).name.clone(),
                });
            }
        }

        let record = self.mods[n].record.take().unwrap_or_else(|| {
            panic!("module slot {} vanished during removal", n)
        });
        for p in &record.provides {
            self.remove_provider(n, p.iface);
        }
        self.mods_count -= 1;
        info!("Module {} removed.", record.name);

        // Drop trailing empty slots from the logical length; the slots
        // themselves stay so their generation counters survive.
        while self.mods_len > 0 && self.mods[self.mods_len - 1].record.is_none() {
            self.mods_len -= 1;
        }
        Ok(())
    }

    /// Approximate heap usage of the registry in bytes.
    pub fn memory_usage(&self) -> usize {
        let mut bytes = self.mods.capacity() * std::mem::size_of::<ModuleSlot>()
            + self.interfaces.capacity() * std::mem::size_of::<InterfaceRecord>();
        for slot in &self.mods {
            let Some(r) = &slot.record else { continue };
            bytes += r.comment.capacity() + r.name.capacity() + r.version.capacity();
            bytes += r.provides.capacity() * std::mem::size_of::<Provide>();
            bytes += r
                .provides
                .iter()
                .map(|p| p.version.capacity())
                .sum::<usize>();
            bytes += (r.uses_static.capacity() + r.uses_live.capacity())
                * std::mem::size_of::<UseRecord>();
            bytes += r
                .uses_static
                .iter()
                .chain(&r.uses_live)
                .map(|u| u.version.capacity())
                .sum::<usize>();
        }
        for rec in &self.interfaces {
            bytes += rec.name.capacity();
        }
        for name in self.interface_names.keys() {
            bytes += name.capacity() + std::mem::size_of::<u16>();
        }
        if let Some(buf) = &self.top_use {
            bytes += buf.heap_bytes();
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(def: &str, uses: &str) -> ModuleDecl {
        ModuleDecl {
            def: def.to_string(),
            uses: uses.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn register_and_remove() {
        let mut reg = RegistryInner::new();
        let handle = reg.register_module(decl("painter 1.0 | paint; brush 0:2", "")).unwrap();

        let n = reg.module_index(handle).unwrap();
        assert_eq!(reg.record(n).name, "painter");
        assert_eq!(reg.record(n).provides.len(), 2);
        assert_eq!(reg.interfaces.len(), 2);
        assert_eq!(reg.iface(0).providers, Providers::One(0));
        assert!(reg.iface(0).defined);

        reg.unregister_module(handle).unwrap();
        assert_eq!(reg.mods_count, 0);
        assert_eq!(reg.mods_len, 0);
        assert_eq!(reg.iface(0).providers, Providers::None);
        // Interfaces are never removed.
        assert_eq!(reg.interfaces.len(), 2);
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut reg = RegistryInner::new();
        let first = reg.register_module(decl("a | x", "")).unwrap();
        reg.unregister_module(first).unwrap();

        assert_eq!(reg.unregister_module(first), Err(ModError::InvalidHandle));

        // The slot is reused with a new generation.
        let second = reg.register_module(decl("b | y", "")).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.iter(), first.iter());
        assert_eq!(reg.module_index(first), Err(ModError::InvalidHandle));
        assert!(reg.module_index(second).is_ok());
    }

    #[test]
    fn provider_counts() {
        let mut reg = RegistryInner::new();
        let a = reg.register_module(decl("a | x 1", "")).unwrap();
        let b = reg.register_module(decl("b | x 2", "")).unwrap();
        let c = reg.register_module(decl("c | x 3", "")).unwrap();

        let iface = *reg.interface_names.get("x").unwrap();
        assert_eq!(reg.iface(iface).providers, Providers::Many(3));

        reg.unregister_module(a).unwrap();
        assert_eq!(reg.iface(iface).providers, Providers::Many(2));

        // Two-to-one switches back to the direct representation.
        reg.unregister_module(c).unwrap();
        assert_eq!(
            reg.iface(iface).providers,
            Providers::One(b.index() as u16)
        );

        reg.unregister_module(b).unwrap();
        assert_eq!(reg.iface(iface).providers, Providers::None);
    }

    #[test]
    fn children_are_counted() {
        let mut reg = RegistryInner::new();
        reg.register_module(decl("m | render[]", "")).unwrap();
        reg.register_module(decl("gl | render+gl", "")).unwrap();
        reg.register_module(decl("sw | render+sw", "")).unwrap();

        let render = *reg.interface_names.get("render").unwrap();
        assert_eq!(reg.iface(render).child_count, 2);
        assert_eq!(reg.iface(render).variability, Variability::Multi);

        let gl = *reg.interface_names.get("render-gl").unwrap();
        assert_eq!(reg.iface(gl).parent, Some(render));
    }

    #[test]
    fn variability_conflicts() {
        let mut reg = RegistryInner::new();
        reg.register_module(decl("m | control$", "")).unwrap();

        // Redeclaring a defined interface with a different shape fails.
        assert_eq!(
            reg.register_module(decl("n | control[]", "")),
            Err(ModError::ExtensionMismatch {
                name: "control".to_string()
            })
        );
        assert_eq!(
            reg.register_module(decl("n | control", "")),
            Err(ModError::ExtensionMismatch {
                name: "control".to_string()
            })
        );
        // The failed registrations rolled back.
        assert_eq!(reg.mods_count, 1);

        // The same shape is fine.
        reg.register_module(decl("n | control$", "")).unwrap();
    }

    #[test]
    fn use_only_interfaces_can_be_redefined() {
        let mut reg = RegistryInner::new();
        // A use clause creates the interface without defining it.
        reg.register_module(decl("a | x", "audio")).unwrap();
        let audio = *reg.interface_names.get("audio").unwrap();
        assert!(!reg.iface(audio).defined);

        // A later definition may give it a variability.
        reg.register_module(decl("b | audio$", "")).unwrap();
        assert_eq!(reg.iface(audio).variability, Variability::Single);
        assert!(reg.iface(audio).defined);
    }

    #[test]
    fn extending_a_plain_interface_fails() {
        let mut reg = RegistryInner::new();
        reg.register_module(decl("a | scene", "")).unwrap();
        assert_eq!(
            reg.register_module(decl("b | scene+gl", "")),
            Err(ModError::ExtensionMismatch {
                name: "scene".to_string()
            })
        );
    }

    #[test]
    fn extension_sigil_must_match_parent_variability() {
        let mut reg = RegistryInner::new();
        reg.register_module(decl("a | scene[]", "")).unwrap();

        // A '=' child implies a single-extendable parent; 'scene' is
        // multi-extendable.
        assert_eq!(
            reg.register_module(decl("b | scene=gl", "")),
            Err(ModError::ExtensionMismatch {
                name: "scene".to_string()
            })
        );
        // The same check applies to extension references in use strings.
        assert_eq!(
            reg.register_module(decl("c | x", "scene=ui")),
            Err(ModError::ExtensionMismatch {
                name: "scene".to_string()
            })
        );
        assert_eq!(reg.mods_count, 1);

        // The matching sigil is accepted.
        reg.register_module(decl("b | scene+gl", "")).unwrap();

        // Mirror case: a '+' child against a single-extendable parent.
        reg.register_module(decl("m | control$", "")).unwrap();
        assert_eq!(
            reg.register_module(decl("n | control+joy", "")),
            Err(ModError::ExtensionMismatch {
                name: "control".to_string()
            })
        );
        reg.register_module(decl("n | control=joy", "")).unwrap();
    }

    #[test]
    fn rollback_restores_providers() {
        let mut reg = RegistryInner::new();
        let a = reg.register_module(decl("a | x; scene", "")).unwrap();

        // 'b' adds a provider for 'x', then fails interning 'scene+gl'
        // against the plain 'scene'; the provider must be rolled back.
        let x = *reg.interface_names.get("x").unwrap();
        assert!(reg.register_module(decl("b | x; scene+gl", "")).is_err());
        assert_eq!(reg.iface(x).providers, Providers::One(a.index() as u16));
        assert_eq!(reg.mods_count, 1);
    }

    #[test]
    fn slot_gaps_are_reused() {
        let mut reg = RegistryInner::new();
        let a = reg.register_module(decl("a | x", "")).unwrap();
        let b = reg.register_module(decl("b | y", "")).unwrap();
        let c = reg.register_module(decl("c | z", "")).unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));

        reg.unregister_module(b).unwrap();
        assert_eq!(reg.mods_len, 3);

        let d = reg.register_module(decl("d | w", "")).unwrap();
        assert_eq!(d.index(), 1);
        assert_eq!(reg.mods_len, 3);

        // Removing the tail shrinks the logical length over the gap.
        reg.unregister_module(d).unwrap();
        reg.unregister_module(c).unwrap();
        assert_eq!(reg.mods_len, 1);
    }

    #[test]
    fn memory_usage_reports_something() {
        let mut reg = RegistryInner::new();
        let empty = reg.memory_usage();
        reg.register_module(decl("a 1.0 | x; y 0:2", "z 1; !w")).unwrap();
        assert!(reg.memory_usage() > empty);
    }
}
