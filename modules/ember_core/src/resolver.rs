//! Dependency resolution and module activation.
//!
//! The resolver walks compiled use lists, chooses providers, and drives the
//! load/unload callbacks in dependency order. All of it runs on the single
//! thread holding the registry; re-entrant calls from inside a load
//! callback operate on the same [`RegistryInner`] the callback received.
use crate::refbuf::RefKind;
use crate::registry::{InternMode, Providers, RegistryInner, Result, UseRecord};
use ember_module::parse::USES_MAX;
use ember_module::{parse_use, ModError, ModuleHandle};
use log::{debug, error, info, warn};
use std::cmp::Ordering;

impl RegistryInner {
    /// Activates the interfaces of `uses` on behalf of the module.
    ///
    /// The first successful call overall makes the calling module the root
    /// of the resolution: the root is loaded first, owns the live
    /// reference buffer, and stays loaded until the registry is dropped.
    /// The executed clauses are recorded (without their version strings) so
    /// that [`RegistryInner::unuse_interfaces`] can reverse them later.
    pub fn use_interfaces(&mut self, handle: ModuleHandle, uses: &str) -> Result<()> {
        let n = self.module_index(handle)?;
        self.use_interfaces_at(n, uses)
    }

    pub(crate) fn use_interfaces_at(&mut self, n: usize, uses: &str) -> Result<()> {
        if self.root_mod() == Some(n) && self.use_level() > 0 {
            error!("The root module is not supposed to be active during any initialisation.");
            return Err(ModError::RootReentrancy);
        }

        let compiled = self.compile_uses(uses)?;
        if self.record(n).uses_live.len() + compiled.len() > USES_MAX {
            return Err(ModError::LiveUsesFull);
        }

        self.enter_use_level();
        let result = self.run_use(n, &compiled);
        self.leave_use_level();
        result?;

        // Keep the executed clauses, versions elided, so a later unuse can
        // reverse them precisely.
        let rec = self.record_mut(n);
        for u in compiled {
            rec.uses_live.push(UseRecord {
                iface: u.iface,
                flags: u.flags,
                version: String::new(),
            });
        }
        Ok(())
    }

    fn run_use(&mut self, n: usize, compiled: &[UseRecord]) -> Result<()> {
        let mut root = false;
        if !self.top_use_is_live() {
            root = true;
            self.set_root_mod(n);
            {
                let rec = self.record(n);
                info!("Root module: {} {}.", rec.name, rec.version);
            }
            self.retire_provides(n);
            self.create_top_use();
            if let Err(err) = self.load_module(n) {
                error!("Root module failed to load, this is the end.");
                return Err(err);
            }
            self.record_mut(n).loading = true;
        }

        let result = self.execute_use(compiled);

        if root {
            self.record_mut(n).loading = false;
            info!(
                "Root module {}initialized, control can be handed over.",
                if result.is_ok() { "" } else { "NOT " }
            );
        }
        result
    }

    /// Compiles a use string, interning every named interface.
    fn compile_uses(&mut self, uses: &str) -> Result<Vec<UseRecord>> {
        let clauses = parse_use(uses)?;
        let mut out = Vec::with_capacity(clauses.len());
        for clause in clauses {
            let iface = self.intern_shape(&clause.shape, InternMode::Use)?;
            out.push(UseRecord {
                iface,
                flags: clause.flags,
                version: clause.version.to_string(),
            });
        }
        Ok(out)
    }

    /// Executes a compiled use list in clause order.
    ///
    /// On failure every reference taken by the preceding clauses of this
    /// call is dropped again; references of earlier calls are untouched.
    fn execute_use(&mut self, uses: &[UseRecord]) -> Result<()> {
        for (i, u) in uses.iter().enumerate() {
            if let Err(err) = self.execute_clause(u) {
                for undo in uses[..i].iter().rev() {
                    if undo.flags.incompat {
                        continue;
                    }
                    let provider = self.provider_of(undo.iface);
                    self.refs_remove(RefKind::Module, provider);
                    self.refs_remove(RefKind::Interface, undo.iface as usize);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn execute_clause(&mut self, u: &UseRecord) -> Result<()> {
        if u.flags.incompat {
            if self.iface(u.iface).loaded {
                return Err(ModError::IncompatibleLoaded {
                    name: self.iface(u.iface).name.clone(),
                });
            }
            // Nothing is loaded that would conflict; the clause holds no
            // reference either.
            return Ok(());
        }

        if matches!(self.iface(u.iface).providers, Providers::None) {
            return Err(ModError::NoProvider {
                name: self.iface(u.iface).name.clone(),
            });
        }

        // An already loaded provider is revalidated against the required
        // version by the selection below.
        let module = self.select_provider(u.iface, &u.version)?;
        self.refs_add(RefKind::Module, module);
        self.refs_add(RefKind::Interface, u.iface as usize);
        Ok(())
    }

    /// The loaded module providing `iface`.
    ///
    /// # Panics
    ///
    /// Panics if no loaded module provides it; interfaces marked loaded
    /// always have exactly one loaded provider.
    pub(crate) fn provider_of(&self, iface: u16) -> usize {
        debug_assert!(self.iface(iface).loaded);
        for n in 0..self.mods_len() {
            let Some(rec) = &self.slot(n).record else {
                continue;
            };
            if rec.loaded && rec.provides.iter().any(|p| p.iface == iface) {
                return n;
            }
        }
        panic!(
            "interface '{}' is marked loaded but no loaded module provides it",
            self.iface(iface).name
        );
    }

    /// Finds and activates the preferred provider for `iface`.
    ///
    /// Does not take any references itself.
    fn select_provider(&mut self, iface: u16, required: &str) -> Result<usize> {
        struct Candidate {
            module: usize,
            version: String,
            works: bool,
        }

        let mut candidates = Vec::new();
        match self.iface(iface).providers {
            Providers::None => unreachable!("caller checks for providers"),
            Providers::One(m) => {
                let rec = self.record(m as usize);
                let version = rec
                    .provides
                    .iter()
                    .find(|p| p.iface == iface)
                    .unwrap_or_else(|| {
                        panic!(
                            "module '{}' is recorded as provider of '{}' but does not provide it",
                            rec.name,
                            self.iface(iface).name
                        )
                    })
                    .version
                    .clone();
                candidates.push(Candidate {
                    module: m as usize,
                    version,
                    works: true,
                });
            }
            Providers::Many(count) => {
                for n in 0..self.mods_len() {
                    let Some(rec) = &self.slot(n).record else {
                        continue;
                    };
                    if let Some(p) = rec.provides.iter().find(|p| p.iface == iface) {
                        candidates.push(Candidate {
                            module: n,
                            version: p.version.clone(),
                            works: true,
                        });
                    }
                }
                debug_assert_eq!(candidates.len(), count as usize);
            }
        }

        // An active provider that is referenced must be kept; one that is
        // merely loaded may still be superseded below.
        let mut prev_prov = None;
        for c in &candidates {
            let rec = self.record(c.module);
            if !rec.loaded && !rec.loading {
                continue;
            }
            debug_assert!(
                prev_prov.is_none(),
                "multiple active providers for '{}'",
                self.iface(iface).name
            );
            if self.refs_count(RefKind::Module, c.module) > 0 {
                if ember_version::compatible(required, &c.version) {
                    return Ok(c.module);
                }
                return Err(ModError::NoCompatibleProvider {
                    name: self.iface(iface).name.clone(),
                });
            }
            prev_prov = Some(c.module);
        }

        loop {
            // Highest compatible version wins; between equal versions the
            // later registration does.
            let mut best: Option<usize> = None;
            for i in 0..candidates.len() {
                if !candidates[i].works {
                    continue;
                }
                if !ember_version::compatible(required, &candidates[i].version) {
                    candidates[i].works = false;
                    continue;
                }
                best = match best {
                    Some(b)
                        if ember_version::compare(
                            &candidates[b].version,
                            &candidates[i].version,
                        ) == Ordering::Greater =>
                    {
                        Some(b)
                    }
                    _ => Some(i),
                };
            }
            let Some(b) = best else { break };
            let chosen = candidates[b].module;

            if prev_prov == Some(chosen) {
                // Loaded earlier and unreferenced; no reload needed.
                return Ok(chosen);
            }
            if let Some(prev) = prev_prov.take() {
                // The superseded provider holds no references; the unload
                // cannot be refused.
                let _ = self.unload_module(prev);
            }

            match self.load_module(chosen) {
                Ok(()) => return Ok(chosen),
                Err(err) => {
                    let rec = self.record(chosen);
                    warn!(
                        "Unsuccessful load of provider {} {} for interface {} {}: {}.",
                        rec.name,
                        rec.version,
                        self.iface(iface).name,
                        required,
                        err
                    );
                    candidates[b].works = false;
                }
            }
        }

        error!(
            "Failed to find a provider module for interface {} {}.",
            self.iface(iface).name,
            required
        );
        Err(ModError::NoCompatibleProvider {
            name: self.iface(iface).name.clone(),
        })
    }

    /// Loads a module: eliminates provider conflicts, activates its
    /// dependencies and runs its load callback.
    pub(crate) fn load_module(&mut self, n: usize) -> Result<()> {
        if self.record(n).loaded {
            return Ok(());
        }
        debug_assert!(
            !self.record(n).loading,
            "recursive load of module '{}'",
            self.record(n).name
        );
        self.record_mut(n).loading = true;
        let result = self.load_module_steps(n);
        if let Some(rec) = self.record_opt_mut(n) {
            rec.loading = false;
        }
        result
    }

    fn load_module_steps(&mut self, n: usize) -> Result<()> {
        let (name, version, provides, uses) = {
            let rec = self.record(n);
            (
                rec.name.clone(),
                rec.version.clone(),
                rec.provides.iter().map(|p| p.iface).collect::<Vec<_>>(),
                rec.uses_static
                    .iter()
                    .chain(&rec.uses_live)
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        };

        // A provided interface that is referenced, or loaded by a module
        // that cannot be unloaded, blocks the load.
        for &iface in &provides {
            if self.refs_count(RefKind::Interface, iface as usize) > 0 {
                debug!(
                    "Cannot load module {} {} - interface {} already referenced.",
                    name,
                    version,
                    self.iface(iface).name
                );
                return Err(ModError::ProvidedInterfaceInUse {
                    name: self.iface(iface).name.clone(),
                });
            }
            if !self.iface(iface).loaded {
                continue;
            }
            let conflicting = self.provider_of(iface);
            match self.unload_module(conflicting) {
                Ok(()) => {}
                Err(ModError::ModuleReferenced { .. }) => {
                    debug!(
                        "Cannot load module {} {} - conflicting interface {} provider required.",
                        name,
                        version,
                        self.iface(iface).name
                    );
                    return Err(ModError::ConflictRequired {
                        name: self.iface(iface).name.clone(),
                    });
                }
                Err(_) => {
                    debug!(
                        "Cannot load module {} {} - conflicting interface {} provider unload \
                         failure.",
                        name,
                        version,
                        self.iface(iface).name
                    );
                    return Err(ModError::ConflictUnloadFailed {
                        name: self.iface(iface).name.clone(),
                    });
                }
            }
        }

        if self.execute_use(&uses).is_err() {
            warn!(
                "Failed to satisfy dependencies for module {} {}.",
                name, version
            );
            return Err(ModError::DependencyFailed { name });
        }

        info!("Loading module {} {}..", name, version);
        let rv = self.invoke_load(n);
        if rv < 0 {
            warn!(
                "Failed to load module {} {} (returned {}).",
                name, version, rv
            );
            // The dependencies were referenced above; give those references
            // back before reporting.
            for u in &uses {
                if u.flags.incompat {
                    continue;
                }
                let provider = self.provider_of(u.iface);
                self.refs_remove(RefKind::Module, provider);
                self.refs_remove(RefKind::Interface, u.iface as usize);
            }
            return Err(ModError::LoadCallbackFailed { name, code: rv });
        }
        info!("Module {} {} loaded.", name, version);

        if let Some(rec) = self.record_opt_mut(n) {
            rec.loaded = true;
        }
        for &iface in &provides {
            self.iface_mut(iface).loaded = true;
        }
        Ok(())
    }

    fn invoke_load(&mut self, n: usize) -> i32 {
        let iter = self.slot(n).iter;
        let Some(mut f) = self.record_opt_mut(n).and_then(|r| r.load.take()) else {
            return 0;
        };
        let rv = f(self);
        // Reinstall unless the callback recycled its own slot.
        if self.slot(n).iter == iter {
            if let Some(rec) = self.record_opt_mut(n) {
                rec.load = Some(f);
            }
        }
        rv
    }

    fn invoke_unload(&mut self, n: usize) -> i32 {
        let iter = self.slot(n).iter;
        let Some(mut f) = self.record_opt_mut(n).and_then(|r| r.unload.take()) else {
            return 0;
        };
        let rv = f(self);
        if self.slot(n).iter == iter {
            if let Some(rec) = self.record_opt_mut(n) {
                rec.unload = Some(f);
            }
        }
        rv
    }

    /// Unloads a module that holds no references.
    ///
    /// The module's own dependencies are dereferenced but stay loaded;
    /// [`RegistryInner::cleanup`] collects them later.
    ///
    /// # Panics
    ///
    /// Panics if the unload callback returns a negative value; there is no
    /// safe recovery from a half-unloaded module.
    pub(crate) fn unload_module(&mut self, n: usize) -> Result<()> {
        debug_assert!(self.record(n).loaded);
        let (name, version) = {
            let rec = self.record(n);
            (rec.name.clone(), rec.version.clone())
        };

        let count = self.refs_count(RefKind::Module, n);
        if count > 0 {
            debug!(
                "Cannot unload module {} {} - it is referenced {} times.",
                name, version, count
            );
            return Err(ModError::ModuleReferenced { name, count });
        }

        let rv = self.invoke_unload(n);
        assert!(
            rv >= 0,
            "unload callback of module '{}' returned {}",
            name,
            rv
        );
        info!("Module {} {} unloaded.", name, version);

        let (provides, uses) = {
            let rec = self.record(n);
            (
                rec.provides.iter().map(|p| p.iface).collect::<Vec<_>>(),
                rec.uses_static
                    .iter()
                    .chain(&rec.uses_live)
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        };
        self.record_mut(n).loaded = false;
        for &iface in &provides {
            debug_assert!(self.iface(iface).loaded);
            debug_assert_eq!(self.refs_count(RefKind::Interface, iface as usize), 0);
            self.iface_mut(iface).loaded = false;
        }

        for u in &uses {
            if u.flags.incompat {
                continue;
            }
            self.refs_remove(RefKind::Interface, u.iface as usize);
            let provider = self.provider_of(u.iface);
            self.refs_remove(RefKind::Module, provider);
        }
        Ok(())
    }

    /// Releases interfaces previously activated with
    /// [`RegistryInner::use_interfaces`].
    ///
    /// Clauses that have no matching live-use entry are skipped with a
    /// warning. The providers stay loaded; call
    /// [`RegistryInner::cleanup`] to unload what is no longer referenced.
    pub fn unuse_interfaces(&mut self, handle: ModuleHandle, uses: &str) -> Result<()> {
        let n = self.module_index(handle)?;
        let compiled = self.compile_uses(uses)?;

        // An unloaded module's references were already dropped by its
        // unload; only the live-use records remain to be removed.
        let holds_refs = self.record(n).loaded;
        for u in &compiled {
            let pos = self
                .record(n)
                .uses_live
                .iter()
                .position(|l| l.iface == u.iface && l.flags == u.flags);
            let Some(pos) = pos else {
                warn!(
                    "Module {} never used interface {}; nothing to release.",
                    self.record(n).name,
                    self.iface(u.iface).name
                );
                continue;
            };
            self.record_mut(n).uses_live.remove(pos);
            if u.flags.incompat || !holds_refs {
                continue;
            }
            self.refs_remove(RefKind::Interface, u.iface as usize);
            let provider = self.provider_of(u.iface);
            self.refs_remove(RefKind::Module, provider);
        }
        Ok(())
    }

    /// Unloads every loaded module whose reference count dropped to zero.
    ///
    /// A single forward pass over the module table; unloading a module may
    /// zero the count of a lower-index module, which the next call picks
    /// up.
    pub fn cleanup(&mut self) {
        if !self.top_use_is_live() {
            return;
        }
        for n in 0..self.mods_len() {
            let Some(rec) = &self.slot(n).record else {
                continue;
            };
            if !rec.loaded {
                continue;
            }
            if self.refs_count(RefKind::Module, n) > 0 {
                continue;
            }
            // The count is zero, so the unload cannot be refused.
            let _ = self.unload_module(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleDecl;

    fn decl(def: &str, uses: &str) -> ModuleDecl {
        ModuleDecl {
            def: def.to_string(),
            uses: uses.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn live_uses_elide_versions() {
        let mut reg = RegistryInner::new();
        let main = reg.register_module(decl("main | entry", "")).unwrap();
        reg.register_module(decl("a | i-a 0:2", "")).unwrap();

        reg.use_interfaces(main, "i-a 0:1").unwrap();

        let rec = reg.record(main.index());
        assert_eq!(rec.uses_live.len(), 1);
        assert!(rec.uses_live[0].version.is_empty());
    }

    #[test]
    fn unuse_releases_references() {
        let mut reg = RegistryInner::new();
        let main = reg.register_module(decl("main | entry", "")).unwrap();
        let a = reg.register_module(decl("a | i-a", "")).unwrap();
        let h = reg.register_module(decl("h | i-h", "")).unwrap();

        reg.use_interfaces(main, "i-h").unwrap();
        // The loaded helper takes a live use of its own.
        reg.use_interfaces(h, "i-a").unwrap();
        assert_eq!(reg.refs_count(RefKind::Module, a.index()), 1);

        reg.unuse_interfaces(h, "i-a").unwrap();
        assert_eq!(reg.refs_count(RefKind::Module, a.index()), 0);
        assert!(reg.record(h.index()).uses_live.is_empty());
    }

    #[test]
    fn unload_drops_dependency_references() {
        let mut reg = RegistryInner::new();
        let main = reg.register_module(decl("main | entry", "")).unwrap();
        reg.register_module(decl("b | i-b", "i-a")).unwrap();
        let a = reg.register_module(decl("a | i-a", "")).unwrap();

        reg.use_interfaces(main, "i-b").unwrap();
        assert_eq!(reg.refs_count(RefKind::Module, a.index()), 1);

        reg.unuse_interfaces(main, "i-b").unwrap();
        reg.cleanup();
        // Unloading b gave back its reference on a; the dependency sits at
        // a higher index, so the same forward pass collected it too.
        assert_eq!(reg.refs_count(RefKind::Module, a.index()), 0);
        assert!(!reg.record(a.index()).loaded);
    }
}

impl Drop for RegistryInner {
    /// Unloads the root module at teardown.
    ///
    /// Runs the unload callback without the usual fatal assertion; a
    /// failure this late is only logged.
    fn drop(&mut self) {
        let Some(root) = self.root_mod() else { return };
        if !self.record_opt(root).is_some_and(|r| r.loaded) {
            return;
        }
        if self.refs_count(RefKind::Module, root) > 0 {
            warn!("Root module is still referenced at teardown.");
            return;
        }
        let rv = self.invoke_unload(root);
        if rv < 0 {
            error!(
                "Unload callback of the root module returned {} at teardown.",
                rv
            );
        }
        let provides = match self.record_opt_mut(root) {
            Some(rec) => {
                rec.loaded = false;
                rec.provides.iter().map(|p| p.iface).collect::<Vec<_>>()
            }
            None => Vec::new(),
        };
        for iface in provides {
            self.iface_mut(iface).loaded = false;
        }
    }
}
