use crate::utils::AddressRange;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A loaded binary image (executable or shared library) mapped into the
/// address space of the process.
///
/// A `Module` is immutable once built. An *invalid* module is the sentinel
/// cached for an address that no known module contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    base_address: usize,
    id: String,
    filename: PathBuf,
    size: usize,
    is_valid: bool,
}

impl Module {
    /// Creates a valid module. `size` may be 0 when the mapped size is
    /// unknown, in which case the module only contains `base_address` itself.
    pub fn new(base_address: usize, id: impl Into<String>, filename: impl Into<PathBuf>, size: usize) -> Self {
        Self {
            base_address,
            id: id.into(),
            filename: filename.into(),
            size,
            is_valid: true,
        }
    }

    /// Creates the sentinel standing for "no module at `address`".
    pub fn invalid(address: usize) -> Self {
        Self {
            base_address: address,
            id: String::new(),
            filename: PathBuf::new(),
            size: 0,
            is_valid: false,
        }
    }

    /// The lowest address at which the image is mapped.
    #[inline]
    pub fn base_address(&self) -> usize {
        self.base_address
    }

    /// An opaque string that identifies a particular build of the image with
    /// high probability. For ELF binaries this is the hex encoded contents of
    /// the `.note.gnu.build-id` note.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    /// `[base_address, base_address + size)`.
    #[inline]
    pub fn address_range(&self) -> AddressRange {
        AddressRange::new(self.base_address, self.size)
    }

    /// Determine whether the target address belongs to this module. A module
    /// of unknown size only contains its base address.
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        if self.size == 0 {
            address == self.base_address
        } else {
            self.address_range().contains(address)
        }
    }
}

/// Platform capability that builds a [Module] for an arbitrary address by
/// inspecting the loader state of the current process.
///
/// Returns `None` if the address does not belong to any loaded module.
pub trait ModuleLocator {
    fn create_module_for_address(&mut self, address: usize) -> Option<Module>;
}

impl<F> ModuleLocator for F
where
    F: FnMut(usize) -> Option<Module>,
{
    fn create_module_for_address(&mut self, address: usize) -> Option<Module> {
        self(address)
    }
}

/// Address-keyed cache of the modules loaded in the process.
///
/// Entries are keyed by base address and are never removed: a module that
/// gets unloaded keeps its entry so addresses already attributed to it stay
/// meaningful. Lookups that hit no module cache an invalid sentinel keyed at
/// the queried address, so the platform locator runs at most once for it.
///
/// `ModuleCache` is meant to be owned by a single consumer (usually the
/// profiler thread). The returned [Module]s can be shared freely.
pub struct ModuleCache {
    modules: BTreeMap<usize, Arc<Module>>,
    locator: Box<dyn ModuleLocator + Send>,
}

impl ModuleCache {
    /// Creates a cache backed by the dynamic loader of the current process.
    #[cfg(target_os = "linux")]
    pub fn new() -> Self {
        Self::with_locator(crate::dyld::DynamicLoaderLocator::default())
    }

    /// Creates a cache backed by a custom locator.
    pub fn with_locator<L>(locator: L) -> Self
    where
        L: ModuleLocator + Send + 'static,
    {
        Self {
            modules: BTreeMap::new(),
            locator: Box::new(locator),
        }
    }

    /// Returns the module containing `address`, or the cached invalid sentinel
    /// for it.
    ///
    /// Repeated lookups of the same address return the same `Arc`, with one
    /// exception: when a module becomes loadable at an address whose sentinel
    /// is cached under the module's own base address, the valid module
    /// replaces that sentinel and is returned from then on.
    pub fn module_for_address(&mut self, address: usize) -> Arc<Module> {
        if let Some(module) = self.cached(address) {
            return module;
        }
        match self.locator.create_module_for_address(address) {
            Some(module) if module.is_valid() => {
                let contains = module.contains(address);
                let module = self.insert(module);
                if contains {
                    return module;
                }
                log::debug!(
                    "module at {:#x} does not contain the queried address {:#x}",
                    module.base_address(),
                    address
                );
                self.insert(Module::invalid(address))
            }
            _ => {
                log::trace!("no module found for {:#x}", address);
                self.insert(Module::invalid(address))
            }
        }
    }

    /// Returns every entry created so far, including invalid sentinels,
    /// ordered by base address.
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.modules.values().cloned().collect()
    }

    /// Returns the number of cached entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Walks down from the greatest base address <= `address`. Sentinels only
    /// match their own address, so they are skipped until the nearest valid
    /// module decides the lookup; valid modules never overlap.
    fn cached(&self, address: usize) -> Option<Arc<Module>> {
        for (_, module) in self.modules.range(..=address).rev() {
            if module.contains(address) {
                return Some(module.clone());
            }
            if module.is_valid() {
                break;
            }
        }
        None
    }

    /// At most one entry per base address. A valid module replaces a sentinel
    /// keyed at its base address; any other collision keeps the existing entry.
    fn insert(&mut self, module: Module) -> Arc<Module> {
        match self.modules.entry(module.base_address) {
            Entry::Occupied(mut e) => {
                if !e.get().is_valid() && module.is_valid() {
                    log::debug!("replacing sentinel at {:#x} with {:?}", module.base_address, module.filename);
                    e.insert(Arc::new(module));
                }
                e.get().clone()
            }
            Entry::Vacant(e) => {
                if module.is_valid() {
                    log::debug!(
                        "cached module {:?} at {:#x} (size {:#x}, id {:?})",
                        module.filename,
                        module.base_address,
                        module.size,
                        module.id
                    );
                }
                e.insert(Arc::new(module)).clone()
            }
        }
    }
}

#[cfg(target_os = "linux")]
impl Default for ModuleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCache").field("modules", &self.modules).finish()
    }
}
