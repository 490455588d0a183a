//! Symbol registry for runtime plugins
//!
//! Hosts that load translated kernels at runtime (through a JIT or a dynamic
//! linker) resolve the runtime's C entry points by name. Each
//! [`RuntimePlugin`] exports a list of [`Symbol`]s; a [`PluginRegistry`]
//! indexes them and refuses a second plugin that exports an already
//! registered name at a different address.
//!
//! ```rust,ignore
//! let registry = kernrun_runtime::plugin_impl::registry()?;
//! for symbol in registry.symbols() {
//!     linker.define(symbol.name, symbol.addr);
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

/// A named entry point with C calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub name: &'static str,
    pub addr: *const u8,
}

impl Symbol {
    pub const fn new(name: &'static str, addr: *const u8) -> Self {
        Symbol { name, addr }
    }
}

/// A set of entry points exported under one plugin name.
pub trait RuntimePlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Every exported symbol. Addresses must stay valid while the plugin is
    /// registered.
    fn symbols(&self) -> Vec<Symbol>;

    /// Runs before the plugin's symbols become resolvable.
    fn on_load(&self) -> Result<(), String> {
        Ok(())
    }

    /// Runs after the plugin's symbols were withdrawn.
    fn on_unload(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicatePlugin(String),
    UnknownPlugin(String),
    /// `symbol` is already exported by `owner` at another address.
    SymbolConflict {
        symbol: &'static str,
        owner: String,
    },
    Hook {
        plugin: String,
        message: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicatePlugin(name) => {
                write!(f, "plugin '{}' is already registered", name)
            }
            RegistryError::UnknownPlugin(name) => write!(f, "plugin '{}' is not registered", name),
            RegistryError::SymbolConflict { symbol, owner } => {
                write!(f, "symbol '{}' is already exported by '{}'", symbol, owner)
            }
            RegistryError::Hook { plugin, message } => {
                write!(f, "plugin '{}' hook failed: {}", plugin, message)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Clone, Copy)]
struct Entry {
    addr: *const u8,
    // Index into `plugins`.
    owner: usize,
}

/// Registered plugins and a name index over their symbols.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn RuntimePlugin>>,
    index: BTreeMap<&'static str, Entry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `plugin` and index its symbols. Nothing changes if the name is
    /// taken, a symbol conflicts, or `on_load` fails.
    pub fn register(&mut self, plugin: Box<dyn RuntimePlugin>) -> Result<(), RegistryError> {
        let name = plugin.name().to_string();
        if self.position(&name).is_some() {
            return Err(RegistryError::DuplicatePlugin(name));
        }

        let owner = self.plugins.len();
        let mut added: BTreeMap<&'static str, Entry> = BTreeMap::new();
        for symbol in plugin.symbols() {
            let existing = self
                .index
                .get(symbol.name)
                .or_else(|| added.get(symbol.name))
                .copied();
            match existing {
                Some(entry) if entry.addr == symbol.addr => {}
                Some(entry) => {
                    let owner = match self.plugins.get(entry.owner) {
                        Some(p) => p.name().to_string(),
                        None => name.clone(),
                    };
                    return Err(RegistryError::SymbolConflict {
                        symbol: symbol.name,
                        owner,
                    });
                }
                None => {
                    added.insert(
                        symbol.name,
                        Entry {
                            addr: symbol.addr,
                            owner,
                        },
                    );
                }
            }
        }

        plugin.on_load().map_err(|message| RegistryError::Hook {
            plugin: name,
            message,
        })?;
        self.plugins.push(plugin);
        self.index.extend(added);
        Ok(())
    }

    /// Remove a plugin and its symbols, then run its unload hook.
    pub fn unregister(&mut self, name: &str) -> Result<(), RegistryError> {
        let removed = self
            .position(name)
            .ok_or_else(|| RegistryError::UnknownPlugin(name.to_string()))?;
        let plugin = self.plugins.remove(removed);

        self.index.retain(|_, entry| entry.owner != removed);
        for entry in self.index.values_mut() {
            if entry.owner > removed {
                entry.owner -= 1;
            }
        }

        plugin.on_unload().map_err(|message| RegistryError::Hook {
            plugin: name.to_string(),
            message,
        })
    }

    pub fn resolve(&self, symbol: &str) -> Option<*const u8> {
        self.index.get(symbol).map(|entry| entry.addr)
    }

    /// Name of the plugin exporting `symbol`.
    pub fn owner(&self, symbol: &str) -> Option<&str> {
        let entry = self.index.get(symbol)?;
        self.plugins.get(entry.owner).map(|p| p.name())
    }

    /// Every indexed symbol, sorted by name.
    pub fn symbols(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.index
            .iter()
            .map(|(&name, entry)| Symbol::new(name, entry.addr))
    }

    /// Plugin names in registration order.
    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn plugin(&self, name: &str) -> Option<&dyn RuntimePlugin> {
        self.position(name).map(|i| &*self.plugins[i])
    }

    /// Number of indexed symbols.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.plugins.iter().position(|p| p.name() == name)
    }
}
