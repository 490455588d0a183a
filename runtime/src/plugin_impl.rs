//! Exported C entry points, gathered with `inventory`
//!
//! Every `kernrun_*` function in [`crate::ffi`] is listed here so hosts that
//! link translated kernels at load time can find it by name through a
//! [`PluginRegistry`].

use kernrun_plugin::{PluginRegistry, RegistryError, RuntimePlugin, Symbol};

pub const PLUGIN_NAME: &str = "kernrun_runtime";

/// One entry in the export table.
pub struct ExportedSymbol(Symbol);

// Holds the address of an `extern "C"` function; never written.
unsafe impl Sync for ExportedSymbol {}

impl ExportedSymbol {
    pub const fn new(name: &'static str, addr: *const u8) -> Self {
        ExportedSymbol(Symbol::new(name, addr))
    }
}

inventory::collect!(ExportedSymbol);

/// Export functions of [`crate::ffi`] under their own names.
macro_rules! export {
    ($($func:ident),+ $(,)?) => {
        $(
            inventory::submit! {
                ExportedSymbol::new(stringify!($func), crate::ffi::$func as *const u8)
            }
        )+
    };
}

// Memory
export!(
    kernrun_alloc_buffer,
    kernrun_free_buffer,
    kernrun_alloc_image_rgba,
    kernrun_free_image,
);

// Context lifetime
export!(
    kernrun_alloc_dispatch_context,
    kernrun_free_dispatch_context,
    kernrun_alloc_thread_context,
    kernrun_free_thread_context,
);

// Dispatch
export!(kernrun_prepare_dispatch, kernrun_dispatch_thread);

/// The runtime's export table as a [`RuntimePlugin`].
#[derive(Debug, Default, Clone, Copy)]
pub struct KernrunRuntimePlugin;

impl RuntimePlugin for KernrunRuntimePlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = inventory::iter::<ExportedSymbol>
            .into_iter()
            .map(|exported| exported.0)
            .collect();
        symbols.sort_by_key(|s| s.name);
        symbols
    }

    fn on_load(&self) -> Result<(), String> {
        log::debug!("{} loaded", PLUGIN_NAME);
        Ok(())
    }
}

pub fn get_plugin() -> Box<dyn RuntimePlugin> {
    Box::new(KernrunRuntimePlugin)
}

/// A registry with the runtime plugin loaded.
pub fn registry() -> Result<PluginRegistry, RegistryError> {
    let mut registry = PluginRegistry::new();
    registry.register(get_plugin())?;
    Ok(registry)
}
