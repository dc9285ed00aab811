// SPDX-License-Identifier: CEPL-1.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use tracing::debug;

use crate::{
    LoadSceneFn, NativeLoadSceneFn, PluginError, Scene, SceneLoader, SceneModule,
    LOAD_SCENE_SYMBOL,
};

/// Platform file name for a scene stem: `game` → `libgame.so`, `game.dll`,
/// `libgame.dylib`.
pub fn library_file_name(stem: &str) -> String {
    libloading::library_filename(stem)
        .to_string_lossy()
        .into_owned()
}

/// Loads scene modules from shared libraries on disk.
#[derive(Debug, Default, Clone)]
pub struct NativeLoader {
    search_dir: Option<PathBuf>,
}

impl NativeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve bare library names relative to `dir` instead of the system
    /// search path.
    pub fn with_search_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            search_dir: Some(dir.into()),
        }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        match &self.search_dir {
            Some(dir) if Path::new(name).is_relative() => dir.join(name),
            _ => PathBuf::from(name),
        }
    }
}

struct NativeModule {
    name: String,
    entry: NativeLoadSceneFn,
    // Keeps `entry` mapped.
    _library: Library,
}

impl SceneModule for NativeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self, scene: &mut Scene) {
        // SAFETY: `entry` follows the C-ABI scene contract and the library
        // that provides it is still mapped.
        unsafe { call_native(self.entry, scene) }
    }
}

/// # Safety
/// `entry` must be a live function with the [`NativeLoadSceneFn`] contract.
unsafe fn call_native(entry: NativeLoadSceneFn, scene: &mut Scene) {
    unsafe { entry(scene as *mut Scene) }
}

impl SceneLoader for NativeLoader {
    fn open(&self, name: &str) -> Result<Box<dyn SceneModule>, PluginError> {
        let path = self.resolve(name);
        debug!("opening scene library {}", path.display());

        // SAFETY: loading a library runs its initializers. Scene libraries are
        // trusted engine plugins.
        let library = unsafe { Library::new(&path) }.map_err(|e| PluginError::NotFound {
            name: name.to_owned(),
            reason: e.to_string(),
        })?;

        // SAFETY: scene libraries export `LoadScene` as an unmangled
        // `extern "C"` function matching `NativeLoadSceneFn`. The copied
        // pointer stays valid while `library` is alive, and `NativeModule`
        // owns both.
        let entry: NativeLoadSceneFn = unsafe {
            let symbol: Symbol<NativeLoadSceneFn> = library
                .get(LOAD_SCENE_SYMBOL.as_bytes())
                .map_err(|e| PluginError::MissingSymbol {
                    name: name.to_owned(),
                    symbol: LOAD_SCENE_SYMBOL,
                    reason: e.to_string(),
                })?;
            *symbol
        };

        Ok(Box::new(NativeModule {
            name: name.to_owned(),
            entry,
            _library: library,
        }))
    }
}

/// In-process registry of scene entries, for scenes linked into the binary.
#[derive(Default, Clone)]
pub struct StaticLoader {
    entries: HashMap<String, LoadSceneFn>,
}

struct StaticModule {
    name: String,
    entry: LoadSceneFn,
}

impl SceneModule for StaticModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self, scene: &mut Scene) {
        (self.entry)(scene)
    }
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, entry: LoadSceneFn) -> &mut Self {
        self.entries.insert(name.into(), entry);
        self
    }
}

impl SceneLoader for StaticLoader {
    fn open(&self, name: &str) -> Result<Box<dyn SceneModule>, PluginError> {
        let entry = *self.entries.get(name).ok_or_else(|| PluginError::NotFound {
            name: name.to_owned(),
            reason: "not registered".to_owned(),
        })?;
        Ok(Box::new(StaticModule {
            name: name.to_owned(),
            entry,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_file_name_uses_platform_affixes() {
        let name = library_file_name("game");
        if cfg!(windows) {
            assert_eq!(name, "game.dll");
        } else if cfg!(target_os = "macos") {
            assert_eq!(name, "libgame.dylib");
        } else {
            assert_eq!(name, "libgame.so");
        }
    }

    #[test]
    fn search_dir_only_applies_to_relative_names() {
        let loader = NativeLoader::with_search_dir("plugins");
        assert_eq!(loader.resolve("libgame.so"), Path::new("plugins").join("libgame.so"));

        let abs = std::env::temp_dir().join("libgame.so");
        assert_eq!(loader.resolve(abs.to_str().unwrap()), abs);
    }

    #[test]
    fn missing_library_is_not_found() {
        let loader = NativeLoader::new();
        let err = loader
            .open(&library_file_name("jelly-no-such-scene-library"))
            .err()
            .expect("library must not exist");
        assert!(matches!(err, PluginError::NotFound { .. }));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn library_without_entry_is_missing_symbol() {
        let loader = NativeLoader::new();
        let err = loader
            .open("libc.so.6")
            .err()
            .expect("libc exports no LoadScene");
        assert!(matches!(
            err,
            PluginError::MissingSymbol {
                symbol: LOAD_SCENE_SYMBOL,
                ..
            }
        ));
    }

    #[test]
    fn static_loader_later_registration_wins() {
        fn one(scene: &mut Scene) {
            scene.create_entity();
        }
        fn two(scene: &mut Scene) {
            scene.create_entity();
            scene.create_entity();
        }

        let mut loader = StaticLoader::new();
        loader.register("s", one).register("s", two);

        let module = loader.open("s").ok().expect("registered");
        let mut scene = Scene::new();
        module.load(&mut scene);
        assert_eq!(scene.entities().len(), 2);
    }

    unsafe extern "C" fn exported_entry(scene: *mut Scene) {
        // SAFETY: the loader passes a live, exclusive scene.
        let scene = unsafe { &mut *scene };
        scene.create_entity().name = Some("from-c-abi".to_owned());
    }

    #[test]
    fn native_entry_runs_across_the_c_abi() {
        let mut scene = Scene::new();
        unsafe { call_native(exported_entry, &mut scene) };
        assert_eq!(scene.entities().len(), 1);
        assert_eq!(scene.entities()[0].name.as_deref(), Some("from-c-abi"));
    }
}
