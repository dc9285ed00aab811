// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Scenes and the scene plugin contract.
//!
//! A scene module is anything that can populate a [`Scene`]. Modules usually
//! come from a shared library exporting [`LOAD_SCENE_SYMBOL`], but the frame
//! loop never sees that: it only deals with the [`Scene`] that
//! [`load_scene`] hands back.

mod loader;

pub use loader::{library_file_name, NativeLoader, StaticLoader};

use thiserror::Error;
use tracing::{error, info};

/// Exported entry point every scene library must provide.
pub const LOAD_SCENE_SYMBOL: &str = "LoadScene";

/// Signature of [`LOAD_SCENE_SYMBOL`] as exported by a scene library. The
/// pointer is never null and is valid only for the duration of the call.
pub type NativeLoadSceneFn = unsafe extern "C" fn(scene: *mut Scene);

/// Scene entry linked into the binary, for [`StaticLoader`].
pub type LoadSceneFn = fn(&mut Scene);

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("scene '{name}' not found: {reason}")]
    NotFound { name: String, reason: String },

    #[error("scene '{name}' not loaded: missing symbol `{symbol}` ({reason})")]
    MissingSymbol {
        name: String,
        symbol: &'static str,
        reason: String,
    },
}

/// Something that can fill a freshly created scene.
pub trait SceneModule {
    fn name(&self) -> &str;
    fn load(&self, scene: &mut Scene);
}

/// Resolves a scene name to a module. Failures are recoverable.
pub trait SceneLoader {
    fn open(&self, name: &str) -> Result<Box<dyn SceneModule>, PluginError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u32);

impl EntityId {
    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug)]
pub struct Entity {
    id: EntityId,
    pub name: Option<String>,
}

impl Entity {
    pub fn id(&self) -> EntityId {
        self.id
    }
}

pub struct Scene {
    entities: Vec<Entity>,
    // Dropped after the entities: a native module keeps its library mapped
    // here.
    module: Option<Box<dyn SceneModule>>,
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("module", &self.module_name())
            .field("entities", &self.entities.len())
            .finish()
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    /// An empty scene with no module behind it.
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            module: None,
        }
    }

    pub fn create_entity(&mut self) -> &mut Entity {
        let id = EntityId(self.entities.len() as u32);
        self.entities.push(Entity { id, name: None });
        let last = self.entities.len() - 1;
        &mut self.entities[last]
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id.0 as usize)
    }

    pub fn module_name(&self) -> Option<&str> {
        self.module.as_deref().map(|m| m.name())
    }
}

/// Open `name` through `loader` and run its entry on a new scene.
///
/// Failures are logged and returned; the caller decides whether to carry on
/// without a scene.
pub fn load_scene(loader: &dyn SceneLoader, name: &str) -> Result<Scene, PluginError> {
    let module = match loader.open(name) {
        Ok(m) => m,
        Err(e) => {
            error!("{e}");
            return Err(e);
        }
    };

    let mut scene = Scene::new();
    module.load(&mut scene);
    info!(
        "scene '{}' loaded ({} entities)",
        module.name(),
        scene.entities.len()
    );
    scene.module = Some(module);
    Ok(scene)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_entities(scene: &mut Scene) {
        scene.create_entity().name = Some("player".to_owned());
        scene.create_entity();
    }

    #[test]
    fn entity_ids_are_sequential() {
        let mut scene = Scene::new();
        let a = scene.create_entity().id();
        let b = scene.create_entity().id();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(scene.entities().len(), 2);
        assert!(scene.entity(b).is_some());
    }

    #[test]
    fn load_scene_runs_entry_and_keeps_module() {
        let mut loader = StaticLoader::new();
        loader.register("game", two_entities);

        let scene = load_scene(&loader, "game").expect("registered scene loads");
        assert_eq!(scene.entities().len(), 2);
        assert_eq!(scene.entities()[0].name.as_deref(), Some("player"));
        assert_eq!(scene.module_name(), Some("game"));
    }

    #[test]
    fn load_scene_reports_unknown_scene() {
        let loader = StaticLoader::new();
        let err = load_scene(&loader, "nope").unwrap_err();
        assert!(matches!(err, PluginError::NotFound { ref name, .. } if name == "nope"));
    }
}
