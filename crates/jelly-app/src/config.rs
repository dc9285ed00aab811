// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use clap::ValueEnum;
use jelly_platform::DisplayConfig;
use jelly_render::RenderSize;
use jelly_render_vk::{vk, EngineConfig, OutOfDatePolicy, SyncMode};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize, Default)]
pub struct AppCfg {
    #[serde(default)]
    pub window: WindowCfg,
    #[serde(default)]
    pub render: RenderCfg,
    #[serde(default)]
    pub scene: SceneCfg,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// Needs `render.out_of_date = "rebuild"` to survive a resize.
    pub resizable: bool,
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self {
            title: "Jelly".to_owned(),
            width: 1280,
            height: 720,
            resizable: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default)]
    pub sync_mode: SyncModeCfg,
    #[serde(default)]
    pub out_of_date: OutOfDateCfg,
    #[serde(default = "default_present_modes")]
    pub present_modes: Vec<PresentModeCfg>,
    #[serde(default)]
    pub use_window_extent: bool,
    #[serde(default = "default_validation")]
    pub validation: bool,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            sync_mode: SyncModeCfg::Strict,
            out_of_date: OutOfDateCfg::Fatal,
            present_modes: default_present_modes(),
            use_window_extent: false,
            validation: default_validation(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct SceneCfg {
    /// Plugin stem, e.g. `game` for `libgame.so`.
    #[serde(default)]
    pub library: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SyncModeCfg {
    #[default]
    Strict,
    Pipelined,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutOfDateCfg {
    #[default]
    Fatal,
    Rebuild,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeCfg {
    Fifo,
    FifoRelaxed,
    Mailbox,
    Immediate,
}

fn default_clear() -> [f32; 4] {
    [1.0, 0.0, 0.0, 1.0]
}
fn default_present_modes() -> Vec<PresentModeCfg> {
    vec![PresentModeCfg::Fifo]
}
fn default_validation() -> bool {
    true
}

impl SyncModeCfg {
    fn to_vk(self) -> SyncMode {
        match self {
            SyncModeCfg::Strict => SyncMode::Strict,
            SyncModeCfg::Pipelined => SyncMode::Pipelined,
        }
    }
}

impl PresentModeCfg {
    fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            PresentModeCfg::Fifo => vk::PresentModeKHR::FIFO,
            PresentModeCfg::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
            PresentModeCfg::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentModeCfg::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

impl AppCfg {
    pub fn display_config(&self) -> DisplayConfig {
        DisplayConfig {
            title: self.window.title.clone(),
            size: RenderSize::new(self.window.width, self.window.height),
            resizable: self.window.resizable,
            ..DisplayConfig::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let r = &self.render;
        EngineConfig {
            app_name: self.window.title.clone(),
            clear_color: r.clear_color,
            sync_mode: r.sync_mode.to_vk(),
            out_of_date: match r.out_of_date {
                OutOfDateCfg::Fatal => OutOfDatePolicy::Fatal,
                OutOfDateCfg::Rebuild => OutOfDatePolicy::Rebuild,
            },
            present_modes: r.present_modes.iter().map(|m| m.to_vk()).collect(),
            use_window_extent: r.use_window_extent,
            // Validation is a debug-build aid only.
            validation: r.validation && cfg!(debug_assertions),
        }
    }
}

pub fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str(text)
}

/// Missing file → defaults. Unreadable or malformed → warning, defaults.
pub fn load_cfg(path: &Path) -> AppCfg {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} not found, using defaults", path.display());
            return AppCfg::default();
        }
        Err(e) => {
            warn!("cannot read {}: {e}; using defaults", path.display());
            return AppCfg::default();
        }
    };
    match parse_cfg(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("malformed {}: {e}; using defaults", path.display());
            AppCfg::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert_eq!(cfg.window.title, "Jelly");
        assert_eq!((cfg.window.width, cfg.window.height), (1280, 720));
        assert!(!cfg.window.resizable);
        assert_eq!(cfg.render.clear_color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(cfg.render.sync_mode, SyncModeCfg::Strict);
        assert_eq!(cfg.render.out_of_date, OutOfDateCfg::Fatal);
        assert_eq!(cfg.render.present_modes, vec![PresentModeCfg::Fifo]);
        assert!(cfg.scene.library.is_none());
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let cfg = parse_cfg(
            r#"
            [window]
            width = 640

            [render]
            sync_mode = "pipelined"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.window.width, 640);
        assert_eq!(cfg.window.height, 720);
        assert_eq!(cfg.render.sync_mode, SyncModeCfg::Pipelined);
        assert_eq!(cfg.render.clear_color, [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn enums_parse_snake_case() {
        let cfg = parse_cfg(
            r#"
            [render]
            out_of_date = "rebuild"
            present_modes = ["mailbox", "fifo_relaxed", "immediate"]

            [scene]
            library = "game"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.out_of_date, OutOfDateCfg::Rebuild);
        assert_eq!(
            cfg.render.present_modes,
            vec![
                PresentModeCfg::Mailbox,
                PresentModeCfg::FifoRelaxed,
                PresentModeCfg::Immediate
            ]
        );
        assert_eq!(cfg.scene.library.as_deref(), Some("game"));

        assert!(parse_cfg("[render]\nsync_mode = \"Strict\"").is_err());
    }

    #[test]
    fn engine_config_maps_to_vulkan_values() {
        let cfg = parse_cfg(
            r#"
            [window]
            title = "demo"
            resizable = true

            [render]
            clear_color = [0.0, 0.5, 0.0, 1.0]
            out_of_date = "rebuild"
            present_modes = ["mailbox"]
            use_window_extent = true
            validation = false
            "#,
        )
        .unwrap();
        let engine = cfg.engine_config();
        assert_eq!(engine.app_name, "demo");
        assert_eq!(engine.clear_color, [0.0, 0.5, 0.0, 1.0]);
        assert_eq!(engine.out_of_date, OutOfDatePolicy::Rebuild);
        assert_eq!(engine.present_modes, vec![vk::PresentModeKHR::MAILBOX]);
        assert!(engine.use_window_extent);
        assert!(!engine.validation);

        let display = cfg.display_config();
        assert_eq!(display.title, "demo");
        assert_eq!(display.size, RenderSize::new(1280, 720));
        assert!(display.resizable);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_cfg(Path::new("definitely/not/here/jelly.toml"));
        assert_eq!(cfg.window.title, "Jelly");
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("jelly-bad-{}.toml", std::process::id()));
        fs::write(&path, "[render\nclear_color = ").unwrap();
        let cfg = load_cfg(&path);
        let _ = fs::remove_file(&path);
        assert_eq!(cfg.render.clear_color, [1.0, 0.0, 0.0, 1.0]);
    }
}
