// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use jelly_core::init_tracing;
use jelly_platform::Display;
use jelly_render_vk::{Application, Engine, RenderFrame};
use jelly_scene::{library_file_name, load_scene, NativeLoader, Scene};
use tracing::{error, info};

use config::{load_cfg, SyncModeCfg};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[arg(long, default_value = "jelly.toml")]
    config: PathBuf,

    /// Scene plugin stem, e.g. `game` for libgame.so / game.dll
    #[arg(long)]
    scene: Option<String>,

    /// Override render.sync_mode
    #[arg(long, value_enum)]
    sync: Option<SyncModeCfg>,
}

/// Counts frames and reports the rate once a second.
struct Demo {
    scene: Option<Scene>,
    frames: u32,
    last_fps_instant: Instant,
}

impl Demo {
    fn new(scene: Option<Scene>) -> Self {
        Self {
            scene,
            frames: 0,
            last_fps_instant: Instant::now(),
        }
    }
}

impl Application for Demo {
    fn on_attach(&mut self) {
        match &self.scene {
            Some(scene) => info!(
                "scene {:?} with {} entities",
                scene.module_name().unwrap_or("<none>"),
                scene.entities().len()
            ),
            None => info!("no scene loaded"),
        }
        self.last_fps_instant = Instant::now();
    }

    fn on_update(&mut self) {
        let elapsed = self.last_fps_instant.elapsed();
        if elapsed.as_secs_f32() >= 1.0 {
            info!("fps: {:.1}", self.frames as f32 / elapsed.as_secs_f32());
            self.frames = 0;
            self.last_fps_instant = Instant::now();
        }
    }

    fn on_render(&mut self, _frame: &RenderFrame<'_>) {
        self.frames += 1;
    }

    fn on_detach(&mut self) {
        info!("detached");
    }
}

/// Scene plugins live next to the executable.
fn scene_loader() -> NativeLoader {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .map(NativeLoader::with_search_dir)
        .unwrap_or_default()
}

fn run() -> Result<()> {
    let args = Args::parse();
    let mut cfg = load_cfg(&args.config);
    if let Some(sync) = args.sync {
        cfg.render.sync_mode = sync;
    }

    // A scene that fails to load is logged by the loader and skipped.
    let scene = args
        .scene
        .or_else(|| cfg.scene.library.clone())
        .and_then(|stem| load_scene(&scene_loader(), &library_file_name(&stem)).ok());

    // Declared before the engine so the engine drops first.
    let mut display = Display::new(&cfg.display_config()).context("failed to open window")?;
    let mut engine =
        Engine::new(&display, cfg.engine_config()).context("failed to initialize Vulkan")?;

    let mut app = Demo::new(scene);
    let frames = engine
        .run(&mut display, &mut app)
        .context("frame loop failed")?;
    info!("rendered {frames} frames");
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
