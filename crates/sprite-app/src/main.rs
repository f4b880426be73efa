// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Result};
use clap::Parser;
use sprite_core::init_tracing;
use sprite_render::{RenderSize, Renderer, ShaderBytecode};
use sprite_render_vk::VkRenderer;
use tracing::{error, info};

use sprite_platform::winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

mod config;
mod demo;

use config::AppCfg;
use demo::DemoScene;

const VERT_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/sprite.vert.spv"));
const FRAG_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/sprite.frag.spv"));

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; missing file means defaults
    #[arg(long, default_value = "sprite.toml")]
    config: PathBuf,
    /// Override the number of demo quads per frame
    #[arg(long)]
    quads: Option<u32>,
}

fn render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize {
        width: size.width,
        height: size.height,
    }
}

struct App {
    cfg: AppCfg,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    scene: Option<DemoScene>,
    render_size: RenderSize,

    failed: Option<anyhow::Error>,
    last_frame: Instant,
    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = Window::default_attributes()
            .with_title(self.cfg.window.title.clone())
            .with_inner_size(PhysicalSize::new(self.cfg.window.width, self.cfg.window.height));
        let window = event_loop.create_window(attrs)?;
        self.render_size = render_size(window.inner_size());

        let shaders = ShaderBytecode {
            vertex: VERT_SPV.to_vec(),
            fragment: FRAG_SPV.to_vec(),
        };
        let mut renderer = VkRenderer::new(
            &window,
            &window,
            self.render_size,
            self.cfg.renderer_config(shaders),
        )?;

        let mut scene = DemoScene::new(&self.cfg.demo, self.render_size, 0x5eed);
        scene.upload_textures(&mut renderer)?;
        info!(
            "demo: {} quads over {} textures",
            scene.len(),
            self.cfg.demo.textures
        );

        window.request_redraw();
        self.window = Some(window);
        self.renderer = Some(renderer);
        self.scene = Some(scene);
        self.last_frame = Instant::now();
        Ok(())
    }

    fn frame(&mut self) -> Result<()> {
        let (Some(renderer), Some(scene)) = (&mut self.renderer, &mut self.scene) else {
            return Ok(());
        };
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32().min(0.1);
        self.last_frame = now;

        scene.update(dt, self.render_size);
        for quad in scene.quads() {
            renderer.submit(quad);
        }
        renderer.end_frame()?;

        self.frames = self.frames.saturating_add(1);
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        self.failed = Some(err);
        // renderer before window: the surface must go first
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.start(event_loop) {
            self.fail(event_loop, e.context("startup"));
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = render_size(new_size);
                info!(
                    "Resized -> {}x{}",
                    self.render_size.width, self.render_size.height
                );
                if let Some(renderer) = &mut self.renderer {
                    if let Err(e) = renderer.resize(self.render_size) {
                        self.fail(event_loop, e);
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.frame() {
                    self.fail(event_loop, e);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = AppCfg::load(&args.config);
    if let Some(quads) = args.quads {
        cfg.demo.quads = quads;
    }

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let now = Instant::now();
    let mut app = App {
        cfg,
        window: None,
        renderer: None,
        scene: None,
        render_size: RenderSize {
            width: 1,
            height: 1,
        },
        failed: None,
        last_frame: now,
        frames: 0,
        last_fps_instant: now,
    };

    event_loop.run_app(&mut app)?;
    if let Some(err) = app.failed {
        bail!("renderer stopped: {err:#}");
    }
    Ok(())
}
