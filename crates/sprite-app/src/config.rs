// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::path::Path;

use serde::Deserialize;
use sprite_render::{PresentModePreference, RendererConfig, ShaderBytecode};
use tracing::{info, warn};

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AppCfg {
    #[serde(default)]
    pub window: WindowCfg,
    #[serde(default)]
    pub render: RenderCfg,
    #[serde(default)]
    pub demo: DemoCfg,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self {
            title: "sprite".to_owned(),
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub present_mode: PresentModeCfg,
    /// Unset = on in debug builds only.
    pub validation: Option<bool>,
    pub vertex_capacity: usize,
}

impl Default for RenderCfg {
    fn default() -> Self {
        Self {
            clear_color: RendererConfig::DEFAULT_CLEAR_COLOR,
            present_mode: PresentModeCfg::default(),
            validation: None,
            vertex_capacity: RendererConfig::DEFAULT_VERTEX_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeCfg {
    Fifo,
    #[default]
    Mailbox,
}

impl From<PresentModeCfg> for PresentModePreference {
    fn from(cfg: PresentModeCfg) -> Self {
        match cfg {
            PresentModeCfg::Fifo => PresentModePreference::Fifo,
            PresentModeCfg::Mailbox => PresentModePreference::Mailbox,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DemoCfg {
    pub quads: u32,
    pub textures: u32,
    pub texture_size: u32,
}

impl Default for DemoCfg {
    fn default() -> Self {
        Self {
            quads: 500,
            textures: 4,
            texture_size: 32,
        }
    }
}

impl AppCfg {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Missing file means defaults; a broken file is reported and ignored.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => match Self::parse(&text) {
                Ok(cfg) => {
                    info!("config: loaded {}", path.display());
                    cfg
                }
                Err(e) => {
                    warn!("config: {} is invalid, using defaults: {e}", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn renderer_config(&self, shaders: ShaderBytecode) -> RendererConfig {
        let defaults = RendererConfig::default();
        RendererConfig {
            app_name: self.window.title.clone(),
            clear_color: self.render.clear_color,
            present_mode: self.render.present_mode.into(),
            initial_vertex_capacity: self.render.vertex_capacity,
            validation: self.render.validation.unwrap_or(defaults.validation),
            shaders,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = AppCfg::parse("").unwrap();
        assert_eq!(cfg.window.width, 1280);
        assert_eq!(cfg.render.present_mode, PresentModeCfg::Mailbox);
        assert_eq!(cfg.render.clear_color, RendererConfig::DEFAULT_CLEAR_COLOR);
        assert_eq!(cfg.demo.quads, 500);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = AppCfg::parse(
            r#"
            [window]
            title = "bench"

            [render]
            present_mode = "fifo"

            [demo]
            quads = 10000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.window.title, "bench");
        assert_eq!(cfg.window.height, 720);
        assert_eq!(cfg.render.present_mode, PresentModeCfg::Fifo);
        assert_eq!(cfg.demo.quads, 10_000);
        assert_eq!(cfg.demo.textures, 4);
    }

    #[test]
    fn unknown_present_mode_is_rejected() {
        assert!(AppCfg::parse("[render]\npresent_mode = \"immediate\"").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = AppCfg::load(Path::new("definitely/not/here/sprite.toml"));
        assert_eq!(cfg.demo.texture_size, 32);
    }

    #[test]
    fn renderer_config_carries_overrides() {
        let cfg = AppCfg::parse(
            r#"
            [render]
            clear_color = [1.0, 0.0, 0.0, 1.0]
            present_mode = "fifo"
            validation = false
            vertex_capacity = 64
            "#,
        )
        .unwrap();
        let rc = cfg.renderer_config(ShaderBytecode::default());
        assert_eq!(rc.clear_color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(rc.present_mode, PresentModePreference::Fifo);
        assert!(!rc.validation);
        assert_eq!(rc.initial_vertex_capacity, 64);
        assert_eq!(rc.app_name, "sprite");
    }
}
