// SPDX-License-Identifier: CEPL-1.0

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PresentModePreference {
    /// Low-latency triple buffering if the surface offers it, FIFO otherwise.
    #[default]
    Mailbox,
    /// Always FIFO; capped at the display refresh rate.
    Fifo,
}

/// Precompiled SPIR-V handed in by the host. The renderer never reads shader files.
#[derive(Clone, Debug, Default)]
pub struct ShaderBytecode {
    pub vertex: Vec<u8>,
    pub fragment: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub app_name: String,
    pub clear_color: [f32; 4],
    pub present_mode: PresentModePreference,
    /// Vertex buffer size at load. Grows (power of two) when a frame needs more.
    pub initial_vertex_capacity: usize,
    /// Request the Khronos validation layer when the loader has it.
    pub validation: bool,
    pub shaders: ShaderBytecode,
}

impl RendererConfig {
    pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.02, 0.02, 0.02, 1.0];
    pub const DEFAULT_VERTEX_CAPACITY: usize = 4096;

    pub fn new(shaders: ShaderBytecode) -> Self {
        Self {
            shaders,
            ..Self::default()
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: "sprite".to_owned(),
            clear_color: Self::DEFAULT_CLEAR_COLOR,
            present_mode: PresentModePreference::default(),
            initial_vertex_capacity: Self::DEFAULT_VERTEX_CAPACITY,
            validation: cfg!(debug_assertions),
            shaders: ShaderBytecode::default(),
        }
    }
}
