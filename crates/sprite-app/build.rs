use std::{env, fs, path::PathBuf};

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR"));

    // Vertex layout must match sprite_render::Vertex:
    //   location 0: R32G32_SFLOAT       (pos, pixels)
    //   location 1: R32G32B32A32_SFLOAT (color)
    //   location 2: R32G32_SFLOAT       (uv)
    let vs_src = r#"
#version 450
layout(location = 0) in vec2 inPos;
layout(location = 1) in vec4 inColor;
layout(location = 2) in vec2 inUv;

layout(set = 0, binding = 0) uniform Projection { mat4 ortho; } u;

layout(location = 0) out vec4 vColor;
layout(location = 1) out vec2 vUv;

void main() {
    vColor = inColor;
    vUv = inUv;
    gl_Position = u.ortho * vec4(inPos, 0.0, 1.0);
}
"#;

    // Texel times per-vertex tint; blending happens in the pipeline.
    let fs_src = r#"
#version 450
layout(location = 0) in vec4 vColor;
layout(location = 1) in vec2 vUv;

layout(set = 0, binding = 1) uniform sampler2D tex;

layout(location = 0) out vec4 outColor;

void main() {
    outColor = texture(tex, vUv) * vColor;
}
"#;

    let comp = shaderc::Compiler::new().expect("shaderc compiler");
    let mut opts = shaderc::CompileOptions::new().expect("shaderc options");
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_1 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let compile = |src: &str, kind: shaderc::ShaderKind, name: &str| {
        comp.compile_into_spirv(src, kind, name, "main", Some(&opts))
            .unwrap_or_else(|e| panic!("{name}: {e}"))
    };
    let vs_spv = compile(vs_src, shaderc::ShaderKind::Vertex, "sprite.vert");
    let fs_spv = compile(fs_src, shaderc::ShaderKind::Fragment, "sprite.frag");

    fs::write(out.join("sprite.vert.spv"), vs_spv.as_binary_u8()).expect("write sprite.vert.spv");
    fs::write(out.join("sprite.frag.spv"), fs_spv.as_binary_u8()).expect("write sprite.frag.spv");

    // Re-run if this file changes (inline sources live here)
    println!("cargo:rerun-if-changed=build.rs");
}
