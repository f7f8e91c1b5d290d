//! Blend program generation
//!
//! One program per (camera count, pixel format). The vertex stage forwards
//! each camera's `(u, v, weight)`; the fragment stage samples every camera,
//! converts Y′CbCr to RGB and outputs `Σ wᵢ·colorᵢ` with alpha `min(1, Σ wᵢ)`.

use std::fmt::Write;

use crate::frame::PixelFormat;

use super::backend::ProgramDesc;

/// BT.601 full-range Y′CbCr to RGB; inputs and outputs in `[0, 1]`
pub fn ycbcr_to_rgb(y: f32, cb: f32, cr: f32) -> [f32; 3] {
    let cb = cb - 0.5;
    let cr = cr - 0.5;
    [
        (y + 1.402 * cr).clamp(0.0, 1.0),
        (y - 0.344_136 * cb - 0.714_136 * cr).clamp(0.0, 1.0),
        (y + 1.772 * cb).clamp(0.0, 1.0),
    ]
}

/// WGSL source for a blend program.
///
/// Bindings: group 0 holds the uniforms (0) and the shared sampler (1);
/// group 1 holds the textures, `camera * planes + plane`.
pub fn generate_wgsl(desc: &ProgramDesc) -> String {
    let n = desc.camera_count;
    let planes = desc.planes_per_camera();
    let mut src = String::with_capacity(2048 + n * 512);

    src.push_str(
        "struct Uniforms {\n    view_proj: mat4x4<f32>,\n    unwrap: vec4<f32>,\n};\n\n\
         @group(0) @binding(0) var<uniform> uniforms: Uniforms;\n\
         @group(0) @binding(1) var samp: sampler;\n",
    );
    for t in 0..n * planes {
        let _ = writeln!(src, "@group(1) @binding({t}) var tex{t}: texture_2d<f32>;");
    }

    src.push_str("\nstruct VsIn {\n    @location(0) position: vec3<f32>,\n    @location(1) uv: vec2<f32>,\n");
    for i in 0..n {
        let _ = writeln!(src, "    @location({}) cam{i}: vec3<f32>,", i + 2);
    }
    src.push_str("};\n\nstruct VsOut {\n    @builtin(position) clip: vec4<f32>,\n");
    for i in 0..n {
        let _ = writeln!(src, "    @location({i}) cam{i}: vec3<f32>,");
    }
    src.push_str(
        "};\n\n@vertex\nfn vs_main(in: VsIn) -> VsOut {\n    var out: VsOut;\n\
         \x20   let world = uniforms.view_proj * vec4<f32>(in.position, 1.0);\n\
         \x20   let unwrapped = vec4<f32>(in.uv.x * 2.0 - 1.0, 1.0 - in.uv.y * 2.0, 0.0, 1.0);\n\
         \x20   out.clip = select(world, unwrapped, uniforms.unwrap.x > 0.5);\n",
    );
    for i in 0..n {
        let _ = writeln!(src, "    out.cam{i} = in.cam{i};");
    }
    src.push_str("    return out;\n}\n\n");

    src.push_str(
        "fn ycbcr_to_rgb(y: f32, cb: f32, cr: f32) -> vec3<f32> {\n\
         \x20   let u = cb - 0.5;\n    let v = cr - 0.5;\n\
         \x20   return clamp(vec3<f32>(y + 1.402 * v, y - 0.344136 * u - 0.714136 * v, y + 1.772 * u), \
         vec3<f32>(0.0), vec3<f32>(1.0));\n}\n\n",
    );

    for i in 0..n {
        let base = i * planes;
        let body = match desc.pixel_format {
            PixelFormat::Rgb24 => format!("    return textureSample(tex{base}, samp, tc).rgb;\n"),
            PixelFormat::Nv12 => format!(
                "    let y = textureSample(tex{base}, samp, tc).r;\n\
                 \x20   let c = textureSample(tex{}, samp, tc).rg;\n\
                 \x20   return ycbcr_to_rgb(y, c.x, c.y);\n",
                base + 1
            ),
            PixelFormat::Yuv420p => format!(
                "    let y = textureSample(tex{base}, samp, tc).r;\n\
                 \x20   let cb = textureSample(tex{}, samp, tc).r;\n\
                 \x20   let cr = textureSample(tex{}, samp, tc).r;\n\
                 \x20   return ycbcr_to_rgb(y, cb, cr);\n",
                base + 1,
                base + 2
            ),
        };
        let _ = write!(src, "fn sample_cam{i}(tc: vec2<f32>) -> vec3<f32> {{\n{body}}}\n\n");
    }

    src.push_str(
        "@fragment\nfn fs_main(in: VsOut) -> @location(0) vec4<f32> {\n\
         \x20   var color = vec3<f32>(0.0);\n    var total = 0.0;\n",
    );
    for i in 0..n {
        let _ = writeln!(src, "    color += in.cam{i}.z * sample_cam{i}(in.cam{i}.xy);");
        let _ = writeln!(src, "    total += in.cam{i}.z;");
    }
    src.push_str("    return vec4<f32>(color, min(total, 1.0));\n}\n");
    src
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ycbcr_neutral_is_grey() {
        let [r, g, b] = ycbcr_to_rgb(0.5, 0.5, 0.5);
        assert!((r - 0.5).abs() < 1e-6 && (g - 0.5).abs() < 1e-6 && (b - 0.5).abs() < 1e-6);
        let [r, _, b] = ycbcr_to_rgb(0.3, 0.5, 1.0);
        assert!(r > 0.9 && b < 0.4);
    }

    #[test]
    fn test_wgsl_declares_every_binding() {
        let src = generate_wgsl(&ProgramDesc {
            camera_count: 3,
            pixel_format: PixelFormat::Yuv420p,
        });
        for t in 0..9 {
            assert!(src.contains(&format!("var tex{t}: texture_2d<f32>")));
        }
        assert!(src.contains("@location(4) cam2: vec3<f32>"));
        assert!(src.contains("fn sample_cam2"));
        assert!(src.contains("fn fs_main"));
        assert!(!src.contains("tex9"));
    }
}
