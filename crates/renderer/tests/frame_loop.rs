//! End-to-end frame loop tests against a headless Vulkan surface.
//!
//! These tests need a Vulkan implementation exposing
//! `VK_EXT_headless_surface` (lavapipe, SwiftShader and most desktop drivers
//! do). They skip when the loader, the extension or a suitable device is
//! missing.

use std::ffi::c_char;
use std::sync::Arc;

use ash::vk;
use glam::Vec4;

use ember_core::RendererConfig;
use ember_renderer::{
    AttributeValue, MeshData, ProgramOptions, RenderError, Renderer, ShaderCode, ShaderProgram,
};
use ember_rhi::RhiError;
use ember_rhi::surface::{Surface, WindowSurface};

/// Window stand-in backed by `VK_EXT_headless_surface`.
struct HeadlessWindow {
    size: (u32, u32),
}

impl WindowSurface for HeadlessWindow {
    fn required_extensions(&self) -> Result<Vec<*const c_char>, RhiError> {
        Ok(vec![
            ash::khr::surface::NAME.as_ptr(),
            ash::ext::headless_surface::NAME.as_ptr(),
        ])
    }

    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<Surface, RhiError> {
        let loader = ash::ext::headless_surface::Instance::new(entry, instance);
        let handle = unsafe {
            loader.create_headless_surface(&vk::HeadlessSurfaceCreateInfoEXT::default(), None)?
        };
        Ok(Surface::from_raw(
            handle,
            ash::khr::surface::Instance::new(entry, instance),
        ))
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn wait_events(&self) {}
}

// Minimal SPIR-V assembler for the two test shaders.
fn op(words: &mut Vec<u32>, opcode: u32, operands: &[u32]) {
    words.push(((operands.len() as u32 + 1) << 16) | opcode);
    words.extend_from_slice(operands);
}

const MAIN: [u32; 2] = [0x6E69_616D, 0]; // "main\0"

fn header(bound: u32) -> Vec<u32> {
    vec![0x0723_0203, 0x0001_0000, 0, bound, 0]
}

/// `gl_Position = vec4(position, 1.0)` with `position` at location 0.
fn vertex_shader() -> Vec<u32> {
    // ids: 1 main, 2 void, 3 fn, 4 float, 5 v3, 6 v4, 7 ptr_in_v3, 8 ptr_out_v4,
    // 9 in_pos, 10 out_pos, 11 one, 12 label, 13 loaded, 14-16 x/y/z, 17 pos
    let mut w = header(18);
    op(&mut w, 17, &[1]); // OpCapability Shader
    op(&mut w, 14, &[0, 1]); // OpMemoryModel Logical GLSL450
    op(&mut w, 15, &[0, 1, MAIN[0], MAIN[1], 9, 10]); // OpEntryPoint Vertex
    op(&mut w, 71, &[9, 30, 0]); // OpDecorate %in_pos Location 0
    op(&mut w, 71, &[10, 11, 0]); // OpDecorate %out_pos BuiltIn Position
    op(&mut w, 19, &[2]);
    op(&mut w, 33, &[3, 2]);
    op(&mut w, 22, &[4, 32]);
    op(&mut w, 23, &[5, 4, 3]);
    op(&mut w, 23, &[6, 4, 4]);
    op(&mut w, 32, &[7, 1, 5]);
    op(&mut w, 32, &[8, 3, 6]);
    op(&mut w, 59, &[7, 9, 1]);
    op(&mut w, 59, &[8, 10, 3]);
    op(&mut w, 43, &[4, 11, 1.0f32.to_bits()]);
    op(&mut w, 54, &[2, 1, 0, 3]); // OpFunction
    op(&mut w, 248, &[12]);
    op(&mut w, 61, &[5, 13, 9]); // OpLoad
    op(&mut w, 81, &[4, 14, 13, 0]); // OpCompositeExtract
    op(&mut w, 81, &[4, 15, 13, 1]);
    op(&mut w, 81, &[4, 16, 13, 2]);
    op(&mut w, 80, &[6, 17, 14, 15, 16, 11]); // OpCompositeConstruct
    op(&mut w, 62, &[10, 17]); // OpStore
    op(&mut w, 253, &[]);
    op(&mut w, 56, &[]);
    w
}

/// Writes opaque red to location 0.
fn fragment_shader() -> Vec<u32> {
    // ids: 1 main, 2 void, 3 fn, 4 float, 5 v4, 6 ptr_out_v4, 7 out_color,
    // 8 one, 9 zero, 10 red, 11 label
    let mut w = header(12);
    op(&mut w, 17, &[1]);
    op(&mut w, 14, &[0, 1]);
    op(&mut w, 15, &[4, 1, MAIN[0], MAIN[1], 7]); // OpEntryPoint Fragment
    op(&mut w, 16, &[1, 7]); // OpExecutionMode OriginUpperLeft
    op(&mut w, 71, &[7, 30, 0]);
    op(&mut w, 19, &[2]);
    op(&mut w, 33, &[3, 2]);
    op(&mut w, 22, &[4, 32]);
    op(&mut w, 23, &[5, 4, 4]);
    op(&mut w, 32, &[6, 3, 5]);
    op(&mut w, 59, &[6, 7, 3]);
    op(&mut w, 43, &[4, 8, 1.0f32.to_bits()]);
    op(&mut w, 43, &[4, 9, 0.0f32.to_bits()]);
    op(&mut w, 44, &[5, 10, 8, 9, 9, 8]); // OpConstantComposite
    op(&mut w, 54, &[2, 1, 0, 3]);
    op(&mut w, 248, &[11]);
    op(&mut w, 62, &[7, 10]);
    op(&mut w, 253, &[]);
    op(&mut w, 56, &[]);
    w
}

fn string(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.resize(s.len() / 4 * 4 + 4, 0);
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn named(words: &mut Vec<u32>, opcode: u32, prefix: &[u32], name: &str) {
    let mut operands = prefix.to_vec();
    operands.extend(string(name));
    op(words, opcode, &operands);
}

/// The red fragment shader plus an unused material interface:
///
/// ```glsl
/// layout(set = 0, binding = 0) uniform Material { vec4 tint; float strength; };
/// layout(set = 0, binding = 1) uniform sampler2D albedo;
/// ```
///
/// Without `textured` the block holds only `tint` and there is no sampler.
fn material_fragment_shader(textured: bool) -> Vec<u32> {
    // ids: 1-11 as in fragment_shader, 12 Material, 13 ptr_uniform, 14 material,
    // 15 image, 16 sampled_image, 17 ptr_sampled, 18 albedo
    let mut w = header(19);
    op(&mut w, 17, &[1]);
    op(&mut w, 14, &[0, 1]);
    op(&mut w, 15, &[4, 1, MAIN[0], MAIN[1], 7]);
    op(&mut w, 16, &[1, 7]);
    named(&mut w, 5, &[12], "Material"); // OpName
    named(&mut w, 6, &[12, 0], "tint"); // OpMemberName
    named(&mut w, 5, &[14], "material");
    if textured {
        named(&mut w, 6, &[12, 1], "strength");
        named(&mut w, 5, &[18], "albedo");
    }
    op(&mut w, 71, &[7, 30, 0]);
    op(&mut w, 72, &[12, 0, 35, 0]); // OpMemberDecorate Offset
    op(&mut w, 71, &[12, 2]); // Block
    op(&mut w, 71, &[14, 34, 0]); // DescriptorSet 0
    op(&mut w, 71, &[14, 33, 0]); // Binding 0
    if textured {
        op(&mut w, 72, &[12, 1, 35, 16]);
        op(&mut w, 71, &[18, 34, 0]);
        op(&mut w, 71, &[18, 33, 1]);
    }
    op(&mut w, 19, &[2]);
    op(&mut w, 33, &[3, 2]);
    op(&mut w, 22, &[4, 32]);
    op(&mut w, 23, &[5, 4, 4]);
    op(&mut w, 32, &[6, 3, 5]);
    op(&mut w, 59, &[6, 7, 3]);
    if textured {
        op(&mut w, 30, &[12, 5, 4]); // OpTypeStruct { vec4, float }
    } else {
        op(&mut w, 30, &[12, 5]);
    }
    op(&mut w, 32, &[13, 2, 12]); // Uniform pointer
    op(&mut w, 59, &[13, 14, 2]);
    if textured {
        op(&mut w, 25, &[15, 4, 1, 0, 0, 0, 1, 0]); // OpTypeImage 2D sampled
        op(&mut w, 27, &[16, 15]);
        op(&mut w, 32, &[17, 0, 16]); // UniformConstant pointer
        op(&mut w, 59, &[17, 18, 0]);
    }
    op(&mut w, 43, &[4, 8, 1.0f32.to_bits()]);
    op(&mut w, 43, &[4, 9, 0.0f32.to_bits()]);
    op(&mut w, 44, &[5, 10, 8, 9, 9, 8]);
    op(&mut w, 54, &[2, 1, 0, 3]);
    op(&mut w, 248, &[11]);
    op(&mut w, 62, &[7, 10]);
    op(&mut w, 253, &[]);
    op(&mut w, 56, &[]);
    w
}

fn material_program(renderer: &Renderer, name: &str, textured: bool) -> Arc<ShaderProgram> {
    let code = ShaderCode::Graphics {
        vertex: vertex_shader(),
        fragment: material_fragment_shader(textured),
    };
    renderer
        .create_shader_program(name, &code, &ProgramOptions::default())
        .unwrap()
}

fn create_renderer() -> Option<Renderer> {
    let window = HeadlessWindow { size: (800, 600) };
    let config = RendererConfig {
        validation: false,
        ..RendererConfig::default()
    };
    match Renderer::new(&window, &config) {
        Ok(renderer) => Some(renderer),
        Err(e) => {
            println!("Skipping test: no headless Vulkan renderer available ({e})");
            None
        }
    }
}

#[test]
fn test_three_frames_advance_slots() {
    let Some(mut renderer) = create_renderer() else {
        return;
    };

    let mesh = renderer.create_mesh(&MeshData::triangle()).unwrap();
    assert_eq!(mesh.vertex_count(), 3);
    assert_eq!(mesh.index_count(), 3);

    let code = ShaderCode::Graphics {
        vertex: vertex_shader(),
        fragment: fragment_shader(),
    };
    let program = renderer
        .create_shader_program("flat", &code, &ProgramOptions::default())
        .unwrap();

    let mut slots = Vec::new();
    for _ in 0..3 {
        slots.push(renderer.frame_slot());
        assert!(renderer.begin_frame().unwrap());
        renderer.clear_color().unwrap();
        renderer.bind_shader(&program).unwrap();
        renderer.draw_vertex_sub_mesh(&mesh, 0).unwrap();
        renderer.end_frame().unwrap();

        let stats = renderer.last_frame_stats();
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(stats.mesh_binds, 1);
    }
    assert_eq!(slots, vec![0, 1, 0]);
    assert_eq!(renderer.frame_number(), 3);

    renderer.wait_for_gpu().unwrap();
}

#[test]
fn test_draw_requires_rendering_scope() {
    let Some(mut renderer) = create_renderer() else {
        return;
    };
    let mesh = renderer.create_mesh(&MeshData::triangle()).unwrap();

    assert!(matches!(
        renderer.clear_color(),
        Err(RenderError::IllegalTransition { .. })
    ));

    assert!(renderer.begin_frame().unwrap());
    assert!(matches!(
        renderer.draw_vertex_sub_mesh(&mesh, 0),
        Err(RenderError::WrongFrameState { .. })
    ));
    assert!(matches!(
        renderer.begin_frame(),
        Err(RenderError::IllegalTransition { .. })
    ));

    // A frame without a clear still submits and presents.
    renderer.end_frame().unwrap();
    assert_eq!(renderer.frame_slot(), 1);
}

#[test]
fn test_storage_buffer_round_trip() {
    let Some(renderer) = create_renderer() else {
        return;
    };

    let floats: Vec<f32> = (0..64).map(|i| i as f32 * 0.5).collect();
    let buffer = renderer
        .create_storage_buffer(bytemuck::cast_slice(&floats))
        .unwrap();
    let bytes = buffer.read_back(renderer.context().transfer()).unwrap();
    assert_eq!(bytemuck::pod_collect_to_vec::<u8, f32>(&bytes), floats);
}

#[test]
fn test_resize_recreates_swapchain() {
    let Some(mut renderer) = create_renderer() else {
        return;
    };

    renderer.resize(640, 480);
    assert!(renderer.begin_frame().unwrap());
    let extent = renderer.extent();
    assert!(extent.width > 0 && extent.height > 0);
    renderer.end_frame().unwrap();

    // Minimized: frames are skipped until the window has area again.
    renderer.resize(0, 0);
    assert!(!renderer.begin_frame().unwrap());
    renderer.resize(800, 600);
    assert!(renderer.begin_frame().unwrap());
    renderer.end_frame().unwrap();
}

#[test]
fn test_material_binds_every_frame() {
    let Some(mut renderer) = create_renderer() else {
        return;
    };
    let mesh = renderer.create_mesh(&MeshData::triangle()).unwrap();
    let program = material_program(&renderer, "textured", true);

    let reflection = program.reflection();
    assert!(reflection.find_member("tint").is_some());
    assert!(reflection.uniforms.contains_key("albedo"));

    let material = renderer.create_material("hull", program.clone()).unwrap();
    material.set_attribute("tint", AttributeValue::Vec4(Vec4::new(1.0, 0.5, 0.25, 1.0)));
    assert_eq!(material.pending_count(), 1);

    let texture = renderer
        .create_texture(2, 2, &[255u8; 16])
        .unwrap();
    for frame in 0..3 {
        // Frame 0 samples the placeholder; the texture arrives on frame 1.
        if frame == 1 {
            material.set_attribute("albedo", AttributeValue::Texture(texture.clone()));
        }
        assert!(renderer.begin_frame().unwrap());
        renderer.clear_color().unwrap();
        renderer.bind_shader(&program).unwrap();
        renderer.bind_material(&material).unwrap();
        renderer.bind_material(&material).unwrap();
        renderer.draw_vertex_sub_mesh(&mesh, 0).unwrap();
        renderer.end_frame().unwrap();

        let stats = renderer.last_frame_stats();
        assert_eq!(stats.material_binds, 1);
        assert_eq!(stats.redundant_binds, 1);
        assert_eq!(material.pending_count(), 0);
    }
    assert_eq!(material.attribute("albedo"), Some(AttributeValue::Texture(texture)));

    renderer.wait_for_gpu().unwrap();
}

#[test]
fn test_material_rebuild_keeps_matching_attributes() {
    let Some(mut renderer) = create_renderer() else {
        return;
    };
    let textured = material_program(&renderer, "textured", true);
    let plain = material_program(&renderer, "plain", false);

    let material = renderer.create_material("glass", textured).unwrap();
    let tint = AttributeValue::Vec4(Vec4::new(0.2, 0.4, 0.6, 0.8));
    material.set_attribute("tint", tint.clone());
    material.set_attribute("strength", AttributeValue::Float(0.5));
    let texture = renderer.create_texture(1, 1, &[0, 0, 0, 255]).unwrap();
    material.set_attribute("albedo", AttributeValue::Texture(texture));

    material.rebuild(plain.clone()).unwrap();
    assert!(Arc::ptr_eq(&material.program(), &plain));
    assert_eq!(material.attribute("tint"), Some(tint));
    assert_eq!(material.attribute("strength"), None);
    assert_eq!(material.attribute("albedo"), None);

    assert!(renderer.begin_frame().unwrap());
    renderer.clear_color().unwrap();
    renderer.bind_shader(&plain).unwrap();
    renderer.bind_material(&material).unwrap();
    renderer.end_frame().unwrap();
    assert_eq!(renderer.last_frame_stats().material_binds, 1);

    renderer.wait_for_gpu().unwrap();
}

#[test]
fn test_cancelled_frame_keeps_slot() {
    let Some(mut renderer) = create_renderer() else {
        return;
    };

    assert!(renderer.begin_frame().unwrap());
    renderer.clear_color().unwrap();
    renderer.cancel_frame().unwrap();
    assert_eq!(renderer.state(), ember_renderer::FrameState::Idle);
    assert_eq!(renderer.frame_slot(), 0);
    assert_eq!(renderer.frame_number(), 0);

    // Cancelling outside a frame does nothing.
    renderer.cancel_frame().unwrap();

    // The slot fence was signalled by the cancel, so the next frame proceeds.
    assert!(renderer.begin_frame().unwrap());
    renderer.clear_color().unwrap();
    renderer.end_frame().unwrap();
    assert_eq!(renderer.frame_slot(), 1);
    assert_eq!(renderer.frame_number(), 1);

    renderer.wait_for_gpu().unwrap();
}
