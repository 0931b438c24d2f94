//! Shader source resolution, `#pragma once` preprocessing, HLSL->SPIR-V
//! compilation and hot-reload polling.
//!
//! Compilation happens in-process via `hassle-rs` (DXC bindings) so the
//! hot-reload debounce and include-read retry windows stay deterministic;
//! see `DESIGN.md` for why an external-process compiler wouldn't give that.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context as _;
use ash::vk;
use parking_lot::Mutex;

use crate::error::GpuError;
use crate::vulkan::device::DeviceShared;

const INCLUDE_RETRY_WINDOW: Duration = Duration::from_millis(100);
const INCLUDE_RETRY_POLL: Duration = Duration::from_millis(1);
const HOT_RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    fn profile(self, shader_model_major: u32, shader_model_minor: u32) -> String {
        let prefix = match self {
            ShaderStage::Vertex => "vs",
            ShaderStage::Fragment => "ps",
            ShaderStage::Compute => "cs",
        };
        format!("{prefix}_{shader_model_major}_{shader_model_minor}")
    }

    fn vulkan_stage_flag(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

#[derive(Clone)]
pub enum ShaderSource {
    Inline { source: String, name: String },
    Path(PathBuf),
    Spirv(Vec<u32>),
}

#[derive(Clone)]
pub struct ShaderCompileInfo {
    pub source: ShaderSource,
    pub stage: ShaderStage,
    pub entry_point: String,
    pub defines: Vec<(String, String)>,
}

pub struct PipelineCompilerInfo {
    pub root_paths: Vec<PathBuf>,
    pub shader_model_major: u32,
    pub shader_model_minor: u32,
    pub optimization_level: u32,
}

impl Default for PipelineCompilerInfo {
    fn default() -> Self {
        Self {
            root_paths: Vec::new(),
            shader_model_major: 6,
            shader_model_minor: 6,
            optimization_level: 3,
        }
    }
}

/// Per-compilation state for the include resolver: which files have already
/// been seen (so a repeated `#pragma once`'d include becomes a no-op) and
/// each file's observed modification time (used for hot-reload checks).
/// Deliberately *not* stored on `PipelineCompiler` -- see `SPEC_FULL.md` §9.
struct IncludeObservations {
    seen: HashSet<PathBuf>,
    mtimes: Vec<(PathBuf, SystemTime)>,
}

impl IncludeObservations {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            mtimes: Vec::new(),
        }
    }
}

pub struct RasterPipelineInfo {
    pub vertex: ShaderCompileInfo,
    pub fragment: ShaderCompileInfo,
    pub color_attachment_formats: Vec<vk::Format>,
    pub depth_attachment_format: Option<vk::Format>,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub push_constant_size: u32,
    pub debug_name: String,
}

pub struct ComputePipelineInfo {
    pub shader: ShaderCompileInfo,
    pub push_constant_size: u32,
    pub debug_name: String,
}

pub struct Pipeline {
    device: Arc<DeviceShared>,
    pub(crate) raw: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) bind_point: vk::PipelineBindPoint,
}

impl Pipeline {
    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let t = self.device.cpu_timeline_value();
        self.device.push_pipeline_zombie(t, self.raw);
    }
}

/// File observation entries recorded the last time a pipeline's sources
/// were hashed for hot reload, and the wall-clock time of that check.
struct HotReloadState {
    last_check: Instant,
    observed: Vec<(PathBuf, SystemTime)>,
}

impl HotReloadState {
    /// Rate-limited to one filesystem check per [`HOT_RELOAD_DEBOUNCE`]
    /// window. Returns whether any observed source file changed since the
    /// last check; if so, refreshes the recorded modification times and the
    /// debounce window. Free of any device dependency so it's directly
    /// testable.
    fn check(&mut self) -> bool {
        if self.last_check.elapsed() < HOT_RELOAD_DEBOUNCE {
            return false;
        }
        self.last_check = Instant::now();

        let mut changed = false;
        for (path, recorded) in self.observed.iter_mut() {
            if let Ok(metadata) = std::fs::metadata(path) {
                if let Ok(modified) = metadata.modified() {
                    if modified > *recorded {
                        changed = true;
                        *recorded = modified;
                    }
                }
            }
        }
        changed
    }
}

pub struct PipelineCompiler {
    device: Arc<DeviceShared>,
    info: PipelineCompilerInfo,
    hot_reload_states: Mutex<Vec<HotReloadState>>,
}

impl PipelineCompiler {
    pub fn new(device: Arc<DeviceShared>, info: PipelineCompilerInfo) -> Self {
        Self {
            device,
            info,
            hot_reload_states: Mutex::new(Vec::new()),
        }
    }

    pub fn create_raster_pipeline(&self, info: &RasterPipelineInfo) -> Result<Pipeline, GpuError> {
        if info.push_constant_size > crate::types::MAX_PUSH_CONSTANT_BYTE_SIZE {
            return Err(GpuError::PushConstantTooLarge {
                pipeline: info.debug_name.clone(),
                size: info.push_constant_size,
                max: crate::types::MAX_PUSH_CONSTANT_BYTE_SIZE,
            });
        }

        let mut observations = IncludeObservations::new();
        let vertex_spirv = self.compile(&info.vertex, &mut observations)?;
        let fragment_spirv = self.compile(&info.fragment, &mut observations)?;

        let device = &self.device.raw;
        let vertex_module = create_shader_module(device, &vertex_spirv)
            .map_err(|e| compile_error(&info.debug_name, e))?;
        let fragment_module = create_shader_module(device, &fragment_spirv)
            .map_err(|e| compile_error(&info.debug_name, e))?;

        let entry_vertex = std::ffi::CString::new(info.vertex.entry_point.clone()).unwrap();
        let entry_fragment = std::ffi::CString::new(info.fragment.entry_point.clone()).unwrap();
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(&entry_vertex),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(&entry_fragment),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(info.polygon_mode)
            .cull_mode(info.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(info.depth_test_enable)
            .depth_write_enable(info.depth_write_enable)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
        let color_blend_attachments: Vec<_> = info
            .color_attachment_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default().color_write_mask(
                    vk::ColorComponentFlags::R
                        | vk::ColorComponentFlags::G
                        | vk::ColorComponentFlags::B
                        | vk::ColorComponentFlags::A,
                )
            })
            .collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&info.color_attachment_formats);
        if let Some(depth_format) = info.depth_attachment_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }

        let layout = {
            let resources = self.device.resources.read();
            resources.pipeline_layout_for_push_constant_size(info.push_constant_size)
        };

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let raw = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map_err(|(_, err)| err)
        .context("failed to create graphics pipeline")
        .map_err(|e| compile_error(&info.debug_name, e))?[0];

        unsafe {
            device.destroy_shader_module(vertex_module, None);
            device.destroy_shader_module(fragment_module, None);
        }

        self.register_hot_reload_state(observations);

        Ok(Pipeline {
            device: self.device.clone(),
            raw,
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }

    pub fn create_compute_pipeline(&self, info: &ComputePipelineInfo) -> Result<Pipeline, GpuError> {
        if info.push_constant_size > crate::types::MAX_PUSH_CONSTANT_BYTE_SIZE {
            return Err(GpuError::PushConstantTooLarge {
                pipeline: info.debug_name.clone(),
                size: info.push_constant_size,
                max: crate::types::MAX_PUSH_CONSTANT_BYTE_SIZE,
            });
        }

        let mut observations = IncludeObservations::new();
        let spirv = self.compile(&info.shader, &mut observations)?;
        let device = &self.device.raw;
        let module =
            create_shader_module(device, &spirv).map_err(|e| compile_error(&info.debug_name, e))?;

        let entry = std::ffi::CString::new(info.shader.entry_point.clone()).unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry);

        let layout = {
            let resources = self.device.resources.read();
            resources.pipeline_layout_for_push_constant_size(info.push_constant_size)
        };

        let create_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);
        let raw = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map_err(|(_, err)| err)
        .context("failed to create compute pipeline")
        .map_err(|e| compile_error(&info.debug_name, e))?[0];

        unsafe { device.destroy_shader_module(module, None) };

        self.register_hot_reload_state(observations);

        Ok(Pipeline {
            device: self.device.clone(),
            raw,
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        })
    }

    fn register_hot_reload_state(&self, observations: IncludeObservations) -> usize {
        let mut states = self.hot_reload_states.lock();
        states.push(HotReloadState {
            last_check: Instant::now(),
            observed: observations.mtimes,
        });
        states.len() - 1
    }

    /// Rate-limited to one filesystem check per 250ms per registered
    /// pipeline. Returns whether any observed source file changed since the
    /// last check; if so, refreshes the recorded modification times.
    pub fn check_if_sources_changed(&self, handle: usize) -> bool {
        let mut states = self.hot_reload_states.lock();
        let Some(state) = states.get_mut(handle) else {
            return false;
        };
        state.check()
    }

    fn compile(&self, info: &ShaderCompileInfo, observations: &mut IncludeObservations) -> Result<Vec<u32>, GpuError> {
        let spirv = match &info.source {
            ShaderSource::Spirv(words) => return Ok(words.clone()),
            ShaderSource::Inline { source, name } => {
                self.compile_hlsl(source, name, info, observations)?
            }
            ShaderSource::Path(path) => {
                let full_path = self.full_path_to_file(path).ok_or_else(|| {
                    GpuError::ShaderSourceNotFound(path.clone())
                })?;
                let source = self.load_shader_source_from_file(&full_path, observations)?;
                self.compile_hlsl(&source, &full_path.to_string_lossy(), info, observations)?
            }
        };
        Ok(spirv)
    }

    fn full_path_to_file(&self, path: &Path) -> Option<PathBuf> {
        if path.is_absolute() && path.exists() {
            return Some(path.to_path_buf());
        }
        for root in &self.info.root_paths {
            let candidate = root.join(path);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    /// Reads a shader/include source file, retrying for up to 100ms (polling
    /// every 1ms) to tolerate editors that truncate-then-write. Returns a
    /// clean `GpuError::ShaderInclude` if the file cannot be opened once the
    /// window elapses, rather than asserting -- see the Open Question note
    /// in `SPEC_FULL.md` §9.
    fn load_shader_source_from_file(
        &self,
        path: &Path,
        observations: &mut IncludeObservations,
    ) -> Result<String, GpuError> {
        let started = Instant::now();
        loop {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    if let Ok(metadata) = std::fs::metadata(path) {
                        if let Ok(modified) = metadata.modified() {
                            observations.mtimes.push((path.to_path_buf(), modified));
                        }
                    }
                    return Ok(self.preprocess_pragma_once(&contents, path));
                }
                Err(err) => {
                    if started.elapsed() >= INCLUDE_RETRY_WINDOW {
                        return Err(GpuError::ShaderInclude {
                            path: path.to_string_lossy().into_owned(),
                            from: path.to_path_buf(),
                            reason: err.to_string(),
                        });
                    }
                    std::thread::sleep(INCLUDE_RETRY_POLL);
                }
            }
        }
    }

    /// Resolves a `#include` directive encountered during compilation. If
    /// `path` was already seen in this compilation, a whitespace blob is
    /// returned so the `#pragma once` guard still gets re-expanded through an
    /// empty body rather than reprocessing the real file.
    fn resolve_include(
        &self,
        requested: &str,
        observations: &mut IncludeObservations,
    ) -> Result<String, GpuError> {
        let path = self.full_path_to_file(Path::new(requested)).ok_or_else(|| {
            GpuError::ShaderInclude {
                path: requested.to_string(),
                from: PathBuf::new(),
                reason: "include not found on any root path".to_string(),
            }
        })?;

        if observations.seen.contains(&path) {
            return Ok(" ".to_string());
        }
        observations.seen.insert(path.clone());
        self.load_shader_source_from_file(&path, observations)
    }

    /// Lowers every `#pragma once` line into an `#if !defined(guard)` /
    /// `#define guard` / trailing `#endif`, where `guard` is the file's
    /// sanitized absolute path -- mirrors `impl_pipeline.cpp`'s
    /// `shader_preprocess`.
    fn preprocess_pragma_once(&self, source: &str, path: &Path) -> String {
        preprocess_pragma_once(source, path)
    }

    fn compile_hlsl(
        &self,
        source: &str,
        name: &str,
        info: &ShaderCompileInfo,
        observations: &mut IncludeObservations,
    ) -> Result<Vec<u32>, GpuError> {
        // Resolve includes up-front: hassle-rs's compile_hlsl takes a fixed
        // include slice rather than a callback, so this crate expands
        // `#include "..."` lines itself before handing the source to DXC.
        let expanded = self.expand_includes(source, observations)?;

        let profile = info.stage.profile(self.info.shader_model_major, self.info.shader_model_minor);
        let mut args: Vec<String> = vec![
            "-spirv".to_string(),
            "-fspv-target-env=vulkan1.1".to_string(),
            "-HV".to_string(),
            "2021".to_string(),
            "-Zpc".to_string(),
            "-WX".to_string(),
            format!("-O{}", self.info.optimization_level),
        ];
        for (key, value) in &info.defines {
            args.push("-D".to_string());
            args.push(format!("{key}={value}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let defines: Vec<(&str, Option<&str>)> = Vec::new();
        hassle_rs::compile_hlsl(name, &expanded, &info.entry_point, &profile, &arg_refs, &defines)
            .map(|bytes| bytes_to_spirv_words(&bytes))
            .map_err(|diagnostics| GpuError::ShaderCompilation {
                name: name.to_string(),
                diagnostics,
            })
    }

    /// Recursively inlines `#include "path"` directives, honoring the
    /// seen-files state so `#pragma once` include guards work across the
    /// whole compilation, not just within one file.
    fn expand_includes(&self, source: &str, observations: &mut IncludeObservations) -> Result<String, GpuError> {
        let mut out = String::with_capacity(source.len());
        for line in source.lines() {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("#include") {
                let requested = rest.trim().trim_matches('"').trim_matches(['<', '>']);
                let included = self.resolve_include(requested, observations)?;
                let expanded = self.expand_includes(&included, observations)?;
                out.push_str(&expanded);
                out.push('\n');
            } else {
                out.push_str(line);
                out.push('\n');
            }
        }
        Ok(out)
    }
}

fn bytes_to_spirv_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn create_shader_module(device: &ash::Device, spirv: &[u32]) -> anyhow::Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(spirv);
    unsafe { device.create_shader_module(&info, None) }.context("failed to create shader module")
}

fn compile_error(name: &str, err: anyhow::Error) -> GpuError {
    GpuError::ShaderCompilation {
        name: name.to_string(),
        diagnostics: format!("{err:#}"),
    }
}

fn sanitize_path_to_identifier(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Lowers every `#pragma once` line into an `#if !defined(guard)` /
/// `#define guard` / trailing `#endif`, where `guard` is the file's
/// sanitized absolute path -- mirrors `impl_pipeline.cpp`'s
/// `shader_preprocess`. Free function so it's testable without a device.
fn preprocess_pragma_once(source: &str, path: &Path) -> String {
    let guard = sanitize_path_to_identifier(path);
    let mut out = String::with_capacity(source.len() + 64);
    let mut saw_pragma_once = false;
    for line in source.lines() {
        if line.trim() == "#pragma once" {
            out.push_str(&format!("#if !defined({guard})\n#define {guard}\n"));
            saw_pragma_once = true;
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    if saw_pragma_once {
        out.push_str("#endif\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_path_replaces_non_alphanumeric() {
        let path = Path::new("/root/crate/shaders/common.hlsl");
        let sanitized = sanitize_path_to_identifier(path);
        assert!(sanitized.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert!(!sanitized.contains('/'));
        assert!(!sanitized.contains('.'));
    }

    #[test]
    fn bytes_to_spirv_words_round_trips() {
        let words = [0x0723_0203u32, 0x0001_0000];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        assert_eq!(bytes_to_spirv_words(&bytes), words);
    }

    #[test]
    fn pragma_once_lowering_is_idempotent_on_reprocessed_source() {
        let path = Path::new("/shaders/common.hlsl");
        let source = "#pragma once\nfloat4 main() { return 0; }\n";
        let once = preprocess_pragma_once(source, path);
        let twice = preprocess_pragma_once(&once, path);
        // Reprocessing finds no further `#pragma once` lines, so the guard
        // block is emitted exactly once either way.
        assert_eq!(once.matches("#define").count(), 1);
        assert_eq!(twice.matches("#define").count(), 1);
    }

    #[test]
    fn pragma_once_guard_is_stable_for_the_same_path() {
        let path = Path::new("/shaders/a.hlsl");
        let a = preprocess_pragma_once("#pragma once\n", path);
        let b = preprocess_pragma_once("#pragma once\n", path);
        assert_eq!(a, b);
    }

    #[test]
    fn hot_reload_debounces_within_the_250ms_window_then_reports_change() {
        let file = tempfile_with_contents("v1");
        let modified = std::fs::metadata(file.path()).unwrap().modified().unwrap();
        let mut state = HotReloadState {
            last_check: Instant::now(),
            observed: vec![(file.path().to_path_buf(), modified)],
        };

        // Touch the file's mtime forward; two checks inside the debounce
        // window must still report no change.
        set_mtime(file.path(), modified + Duration::from_secs(1));
        assert!(!state.check());
        assert!(!state.check());

        std::thread::sleep(HOT_RELOAD_DEBOUNCE + Duration::from_millis(50));
        assert!(state.check());
    }

    struct TempFile(PathBuf);

    impl TempFile {
        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn tempfile_with_contents(contents: &str) -> TempFile {
        let mut path = std::env::temp_dir();
        path.push(format!("loom_gpu_hot_reload_test_{:?}", std::thread::current().id()));
        std::fs::write(&path, contents).unwrap();
        TempFile(path)
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        let file = std::fs::File::open(path).unwrap();
        file.set_modified(time).unwrap();
    }
}
