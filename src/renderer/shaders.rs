use std::{
    fs,
    mem::size_of,
    path::{Path, PathBuf},
};

use ash::vk;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use thiserror::Error;
use tracing::{info, warn};

use super::{
    device::{
        Device, DeviceError, PipelineHandle, RasterPipelineDesc, RayTracingPipelineDesc, ShaderModule,
        ShaderModuleDesc,
    },
    retirement::Retired,
};

// Descriptor set layouts shared by the host and the shaders. Every bindless array has exactly
// `bindless_capacity` elements, unused slots hold the padding resources.

pub(crate) mod frame_set {
    pub(crate) const INDEX: u32 = 0;
    pub(crate) const CAMERA: u32 = 0;
    pub(crate) const DIRECT_LIGHT_PARAMS: u32 = 1;
    pub(crate) const RESERVOIR_HISTORY: u32 = 2;
    pub(crate) const RT_OUTPUT: u32 = 3;
    pub(crate) const RESERVOIR_OUT: u32 = 4;
}

pub(crate) mod material_set {
    pub(crate) const INDEX: u32 = 1;
    pub(crate) const SAMPLER: u32 = 0;
    pub(crate) const MATERIALS: u32 = 1;
    pub(crate) const MATERIAL_IDS: u32 = 2;
    pub(crate) const EMISSIVES: u32 = 3;
    pub(crate) const TEXTURES: u32 = 4;
}

pub(crate) mod geometry_set {
    pub(crate) const INDEX: u32 = 2;
    pub(crate) const TLAS: u32 = 0;
    pub(crate) const OBJECT_TABLE: u32 = 1;
    pub(crate) const TRIANGLE_COUNTS: u32 = 2;
    pub(crate) const GEOMETRY_RECORDS: u32 = 3;
    pub(crate) const INDEX_BUFFERS: u32 = 4;
}

pub(crate) mod vertex_set {
    pub(crate) const INDEX: u32 = 3;
    pub(crate) const VERTEX_BUFFERS: u32 = 0;
}

/// Bound at the graphics bind point for the composite pass.
pub(crate) mod beauty_set {
    pub(crate) const INDEX: u32 = 0;
    pub(crate) const SAMPLER: u32 = 0;
    pub(crate) const RT_OUTPUT: u32 = 1;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct CameraParams {
    pub(crate) inv_view: [[f32; 4]; 4],
    pub(crate) inv_proj: [[f32; 4]; 4],
}

const_assert_eq!(size_of::<CameraParams>(), 128);

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct DirectLightParams {
    /// Decorrelates the per-pixel random streams between frames.
    pub(crate) rng_stream_id: u32,
    pub(crate) initial_candidates: u32,
    pub(crate) history_cap: u32,
    pub(crate) flags: u32,
    pub(crate) ambient: [f32; 4],
}

const_assert_eq!(size_of::<DirectLightParams>(), 32);

impl DirectLightParams {
    pub(crate) const TEMPORAL_REUSE: u32 = 0b1;

    pub(crate) fn temporal_reuse(&self) -> bool {
        self.flags & Self::TEMPORAL_REUSE != 0
    }
}

#[derive(Error, Debug)]
pub(crate) enum ShaderError {
    #[error("failed to read shader source {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub(crate) struct ShaderSrc {
    pub(crate) file_path: PathBuf,
    pub(crate) entry: &'static str,
    pub(crate) defines: Vec<String>,
    pub(crate) stage: vk::ShaderStageFlags,
}

impl ShaderSrc {
    pub(crate) fn new(shader_dir: &Path, file: &str, entry: &'static str, stage: vk::ShaderStageFlags) -> ShaderSrc {
        ShaderSrc {
            file_path: shader_dir.join(file),
            entry,
            defines: vec![],
            stage,
        }
    }

    pub(crate) fn define(mut self, define: String) -> ShaderSrc {
        self.defines.push(define);
        self
    }

    pub(crate) fn source(&self) -> Result<String, ShaderError> {
        fs::read_to_string(&self.file_path).map_err(|source| ShaderError::Io {
            path: self.file_path.display().to_string(),
            source,
        })
    }

    pub(crate) fn compile(&self, device: &Device) -> Result<ShaderModule, ShaderError> {
        let source = self.source()?;
        Ok(device.compile_shader(&ShaderModuleDesc {
            path: &self.file_path,
            source: &source,
            entry: self.entry,
            stage: self.stage,
            defines: &self.defines,
        })?)
    }
}

/// Result of (re)building the pipelines. A failure is only fatal when there is nothing to fall back to.
#[derive(Debug)]
pub(crate) enum ShaderCompileOutcome<T> {
    Success(T),
    RecoverableFailure(ShaderError),
    FatalFailure(ShaderError),
}

impl<T> ShaderCompileOutcome<T> {
    pub(crate) fn from_result(result: Result<T, ShaderError>, is_first_load: bool) -> ShaderCompileOutcome<T> {
        match result {
            Ok(value) => ShaderCompileOutcome::Success(value),
            Err(err) if is_first_load => ShaderCompileOutcome::FatalFailure(err),
            Err(err) => ShaderCompileOutcome::RecoverableFailure(err),
        }
    }
}

pub(crate) struct RendererPipelines {
    pub(crate) direct_light: PipelineHandle,
    pub(crate) beauty: PipelineHandle,
}

pub(crate) const DIRECT_LIGHT_SHADER: &str = "direct_light.hlsl";
pub(crate) const BEAUTY_SHADER: &str = "beauty.hlsl";

impl RendererPipelines {
    pub(crate) fn compile(
        device: &Device,
        shader_dir: &Path,
        bindless_capacity: u32,
        color_format: vk::Format,
    ) -> Result<RendererPipelines, ShaderError> {
        let capacity_define = format!("BINDLESS_CAPACITY={}", bindless_capacity);
        let rt_shader = |entry: &'static str, stage: vk::ShaderStageFlags| {
            ShaderSrc::new(shader_dir, DIRECT_LIGHT_SHADER, entry, stage).define(capacity_define.clone())
        };

        let raygen = rt_shader("RayGen", vk::ShaderStageFlags::RAYGEN_KHR).compile(device)?;
        let miss = rt_shader("Miss", vk::ShaderStageFlags::MISS_KHR).compile(device)?;
        let shadow_miss = rt_shader("ShadowMiss", vk::ShaderStageFlags::MISS_KHR).compile(device)?;
        let closest_hit = rt_shader("ClosestHit", vk::ShaderStageFlags::CLOSEST_HIT_KHR).compile(device)?;
        let emissive_hit = rt_shader("EmissiveClosestHit", vk::ShaderStageFlags::CLOSEST_HIT_KHR).compile(device)?;

        let vertex = ShaderSrc::new(shader_dir, BEAUTY_SHADER, "VsMain", vk::ShaderStageFlags::VERTEX).compile(device)?;
        let fragment =
            ShaderSrc::new(shader_dir, BEAUTY_SHADER, "FsMain", vk::ShaderStageFlags::FRAGMENT).compile(device)?;

        let direct_light = device.create_ray_tracing_pipeline(&RayTracingPipelineDesc {
            name: "Direct light RT pipeline",
            raygen: &raygen,
            miss: &[&miss, &shadow_miss],
            // hit group index doubles as the instance custom index
            closest_hit_groups: &[&closest_hit, &emissive_hit],
            max_payload_size: 16,
            max_attribute_size: 8,
            max_recursion_depth: 2,
            bindless_capacity,
        })?;
        let beauty = match device.create_raster_pipeline(&RasterPipelineDesc {
            name: "Beauty composite pipeline",
            vertex: &vertex,
            fragment: &fragment,
            color_format,
        }) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                device.destroy_pipeline(direct_light);
                return Err(err.into());
            }
        };
        info!(bindless_capacity, "compiled pipelines");

        Ok(RendererPipelines { direct_light, beauty })
    }

    /// Compiles a replacement set of pipelines, keeping `self` when that fails after the first load.
    pub(crate) fn reload(
        &mut self,
        device: &Device,
        shader_dir: &Path,
        bindless_capacity: u32,
        color_format: vk::Format,
    ) -> ShaderCompileOutcome<Vec<Retired>> {
        let result = RendererPipelines::compile(device, shader_dir, bindless_capacity, color_format);
        match ShaderCompileOutcome::from_result(result, false) {
            ShaderCompileOutcome::Success(new) => {
                let old = std::mem::replace(self, new);
                ShaderCompileOutcome::Success(old.retire())
            }
            ShaderCompileOutcome::RecoverableFailure(err) => {
                warn!(error = %err, "shader reload failed, keeping the previous pipelines");
                ShaderCompileOutcome::RecoverableFailure(err)
            }
            ShaderCompileOutcome::FatalFailure(err) => ShaderCompileOutcome::FatalFailure(err),
        }
    }

    pub(crate) fn retire(self) -> Vec<Retired> {
        vec![Retired::Pipeline(self.direct_light), Retired::Pipeline(self.beauty)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_fatal_only_on_first_load() {
        let failure = || Err::<(), _>(ShaderError::Device(DeviceError::SwapchainExhausted));
        assert!(matches!(
            ShaderCompileOutcome::from_result(failure(), true),
            ShaderCompileOutcome::FatalFailure(_)
        ));
        assert!(matches!(
            ShaderCompileOutcome::from_result(failure(), false),
            ShaderCompileOutcome::RecoverableFailure(_)
        ));
        assert!(matches!(
            ShaderCompileOutcome::from_result(Ok(()), true),
            ShaderCompileOutcome::Success(())
        ));
    }

    #[test]
    fn missing_sources_report_the_path() {
        let src = ShaderSrc::new(Path::new("/nonexistent"), "missing.hlsl", "Main", vk::ShaderStageFlags::VERTEX);
        let err = src.source().unwrap_err();
        assert!(err.to_string().contains("missing.hlsl"));
    }
}
