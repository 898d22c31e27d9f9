use thiserror::Error;

use super::{device::DeviceError, shaders::ShaderError};
use crate::scene::SceneError;

#[derive(Error, Debug)]
pub(crate) enum RendererError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error("the scene acceleration structures were never built")]
    SceneNotBuilt,
    #[error("{0} frames in flight is outside of 1..=8")]
    FlightCount(u32),
    #[error("flight index {index} is out of range for {count} flights")]
    FlightIndex { index: u32, count: u32 },
    #[error("{slots} reservoir buffers cannot be exchanged between {flights} flights")]
    ReservoirSlots { slots: u32, flights: u32 },
    #[error("object {object} references unknown mesh {mesh}")]
    UnknownMesh { object: usize, mesh: u32 },
    #[error("object {object} references unknown material {material_id}")]
    UnknownMaterial { object: usize, material_id: u32 },
    #[error("object {object} references unknown emissive {emissive_id}")]
    UnknownEmissive { object: usize, emissive_id: u32 },
    #[error("material {material} references unknown texture {texture_id}")]
    UnknownTexture { material: usize, texture_id: i32 },
    #[error("{count} {what} do not fit into bindless arrays of {capacity}")]
    BindlessCapacity {
        what: &'static str,
        count: usize,
        capacity: u32,
    },
}
