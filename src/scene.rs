//! Scene description consumed by the renderer: meshes, materials, lights and the objects that
//! combine them.

use std::mem::size_of;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use thiserror::Error;
use tracing::debug;

use crate::renderer::{
    device::{BufferDesc, BufferHandle, Device, MemoryLocation, TextureDesc, TextureHandle},
    human_size, RendererError,
};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub(crate) struct CompactVertex {
    pub(crate) position: [f32; 3],
    pub(crate) normal: [f32; 3],
    pub(crate) uv: [f32; 2],
}

const_assert_eq!(size_of::<CompactVertex>(), 32);

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub(crate) struct Material {
    pub(crate) base_color: [f32; 4],
    /// Index into the bindless texture array, negative for untextured materials.
    pub(crate) texture_id: i32,
    _pad: [u32; 3],
}

const_assert_eq!(size_of::<Material>(), 32);

impl Material {
    pub(crate) fn new(base_color: [f32; 3], texture_id: Option<u32>) -> Material {
        Material {
            base_color: [base_color[0], base_color[1], base_color[2], 1.0],
            texture_id: texture_id.map_or(-1, |id| id as i32),
            _pad: [0; 3],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub(crate) struct Emissive {
    pub(crate) radiance: [f32; 4],
}

const_assert_eq!(size_of::<Emissive>(), 16);

#[derive(Error, Debug, Clone, PartialEq)]
pub(crate) enum SceneError {
    #[error("object has neither a material nor an emissive")]
    NoShading,
    #[error("object has both material {material_id} and emissive {emissive_id}")]
    AmbiguousShading { material_id: u32, emissive_id: u32 },
    #[error("mesh {0} has no triangles")]
    EmptyMesh(String),
    #[error("mesh {mesh} references vertex {index} but has {vertex_count} vertices")]
    IndexOutOfRange { mesh: String, index: u32, vertex_count: u32 },
    #[error("texture {name} has {len} bytes, expected {expected}")]
    TextureSize { name: String, len: usize, expected: usize },
}

/// Exactly one of a material or a light.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Shading {
    Opaque { material_id: u32 },
    Emissive { emissive_id: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RenderableObject {
    pub(crate) mesh: u32,
    pub(crate) shading: Shading,
}

impl RenderableObject {
    pub(crate) fn try_new(
        mesh: u32,
        material_id: Option<u32>,
        emissive_id: Option<u32>,
    ) -> Result<RenderableObject, SceneError> {
        let shading = match (material_id, emissive_id) {
            (Some(material_id), None) => Shading::Opaque { material_id },
            (None, Some(emissive_id)) => Shading::Emissive { emissive_id },
            (None, None) => return Err(SceneError::NoShading),
            (Some(material_id), Some(emissive_id)) => {
                return Err(SceneError::AmbiguousShading {
                    material_id,
                    emissive_id,
                })
            }
        };
        Ok(RenderableObject { mesh, shading })
    }

    pub(crate) fn is_emissive(&self) -> bool {
        matches!(self.shading, Shading::Emissive { .. })
    }
}

/// A range of a shared index/vertex buffer pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Mesh {
    /// Slot in the bindless index buffer array.
    pub(crate) index_buffer: u32,
    /// Slot in the bindless vertex buffer array.
    pub(crate) vertex_buffer: u32,
    pub(crate) first_index: u32,
    /// Added to every index of the mesh.
    pub(crate) vertex_offset: u32,
    pub(crate) index_count: u32,
    pub(crate) vertex_count: u32,
}

impl Mesh {
    pub(crate) fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct MeshData {
    pub(crate) name: String,
    pub(crate) vertices: Vec<CompactVertex>,
    pub(crate) indices: Vec<u32>,
}

impl MeshData {
    pub(crate) fn new(name: &str) -> MeshData {
        MeshData {
            name: name.to_owned(),
            ..MeshData::default()
        }
    }

    /// Appends a planar quad with corners in order around its edge.
    pub(crate) fn quad(mut self, corners: [[f32; 3]; 4]) -> MeshData {
        let [a, b, c, d] = corners.map(|corner| glm::make_vec3(&corner));
        let normal = (b - a).cross(&(c - a)).normalize();
        let base = self.vertices.len() as u32;
        let uvs = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        for (position, uv) in [a, b, c, d].iter().zip(uvs) {
            self.vertices.push(CompactVertex {
                position: [position.x, position.y, position.z],
                normal: [normal.x, normal.y, normal.z],
                uv,
            });
        }
        self.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        self
    }

    /// Axis aligned box without its bottom face.
    pub(crate) fn block(self, min: [f32; 3], max: [f32; 3]) -> MeshData {
        let [x0, y0, z0] = min;
        let [x1, y1, z1] = max;
        self.quad([[x0, y1, z0], [x1, y1, z0], [x1, y1, z1], [x0, y1, z1]])
            .quad([[x0, y0, z0], [x1, y0, z0], [x1, y1, z0], [x0, y1, z0]])
            .quad([[x1, y0, z1], [x0, y0, z1], [x0, y1, z1], [x1, y1, z1]])
            .quad([[x0, y0, z1], [x0, y0, z0], [x0, y1, z0], [x0, y1, z1]])
            .quad([[x1, y0, z0], [x1, y0, z1], [x1, y1, z1], [x1, y1, z0]])
    }

    fn validate(&self) -> Result<(), SceneError> {
        if self.indices.is_empty() || self.indices.len() % 3 != 0 {
            return Err(SceneError::EmptyMesh(self.name.clone()));
        }
        let vertex_count = self.vertices.len() as u32;
        match self.indices.iter().find(|&&index| index >= vertex_count) {
            Some(&index) => Err(SceneError::IndexOutOfRange {
                mesh: self.name.clone(),
                index,
                vertex_count,
            }),
            None => Ok(()),
        }
    }
}

/// Device resources of the scene. Meshes, materials and lights are referenced by index.
#[derive(Default)]
pub(crate) struct AssetPool {
    meshes: Vec<Mesh>,
    materials: Vec<Material>,
    emissives: Vec<Emissive>,
    textures: Vec<TextureHandle>,
    index_buffers: Vec<BufferHandle>,
    vertex_buffers: Vec<BufferHandle>,
}

impl AssetPool {
    pub(crate) fn new() -> AssetPool {
        AssetPool::default()
    }

    /// Packs `meshes` into one shared index/vertex buffer pair and stages the upload. Returns the
    /// mesh ids in order.
    pub(crate) fn add_meshes(
        &mut self,
        device: &Device,
        name: &str,
        meshes: &[MeshData],
    ) -> Result<Vec<u32>, RendererError> {
        meshes.iter().try_for_each(MeshData::validate)?;
        if meshes.is_empty() {
            return Ok(vec![]);
        }

        let index_slot = self.index_buffers.len() as u32;
        let vertex_slot = self.vertex_buffers.len() as u32;
        let mut indices: Vec<u32> = vec![];
        let mut vertices: Vec<CompactVertex> = vec![];
        let mut ids = Vec::with_capacity(meshes.len());
        for mesh in meshes {
            ids.push(self.meshes.len() as u32);
            self.meshes.push(Mesh {
                index_buffer: index_slot,
                vertex_buffer: vertex_slot,
                first_index: indices.len() as u32,
                vertex_offset: vertices.len() as u32,
                index_count: mesh.indices.len() as u32,
                vertex_count: mesh.vertices.len() as u32,
            });
            indices.extend_from_slice(&mesh.indices);
            vertices.extend_from_slice(&mesh.vertices);
        }

        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let index_bytes: &[u8] = bytemuck::cast_slice(&indices);
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let index_buffer = device.create_buffer(&BufferDesc {
            name: &format!("{} index buffer", name),
            size: index_bytes.len() as u64,
            usage,
            location: MemoryLocation::GpuOnly,
        })?;
        self.index_buffers.push(index_buffer);
        let vertex_buffer = device.create_buffer(&BufferDesc {
            name: &format!("{} vertex buffer", name),
            size: vertex_bytes.len() as u64,
            usage,
            location: MemoryLocation::GpuOnly,
        })?;
        self.vertex_buffers.push(vertex_buffer);
        device.stage_buffer_upload(index_buffer, 0, index_bytes)?;
        device.stage_buffer_upload(vertex_buffer, 0, vertex_bytes)?;

        debug!(
            name,
            meshes = meshes.len(),
            indices = %human_size(index_bytes.len() as u64),
            vertices = %human_size(vertex_bytes.len() as u64),
            "staged mesh buffers"
        );
        Ok(ids)
    }

    pub(crate) fn add_material(&mut self, material: Material) -> u32 {
        self.materials.push(material);
        self.materials.len() as u32 - 1
    }

    pub(crate) fn add_emissive(&mut self, radiance: [f32; 3]) -> u32 {
        self.emissives.push(Emissive {
            radiance: [radiance[0], radiance[1], radiance[2], 1.0],
        });
        self.emissives.len() as u32 - 1
    }

    /// Stages an RGBA8 sRGB texture, returns its bindless slot.
    pub(crate) fn add_texture(
        &mut self,
        device: &Device,
        name: &str,
        extent: vk::Extent2D,
        rgba: &[u8],
    ) -> Result<u32, RendererError> {
        let expected = extent.width as usize * extent.height as usize * 4;
        if rgba.len() != expected {
            return Err(SceneError::TextureSize {
                name: name.to_owned(),
                len: rgba.len(),
                expected,
            }
            .into());
        }
        let texture = device.create_texture(&TextureDesc {
            name,
            extent,
            format: vk::Format::R8G8B8A8_SRGB,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            initial_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        })?;
        self.textures.push(texture);
        device.stage_texture_upload(texture, rgba)?;
        Ok(self.textures.len() as u32 - 1)
    }

    pub(crate) fn mesh(&self, id: u32) -> Option<&Mesh> {
        self.meshes.get(id as usize)
    }

    pub(crate) fn materials(&self) -> &[Material] {
        &self.materials
    }

    pub(crate) fn emissives(&self) -> &[Emissive] {
        &self.emissives
    }

    pub(crate) fn textures(&self) -> &[TextureHandle] {
        &self.textures
    }

    pub(crate) fn index_buffers(&self) -> &[BufferHandle] {
        &self.index_buffers
    }

    pub(crate) fn vertex_buffers(&self) -> &[BufferHandle] {
        &self.vertex_buffers
    }

    /// The device must be idle.
    pub(crate) fn destroy(self, device: &Device) {
        self.textures.into_iter().for_each(|texture| device.destroy_texture(texture));
        self.index_buffers
            .into_iter()
            .chain(self.vertex_buffers)
            .for_each(|buffer| device.destroy_buffer(buffer));
    }
}

/// The static part of the scene. Changes mark it dirty, which makes the renderer rebuild its
/// acceleration structures on the next frame.
pub(crate) struct Scene {
    objects: Vec<RenderableObject>,
    dirty: bool,
}

impl Scene {
    pub(crate) fn new(objects: Vec<RenderableObject>) -> Scene {
        Scene { objects, dirty: true }
    }

    pub(crate) fn objects(&self) -> &[RenderableObject] {
        &self.objects
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

fn checker_texture(size: u32, cells: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|ix| {
            let (x, y) = (ix % size, ix / size);
            let light = ((x * cells / size) + (y * cells / size)) % 2 == 0;
            if light {
                [235, 235, 235, 255]
            } else {
                [60, 60, 60, 255]
            }
        })
        .collect()
}

/// Box with a red left wall, a green right wall, two blocks and a ceiling light. The open side
/// faces `-z`.
pub(crate) fn cornell_box(device: &Device) -> Result<(AssetPool, Scene), RendererError> {
    let mut pool = AssetPool::new();

    let checker = pool.add_texture(
        device,
        "Floor checker texture",
        vk::Extent2D { width: 64, height: 64 },
        &checker_texture(64, 8),
    )?;
    let white = pool.add_material(Material::new([0.73, 0.73, 0.73], None));
    let red = pool.add_material(Material::new([0.65, 0.05, 0.05], None));
    let green = pool.add_material(Material::new([0.12, 0.45, 0.15], None));
    let floor_material = pool.add_material(Material::new([0.9, 0.9, 0.9], Some(checker)));
    let light = pool.add_emissive([12.0, 9.0, 4.0]);

    let meshes = [
        MeshData::new("floor").quad([
            [-1.0, -1.0, -1.0],
            [1.0, -1.0, -1.0],
            [1.0, -1.0, 1.0],
            [-1.0, -1.0, 1.0],
        ]),
        MeshData::new("ceiling").quad([[-1.0, 1.0, -1.0], [-1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, -1.0]]),
        MeshData::new("back wall").quad([[-1.0, -1.0, 1.0], [1.0, -1.0, 1.0], [1.0, 1.0, 1.0], [-1.0, 1.0, 1.0]]),
        MeshData::new("left wall").quad([
            [-1.0, -1.0, -1.0],
            [-1.0, -1.0, 1.0],
            [-1.0, 1.0, 1.0],
            [-1.0, 1.0, -1.0],
        ]),
        MeshData::new("right wall").quad([[1.0, -1.0, 1.0], [1.0, -1.0, -1.0], [1.0, 1.0, -1.0], [1.0, 1.0, 1.0]]),
        MeshData::new("short block").block([0.05, -1.0, -0.55], [0.65, -0.4, 0.05]),
        MeshData::new("tall block").block([-0.7, -1.0, 0.0], [-0.1, 0.2, 0.6]),
        MeshData::new("ceiling light").quad([
            [-0.25, 0.99, -0.25],
            [0.25, 0.99, -0.25],
            [0.25, 0.99, 0.25],
            [-0.25, 0.99, 0.25],
        ]),
    ];
    let ids = pool.add_meshes(device, "Cornell box", &meshes)?;
    // (material, emissive) per mesh
    let shading = [
        (Some(floor_material), None),
        (Some(white), None),
        (Some(white), None),
        (Some(red), None),
        (Some(green), None),
        (Some(white), None),
        (Some(white), None),
        (None, Some(light)),
    ];

    let objects = ids
        .iter()
        .zip(shading)
        .map(|(&mesh, (material, emissive))| RenderableObject::try_new(mesh, material, emissive))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((pool, Scene::new(objects)))
}

#[cfg(test)]
impl RenderableObject {
    pub(crate) fn opaque(mesh: u32, material_id: u32) -> RenderableObject {
        RenderableObject {
            mesh,
            shading: Shading::Opaque { material_id },
        }
    }

    pub(crate) fn emissive(mesh: u32, emissive_id: u32) -> RenderableObject {
        RenderableObject {
            mesh,
            shading: Shading::Emissive { emissive_id },
        }
    }
}
