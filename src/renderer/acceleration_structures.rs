use std::mem::{size_of, size_of_val};

use ash::vk;
use bytemuck::{Pod, Zeroable};
use num_traits::ToPrimitive;
use profiling::scope;
use static_assertions::const_assert_eq;
use tracing::{debug, info};

use super::{
    device::{
        AccelerationStructureHandle, BufferDesc, BufferHandle, CommandRecorder, Device, GeometryDesc, InstanceDesc,
        MemoryBarrier, MemoryLocation,
    },
    human_size,
    retirement::Retired,
    RendererError,
};
use crate::scene::{AssetPool, CompactVertex, Emissive, Mesh, RenderableObject, Shading};

/// Instance custom index of the non-emissive BLAS.
pub(crate) const NONEMISSIVE_INSTANCE: u32 = 0;
/// Instance custom index of the emissive BLAS.
pub(crate) const EMISSIVE_INSTANCE: u32 = 1;

/// Maps an instance and a geometry index inside it to a global object slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct BindlessObjectTable {
    pub(crate) nonemissive_start: u32,
    pub(crate) nonemissive_count: u32,
    pub(crate) emissive_start: u32,
    pub(crate) emissive_count: u32,
}

const_assert_eq!(size_of::<BindlessObjectTable>(), 16);

impl BindlessObjectTable {
    pub(crate) fn new(nonemissive_count: u32, emissive_count: u32) -> BindlessObjectTable {
        BindlessObjectTable {
            nonemissive_start: 0,
            nonemissive_count,
            emissive_start: nonemissive_count,
            emissive_count,
        }
    }

    pub(crate) fn object_count(&self) -> u32 {
        self.nonemissive_count + self.emissive_count
    }

    pub(crate) fn slot(&self, instance_custom_index: u32, geometry_index: u32) -> Option<u32> {
        let (start, count) = match instance_custom_index {
            NONEMISSIVE_INSTANCE => (self.nonemissive_start, self.nonemissive_count),
            EMISSIVE_INSTANCE => (self.emissive_start, self.emissive_count),
            _ => return None,
        };
        (geometry_index < count).then(|| start + geometry_index)
    }
}

/// Where hit shading finds the attributes of an object.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct GeometryRecord {
    pub(crate) index_buffer: u32,
    pub(crate) first_index: u32,
    pub(crate) vertex_buffer: u32,
    pub(crate) vertex_offset: u32,
}

const_assert_eq!(size_of::<GeometryRecord>(), 16);

/// Splits objects into non-emissive and emissive ones, keeping their relative order.
pub(crate) fn partition(objects: &[RenderableObject]) -> (Vec<RenderableObject>, Vec<RenderableObject>) {
    objects.iter().copied().partition(|object| !object.is_emissive())
}

/// Acceleration structures and flat scene buffers of one rebuild. Read-only once built.
#[derive(Debug)]
pub(crate) struct SceneAcceleration {
    pub(crate) nonemissive_blas: AccelerationStructureHandle,
    pub(crate) emissive_blas: AccelerationStructureHandle,
    pub(crate) tlas: AccelerationStructureHandle,
    pub(crate) object_table: BufferHandle,
    pub(crate) materials: BufferHandle,
    pub(crate) material_ids: BufferHandle,
    pub(crate) emissives: BufferHandle,
    pub(crate) triangle_counts: BufferHandle,
    pub(crate) geometry_records: BufferHandle,
}

impl SceneAcceleration {
    pub(crate) fn retire(self) -> Vec<Retired> {
        vec![
            Retired::AccelerationStructure(self.tlas),
            Retired::AccelerationStructure(self.nonemissive_blas),
            Retired::AccelerationStructure(self.emissive_blas),
            Retired::Buffer(self.object_table),
            Retired::Buffer(self.materials),
            Retired::Buffer(self.material_ids),
            Retired::Buffer(self.emissives),
            Retired::Buffer(self.triangle_counts),
            Retired::Buffer(self.geometry_records),
        ]
    }
}

pub(crate) struct SceneAccelerationBuilder {
    bindless_capacity: u32,
}

impl SceneAccelerationBuilder {
    pub(crate) fn new(bindless_capacity: u32) -> SceneAccelerationBuilder {
        SceneAccelerationBuilder { bindless_capacity }
    }

    pub(crate) fn bindless_capacity(&self) -> u32 {
        self.bindless_capacity
    }

    pub(crate) fn validate(&self, objects: &[RenderableObject], pool: &AssetPool) -> Result<(), RendererError> {
        for (what, count) in [
            ("textures", pool.textures().len()),
            ("index buffers", pool.index_buffers().len()),
            ("vertex buffers", pool.vertex_buffers().len()),
        ] {
            if count > self.bindless_capacity as usize {
                return Err(RendererError::BindlessCapacity {
                    what,
                    count,
                    capacity: self.bindless_capacity,
                });
            }
        }

        for (material_ix, material) in pool.materials().iter().enumerate() {
            if material.texture_id >= 0 && material.texture_id as usize >= pool.textures().len() {
                return Err(RendererError::UnknownTexture {
                    material: material_ix,
                    texture_id: material.texture_id,
                });
            }
        }

        for (object, renderable) in objects.iter().enumerate() {
            if pool.mesh(renderable.mesh).is_none() {
                return Err(RendererError::UnknownMesh {
                    object,
                    mesh: renderable.mesh,
                });
            }
            match renderable.shading {
                Shading::Opaque { material_id } if material_id as usize >= pool.materials().len() => {
                    return Err(RendererError::UnknownMaterial { object, material_id })
                }
                Shading::Emissive { emissive_id } if emissive_id as usize >= pool.emissives().len() => {
                    return Err(RendererError::UnknownEmissive { object, emissive_id })
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Builds the acceleration structure pair, the TLAS and the bindless scene buffers for
    /// `objects`. Flushes every staged upload and records the builds into `recorder`, which must be
    /// submitted before anything reads the result.
    pub(crate) fn rebuild(
        &self,
        device: &Device,
        recorder: &CommandRecorder,
        objects: &[RenderableObject],
        pool: &AssetPool,
    ) -> Result<SceneAcceleration, RendererError> {
        scope!("acceleration_structures::rebuild");

        self.validate(objects, pool)?;

        let mut created = vec![];
        match self.build(device, recorder, objects, pool, &mut created) {
            Ok(acceleration) => Ok(acceleration),
            Err(err) => {
                created.into_iter().for_each(|resource: Retired| resource.destroy(device));
                Err(err)
            }
        }
    }

    fn build(
        &self,
        device: &Device,
        recorder: &CommandRecorder,
        objects: &[RenderableObject],
        pool: &AssetPool,
        created: &mut Vec<Retired>,
    ) -> Result<SceneAcceleration, RendererError> {
        let (nonemissive, emissive) = partition(objects);
        let table = BindlessObjectTable::new(count(nonemissive.len())?, count(emissive.len())?);
        // validated above
        let meshes = nonemissive
            .iter()
            .chain(emissive.iter())
            .filter_map(|object| pool.mesh(object.mesh).copied())
            .collect::<Vec<_>>();

        let geometry = |mesh: &Mesh| GeometryDesc {
            index_buffer: pool.index_buffers()[mesh.index_buffer as usize],
            index_offset: u64::from(mesh.first_index) * size_of::<u32>() as u64,
            index_type: vk::IndexType::UINT32,
            vertex_buffer: pool.vertex_buffers()[mesh.vertex_buffer as usize],
            vertex_offset: u64::from(mesh.vertex_offset) * size_of::<CompactVertex>() as u64,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_stride: size_of::<CompactVertex>() as u64,
            triangle_count: mesh.triangle_count(),
            flags: vk::GeometryFlagsKHR::OPAQUE,
        };
        let (nonemissive_meshes, emissive_meshes) = meshes.split_at(nonemissive.len());

        let nonemissive_blas = device.create_bottom_level(
            "Non-emissive BLAS",
            &nonemissive_meshes.iter().map(geometry).collect::<Vec<_>>(),
        )?;
        created.push(Retired::AccelerationStructure(nonemissive_blas));
        // built even when there are no lights, the TLAS always instances both
        let emissive_blas =
            device.create_bottom_level("Emissive BLAS", &emissive_meshes.iter().map(geometry).collect::<Vec<_>>())?;
        created.push(Retired::AccelerationStructure(emissive_blas));
        let tlas = device.create_top_level(
            "Scene TLAS",
            &[
                InstanceDesc {
                    blas: nonemissive_blas,
                    custom_index: NONEMISSIVE_INSTANCE,
                    mask: 0xff,
                    transform: InstanceDesc::IDENTITY,
                },
                InstanceDesc {
                    blas: emissive_blas,
                    custom_index: EMISSIVE_INSTANCE,
                    mask: 0xff,
                    transform: InstanceDesc::IDENTITY,
                },
            ],
        )?;
        created.push(Retired::AccelerationStructure(tlas));

        let material_id_records = nonemissive
            .iter()
            .filter_map(|object| match object.shading {
                Shading::Opaque { material_id } => Some(material_id),
                Shading::Emissive { .. } => None,
            })
            .collect::<Vec<u32>>();
        let emissive_records = emissive
            .iter()
            .filter_map(|object| match object.shading {
                Shading::Emissive { emissive_id } => pool.emissives().get(emissive_id as usize).copied(),
                Shading::Opaque { .. } => None,
            })
            .collect::<Vec<Emissive>>();
        let triangle_count_records = meshes.iter().map(|mesh| mesh.triangle_count()).collect::<Vec<u32>>();
        let geometry_record_list = meshes
            .iter()
            .map(|mesh| GeometryRecord {
                index_buffer: mesh.index_buffer,
                first_index: mesh.first_index,
                vertex_buffer: mesh.vertex_buffer,
                vertex_offset: mesh.vertex_offset,
            })
            .collect::<Vec<_>>();

        let materials = staged_table(device, created, "Materials buffer", bytemuck::cast_slice(pool.materials()))?;
        let material_ids = staged_table(
            device,
            created,
            "Material ids buffer",
            bytemuck::cast_slice(&material_id_records),
        )?;
        let emissives = staged_table(device, created, "Emissives buffer", bytemuck::cast_slice(&emissive_records))?;
        let triangle_counts = staged_table(
            device,
            created,
            "Triangle counts buffer",
            bytemuck::cast_slice(&triangle_count_records),
        )?;
        let geometry_records = staged_table(
            device,
            created,
            "Geometry records buffer",
            bytemuck::cast_slice(&geometry_record_list),
        )?;
        let table_bytes = [
            size_of_val(pool.materials()),
            size_of_val(material_id_records.as_slice()),
            size_of_val(emissive_records.as_slice()),
            size_of_val(triangle_count_records.as_slice()),
            size_of_val(geometry_record_list.as_slice()),
        ]
        .iter()
        .sum::<usize>() as u64;

        let object_table = device.create_buffer(&BufferDesc {
            name: "Bindless object table",
            size: size_of::<BindlessObjectTable>() as u64,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
            location: MemoryLocation::CpuToGpu,
        })?;
        created.push(Retired::Buffer(object_table));
        device.write_mapped(object_table, 0, bytemuck::bytes_of(&table))?;

        let flushed = device.flush_staging()?;
        recorder.barrier(MemoryBarrier::UPLOAD_TO_CONSUMERS)?;
        recorder.build_acceleration_structure(nonemissive_blas)?;
        recorder.build_acceleration_structure(emissive_blas)?;
        recorder.barrier(MemoryBarrier::BLAS_TO_TLAS)?;
        recorder.build_acceleration_structure(tlas)?;
        recorder.barrier(MemoryBarrier::TLAS_TO_TRACE)?;

        info!(
            nonemissive = table.nonemissive_count,
            emissive = table.emissive_count,
            flushed_uploads = flushed,
            "rebuilt scene acceleration structures"
        );
        debug!(tables = %human_size(table_bytes), "bindless scene tables");

        Ok(SceneAcceleration {
            nonemissive_blas,
            emissive_blas,
            tlas,
            object_table,
            materials,
            material_ids,
            emissives,
            triangle_counts,
            geometry_records,
        })
    }
}

fn staged_table(
    device: &Device,
    created: &mut Vec<Retired>,
    name: &str,
    records: &[u8],
) -> Result<BufferHandle, RendererError> {
    let buffer = device.create_buffer(&BufferDesc {
        name,
        // empty tables still need a buffer to bind
        size: records.len().max(16) as u64,
        usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        location: MemoryLocation::GpuOnly,
    })?;
    created.push(Retired::Buffer(buffer));
    if !records.is_empty() {
        device.stage_buffer_upload(buffer, 0, records)?;
    }
    Ok(buffer)
}

fn count(len: usize) -> Result<u32, RendererError> {
    len.to_u32().ok_or(RendererError::BindlessCapacity {
        what: "objects",
        count: len,
        capacity: u32::MAX,
    })
}
