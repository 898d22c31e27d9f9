//! CPU rendition of the direct lighting ray tracing pipeline.
//!
//! Every pixel traces one primary ray, resamples `initial_candidates` points on emissive triangles
//! into a fresh reservoir, optionally merges last frame's reservoir of the same pixel, and shades
//! the surviving sample with one shadow ray.

use std::f32::consts::PI;

use ash::vk;
use profiling::scope;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;

use super::{
    geometry::{AccelerationKind, BuiltTopLevel},
    queue::Bindings,
    resources::{SoftBuffer, SoftTexture},
    PipelineKind, ResourceKey, SoftDescriptorSet, State,
};
use crate::{
    renderer::{
        acceleration_structures::{BindlessObjectTable, GeometryRecord, EMISSIVE_INSTANCE},
        device::{
            AccelerationStructureHandle, BufferHandle, DescriptorResource, DeviceError, PipelineHandle, SamplerHandle,
            TextureHandle,
        },
        reservoir::{LightSample, Reservoir},
        shaders::{frame_set, geometry_set, material_set, vertex_set, CameraParams, DirectLightParams},
    },
    scene::{CompactVertex, Emissive, Material},
};

const RAY_EPSILON: f32 = 1e-3;

/// The resources one descriptor set binds, looked up by binding number.
pub(super) struct BoundSet<'a> {
    index: u32,
    set: &'a SoftDescriptorSet,
}

impl<'a> BoundSet<'a> {
    pub(super) fn resolve(
        state: &'a State,
        bindings: &Bindings,
        bind_point: vk::PipelineBindPoint,
        index: u32,
    ) -> Result<BoundSet<'a>, DeviceError> {
        let set = state.descriptor_set(bindings.set(bind_point, index)?)?;
        Ok(BoundSet { index, set })
    }

    fn invalid(&self, binding: u32, reason: String) -> DeviceError {
        DeviceError::InvalidDescriptor {
            set: self.index,
            binding,
            reason,
        }
    }

    fn resource<T>(
        &self,
        binding: u32,
        expected: &str,
        pick: impl FnOnce(&'a DescriptorResource) -> Option<T>,
    ) -> Result<T, DeviceError> {
        let resource = self
            .set
            .bindings
            .get(&binding)
            .ok_or_else(|| self.invalid(binding, format!("nothing bound in {}", self.set.name)))?;
        pick(resource).ok_or_else(|| {
            self.invalid(
                binding,
                format!("expected {}, found {:?}", expected, resource.descriptor_type()),
            )
        })
    }

    fn uniform_buffer(&self, binding: u32) -> Result<BufferHandle, DeviceError> {
        self.resource(binding, "a uniform buffer", |resource| match *resource {
            DescriptorResource::UniformBuffer(buffer) => Some(buffer),
            _ => None,
        })
    }

    fn read_only_buffer(&self, binding: u32) -> Result<BufferHandle, DeviceError> {
        self.resource(binding, "a read-only storage buffer", |resource| match *resource {
            DescriptorResource::ReadOnlyStorageBuffer(buffer) => Some(buffer),
            _ => None,
        })
    }

    fn storage_buffer(&self, binding: u32) -> Result<BufferHandle, DeviceError> {
        self.resource(binding, "a storage buffer", |resource| match *resource {
            DescriptorResource::StorageBuffer(buffer) => Some(buffer),
            _ => None,
        })
    }

    fn storage_image(&self, binding: u32) -> Result<TextureHandle, DeviceError> {
        self.resource(binding, "a storage image", |resource| match *resource {
            DescriptorResource::StorageImage(texture) => Some(texture),
            _ => None,
        })
    }

    pub(super) fn sampled_image(&self, binding: u32) -> Result<TextureHandle, DeviceError> {
        self.resource(binding, "a sampled image", |resource| match *resource {
            DescriptorResource::SampledImage(texture) => Some(texture),
            _ => None,
        })
    }

    pub(super) fn sampler(&self, binding: u32) -> Result<SamplerHandle, DeviceError> {
        self.resource(binding, "a sampler", |resource| match *resource {
            DescriptorResource::Sampler(sampler) => Some(sampler),
            _ => None,
        })
    }

    fn acceleration_structure(&self, binding: u32) -> Result<AccelerationStructureHandle, DeviceError> {
        self.resource(binding, "an acceleration structure", |resource| match *resource {
            DescriptorResource::AccelerationStructure(accel) => Some(accel),
            _ => None,
        })
    }

    fn buffers(&self, binding: u32) -> Result<&'a [BufferHandle], DeviceError> {
        self.resource(binding, "a storage buffer array", |resource| match resource {
            DescriptorResource::StorageBufferArray(buffers) => Some(buffers.as_slice()),
            _ => None,
        })
    }

    fn images(&self, binding: u32) -> Result<&'a [TextureHandle], DeviceError> {
        self.resource(binding, "a sampled image array", |resource| match resource {
            DescriptorResource::SampledImageArray(textures) => Some(textures.as_slice()),
            _ => None,
        })
    }

    /// Bindless arrays must be filled up to the capacity the pipeline was created with.
    fn check_capacity(&self, binding: u32, len: usize, capacity: u32) -> Result<(), DeviceError> {
        if len == capacity as usize {
            Ok(())
        } else {
            Err(self.invalid(
                binding,
                format!("array holds {} elements, the layout has {}", len, capacity),
            ))
        }
    }
}

struct DispatchTargets {
    output: TextureHandle,
    reservoirs_out: BufferHandle,
}

struct DirectLightInputs<'a> {
    camera: CameraParams,
    params: DirectLightParams,
    tlas: &'a BuiltTopLevel,
    table: BindlessObjectTable,
    triangle_counts: &'a [u32],
    geometry_records: &'a [GeometryRecord],
    materials: &'a [Material],
    material_ids: &'a [u32],
    emissives: &'a [Emissive],
    textures: Vec<&'a SoftTexture>,
    index_buffers: Vec<&'a [u32]>,
    vertex_buffers: Vec<&'a [CompactVertex]>,
    history: &'a [Reservoir],
}

#[derive(Clone, Copy)]
struct Surface {
    position: glm::Vec3,
    normal: glm::Vec3,
    albedo: glm::Vec3,
}

#[derive(Clone, Copy)]
struct LightPoint {
    position: glm::Vec3,
    normal: glm::Vec3,
    area: f32,
}

fn luminance(rgb: &glm::Vec3) -> f32 {
    0.2126 * rgb.x + 0.7152 * rgb.y + 0.0722 * rgb.z
}

fn rgb(value: [f32; 4]) -> glm::Vec3 {
    glm::vec3(value[0], value[1], value[2])
}

impl State {
    pub(super) fn trace_rays(
        &mut self,
        pipeline: PipelineHandle,
        bindings: &Bindings,
        width: u32,
        height: u32,
    ) -> Result<(), DeviceError> {
        scope!("software::trace_rays");

        let targets = self.validate_dispatch(pipeline, bindings, width, height)?;

        let mut output = self
            .textures
            .remove(&targets.output)
            .ok_or_else(|| DeviceError::InvalidHandle(targets.output.to_string()))?;
        let result = match self.buffers.remove(&targets.reservoirs_out) {
            Some(mut reservoirs_out) => {
                let result = self.dispatch(bindings, &mut output, &mut reservoirs_out);
                self.buffers.insert(targets.reservoirs_out, reservoirs_out);
                result
            }
            None => Err(DeviceError::InvalidHandle(targets.reservoirs_out.to_string())),
        };
        self.textures.insert(targets.output, output);

        result
    }

    fn bound_buffer(&self, set: &BoundSet<'_>, binding: u32, handle: BufferHandle) -> Result<&SoftBuffer, DeviceError> {
        self.check_visible(ResourceKey::Buffer(handle))?;
        self.buffer(handle)
            .map_err(|err| set.invalid(binding, err.to_string()))
    }

    fn validate_dispatch(
        &self,
        pipeline: PipelineHandle,
        bindings: &Bindings,
        width: u32,
        height: u32,
    ) -> Result<DispatchTargets, DeviceError> {
        let entry = self.pipeline(pipeline)?;
        let capacity = match entry.kind {
            PipelineKind::RayTracing { bindless_capacity } => bindless_capacity,
            PipelineKind::Raster { .. } => {
                return Err(DeviceError::InvalidCommand {
                    name: entry.name.clone(),
                    reason: "trace_rays needs a ray tracing pipeline".to_owned(),
                })
            }
        };

        let bind_point = vk::PipelineBindPoint::RAY_TRACING_KHR;
        let frame = BoundSet::resolve(self, bindings, bind_point, frame_set::INDEX)?;
        let material = BoundSet::resolve(self, bindings, bind_point, material_set::INDEX)?;
        let geometry = BoundSet::resolve(self, bindings, bind_point, geometry_set::INDEX)?;
        let vertex = BoundSet::resolve(self, bindings, bind_point, vertex_set::INDEX)?;

        let history = frame.read_only_buffer(frame_set::RESERVOIR_HISTORY)?;
        let reservoirs_out = frame.storage_buffer(frame_set::RESERVOIR_OUT)?;
        if history == reservoirs_out {
            return Err(DeviceError::AliasedBinding {
                name: self.buffer(history)?.name.clone(),
            });
        }
        let pixels = u64::from(width) * u64::from(height);
        for (binding, handle) in [
            (frame_set::RESERVOIR_HISTORY, history),
            (frame_set::RESERVOIR_OUT, reservoirs_out),
        ] {
            let buffer = self.bound_buffer(&frame, binding, handle)?;
            if buffer.size != pixels * Reservoir::SIZE {
                return Err(frame.invalid(
                    binding,
                    format!(
                        "{} holds {} bytes, a {}x{} dispatch needs {}",
                        buffer.name,
                        buffer.size,
                        width,
                        height,
                        pixels * Reservoir::SIZE
                    ),
                ));
            }
        }

        let output = frame.storage_image(frame_set::RT_OUTPUT)?;
        let texture = self.texture(output)?;
        if texture.layout != vk::ImageLayout::GENERAL {
            return Err(DeviceError::LayoutMismatch {
                name: texture.name.clone(),
                expected: vk::ImageLayout::GENERAL,
                actual: texture.layout,
            });
        }
        if texture.format != vk::Format::R32G32B32A32_SFLOAT || texture.extent != (vk::Extent2D { width, height }) {
            return Err(frame.invalid(
                frame_set::RT_OUTPUT,
                format!(
                    "{} is {:?} {:?}, the dispatch is {}x{}",
                    texture.name, texture.format, texture.extent, width, height
                ),
            ));
        }

        self.bound_buffer(&frame, frame_set::CAMERA, frame.uniform_buffer(frame_set::CAMERA)?)?;
        self.bound_buffer(
            &frame,
            frame_set::DIRECT_LIGHT_PARAMS,
            frame.uniform_buffer(frame_set::DIRECT_LIGHT_PARAMS)?,
        )?;

        material.sampler(material_set::SAMPLER)?;
        for binding in [material_set::MATERIALS, material_set::MATERIAL_IDS, material_set::EMISSIVES] {
            self.bound_buffer(&material, binding, material.read_only_buffer(binding)?)?;
        }
        let textures = material.images(material_set::TEXTURES)?;
        material.check_capacity(material_set::TEXTURES, textures.len(), capacity)?;
        for &texture in textures {
            self.check_visible(ResourceKey::Texture(texture))?;
            let entry = self
                .texture(texture)
                .map_err(|err| material.invalid(material_set::TEXTURES, err.to_string()))?;
            if entry.layout != vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
                return Err(DeviceError::LayoutMismatch {
                    name: entry.name.clone(),
                    expected: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    actual: entry.layout,
                });
            }
        }

        let tlas = geometry.acceleration_structure(geometry_set::TLAS)?;
        self.built_tlas(tlas)?;
        self.bound_buffer(
            &geometry,
            geometry_set::OBJECT_TABLE,
            geometry.uniform_buffer(geometry_set::OBJECT_TABLE)?,
        )?;
        for binding in [geometry_set::TRIANGLE_COUNTS, geometry_set::GEOMETRY_RECORDS] {
            self.bound_buffer(&geometry, binding, geometry.read_only_buffer(binding)?)?;
        }
        let index_buffers = geometry.buffers(geometry_set::INDEX_BUFFERS)?;
        geometry.check_capacity(geometry_set::INDEX_BUFFERS, index_buffers.len(), capacity)?;
        for &buffer in index_buffers {
            self.bound_buffer(&geometry, geometry_set::INDEX_BUFFERS, buffer)?;
        }
        let vertex_buffers = vertex.buffers(vertex_set::VERTEX_BUFFERS)?;
        vertex.check_capacity(vertex_set::VERTEX_BUFFERS, vertex_buffers.len(), capacity)?;
        for &buffer in vertex_buffers {
            self.bound_buffer(&vertex, vertex_set::VERTEX_BUFFERS, buffer)?;
        }

        Ok(DispatchTargets { output, reservoirs_out })
    }

    fn built_tlas(&self, handle: AccelerationStructureHandle) -> Result<&BuiltTopLevel, DeviceError> {
        let accel = self
            .acceleration_structures
            .get(&handle)
            .ok_or_else(|| DeviceError::InvalidHandle(handle.to_string()))?;
        let built = match accel.kind {
            AccelerationKind::Top { built: Some(ref built), .. } => built,
            _ => {
                return Err(DeviceError::InvalidCommand {
                    name: accel.name.clone(),
                    reason: "traced before its build was executed".to_owned(),
                })
            }
        };
        if let Some(instance) = built
            .instances
            .iter()
            .find(|instance| !self.acceleration_structures.contains_key(&instance.source))
        {
            return Err(DeviceError::InvalidCommand {
                name: accel.name.clone(),
                reason: format!("instanced {} was destroyed", instance.source),
            });
        }
        Ok(built)
    }

    fn gather_inputs<'a>(&'a self, bindings: &Bindings) -> Result<DirectLightInputs<'a>, DeviceError> {
        let bind_point = vk::PipelineBindPoint::RAY_TRACING_KHR;
        let frame = BoundSet::resolve(self, bindings, bind_point, frame_set::INDEX)?;
        let material = BoundSet::resolve(self, bindings, bind_point, material_set::INDEX)?;
        let geometry = BoundSet::resolve(self, bindings, bind_point, geometry_set::INDEX)?;
        let vertex = BoundSet::resolve(self, bindings, bind_point, vertex_set::INDEX)?;
        let uniform = |set: &BoundSet<'a>, binding: u32| -> Result<&'a SoftBuffer, DeviceError> {
            self.bound_buffer(set, binding, set.uniform_buffer(binding)?)
        };
        let read_only = |set: &BoundSet<'a>, binding: u32| -> Result<&'a SoftBuffer, DeviceError> {
            self.bound_buffer(set, binding, set.read_only_buffer(binding)?)
        };

        let textures = material
            .images(material_set::TEXTURES)?
            .iter()
            .map(|&texture| self.texture(texture))
            .collect::<Result<Vec<_>, _>>()?;
        let index_buffers = geometry
            .buffers(geometry_set::INDEX_BUFFERS)?
            .iter()
            .map(|&handle| self.buffer(handle)?.typed::<u32>())
            .collect::<Result<Vec<_>, _>>()?;
        let vertex_buffers = vertex
            .buffers(vertex_set::VERTEX_BUFFERS)?
            .iter()
            .map(|&handle| self.buffer(handle)?.typed::<CompactVertex>())
            .collect::<Result<Vec<_>, _>>()?;

        let inputs = DirectLightInputs {
            camera: uniform(&frame, frame_set::CAMERA)?.read_pod()?,
            params: uniform(&frame, frame_set::DIRECT_LIGHT_PARAMS)?.read_pod()?,
            tlas: self.built_tlas(geometry.acceleration_structure(geometry_set::TLAS)?)?,
            table: uniform(&geometry, geometry_set::OBJECT_TABLE)?.read_pod()?,
            triangle_counts: read_only(&geometry, geometry_set::TRIANGLE_COUNTS)?.typed()?,
            geometry_records: read_only(&geometry, geometry_set::GEOMETRY_RECORDS)?.typed()?,
            materials: read_only(&material, material_set::MATERIALS)?.typed()?,
            material_ids: read_only(&material, material_set::MATERIAL_IDS)?.typed()?,
            emissives: read_only(&material, material_set::EMISSIVES)?.typed()?,
            textures,
            index_buffers,
            vertex_buffers,
            history: read_only(&frame, frame_set::RESERVOIR_HISTORY)?.typed()?,
        };
        inputs.check_tables()?;
        Ok(inputs)
    }

    fn dispatch(
        &self,
        bindings: &Bindings,
        output: &mut SoftTexture,
        reservoirs_out: &mut SoftBuffer,
    ) -> Result<(), DeviceError> {
        let inputs = self.gather_inputs(bindings)?;
        let width = output.extent.width as usize;
        let height = output.extent.height;
        let texels = output.rgba32f_mut()?;
        let reservoirs = reservoirs_out.typed_mut::<Reservoir>()?;

        texels
            .par_chunks_mut(width)
            .zip(reservoirs.par_chunks_mut(width))
            .enumerate()
            .for_each(|(y, (texel_row, reservoir_row))| {
                scope!("software::trace_rays::row");

                for (x, (texel, reservoir)) in texel_row.iter_mut().zip(reservoir_row.iter_mut()).enumerate() {
                    let pixel = y * width + x;
                    let (radiance, merged) = inputs.shade_pixel(x as u32, y as u32, width as u32, height, pixel);
                    *texel = [radiance.x, radiance.y, radiance.z, 1.0];
                    *reservoir = merged;
                }
            });

        Ok(())
    }
}

impl<'a> DirectLightInputs<'a> {
    fn check_tables(&self) -> Result<(), DeviceError> {
        let object_count = self.table.object_count() as usize;
        let short = |what: &str, len: usize, needed: usize| DeviceError::InvalidCommand {
            name: "trace_rays".to_owned(),
            reason: format!("{} holds {} records, the object table needs {}", what, len, needed),
        };
        if self.triangle_counts.len() < object_count {
            return Err(short("triangle counts", self.triangle_counts.len(), object_count));
        }
        if self.geometry_records.len() < object_count {
            return Err(short("geometry records", self.geometry_records.len(), object_count));
        }
        if self.material_ids.len() < self.table.nonemissive_count as usize {
            return Err(short("material ids", self.material_ids.len(), self.table.nonemissive_count as usize));
        }
        if self.emissives.len() < self.table.emissive_count as usize {
            return Err(short("emissives", self.emissives.len(), self.table.emissive_count as usize));
        }
        Ok(())
    }

    fn primary_ray(&self, x: u32, y: u32, width: u32, height: u32) -> (glm::Vec3, glm::Vec3) {
        let inv_view = glm::Mat4::from(self.camera.inv_view);
        let inv_proj = glm::Mat4::from(self.camera.inv_proj);
        let ndc_x = (x as f32 + 0.5) / width as f32 * 2.0 - 1.0;
        let ndc_y = 1.0 - (y as f32 + 0.5) / height as f32 * 2.0;

        let target = inv_proj * glm::vec4(ndc_x, ndc_y, 1.0, 1.0);
        let view_dir = glm::vec4(target.x / target.w, target.y / target.w, target.z / target.w, 0.0);
        let origin = inv_view * glm::vec4(0.0, 0.0, 0.0, 1.0);
        let dir = inv_view * view_dir;

        (origin.xyz(), dir.xyz().normalize())
    }

    fn vertices(&self, slot: u32, triangle: u32) -> Option<[CompactVertex; 3]> {
        let record = self.geometry_records.get(slot as usize)?;
        let indices = self.index_buffers.get(record.index_buffer as usize)?;
        let vertices = self.vertex_buffers.get(record.vertex_buffer as usize)?;
        let first = record.first_index as usize + triangle as usize * 3;
        let fetch = |corner: usize| -> Option<CompactVertex> {
            let index = *indices.get(first + corner)?;
            vertices.get(record.vertex_offset as usize + index as usize).copied()
        };
        Some([fetch(0)?, fetch(1)?, fetch(2)?])
    }

    fn surface(
        &self,
        slot: u32,
        material_slot: u32,
        triangle: u32,
        barycentrics: [f32; 2],
        view_dir: &glm::Vec3,
    ) -> Option<Surface> {
        let [a, b, c] = self.vertices(slot, triangle)?;
        let [u, v] = barycentrics;
        let w = 1.0 - u - v;
        let lerp3 = |pa: [f32; 3], pb: [f32; 3], pc: [f32; 3]| {
            glm::make_vec3(&pa) * w + glm::make_vec3(&pb) * u + glm::make_vec3(&pc) * v
        };
        let position = lerp3(a.position, b.position, c.position);
        let mut normal = lerp3(a.normal, b.normal, c.normal).normalize();
        if normal.dot(view_dir) > 0.0 {
            normal = -normal;
        }

        let material = self.materials.get(*self.material_ids.get(material_slot as usize)? as usize)?;
        let mut albedo = rgb(material.base_color);
        if material.texture_id >= 0 {
            if let Some(texture) = self.textures.get(material.texture_id as usize) {
                let uv = [
                    a.uv[0] * w + b.uv[0] * u + c.uv[0] * v,
                    a.uv[1] * w + b.uv[1] * u + c.uv[1] * v,
                ];
                albedo.component_mul_assign(&rgb(texture.sample(uv)));
            }
        }

        Some(Surface {
            position,
            normal,
            albedo,
        })
    }

    fn light_point(&self, sample: &LightSample) -> Option<LightPoint> {
        if sample.light >= self.table.emissive_count {
            return None;
        }
        let slot = self.table.emissive_start + sample.light;
        if sample.triangle >= *self.triangle_counts.get(slot as usize)? {
            return None;
        }
        let [a, b, c] = self.vertices(slot, sample.triangle)?;
        let a = glm::make_vec3(&a.position);
        let e1 = glm::make_vec3(&b.position) - a;
        let e2 = glm::make_vec3(&c.position) - a;
        let cross = e1.cross(&e2);
        let double_area = cross.norm();
        if double_area <= 0.0 {
            return None;
        }
        let [u, v] = sample.barycentrics;

        Some(LightPoint {
            position: a + e1 * u + e2 * v,
            normal: cross / double_area,
            area: 0.5 * double_area,
        })
    }

    fn radiance(&self, sample: &LightSample) -> glm::Vec3 {
        self.emissives
            .get(sample.light as usize)
            .map_or_else(glm::Vec3::zeros, |emissive| rgb(emissive.radiance))
    }

    /// Unshadowed light contribution of `sample`, without the albedo: `Le * G`.
    fn unshadowed(&self, surface: &Surface, sample: &LightSample) -> Option<(glm::Vec3, LightPoint)> {
        let light = self.light_point(sample)?;
        let to_light = light.position - surface.position;
        let distance_squared = to_light.norm_squared();
        if distance_squared <= RAY_EPSILON * RAY_EPSILON {
            return None;
        }
        let dir = to_light / distance_squared.sqrt();
        let cos_surface = surface.normal.dot(&dir);
        let cos_light = light.normal.dot(&-dir).abs();
        if cos_surface <= 0.0 {
            return None;
        }
        Some((self.radiance(sample) * (cos_surface * cos_light / distance_squared), light))
    }

    fn target_pdf(&self, surface: &Surface, sample: &LightSample) -> f32 {
        self.unshadowed(surface, sample)
            .map_or(0.0, |(contribution, _)| luminance(&contribution))
    }

    /// A uniformly chosen light, triangle and point on it, with the light and triangle selection
    /// pdf folded into the returned factor.
    fn candidate(&self, rng: &mut StdRng) -> Option<(LightSample, f32)> {
        let emissive_count = self.table.emissive_count;
        if emissive_count == 0 {
            return None;
        }
        let light = rng.gen_range(0..emissive_count);
        let triangle_count = *self.triangle_counts.get((self.table.emissive_start + light) as usize)?;
        if triangle_count == 0 {
            return None;
        }
        let triangle = rng.gen_range(0..triangle_count);
        let r1 = rng.gen::<f32>().sqrt();
        let r2 = rng.gen::<f32>();

        let sample = LightSample {
            light,
            triangle,
            barycentrics: [r1 * (1.0 - r2), r1 * r2],
        };
        Some((sample, emissive_count as f32 * triangle_count as f32))
    }

    fn resample(&self, surface: &Surface, rng: &mut StdRng) -> Reservoir {
        let mut reservoir = Reservoir::default();
        for _ in 0..self.params.initial_candidates {
            let (sample, inv_selection_pdf) = match self.candidate(rng) {
                Some(candidate) => candidate,
                None => {
                    reservoir.sample_count += 1;
                    continue;
                }
            };
            let (target_pdf, weight) = match self.unshadowed(surface, &sample) {
                Some((contribution, light)) => {
                    let target_pdf = luminance(&contribution);
                    (target_pdf, target_pdf * inv_selection_pdf * light.area)
                }
                None => (0.0, 0.0),
            };
            reservoir.update(sample, target_pdf, weight, rng.gen());
        }
        reservoir.finalize();
        reservoir
    }

    fn shade_pixel(&self, x: u32, y: u32, width: u32, height: u32, pixel: usize) -> (glm::Vec3, Reservoir) {
        let mut rng = StdRng::seed_from_u64(u64::from(self.params.rng_stream_id) << 32 | pixel as u64);
        let ambient = rgb(self.params.ambient);
        let (origin, dir) = self.primary_ray(x, y, width, height);

        let hit = match self.tlas.closest_hit(&origin, &dir, RAY_EPSILON, f32::MAX, 0xff) {
            Some(hit) => hit,
            None => return (ambient, Reservoir::default()),
        };
        let slot = match self.table.slot(hit.instance_custom_index, hit.geometry_index) {
            Some(slot) => slot,
            None => return (glm::Vec3::zeros(), Reservoir::default()),
        };
        if hit.instance_custom_index == EMISSIVE_INSTANCE {
            let light = LightSample {
                light: hit.geometry_index,
                ..LightSample::default()
            };
            return (self.radiance(&light), Reservoir::default());
        }
        let material_slot = slot - self.table.nonemissive_start;
        let surface = match self.surface(slot, material_slot, hit.primitive_index, hit.barycentrics, &dir) {
            Some(surface) => surface,
            None => return (glm::Vec3::zeros(), Reservoir::default()),
        };

        let mut reservoir = self.resample(&surface, &mut rng);
        if self.params.temporal_reuse() {
            if let Some(history) = self.history.get(pixel).filter(|history| !history.is_empty()) {
                let history_pdf = self.target_pdf(&surface, &history.sample);
                if self.light_point(&history.sample).is_some() {
                    let mut history = *history;
                    history.cap_history(self.params.history_cap);
                    let mut merged = Reservoir::default();
                    merged.combine(&reservoir, reservoir.target_pdf, rng.gen());
                    merged.combine(&history, history_pdf, rng.gen());
                    merged.finalize();
                    reservoir = merged;
                }
            }
        }

        let mut radiance = ambient.component_mul(&surface.albedo);
        if reservoir.contribution_weight > 0.0 {
            if let Some((contribution, light)) = self.unshadowed(&surface, &reservoir.sample) {
                let to_light = light.position - surface.position;
                let distance = to_light.norm();
                let origin = surface.position + surface.normal * RAY_EPSILON;
                let occluded = self
                    .tlas
                    .occluded(&origin, &(to_light / distance), 0.0, distance - 2.0 * RAY_EPSILON, 0xff);
                if occluded {
                    reservoir.contribution_weight = 0.0;
                } else {
                    radiance += surface.albedo.component_mul(&contribution) * (reservoir.contribution_weight / PI);
                }
            }
        }

        (radiance, reservoir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::{acceleration_structures::NONEMISSIVE_INSTANCE, device::software::geometry::BuiltInstance};

    fn inputs_with<'a>(tlas: &'a BuiltTopLevel, history: &'a [Reservoir]) -> DirectLightInputs<'a> {
        DirectLightInputs {
            camera: CameraParams {
                inv_view: glm::Mat4::identity().into(),
                inv_proj: glm::Mat4::identity().into(),
            },
            params: DirectLightParams {
                rng_stream_id: 0,
                initial_candidates: 4,
                history_cap: 20,
                flags: DirectLightParams::TEMPORAL_REUSE,
                ambient: [0.0; 4],
            },
            tlas,
            table: BindlessObjectTable::new(0, 0),
            triangle_counts: &[],
            geometry_records: &[],
            materials: &[],
            material_ids: &[],
            emissives: &[],
            textures: vec![],
            index_buffers: vec![],
            vertex_buffers: vec![],
            history,
        }
    }

    #[test]
    fn primary_rays_span_the_image_plane() {
        let tlas = BuiltTopLevel { instances: vec![] };
        let inputs = inputs_with(&tlas, &[]);
        let (origin, center) = inputs.primary_ray(1, 1, 3, 3);
        assert_eq!(origin, glm::Vec3::zeros());
        assert!((center - glm::vec3(0.0, 0.0, 1.0)).norm() < 1e-5);

        let (_, top_left) = inputs.primary_ray(0, 0, 3, 3);
        assert!(top_left.x < 0.0 && top_left.y > 0.0);
    }

    #[test]
    fn misses_return_ambient_and_an_empty_reservoir() {
        let tlas = BuiltTopLevel { instances: vec![] };
        let history = [Reservoir {
            sample_count: 7,
            ..Reservoir::default()
        }];
        let mut inputs = inputs_with(&tlas, &history);
        inputs.params.ambient = [0.1, 0.2, 0.3, 0.0];

        let (radiance, reservoir) = inputs.shade_pixel(0, 0, 1, 1, 0);
        assert_eq!(radiance, glm::vec3(0.1, 0.2, 0.3));
        assert!(reservoir.is_empty());
    }

    #[test]
    fn candidates_need_emissive_objects() {
        let tlas = BuiltTopLevel { instances: vec![] };
        let inputs = inputs_with(&tlas, &[]);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(inputs.candidate(&mut rng).is_none());
        let surface = Surface {
            position: glm::Vec3::zeros(),
            normal: glm::vec3(0.0, 1.0, 0.0),
            albedo: glm::Vec3::repeat(1.0),
        };
        let reservoir = inputs.resample(&surface, &mut rng);
        assert_eq!(reservoir.sample_count, 4);
        assert_eq!(reservoir.contribution_weight, 0.0);
    }

    const FLOOR: [[f32; 3]; 4] = [[-1.0, -1.0, 5.0], [2.0, -1.0, 5.0], [2.0, 1.5, 5.0], [-1.0, 1.5, 5.0]];
    const LIGHT: [[f32; 3]; 4] = [[2.0, -0.5, 2.0], [3.0, -0.5, 2.0], [3.0, 0.5, 2.0], [2.0, 0.5, 2.0]];
    /// Sits between the floor and every point of the light, but not in front of the camera.
    const OCCLUDER: [[f32; 3]; 4] = [[0.8, -1.0, 3.5], [1.7, -1.0, 3.5], [1.7, 1.0, 3.5], [0.8, 1.0, 3.5]];

    /// Opaque quads followed by light quads, packed into one index and one vertex buffer.
    struct QuadScene {
        tlas: BuiltTopLevel,
        table: BindlessObjectTable,
        triangle_counts: Vec<u32>,
        records: Vec<GeometryRecord>,
        indices: Vec<u32>,
        vertices: Vec<CompactVertex>,
        materials: Vec<Material>,
        material_ids: Vec<u32>,
        emissives: Vec<Emissive>,
    }

    impl QuadScene {
        fn new(opaque: &[[[f32; 3]; 4]], lights: &[[[f32; 3]; 4]]) -> QuadScene {
            let triangles = |quads: &[[[f32; 3]; 4]]| {
                quads
                    .iter()
                    .map(|quad| {
                        let [a, b, c, d] = quad.map(|corner| glm::make_vec3(&corner));
                        vec![[a, b, c], [a, c, d]]
                    })
                    .collect::<Vec<_>>()
            };
            let quads = opaque.iter().chain(lights).collect::<Vec<_>>();
            QuadScene {
                tlas: BuiltTopLevel {
                    instances: vec![
                        BuiltInstance::from_triangles(NONEMISSIVE_INSTANCE, &triangles(opaque)),
                        BuiltInstance::from_triangles(EMISSIVE_INSTANCE, &triangles(lights)),
                    ],
                },
                table: BindlessObjectTable::new(opaque.len() as u32, lights.len() as u32),
                triangle_counts: vec![2; quads.len()],
                records: (0..quads.len() as u32)
                    .map(|slot| GeometryRecord {
                        index_buffer: 0,
                        first_index: slot * 6,
                        vertex_buffer: 0,
                        vertex_offset: slot * 4,
                    })
                    .collect(),
                indices: quads.iter().flat_map(|_| [0, 1, 2, 0, 2, 3]).collect(),
                vertices: quads
                    .iter()
                    .flat_map(|quad| {
                        quad.map(|position| CompactVertex {
                            position,
                            normal: [0.0, 0.0, -1.0],
                            uv: [0.0, 0.0],
                        })
                    })
                    .collect(),
                materials: vec![Material::new([1.0, 1.0, 1.0], None)],
                material_ids: vec![0; opaque.len()],
                emissives: vec![Emissive { radiance: [5.0, 5.0, 5.0, 1.0] }; lights.len()],
            }
        }

        fn inputs<'a>(&'a self, history: &'a [Reservoir]) -> DirectLightInputs<'a> {
            DirectLightInputs {
                table: self.table,
                triangle_counts: &self.triangle_counts,
                geometry_records: &self.records,
                materials: &self.materials,
                material_ids: &self.material_ids,
                emissives: &self.emissives,
                index_buffers: vec![&self.indices],
                vertex_buffers: vec![&self.vertices],
                ..inputs_with(&self.tlas, history)
            }
        }
    }

    fn history_on_light(light: u32, triangle: u32) -> Reservoir {
        Reservoir {
            sample: LightSample {
                light,
                triangle,
                barycentrics: [0.25, 0.25],
            },
            target_pdf: 1.0,
            weight_sum: 50.0,
            sample_count: 50,
            contribution_weight: 1.0,
        }
    }

    #[test]
    fn visible_light_shades_the_surface() {
        let scene = QuadScene::new(&[FLOOR], &[LIGHT]);
        let inputs = scene.inputs(&[]);
        inputs.check_tables().unwrap();

        let (radiance, reservoir) = inputs.shade_pixel(0, 0, 1, 1, 0);
        assert_eq!(reservoir.sample_count, 4);
        assert!(reservoir.target_pdf > 0.0);
        assert!(reservoir.contribution_weight > 0.0);
        assert!(radiance.x > 0.0 && radiance.x == radiance.y && radiance.y == radiance.z);
    }

    #[test]
    fn occluded_sample_keeps_its_candidates_but_no_weight() {
        let scene = QuadScene::new(&[FLOOR, OCCLUDER], &[LIGHT]);
        let (radiance, reservoir) = scene.inputs(&[]).shade_pixel(0, 0, 1, 1, 0);
        assert_eq!(reservoir.sample_count, 4);
        assert!(reservoir.weight_sum > 0.0);
        assert_eq!(reservoir.contribution_weight, 0.0);
        assert_eq!(radiance, glm::Vec3::zeros());

        let history = [history_on_light(0, 1)];
        let (_, merged) = scene.inputs(&history).shade_pixel(0, 0, 1, 1, 0);
        assert_eq!(merged.sample_count, 24);
        assert_eq!(merged.contribution_weight, 0.0);
    }

    #[test]
    fn history_is_capped_before_merging() {
        let scene = QuadScene::new(&[FLOOR], &[LIGHT]);
        let history = [history_on_light(0, 1)];

        let (radiance, merged) = scene.inputs(&history).shade_pixel(0, 0, 1, 1, 0);
        assert_eq!(merged.sample_count, 4 + 20);
        assert!(merged.contribution_weight > 0.0);
        assert!(radiance.x > 0.0);

        let mut inputs = scene.inputs(&history);
        inputs.params.flags = 0;
        assert_eq!(inputs.shade_pixel(0, 0, 1, 1, 0).1.sample_count, 4);
    }

    #[test]
    fn stale_history_is_dropped() {
        let scene = QuadScene::new(&[FLOOR], &[LIGHT]);
        for stale in [history_on_light(3, 0), history_on_light(0, 7)] {
            let history = [stale];
            let (_, reservoir) = scene.inputs(&history).shade_pixel(0, 0, 1, 1, 0);
            assert_eq!(reservoir.sample_count, 4);
        }
    }
}
