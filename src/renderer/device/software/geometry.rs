use std::sync::Arc;

use ash::vk;
use profiling::scope;

use super::{ResourceKey, State};
use crate::renderer::device::{AccelerationStructureHandle, DeviceError, GeometryDesc, InstanceDesc};

#[derive(Clone, Copy, Debug)]
pub(super) struct Triangle {
    v0: glm::Vec3,
    e1: glm::Vec3,
    e2: glm::Vec3,
}

#[derive(Clone, Copy, Debug)]
struct Aabb {
    min: glm::Vec3,
    max: glm::Vec3,
}

#[derive(Clone, Debug)]
pub(super) struct GeometryTriangles {
    triangles: Vec<Triangle>,
    bounds: Aabb,
}

pub(super) enum AccelerationKind {
    Bottom {
        geometries: Vec<GeometryDesc>,
        built: Option<Arc<Vec<GeometryTriangles>>>,
    },
    Top {
        instances: Vec<InstanceDesc>,
        built: Option<Arc<BuiltTopLevel>>,
    },
}

pub(super) struct SoftAccelerationStructure {
    pub(super) name: String,
    pub(super) kind: AccelerationKind,
}

pub(super) struct BuiltInstance {
    pub(super) source: AccelerationStructureHandle,
    custom_index: u32,
    mask: u8,
    geometries: Vec<GeometryTriangles>,
}

pub(super) struct BuiltTopLevel {
    pub(super) instances: Vec<BuiltInstance>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(super) struct Hit {
    pub(super) t: f32,
    pub(super) instance_custom_index: u32,
    pub(super) geometry_index: u32,
    pub(super) primitive_index: u32,
    pub(super) barycentrics: [f32; 2],
}

impl Triangle {
    fn new(a: glm::Vec3, b: glm::Vec3, c: glm::Vec3) -> Triangle {
        Triangle {
            v0: a,
            e1: b - a,
            e2: c - a,
        }
    }

    fn vertices(&self) -> [glm::Vec3; 3] {
        [self.v0, self.v0 + self.e1, self.v0 + self.e2]
    }

    /// Möller-Trumbore, both faces.
    fn intersect(&self, origin: &glm::Vec3, dir: &glm::Vec3, t_min: f32, t_max: f32) -> Option<(f32, f32, f32)> {
        let p = dir.cross(&self.e2);
        let det = self.e1.dot(&p);
        if det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;
        let s = origin - self.v0;
        let u = s.dot(&p) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }
        let q = s.cross(&self.e1);
        let v = dir.dot(&q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }
        let t = self.e2.dot(&q) * inv_det;
        if t > t_min && t < t_max {
            Some((t, u, v))
        } else {
            None
        }
    }
}

impl Aabb {
    fn empty() -> Aabb {
        Aabb {
            min: glm::Vec3::repeat(f32::INFINITY),
            max: glm::Vec3::repeat(f32::NEG_INFINITY),
        }
    }

    fn grow(&mut self, point: &glm::Vec3) {
        self.min = glm::min2(&self.min, point);
        self.max = glm::max2(&self.max, point);
    }

    fn hit(&self, origin: &glm::Vec3, inv_dir: &glm::Vec3, t_min: f32, t_max: f32) -> bool {
        let mut near = t_min;
        let mut far = t_max;
        for axis in 0..3 {
            let t0 = (self.min[axis] - origin[axis]) * inv_dir[axis];
            let t1 = (self.max[axis] - origin[axis]) * inv_dir[axis];
            let (t0, t1) = if t0 > t1 { (t1, t0) } else { (t0, t1) };
            near = near.max(t0);
            far = far.min(t1);
            if near > far {
                return false;
            }
        }
        true
    }
}

impl GeometryTriangles {
    fn new(triangles: Vec<Triangle>) -> GeometryTriangles {
        let mut bounds = Aabb::empty();
        triangles
            .iter()
            .flat_map(|triangle| triangle.vertices())
            .for_each(|vertex| bounds.grow(&vertex));
        GeometryTriangles { triangles, bounds }
    }

    fn transformed(&self, transform: &[[f32; 4]; 3]) -> GeometryTriangles {
        let apply = |v: glm::Vec3| {
            glm::vec3(
                transform[0][0] * v.x + transform[0][1] * v.y + transform[0][2] * v.z + transform[0][3],
                transform[1][0] * v.x + transform[1][1] * v.y + transform[1][2] * v.z + transform[1][3],
                transform[2][0] * v.x + transform[2][1] * v.y + transform[2][2] * v.z + transform[2][3],
            )
        };
        GeometryTriangles::new(
            self.triangles
                .iter()
                .map(|triangle| {
                    let [a, b, c] = triangle.vertices();
                    Triangle::new(apply(a), apply(b), apply(c))
                })
                .collect(),
        )
    }
}

#[cfg(test)]
impl BuiltInstance {
    /// An instance with an identity transform over world space triangles, one list per geometry.
    pub(super) fn from_triangles(custom_index: u32, geometries: &[Vec<[glm::Vec3; 3]>]) -> BuiltInstance {
        BuiltInstance {
            source: AccelerationStructureHandle(u64::from(custom_index)),
            custom_index,
            mask: 0xff,
            geometries: geometries
                .iter()
                .map(|triangles| {
                    GeometryTriangles::new(triangles.iter().map(|&[a, b, c]| Triangle::new(a, b, c)).collect())
                })
                .collect(),
        }
    }
}

impl BuiltTopLevel {
    pub(super) fn closest_hit(
        &self,
        origin: &glm::Vec3,
        dir: &glm::Vec3,
        t_min: f32,
        t_max: f32,
        mask: u8,
    ) -> Option<Hit> {
        let inv_dir = dir.map(|c| 1.0 / c);
        let mut closest: Option<Hit> = None;

        for instance in self.instances.iter().filter(|instance| instance.mask & mask != 0) {
            for (geometry_index, geometry) in instance.geometries.iter().enumerate() {
                let limit = closest.map_or(t_max, |hit| hit.t);
                if !geometry.bounds.hit(origin, &inv_dir, t_min, limit) {
                    continue;
                }
                for (primitive_index, triangle) in geometry.triangles.iter().enumerate() {
                    let limit = closest.map_or(t_max, |hit| hit.t);
                    if let Some((t, u, v)) = triangle.intersect(origin, dir, t_min, limit) {
                        closest = Some(Hit {
                            t,
                            instance_custom_index: instance.custom_index,
                            geometry_index: geometry_index as u32,
                            primitive_index: primitive_index as u32,
                            barycentrics: [u, v],
                        });
                    }
                }
            }
        }

        closest
    }

    /// Terminates on the first intersection, for shadow rays.
    pub(super) fn occluded(&self, origin: &glm::Vec3, dir: &glm::Vec3, t_min: f32, t_max: f32, mask: u8) -> bool {
        let inv_dir = dir.map(|c| 1.0 / c);
        self.instances
            .iter()
            .filter(|instance| instance.mask & mask != 0)
            .flat_map(|instance| instance.geometries.iter())
            .filter(|geometry| geometry.bounds.hit(origin, &inv_dir, t_min, t_max))
            .any(|geometry| {
                geometry
                    .triangles
                    .iter()
                    .any(|triangle| triangle.intersect(origin, dir, t_min, t_max).is_some())
            })
    }
}

pub(super) fn validate_geometry(name: &str, geometry: &GeometryDesc) -> Result<(), DeviceError> {
    let invalid = |reason: &str| DeviceError::InvalidCreateInfo {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };
    if geometry.index_type != vk::IndexType::UINT32 {
        return Err(invalid("only UINT32 indices are supported"));
    }
    if geometry.vertex_format != vk::Format::R32G32B32_SFLOAT {
        return Err(invalid("vertex positions must be R32G32B32_SFLOAT"));
    }
    if geometry.vertex_stride < 12 {
        return Err(invalid("vertex stride is smaller than a position"));
    }
    if geometry.index_offset % 4 != 0 {
        return Err(invalid("index offset must be aligned to the index size"));
    }
    // there is no any hit stage to resolve transparency
    if !geometry.flags.contains(vk::GeometryFlagsKHR::OPAQUE) {
        return Err(invalid("only OPAQUE geometry is supported"));
    }
    Ok(())
}

impl State {
    pub(super) fn build_acceleration_structure(
        &mut self,
        handle: AccelerationStructureHandle,
    ) -> Result<(), DeviceError> {
        scope!("software::build_acceleration_structure");

        let accel = self
            .acceleration_structures
            .get(&handle)
            .ok_or_else(|| DeviceError::InvalidHandle(handle.to_string()))?;

        match accel.kind {
            AccelerationKind::Bottom { ref geometries, .. } => {
                let geometries = geometries
                    .iter()
                    .map(|geometry| self.read_geometry(&accel.name, geometry))
                    .collect::<Result<Vec<_>, _>>()?;
                if let Some(SoftAccelerationStructure {
                    kind: AccelerationKind::Bottom { built, .. },
                    ..
                }) = self.acceleration_structures.get_mut(&handle)
                {
                    *built = Some(Arc::new(geometries));
                }
            }
            AccelerationKind::Top { ref instances, .. } => {
                let instances = instances
                    .iter()
                    .map(|instance| self.instantiate(&accel.name, instance))
                    .collect::<Result<Vec<_>, _>>()?;
                if let Some(SoftAccelerationStructure {
                    kind: AccelerationKind::Top { built, .. },
                    ..
                }) = self.acceleration_structures.get_mut(&handle)
                {
                    *built = Some(Arc::new(BuiltTopLevel { instances }));
                }
            }
        }
        self.stats.acceleration_structure_builds += 1;

        Ok(())
    }

    fn read_geometry(&self, name: &str, geometry: &GeometryDesc) -> Result<GeometryTriangles, DeviceError> {
        self.check_visible(ResourceKey::Buffer(geometry.index_buffer))?;
        self.check_visible(ResourceKey::Buffer(geometry.vertex_buffer))?;
        let index_buffer = self.buffer(geometry.index_buffer)?;
        let vertex_buffer = self.buffer(geometry.vertex_buffer)?;

        let indices = index_buffer.read(geometry.index_offset, u64::from(geometry.triangle_count) * 3 * 4)?;
        let position = |index: u32| -> Result<glm::Vec3, DeviceError> {
            let offset = geometry.vertex_offset + u64::from(index) * geometry.vertex_stride;
            let [x, y, z] = bytemuck::pod_read_unaligned::<[f32; 3]>(vertex_buffer.read(offset, 12)?);
            Ok(glm::vec3(x, y, z))
        };

        let triangles = indices
            .chunks_exact(12)
            .map(|triangle| {
                let [a, b, c] = bytemuck::pod_read_unaligned::<[u32; 3]>(triangle);
                Ok(Triangle::new(position(a)?, position(b)?, position(c)?))
            })
            .collect::<Result<Vec<_>, DeviceError>>()
            .map_err(|err| DeviceError::InvalidCommand {
                name: name.to_owned(),
                reason: format!("reading geometry: {}", err),
            })?;

        Ok(GeometryTriangles::new(triangles))
    }

    fn instantiate(&self, name: &str, instance: &InstanceDesc) -> Result<BuiltInstance, DeviceError> {
        let blas = self
            .acceleration_structures
            .get(&instance.blas)
            .ok_or_else(|| DeviceError::InvalidHandle(instance.blas.to_string()))?;
        let geometries = match blas.kind {
            AccelerationKind::Bottom { built: Some(ref built), .. } => built,
            AccelerationKind::Bottom { built: None, .. } => {
                return Err(DeviceError::InvalidCommand {
                    name: name.to_owned(),
                    reason: format!("{} is instanced before it was built", blas.name),
                })
            }
            AccelerationKind::Top { .. } => {
                return Err(DeviceError::InvalidCommand {
                    name: name.to_owned(),
                    reason: format!("{} is a top level structure", blas.name),
                })
            }
        };

        Ok(BuiltInstance {
            source: instance.blas,
            custom_index: instance.custom_index,
            mask: instance.mask,
            geometries: geometries
                .iter()
                .map(|geometry| geometry.transformed(&instance.transform))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_instance(custom_index: u32, z: f32) -> BuiltInstance {
        let a = glm::vec3(-1.0, -1.0, z);
        let b = glm::vec3(1.0, -1.0, z);
        let c = glm::vec3(1.0, 1.0, z);
        let d = glm::vec3(-1.0, 1.0, z);
        BuiltInstance {
            source: AccelerationStructureHandle(custom_index as u64),
            custom_index,
            mask: 0xff,
            geometries: vec![
                GeometryTriangles::new(vec![Triangle::new(a, b, c), Triangle::new(a, c, d)]),
                GeometryTriangles::new(vec![]),
            ],
        }
    }

    #[test]
    fn closest_hit_picks_the_nearest_instance() {
        let tlas = BuiltTopLevel {
            instances: vec![quad_instance(0, 5.0), quad_instance(1, 2.0)],
        };
        let origin = glm::vec3(0.25, 0.0, 0.0);
        let dir = glm::vec3(0.0, 0.0, 1.0);

        let hit = tlas.closest_hit(&origin, &dir, 0.0, f32::MAX, 0xff).unwrap();
        assert_eq!(hit.instance_custom_index, 1);
        assert_eq!(hit.geometry_index, 0);
        assert!((hit.t - 2.0).abs() < 1e-5);

        assert!(tlas.occluded(&origin, &dir, 0.0, 3.0, 0xff));
        assert!(!tlas.occluded(&origin, &dir, 0.0, 1.5, 0xff));
        assert!(tlas.closest_hit(&origin, &(-dir), 0.0, f32::MAX, 0xff).is_none());
    }

    #[test]
    fn empty_geometry_never_hits() {
        let tlas = BuiltTopLevel {
            instances: vec![BuiltInstance {
                source: AccelerationStructureHandle(1),
                custom_index: 1,
                mask: 0xff,
                geometries: vec![GeometryTriangles::new(vec![])],
            }],
        };
        let hit = tlas.closest_hit(&glm::Vec3::zeros(), &glm::vec3(0.0, 0.0, 1.0), 0.0, f32::MAX, 0xff);
        assert!(hit.is_none());
    }
}
