use ash::vk;
use profiling::scope;
use rayon::prelude::*;

use super::{direct_light::BoundSet, queue::Bindings, resources::SoftTexture, PipelineKind, ResourceKey, State};
use crate::renderer::{
    device::{DeviceError, PipelineHandle, TextureHandle},
    shaders::beauty_set,
};

/// Reinhard, then display gamma unless the target encodes sRGB itself.
fn tonemap(radiance: [f32; 4], encode_gamma: bool) -> [u8; 3] {
    let channel = |c: f32| {
        let mapped = c.max(0.0) / (1.0 + c.max(0.0));
        let encoded = if encode_gamma { mapped.powf(1.0 / 2.2) } else { mapped };
        (encoded * 255.0 + 0.5) as u8
    };
    [channel(radiance[0]), channel(radiance[1]), channel(radiance[2])]
}

impl State {
    /// Fullscreen triangle sampling the ray traced radiance into `target`.
    pub(super) fn composite(
        &mut self,
        pipeline: PipelineHandle,
        bindings: &Bindings,
        target: TextureHandle,
    ) -> Result<(), DeviceError> {
        scope!("software::composite");

        let entry = self.pipeline(pipeline)?;
        let color_format = match entry.kind {
            PipelineKind::Raster { color_format } => color_format,
            PipelineKind::RayTracing { .. } => {
                return Err(DeviceError::InvalidCommand {
                    name: entry.name.clone(),
                    reason: "draws need a raster pipeline".to_owned(),
                })
            }
        };
        let target_format = self.texture(target)?.format;
        if target_format != color_format {
            return Err(DeviceError::InvalidCommand {
                name: entry.name.clone(),
                reason: format!("renders {:?} but the target is {:?}", color_format, target_format),
            });
        }

        let set = BoundSet::resolve(self, bindings, vk::PipelineBindPoint::GRAPHICS, beauty_set::INDEX)?;
        set.sampler(beauty_set::SAMPLER)?;
        let source = set.sampled_image(beauty_set::RT_OUTPUT)?;
        if source == target {
            return Err(DeviceError::AliasedBinding {
                name: self.texture(target)?.name.clone(),
            });
        }
        self.check_visible(ResourceKey::Texture(source))?;
        let source_texture = self.texture(source)?;
        if source_texture.layout != vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
            return Err(DeviceError::LayoutMismatch {
                name: source_texture.name.clone(),
                expected: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                actual: source_texture.layout,
            });
        }

        let mut output = self
            .textures
            .remove(&target)
            .ok_or_else(|| DeviceError::InvalidHandle(target.to_string()))?;
        let result = self.resolve_into(source, &mut output);
        self.textures.insert(target, output);
        result
    }

    fn resolve_into(&self, source: TextureHandle, output: &mut SoftTexture) -> Result<(), DeviceError> {
        let source = self.texture(source)?;
        let width = output.extent.width as usize;
        let height = output.extent.height as f32;
        let encode_gamma = output.format != vk::Format::R8G8B8A8_SRGB;
        let swizzle = output.format == vk::Format::B8G8R8A8_UNORM;

        output
            .rgba8_mut()?
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, texel) in row.iter_mut().enumerate() {
                    let uv = [(x as f32 + 0.5) / width as f32, (y as f32 + 0.5) / height];
                    let [r, g, b] = tonemap(source.sample(uv), encode_gamma);
                    *texel = if swizzle { [b, g, r, 255] } else { [r, g, b, 255] };
                }
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tonemap_is_monotonic_and_bounded() {
        assert_eq!(tonemap([0.0, -1.0, 0.0, 1.0], false), [0, 0, 0]);
        assert_eq!(tonemap([1.0, 1.0, 1.0, 1.0], false), [128, 128, 128]);

        let mut previous = 0;
        for step in 0..64 {
            let [value, ..] = tonemap([step as f32 * 0.25, 0.0, 0.0, 1.0], true);
            assert!(value >= previous);
            previous = value;
        }
        assert!(previous < 255);
    }
}
