use std::mem::size_of;

use ash::vk;
use bytemuck::Pod;

use crate::renderer::device::{BufferDesc, DeviceError, MemoryLocation, TextureDesc};

/// Memory is word-backed so every `#[repr(C)]` record of `f32`/`u32` fields can be viewed in place.
pub(super) struct SoftBuffer {
    pub(super) name: String,
    pub(super) size: u64,
    pub(super) usage: vk::BufferUsageFlags,
    pub(super) location: MemoryLocation,
    words: Vec<u32>,
}

impl SoftBuffer {
    pub(super) fn new(desc: &BufferDesc<'_>) -> Result<SoftBuffer, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::InvalidCreateInfo {
                name: desc.name.to_owned(),
                reason: "buffers must not be empty".to_owned(),
            });
        }
        if desc.usage.is_empty() {
            return Err(DeviceError::InvalidCreateInfo {
                name: desc.name.to_owned(),
                reason: "no usage flags".to_owned(),
            });
        }

        Ok(SoftBuffer {
            name: desc.name.to_owned(),
            size: desc.size,
            usage: desc.usage,
            location: desc.location,
            words: vec![0; ((desc.size + 3) / 4) as usize],
        })
    }

    pub(super) fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u32, u8>(&self.words)[..self.size as usize]
    }

    fn range(&self, offset: u64, len: u64) -> Result<std::ops::Range<usize>, DeviceError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(offset as usize..end as usize),
            _ => Err(DeviceError::OutOfBounds {
                name: self.name.clone(),
                offset,
                len,
                size: self.size,
            }),
        }
    }

    pub(super) fn read(&self, offset: u64, len: u64) -> Result<&[u8], DeviceError> {
        let range = self.range(offset, len)?;
        Ok(&self.bytes()[range])
    }

    pub(super) fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let range = self.range(offset, data.len() as u64)?;
        bytemuck::cast_slice_mut::<u32, u8>(&mut self.words)[range].copy_from_slice(data);
        Ok(())
    }

    pub(super) fn fill(&mut self, value: u32) {
        self.words.iter_mut().for_each(|word| *word = value);
    }

    pub(super) fn read_pod<T: Pod>(&self) -> Result<T, DeviceError> {
        Ok(bytemuck::pod_read_unaligned(self.read(0, size_of::<T>() as u64)?))
    }

    /// The whole buffer as records of `T`, trailing bytes ignored.
    pub(super) fn typed<T: Pod>(&self) -> Result<&[T], DeviceError> {
        let len = self.size as usize / size_of::<T>() * size_of::<T>();
        bytemuck::try_cast_slice(&self.bytes()[..len]).map_err(|err| self.cast_error(err))
    }

    pub(super) fn typed_mut<T: Pod>(&mut self) -> Result<&mut [T], DeviceError> {
        let len = self.size as usize / size_of::<T>() * size_of::<T>();
        let bytes = &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.words)[..len];
        match bytemuck::try_cast_slice_mut(bytes) {
            Ok(typed) => Ok(typed),
            Err(err) => Err(DeviceError::InvalidCommand {
                name: self.name.clone(),
                reason: format!("cannot view as {}: {}", std::any::type_name::<T>(), err),
            }),
        }
    }

    fn cast_error(&self, err: bytemuck::PodCastError) -> DeviceError {
        DeviceError::InvalidCommand {
            name: self.name.clone(),
            reason: format!("cannot view buffer contents: {}", err),
        }
    }
}

pub(super) struct SoftTexture {
    pub(super) name: String,
    pub(super) extent: vk::Extent2D,
    pub(super) format: vk::Format,
    pub(super) usage: vk::ImageUsageFlags,
    pub(super) layout: vk::ImageLayout,
    words: Vec<u32>,
}

fn words_per_texel(format: vk::Format) -> Option<usize> {
    match format {
        vk::Format::R32G32B32A32_SFLOAT => Some(4),
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB | vk::Format::B8G8R8A8_UNORM => Some(1),
        _ => None,
    }
}

impl SoftTexture {
    pub(super) fn new(desc: &TextureDesc<'_>) -> Result<SoftTexture, DeviceError> {
        let invalid = |reason: String| DeviceError::InvalidCreateInfo {
            name: desc.name.to_owned(),
            reason,
        };
        let words_per_texel =
            words_per_texel(desc.format).ok_or_else(|| invalid(format!("unsupported format {:?}", desc.format)))?;
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(invalid(format!("zero sized extent {:?}", desc.extent)));
        }

        Ok(SoftTexture {
            name: desc.name.to_owned(),
            extent: desc.extent,
            format: desc.format,
            usage: desc.usage,
            layout: desc.initial_layout,
            words: vec![0; desc.extent.width as usize * desc.extent.height as usize * words_per_texel],
        })
    }

    pub(super) fn byte_len(&self) -> usize {
        self.words.len() * 4
    }

    pub(super) fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub(super) fn write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        if data.len() != self.byte_len() {
            return Err(DeviceError::OutOfBounds {
                name: self.name.clone(),
                offset: 0,
                len: data.len() as u64,
                size: self.byte_len() as u64,
            });
        }
        bytemuck::cast_slice_mut::<u32, u8>(&mut self.words).copy_from_slice(data);
        Ok(())
    }

    fn expect_format(&self, float: bool) -> Result<(), DeviceError> {
        if (self.format == vk::Format::R32G32B32A32_SFLOAT) == float {
            Ok(())
        } else {
            Err(DeviceError::InvalidCommand {
                name: self.name.clone(),
                reason: format!("texel access does not match format {:?}", self.format),
            })
        }
    }

    #[cfg(test)]
    pub(super) fn rgba32f(&self) -> Result<&[[f32; 4]], DeviceError> {
        self.expect_format(true)?;
        Ok(bytemuck::cast_slice(&self.words))
    }

    pub(super) fn rgba32f_mut(&mut self) -> Result<&mut [[f32; 4]], DeviceError> {
        self.expect_format(true)?;
        Ok(bytemuck::cast_slice_mut(&mut self.words))
    }

    pub(super) fn rgba8_mut(&mut self) -> Result<&mut [[u8; 4]], DeviceError> {
        self.expect_format(false)?;
        Ok(bytemuck::cast_slice_mut(&mut self.words))
    }

    /// Nearest neighbour, repeat addressing, normalized to `[0, 1]` for 8 bit formats.
    pub(super) fn sample(&self, uv: [f32; 2]) -> [f32; 4] {
        let wrap = |coord: f32, size: u32| {
            let texel = (coord - coord.floor()) * size as f32;
            (texel as u32).min(size - 1)
        };
        let x = wrap(uv[0], self.extent.width);
        let y = wrap(uv[1], self.extent.height);
        let ix = (y * self.extent.width + x) as usize;

        if self.format == vk::Format::R32G32B32A32_SFLOAT {
            let base = ix * 4;
            [
                f32::from_bits(self.words[base]),
                f32::from_bits(self.words[base + 1]),
                f32::from_bits(self.words[base + 2]),
                f32::from_bits(self.words[base + 3]),
            ]
        } else {
            let [r, g, b, a] = self.words[ix].to_le_bytes();
            let texel = if self.format == vk::Format::B8G8R8A8_UNORM {
                [b, g, r, a]
            } else {
                [r, g, b, a]
            };
            texel.map(|c| c as f32 / 255.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_views_ignore_trailing_bytes() {
        let mut buffer = SoftBuffer::new(&BufferDesc {
            name: "test",
            size: 10,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            location: MemoryLocation::CpuToGpu,
        })
        .unwrap();
        buffer.write(0, bytemuck::cast_slice(&[7u32, 9u32])).unwrap();
        assert_eq!(buffer.typed::<u32>().unwrap(), &[7, 9]);
        assert!(buffer.write(8, &[0; 4]).is_err());
        assert_eq!(buffer.read_pod::<u32>().unwrap(), 7);
    }

    #[test]
    fn sampling_wraps_and_normalizes() {
        let mut texture = SoftTexture::new(&TextureDesc {
            name: "checker",
            extent: vk::Extent2D { width: 2, height: 1 },
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::SAMPLED,
            initial_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        })
        .unwrap();
        texture.write(&[255, 0, 0, 255, 0, 255, 0, 255]).unwrap();
        assert_eq!(texture.sample([0.25, 0.5]), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(texture.sample([1.75, 0.5]), [0.0, 1.0, 0.0, 1.0]);
        assert!(texture.rgba32f().is_err());
    }
}
