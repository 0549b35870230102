use std::borrow::Cow;

use image::RgbaImage;
use tracing::{debug, info};
use wgpu::{
    Backends, BindGroupDescriptor, BindGroupEntry, BindingResource, Buffer, BufferDescriptor,
    BufferUsages, CommandEncoderDescriptor, ComputePipeline, Device, Extent3d, Instance, Queue,
    Sampler, Texture, TextureDescriptor, TextureDimension, TextureFormat, TextureUsages,
    TextureViewDescriptor,
};

use super::{CpuRasterContext, RasterContext};
use crate::{error::TranscodeError, texture::RasterImage};

const WORKGROUP_SIZE: u32 = 8;

/// Resamples through a compute pass on the GPU.
///
/// The source is uploaded into a sampled texture and drawn into a storage texture of
/// the requested size with a linear, clamp-to-edge sampler, then read back.
pub struct GpuRasterContext {
    device: Device,
    queue: Queue,
    pipeline: ComputePipeline,
    sampler: Sampler,
    adapter_name: String,
    oversized: CpuRasterContext,
}

/// Per-call GPU allocations, destroyed when dropped so every exit path releases them.
struct ScratchResources {
    source: Texture,
    target: Texture,
    readback: Buffer,
}

impl Drop for ScratchResources {
    fn drop(&mut self) {
        self.source.destroy();
        self.target.destroy();
        self.readback.destroy();
    }
}

impl GpuRasterContext {
    pub fn new() -> Result<Self, TranscodeError> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self, TranscodeError> {
        let instance = Instance::new(&wgpu::InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(Backends::all()).await;
        let adapter = adapters
            .into_iter()
            .max_by_key(|adapter| match adapter.get_info().device_type {
                wgpu::DeviceType::DiscreteGpu => 3,
                wgpu::DeviceType::IntegratedGpu => 2,
                wgpu::DeviceType::VirtualGpu => 1,
                _ => 0,
            })
            .ok_or_else(|| TranscodeError::ContextUnavailable("no GPU adapter found".into()))?;

        let adapter_info = adapter.get_info();
        let required_limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("texbake raster context"),
                required_features: wgpu::Features::empty(),
                required_limits,
                ..Default::default()
            })
            .await
            .map_err(|err| TranscodeError::ContextUnavailable(err.to_string()))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("texbake resample shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("resample.wgsl"))),
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("texbake resample pipeline"),
            layout: None,
            module: &shader,
            entry_point: Some("resample"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("texbake resample sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        info!(
            "GPU raster context ready: {} ({:?}, {:?})",
            adapter_info.name, adapter_info.backend, adapter_info.device_type
        );

        Ok(Self {
            device,
            queue,
            pipeline,
            sampler,
            adapter_name: adapter_info.name,
            oversized: CpuRasterContext::default(),
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn allocate(&self, source: &RgbaImage, width: u32, height: u32, padded_row: u32) -> ScratchResources {
        let source_texture = self.device.create_texture(&TextureDescriptor {
            label: Some("texbake resample source"),
            size: extent(source.width(), source.height()),
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let target = self.device.create_texture(&TextureDescriptor {
            label: Some("texbake resample target"),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsages::STORAGE_BINDING | TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let readback = self.device.create_buffer(&BufferDescriptor {
            label: Some("texbake resample readback"),
            size: padded_row as u64 * height as u64,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        ScratchResources {
            source: source_texture,
            target,
            readback,
        }
    }
}

/// Whether both the source and the target texture stay within `max_dimension`.
fn fits_device(max_dimension: u32, source: &RgbaImage, width: u32, height: u32) -> bool {
    width
        .max(height)
        .max(source.width())
        .max(source.height())
        <= max_dimension
}

fn extent(width: u32, height: u32) -> Extent3d {
    Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

impl RasterContext for GpuRasterContext {
    fn name(&self) -> &str {
        "gpu"
    }

    fn resample(
        &mut self,
        source: &RgbaImage,
        width: u32,
        height: u32,
    ) -> Result<RasterImage, TranscodeError> {
        if width == 0 || height == 0 {
            return Err(TranscodeError::Resample(format!(
                "cannot resample {}x{} to {}x{}",
                source.width(),
                source.height(),
                width,
                height
            )));
        }

        let max_dimension = self.device.limits().max_texture_dimension_2d;
        if !fits_device(max_dimension, source, width, height) {
            debug!(
                "{}x{} -> {}x{} exceeds the device limit of {}, resampling on the CPU",
                source.width(),
                source.height(),
                width,
                height,
                max_dimension
            );
            return self.oversized.resample(source, width, height);
        }

        let unpadded_row = width * 4;
        let padded_row = unpadded_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let scratch = self.allocate(source, width, height, padded_row);

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &scratch.source,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            source.as_raw(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(source.width() * 4),
                rows_per_image: Some(source.height()),
            },
            extent(source.width(), source.height()),
        );

        let source_view = scratch.source.create_view(&TextureViewDescriptor::default());
        let target_view = scratch.target.create_view(&TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("texbake resample bind group"),
            layout: &self.pipeline.get_bind_group_layout(0),
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::TextureView(&source_view),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::Sampler(&self.sampler),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: BindingResource::TextureView(&target_view),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("texbake resample encoder"),
            });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("texbake resample pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                width.div_ceil(WORKGROUP_SIZE),
                height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &scratch.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &scratch.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            extent(width, height),
        );

        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = scratch.readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        let _ = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });
        rx.recv()
            .map_err(|_| TranscodeError::Resample("readback channel closed".into()))?
            .map_err(|err| TranscodeError::Resample(err.to_string()))?;

        let mut pixels = Vec::with_capacity((unpadded_row * height) as usize);
        {
            let mapped = buffer_slice.get_mapped_range();
            for row in mapped.chunks_exact(padded_row as usize) {
                pixels.extend_from_slice(&row[..unpadded_row as usize]);
            }
        }
        scratch.readback.unmap();

        debug!(
            "GPU resampled {}x{} -> {}x{}",
            source.width(),
            source.height(),
            width,
            height
        );

        RasterImage::new(width, height, pixels)
            .ok_or_else(|| TranscodeError::Resample("readback size mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;

    #[test]
    fn test_fits_device() {
        let wide = RgbaImage::new(4096, 64);
        assert!(!fits_device(2048, &wide, 1024, 16));
        assert!(fits_device(8192, &wide, 1024, 16));
        assert!(!fits_device(2048, &RgbaImage::new(16, 16), 4096, 4096));
        assert!(fits_device(2048, &RgbaImage::new(2048, 2048), 2048, 2048));
    }

    #[test]
    #[ignore] // Requires GPU
    fn test_gpu_resample_beyond_device_limit() {
        let mut context = GpuRasterContext::new().expect("Failed to create GPU context");
        let limit = context.device.limits().max_texture_dimension_2d;
        let source = RgbaImage::from_pixel(limit + 1, 64, Rgba([10, 20, 30, 255]));
        let raster = context.resample(&source, 1024, 16).unwrap();

        assert_eq!((raster.width(), raster.height()), (1024, 16));
        assert!(raster
            .pixels()
            .chunks_exact(4)
            .all(|texel| texel == [10, 20, 30, 255]));
    }

    #[test]
    #[ignore] // Requires GPU
    fn test_gpu_resample_solid_color() {
        let mut context = GpuRasterContext::new().expect("Failed to create GPU context");
        let source = RgbaImage::from_pixel(300, 200, Rgba([0, 255, 0, 255]));
        let raster = context.resample(&source, 512, 256).unwrap();

        assert_eq!((raster.width(), raster.height()), (512, 256));
        assert!(raster
            .pixels()
            .chunks_exact(4)
            .all(|texel| texel == [0, 255, 0, 255]));
    }
}
