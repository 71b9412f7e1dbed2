use crate::utils::{Handle, Pool};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use std::mem::ManuallyDrop;
use vk_mem::Alloc;

use super::commands;
use super::{GpuError, ImmediateSubmit, Result};

/// Where a buffer's memory should live.
#[repr(C)]
#[derive(Default, Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryVisibility {
    Gpu,
    #[default]
    CpuAndGpu,
}

/// A buffer and the device memory backing it. The pair is created together
/// and destroyed together; neither handle is ever released on its own.
#[derive(Debug)]
pub struct AllocatedBuffer {
    pub buf: vk::Buffer,
    pub(crate) alloc: vk_mem::Allocation,
    pub size: u64,
}

/// An image, its default full-range view, and its memory allocation.
#[derive(Debug)]
pub struct AllocatedImage {
    pub img: vk::Image,
    pub view: vk::ImageView,
    pub(crate) alloc: vk_mem::Allocation,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
}

/// Vertex layout shared with the mesh shaders: interleaved, with the UVs
/// packed into the padding lanes of the two vec3s.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub uv_x: f32,
    pub normal: Vec3,
    pub uv_y: f32,
    pub color: Vec4,
}

/// GPU-side storage for one uploaded mesh.
pub struct GpuMeshBuffers {
    pub index_buffer: Handle<AllocatedBuffer>,
    pub vertex_buffer: Handle<AllocatedBuffer>,
    pub vertex_buffer_address: vk::DeviceAddress,
}

/// Push-constant block consumed by the mesh pipelines. The external pipeline
/// collaborator sizes its push range from this struct.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuDrawPushConstants {
    pub world_matrix: Mat4,
    pub vertex_buffer: vk::DeviceAddress,
    pub _padding: u64,
}

impl GpuDrawPushConstants {
    pub fn new(world_matrix: Mat4, vertex_buffer: vk::DeviceAddress) -> Self {
        Self {
            world_matrix,
            vertex_buffer,
            _padding: 0,
        }
    }
}

/// Owner of every buffer and image the renderer creates.
///
/// Creation returns generational handles; destruction releases the resource
/// and its memory in one step and invalidates the handle, so a second destroy
/// of the same handle is a logged no-op rather than a double free. The live
/// counters exist for leak checks at shutdown and in tests.
pub struct ResourceManager {
    device: ash::Device,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    buffers: Pool<AllocatedBuffer>,
    images: Pool<AllocatedImage>,
}

impl ResourceManager {
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        pdevice: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
            instance, &device, pdevice,
        ))?;

        Ok(Self {
            device,
            allocator: ManuallyDrop::new(allocator),
            buffers: Pool::default(),
            images: Pool::default(),
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn make_buffer(
        &mut self,
        byte_size: u64,
        usage: vk::BufferUsageFlags,
        visibility: MemoryVisibility,
    ) -> Result<Handle<AllocatedBuffer>> {
        let mappable = matches!(visibility, MemoryVisibility::CpuAndGpu);
        let create_info = vk_mem::AllocationCreateInfo {
            usage: if mappable {
                vk_mem::MemoryUsage::AutoPreferHost
            } else {
                vk_mem::MemoryUsage::Auto
            },
            flags: if mappable {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };

        let (buffer, allocation) = unsafe {
            self.allocator.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(byte_size)
                    .usage(usage)
                    .build(),
                &create_info,
            )
        }
        .map_err(|cause| GpuError::AllocationFailed {
            what: "buffer",
            size: byte_size,
            cause,
        })?;

        self.buffers
            .insert(AllocatedBuffer {
                buf: buffer,
                alloc: allocation,
                size: byte_size,
            })
            .ok_or(GpuError::SlotExhausted("buffer"))
    }

    /// Resolves a handle. Panics on a stale handle; holding one past destroy
    /// is an ownership bug, not a runtime condition.
    pub fn buffer(&self, handle: Handle<AllocatedBuffer>) -> &AllocatedBuffer {
        self.buffers.get_ref(handle).expect("stale buffer handle")
    }

    pub fn image(&self, handle: Handle<AllocatedImage>) -> &AllocatedImage {
        self.images.get_ref(handle).expect("stale image handle")
    }

    /// Copies `data` into a host-visible buffer through a transient mapping.
    /// Writes larger than the buffer are rejected without touching memory.
    pub fn write_buffer<T: Pod>(
        &mut self,
        handle: Handle<AllocatedBuffer>,
        data: &[T],
    ) -> Result<()> {
        let buf = self
            .buffers
            .get_mut_ref(handle)
            .ok_or(GpuError::SlotExhausted("buffer"))?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 > buf.size {
            return Err(GpuError::BufferWriteOverflow {
                len: bytes.len() as u64,
                capacity: buf.size,
            });
        }

        unsafe {
            let mapped = self.allocator.map_memory(&mut buf.alloc)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped, bytes.len());
            self.allocator.unmap_memory(&mut buf.alloc);
        }
        Ok(())
    }

    pub fn make_image(
        &mut self,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mipmapped: bool,
    ) -> Result<Handle<AllocatedImage>> {
        let mip_levels = if mipmapped {
            commands::mip_levels_for(vk::Extent2D {
                width: extent.width,
                height: extent.height,
            })
        } else {
            1
        };

        let (image, allocation) = unsafe {
            self.allocator.create_image(
                &commands::image_create_info(format, usage, extent, mip_levels),
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::Auto,
                    ..Default::default()
                },
            )
        }
        .map_err(|cause| GpuError::AllocationFailed {
            what: "image",
            size: extent.width as u64 * extent.height as u64 * extent.depth as u64 * 4,
            cause,
        })?;

        let aspect = commands::image_aspect_for_format(format);
        let view = unsafe {
            self.device.create_image_view(
                &commands::image_view_create_info(format, image, aspect, mip_levels),
                None,
            )?
        };

        self.images
            .insert(AllocatedImage {
                img: image,
                view,
                alloc: allocation,
                extent,
                format,
            })
            .ok_or(GpuError::SlotExhausted("image"))
    }

    /// Creates an image and fills it from `data` (tightly packed, 4 bytes per
    /// texel) before returning. The upload runs through the immediate channel,
    /// so the image is ready for sampling once this call comes back.
    pub fn make_image_with_data(
        &mut self,
        imm: &mut ImmediateSubmit,
        data: &[u8],
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mipmapped: bool,
    ) -> Result<Handle<AllocatedImage>> {
        let staging = self.make_buffer(
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryVisibility::CpuAndGpu,
        )?;
        self.write_buffer(staging, data)?;

        let image = self.make_image(
            extent,
            format,
            usage | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
            mipmapped,
        )?;

        let raw_image = self.image(image).img;
        let raw_staging = self.buffer(staging).buf;
        let device = self.device.clone();

        imm.submit(|cmd| {
            commands::transition_image(
                &device,
                cmd,
                raw_image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1)
                        .build(),
                )
                .image_extent(extent)
                .build();

            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    raw_staging,
                    raw_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&region),
                )
            };

            if mipmapped {
                commands::generate_mipmaps(
                    &device,
                    cmd,
                    raw_image,
                    vk::Extent2D {
                        width: extent.width,
                        height: extent.height,
                    },
                );
            } else {
                commands::transition_image(
                    &device,
                    cmd,
                    raw_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            }
        })?;

        self.destroy_buffer(staging);
        Ok(image)
    }

    /// Uploads index and vertex data into device-local buffers, returning the
    /// vertex buffer's GPU address for pull-style vertex fetch. Blocks until
    /// the copy has finished.
    pub fn upload_mesh(
        &mut self,
        imm: &mut ImmediateSubmit,
        indices: &[u32],
        vertices: &[Vertex],
    ) -> Result<GpuMeshBuffers> {
        let vertex_bytes = std::mem::size_of_val(vertices) as u64;
        let index_bytes = std::mem::size_of_val(indices) as u64;

        let vertex_buffer = self.make_buffer(
            vertex_bytes,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryVisibility::Gpu,
        )?;
        let index_buffer = self.make_buffer(
            index_bytes,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryVisibility::Gpu,
        )?;

        let vertex_buffer_address = unsafe {
            self.device.get_buffer_device_address(
                &vk::BufferDeviceAddressInfo::builder()
                    .buffer(self.buffer(vertex_buffer).buf)
                    .build(),
            )
        };

        let staging = self.make_buffer(
            vertex_bytes + index_bytes,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryVisibility::CpuAndGpu,
        )?;
        {
            let buf = self
                .buffers
                .get_mut_ref(staging)
                .ok_or(GpuError::SlotExhausted("buffer"))?;
            unsafe {
                let mapped = self.allocator.map_memory(&mut buf.alloc)?;
                std::ptr::copy_nonoverlapping(
                    vertices.as_ptr() as *const u8,
                    mapped,
                    vertex_bytes as usize,
                );
                std::ptr::copy_nonoverlapping(
                    indices.as_ptr() as *const u8,
                    mapped.add(vertex_bytes as usize),
                    index_bytes as usize,
                );
                self.allocator.unmap_memory(&mut buf.alloc);
            }
        }

        let raw_staging = self.buffer(staging).buf;
        let raw_vertex = self.buffer(vertex_buffer).buf;
        let raw_index = self.buffer(index_buffer).buf;
        let device = self.device.clone();

        imm.submit(|cmd| unsafe {
            device.cmd_copy_buffer(
                cmd,
                raw_staging,
                raw_vertex,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: vertex_bytes,
                }],
            );
            device.cmd_copy_buffer(
                cmd,
                raw_staging,
                raw_index,
                &[vk::BufferCopy {
                    src_offset: vertex_bytes,
                    dst_offset: 0,
                    size: index_bytes,
                }],
            );
        })?;

        self.destroy_buffer(staging);

        Ok(GpuMeshBuffers {
            index_buffer,
            vertex_buffer,
            vertex_buffer_address,
        })
    }

    /// Releases the buffer and its memory. Exactly one destroy per handle;
    /// a stale handle is ignored with a warning.
    ///
    /// # Prerequisites
    /// - The GPU must have finished all work referencing the buffer.
    pub fn destroy_buffer(&mut self, handle: Handle<AllocatedBuffer>) {
        match self.buffers.take(handle) {
            Some(mut buf) => unsafe {
                self.allocator.destroy_buffer(buf.buf, &mut buf.alloc);
            },
            None => log::warn!("destroy_buffer called with a stale handle"),
        }
    }

    /// Releases the image, its view and its memory.
    ///
    /// # Prerequisites
    /// - The GPU must have finished all work referencing the image.
    pub fn destroy_image(&mut self, handle: Handle<AllocatedImage>) {
        match self.images.take(handle) {
            Some(mut img) => unsafe {
                self.device.destroy_image_view(img.view, None);
                self.allocator.destroy_image(img.img, &mut img.alloc);
            },
            None => log::warn!("destroy_image called with a stale handle"),
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len_occupied()
    }

    pub fn live_images(&self) -> usize {
        self.images.len_occupied()
    }

    /// Destroys anything still alive (warning about it; a clean shutdown
    /// flushes every deletion queue first) and tears down the allocator.
    /// Must run before the device is destroyed.
    pub fn destroy(&mut self) {
        let leaked = self.live_buffers() + self.live_images();
        if leaked > 0 {
            log::warn!(
                "resource manager shutting down with {} live allocations ({} buffers, {} images)",
                leaked,
                self.live_buffers(),
                self.live_images()
            );
        }

        let allocator = &self.allocator;
        let device = &self.device;
        self.buffers.for_each_occupied_mut(|buf| unsafe {
            allocator.destroy_buffer(buf.buf, &mut buf.alloc);
        });
        self.images.for_each_occupied_mut(|img| unsafe {
            device.destroy_image_view(img.view, None);
            allocator.destroy_image(img.img, &mut img.alloc);
        });
        self.buffers.clear();
        self.images.clear();

        // The allocator has to go before the device it was created from.
        unsafe { ManuallyDrop::drop(&mut self.allocator) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_shader_expectations() {
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
        assert_eq!(std::mem::offset_of!(Vertex, uv_x), 12);
        assert_eq!(std::mem::offset_of!(Vertex, normal), 16);
        assert_eq!(std::mem::offset_of!(Vertex, uv_y), 28);
        assert_eq!(std::mem::offset_of!(Vertex, color), 32);
    }

    #[test]
    fn push_constants_are_pod_sized() {
        // mat4 + device address, padded to a 16-byte multiple.
        assert_eq!(std::mem::size_of::<GpuDrawPushConstants>(), 80);
    }
}
