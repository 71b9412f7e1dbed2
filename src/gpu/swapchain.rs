use ash::extensions::khr;
use ash::vk;

use super::Result;

/// The presentable image chain for one surface.
///
/// Resizes are not errors here: a stale chain reports itself through the
/// return values of [`Swapchain::acquire`] and [`Swapchain::present`] and the
/// caller rebuilds it once the GPU is idle.
pub struct Swapchain {
    device: ash::Device,
    loader: khr::Swapchain,
    surface_loader: khr::Surface,
    pdevice: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

impl Swapchain {
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        surface_loader: khr::Surface,
        pdevice: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let loader = khr::Swapchain::new(instance, &device);
        let mut chain = Self {
            device,
            loader,
            surface_loader,
            pdevice,
            surface,
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            extent,
            format: vk::Format::B8G8R8A8_UNORM,
        };
        chain.create(extent, vk::SwapchainKHR::null())?;
        Ok(chain)
    }

    fn create(&mut self, extent: vk::Extent2D, old: vk::SwapchainKHR) -> Result<()> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.pdevice, self.surface)?
        };

        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: extent
                    .width
                    .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: extent
                    .height
                    .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(self.format)
            .image_color_space(vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            // FIFO is always available and caps the frame rate to vsync.
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old)
            .build();

        self.handle = unsafe { self.loader.create_swapchain(&info, None)? };
        self.extent = extent;
        self.images = unsafe { self.loader.get_swapchain_images(self.handle)? };

        self.image_views = self
            .images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(self.format)
                    .subresource_range(
                        vk::ImageSubresourceRange::builder()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1)
                            .build(),
                    )
                    .build();
                unsafe { Ok(self.device.create_image_view(&view_info, None)?) }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(())
    }

    /// Acquires the next presentable image. `Ok(None)` means the chain no
    /// longer matches the surface and must be rebuilt before rendering.
    pub fn acquire(&mut self, signal: vk::Semaphore) -> Result<Option<u32>> {
        match unsafe {
            self.loader
                .acquire_next_image(self.handle, 1_000_000_000, signal, vk::Fence::null())
        } {
            Ok((index, _suboptimal)) => Ok(Some(index)),
            // A timeout here means the surface stopped producing images,
            // which a rebuild resolves; it is not a failure.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::TIMEOUT) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Presents `image_index` after `wait` signals. Returns `true` when the
    /// chain needs a rebuild before the next frame.
    pub fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool> {
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(std::slice::from_ref(&wait))
            .swapchains(std::slice::from_ref(&self.handle))
            .image_indices(std::slice::from_ref(&image_index))
            .build();

        match unsafe { self.loader.queue_present(queue, &info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Tears the chain down and recreates it at `extent`.
    ///
    /// # Prerequisites
    /// - The device must be idle.
    pub fn rebuild(&mut self, extent: vk::Extent2D) -> Result<()> {
        let old = self.handle;
        self.destroy_views();
        self.create(extent, old)?;
        unsafe { self.loader.destroy_swapchain(old, None) };
        Ok(())
    }

    fn destroy_views(&mut self) {
        for view in self.image_views.drain(..) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
    }

    /// # Prerequisites
    /// - The device must be idle.
    pub fn destroy(&mut self) {
        self.destroy_views();
        unsafe { self.loader.destroy_swapchain(self.handle, None) };
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();
    }
}
