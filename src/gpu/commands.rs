//! Free helpers for command recording: layout transitions, blits and
//! mip-chain generation, plus the create-info boilerplate shared by the
//! resource manager and the engine.

use ash::vk;

/// Number of mip levels for a full chain over the given extent.
pub fn mip_levels_for(extent: vk::Extent2D) -> u32 {
    (extent.width.max(extent.height) as f32).log2().floor() as u32 + 1
}

pub fn image_aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM
        | vk::Format::D32_SFLOAT
        | vk::Format::X8_D24_UNORM_PACK32 => vk::ImageAspectFlags::DEPTH,
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

pub fn image_create_info(
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    extent: vk::Extent3D,
    mip_levels: u32,
) -> vk::ImageCreateInfo {
    vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(extent)
        .mip_levels(mip_levels)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .build()
}

pub fn image_view_create_info(
    format: vk::Format,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> vk::ImageViewCreateInfo {
    vk::ImageViewCreateInfo::builder()
        .view_type(vk::ImageViewType::TYPE_2D)
        .image(image)
        .format(format)
        .subresource_range(
            vk::ImageSubresourceRange::builder()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(mip_levels)
                .base_array_layer(0)
                .layer_count(1)
                .build(),
        )
        .build()
}

/// Coarse full-image layout transition.
///
/// Uses ALL_COMMANDS stage masks on both sides. That over-synchronizes, but
/// the frame ring issues only a handful of these per frame and the fence is
/// the real gate; finer masks belong to a barrier-tracking layer this crate
/// does not have.
pub fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let aspect = if new_layout == vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    };

    let barrier = vk::ImageMemoryBarrier2::builder()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .subresource_range(
            vk::ImageSubresourceRange::builder()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(vk::REMAINING_MIP_LEVELS)
                .base_array_layer(0)
                .layer_count(vk::REMAINING_ARRAY_LAYERS)
                .build(),
        )
        .image(image)
        .build();

    let dep = vk::DependencyInfo::builder()
        .image_memory_barriers(std::slice::from_ref(&barrier))
        .build();

    unsafe { device.cmd_pipeline_barrier2(cmd, &dep) };
}

/// Blit-copy one color image into another, rescaling on extent mismatch.
pub fn copy_image_to_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    src_size: vk::Extent2D,
    dst_size: vk::Extent2D,
) {
    let subresource = vk::ImageSubresourceLayers::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_array_layer(0)
        .layer_count(1)
        .mip_level(0)
        .build();

    let region = vk::ImageBlit2::builder()
        .src_subresource(subresource)
        .src_offsets([
            vk::Offset3D::default(),
            vk::Offset3D {
                x: src_size.width as i32,
                y: src_size.height as i32,
                z: 1,
            },
        ])
        .dst_subresource(subresource)
        .dst_offsets([
            vk::Offset3D::default(),
            vk::Offset3D {
                x: dst_size.width as i32,
                y: dst_size.height as i32,
                z: 1,
            },
        ])
        .build();

    let blit = vk::BlitImageInfo2::builder()
        .src_image(src)
        .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .dst_image(dst)
        .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .filter(vk::Filter::LINEAR)
        .regions(std::slice::from_ref(&region))
        .build();

    unsafe { device.cmd_blit_image2(cmd, &blit) };
}

/// Builds the full mip chain for an image whose level 0 is already filled and
/// sitting in TRANSFER_DST_OPTIMAL. Leaves every level in
/// SHADER_READ_ONLY_OPTIMAL.
pub fn generate_mipmaps(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    size: vk::Extent2D,
) {
    let mip_levels = mip_levels_for(size);
    let mut extent = size;

    for mip in 0..mip_levels {
        let half = vk::Extent2D {
            width: (extent.width / 2).max(1),
            height: (extent.height / 2).max(1),
        };

        // Current level becomes the blit source for the next one.
        let barrier = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(mip)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS)
                    .build(),
            )
            .image(image)
            .build();

        let dep = vk::DependencyInfo::builder()
            .image_memory_barriers(std::slice::from_ref(&barrier))
            .build();
        unsafe { device.cmd_pipeline_barrier2(cmd, &dep) };

        if mip + 1 < mip_levels {
            let region = vk::ImageBlit2::builder()
                .src_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_array_layer(0)
                        .layer_count(1)
                        .mip_level(mip)
                        .build(),
                )
                .src_offsets([
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: extent.width as i32,
                        y: extent.height as i32,
                        z: 1,
                    },
                ])
                .dst_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_array_layer(0)
                        .layer_count(1)
                        .mip_level(mip + 1)
                        .build(),
                )
                .dst_offsets([
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: half.width as i32,
                        y: half.height as i32,
                        z: 1,
                    },
                ])
                .build();

            let blit = vk::BlitImageInfo2::builder()
                .src_image(image)
                .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .dst_image(image)
                .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .filter(vk::Filter::LINEAR)
                .regions(std::slice::from_ref(&region))
                .build();
            unsafe { device.cmd_blit_image2(cmd, &blit) };

            extent = half;
        }
    }

    transition_image(
        device,
        cmd,
        image,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_length() {
        let e = |w, h| vk::Extent2D {
            width: w,
            height: h,
        };
        assert_eq!(mip_levels_for(e(1, 1)), 1);
        assert_eq!(mip_levels_for(e(16, 16)), 5);
        assert_eq!(mip_levels_for(e(1024, 512)), 11);
        assert_eq!(mip_levels_for(e(1700, 900)), 11);
    }

    #[test]
    fn depth_formats_map_to_depth_aspect() {
        assert_eq!(
            image_aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            image_aspect_for_format(vk::Format::R16G16B16A16_SFLOAT),
            vk::ImageAspectFlags::COLOR
        );
        assert!(image_aspect_for_format(vk::Format::D24_UNORM_S8_UINT)
            .contains(vk::ImageAspectFlags::STENCIL));
    }
}
