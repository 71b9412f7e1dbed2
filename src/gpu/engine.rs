use ash::extensions::khr;
use ash::vk;
use glam::Mat4;
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::platform::run_return::EventLoopExtRunReturn;

use crate::utils::Handle;

use super::commands;
use super::window::{create_window, WindowInfo};
use super::{
    AllocatedBuffer, AllocatedImage, ComputeEffect, DeferredItem, DeletionQueue,
    DescriptorAllocator, DescriptorLayoutBuilder, DescriptorWriter, DeviceContext, DrawContext,
    FrameRing, GpuDrawPushConstants, GpuMeshBuffers, GpuSceneData, ImmediateSubmit,
    MemoryVisibility, PoolSizeRatio, ResourceManager, Result, SceneArena, Swapchain, Vertex,
};

/// Callback recorded into the frame after the blit, for debug overlays. The
/// command buffer is only valid for the duration of the call.
pub type OverlayFn = Box<dyn FnMut(vk::CommandBuffer, vk::ImageView)>;

#[derive(Clone, Debug)]
pub struct RendererInfo {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for RendererInfo {
    fn default() -> Self {
        Self {
            title: "kiln".to_string(),
            width: 1700,
            height: 900,
        }
    }
}

const WHITE: u32 = 0xFFFFFFFF;
const GREY: u32 = 0xFFAAAAAA;
const BLACK: u32 = 0xFF000000;
const MAGENTA: u32 = 0xFFFF00FF;

/// Alternating `a`/`b` texel grid, the classic missing-texture pattern.
fn checkerboard_pixels(a: u32, b: u32, dim: usize) -> Vec<u32> {
    (0..dim * dim)
        .map(|i| {
            let (x, y) = (i % dim, i / dim);
            if (x + y) % 2 == 0 {
                a
            } else {
                b
            }
        })
        .collect()
}

/// The renderer. Owns the device, window, swapchain, frame ring and every
/// default resource; callers hold it directly rather than reaching through
/// any global state.
pub struct Renderer {
    ctx: DeviceContext,
    surface_loader: khr::Surface,
    surface: vk::SurfaceKHR,
    window: winit::window::Window,
    event_loop: Option<EventLoop<()>>,

    res: ResourceManager,
    imm: ImmediateSubmit,
    frames: FrameRing,
    swapchain: Swapchain,

    draw_image: Handle<AllocatedImage>,
    depth_image: Handle<AllocatedImage>,
    draw_extent: vk::Extent2D,
    render_scale: f32,

    global_descriptors: DescriptorAllocator,
    draw_image_descriptor_layout: vk::DescriptorSetLayout,
    draw_image_descriptors: vk::DescriptorSet,
    pub scene_data_layout: vk::DescriptorSetLayout,

    pub white_image: Handle<AllocatedImage>,
    pub black_image: Handle<AllocatedImage>,
    pub grey_image: Handle<AllocatedImage>,
    pub error_checkerboard_image: Handle<AllocatedImage>,
    pub default_sampler_nearest: vk::Sampler,
    pub default_sampler_linear: vk::Sampler,

    main_deletion_queue: DeletionQueue,

    pub scene: SceneArena,
    pub scene_data: GpuSceneData,
    main_draw_context: DrawContext,

    background_effects: Vec<ComputeEffect>,
    current_background_effect: usize,

    overlay: Option<OverlayFn>,

    stop_rendering: bool,
    resize_requested: bool,
}

impl Renderer {
    pub fn new(info: &RendererInfo) -> Result<Self> {
        let ctx = DeviceContext::windowed()?;

        let (event_loop, window, surface) = create_window(
            &ctx.entry,
            &ctx.instance,
            &WindowInfo {
                title: info.title.clone(),
                size: [info.width, info.height],
                resizable: true,
            },
        )?;
        let surface_loader = khr::Surface::new(&ctx.entry, &ctx.instance);

        let mut res = ResourceManager::new(&ctx.instance, ctx.device.clone(), ctx.pdevice)?;

        let extent = vk::Extent2D {
            width: info.width,
            height: info.height,
        };
        let swapchain = Swapchain::new(
            &ctx.instance,
            ctx.device.clone(),
            surface_loader.clone(),
            ctx.pdevice,
            surface,
            extent,
        )?;

        // The draw target is sized once at startup; resizes render into a
        // sub-rectangle and the blit rescales.
        let draw_image = res.make_image(
            vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            },
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            false,
        )?;
        let depth_image = res.make_image(
            vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            },
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            false,
        )?;

        let frames = FrameRing::new(&ctx.device, ctx.graphics_family)?;
        let mut imm =
            ImmediateSubmit::new(ctx.device.clone(), ctx.graphics_queue, ctx.graphics_family)?;

        let mut global_descriptors = DescriptorAllocator::new(
            &ctx.device,
            10,
            &[
                PoolSizeRatio {
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    ratio: 1.0,
                },
                PoolSizeRatio {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    ratio: 1.0,
                },
                PoolSizeRatio {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    ratio: 1.0,
                },
            ],
        )?;

        let draw_image_descriptor_layout = DescriptorLayoutBuilder::default()
            .add_binding(0, vk::DescriptorType::STORAGE_IMAGE)
            .build(&ctx.device, vk::ShaderStageFlags::COMPUTE)?;
        let draw_image_descriptors =
            global_descriptors.allocate(&ctx.device, draw_image_descriptor_layout)?;

        let mut writer = DescriptorWriter::default();
        writer.write_image(
            0,
            res.image(draw_image).view,
            vk::Sampler::null(),
            vk::ImageLayout::GENERAL,
            vk::DescriptorType::STORAGE_IMAGE,
        );
        writer.update_set(&ctx.device, draw_image_descriptors);

        let scene_data_layout = DescriptorLayoutBuilder::default()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
            .build(
                &ctx.device,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            )?;

        let one_by_one = vk::Extent3D {
            width: 1,
            height: 1,
            depth: 1,
        };
        let white_image = res.make_image_with_data(
            &mut imm,
            bytemuck::bytes_of(&WHITE),
            one_by_one,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
            false,
        )?;
        let grey_image = res.make_image_with_data(
            &mut imm,
            bytemuck::bytes_of(&GREY),
            one_by_one,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
            false,
        )?;
        let black_image = res.make_image_with_data(
            &mut imm,
            bytemuck::bytes_of(&BLACK),
            one_by_one,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
            false,
        )?;
        let checkerboard = checkerboard_pixels(MAGENTA, BLACK, 16);
        let error_checkerboard_image = res.make_image_with_data(
            &mut imm,
            bytemuck::cast_slice(&checkerboard),
            vk::Extent3D {
                width: 16,
                height: 16,
                depth: 1,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
            false,
        )?;

        let default_sampler_nearest = unsafe {
            ctx.device.create_sampler(
                &vk::SamplerCreateInfo::builder()
                    .mag_filter(vk::Filter::NEAREST)
                    .min_filter(vk::Filter::NEAREST)
                    .build(),
                None,
            )?
        };
        let default_sampler_linear = unsafe {
            ctx.device.create_sampler(
                &vk::SamplerCreateInfo::builder()
                    .mag_filter(vk::Filter::LINEAR)
                    .min_filter(vk::Filter::LINEAR)
                    .build(),
                None,
            )?
        };

        let mut main_deletion_queue = DeletionQueue::default();
        main_deletion_queue.push(DeferredItem::Image(draw_image));
        main_deletion_queue.push(DeferredItem::Image(depth_image));
        main_deletion_queue.push(DeferredItem::Image(white_image));
        main_deletion_queue.push(DeferredItem::Image(grey_image));
        main_deletion_queue.push(DeferredItem::Image(black_image));
        main_deletion_queue.push(DeferredItem::Image(error_checkerboard_image));
        main_deletion_queue.push(DeferredItem::Sampler(default_sampler_nearest));
        main_deletion_queue.push(DeferredItem::Sampler(default_sampler_linear));
        main_deletion_queue.push(DeferredItem::DescriptorSetLayout(
            draw_image_descriptor_layout,
        ));
        main_deletion_queue.push(DeferredItem::DescriptorSetLayout(scene_data_layout));

        log::info!(
            "renderer up: {}x{} swapchain, {} frames in flight",
            extent.width,
            extent.height,
            super::FRAME_OVERLAP
        );

        Ok(Self {
            ctx,
            surface_loader,
            surface,
            window,
            event_loop: Some(event_loop),
            res,
            imm,
            frames,
            swapchain,
            draw_image,
            depth_image,
            draw_extent: extent,
            render_scale: 1.0,
            global_descriptors,
            draw_image_descriptor_layout,
            draw_image_descriptors,
            scene_data_layout,
            white_image,
            black_image,
            grey_image,
            error_checkerboard_image,
            default_sampler_nearest,
            default_sampler_linear,
            main_deletion_queue,
            scene: SceneArena::default(),
            scene_data: GpuSceneData::default(),
            main_draw_context: DrawContext::default(),
            background_effects: Vec::new(),
            current_background_effect: 0,
            overlay: None,
            stop_rendering: false,
            resize_requested: false,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.ctx.device
    }

    /// Registers a full-screen compute pass and takes ownership of its
    /// pipeline objects. Returns the index used with
    /// [`Renderer::set_background_effect`].
    pub fn register_background_effect(&mut self, effect: ComputeEffect) -> usize {
        self.main_deletion_queue
            .push(DeferredItem::Pipeline(effect.pipeline));
        self.main_deletion_queue
            .push(DeferredItem::PipelineLayout(effect.layout));
        self.background_effects.push(effect);
        self.background_effects.len() - 1
    }

    pub fn set_background_effect(&mut self, index: usize) {
        if index < self.background_effects.len() {
            self.current_background_effect = index;
        }
    }

    pub fn background_effect_mut(&mut self, index: usize) -> Option<&mut ComputeEffect> {
        self.background_effects.get_mut(index)
    }

    /// Layout consumed by background compute pipelines at set 0.
    pub fn draw_image_layout(&self) -> vk::DescriptorSetLayout {
        self.draw_image_descriptor_layout
    }

    pub fn set_render_scale(&mut self, scale: f32) {
        self.render_scale = scale.clamp(0.1, 1.0);
    }

    pub fn set_overlay(&mut self, overlay: OverlayFn) {
        self.overlay = Some(overlay);
    }

    // Resource entry points, forwarded so callers rarely touch the manager.

    pub fn make_buffer(
        &mut self,
        byte_size: u64,
        usage: vk::BufferUsageFlags,
        visibility: MemoryVisibility,
    ) -> Result<Handle<AllocatedBuffer>> {
        self.res.make_buffer(byte_size, usage, visibility)
    }

    pub fn destroy_buffer(&mut self, handle: Handle<AllocatedBuffer>) {
        self.res.destroy_buffer(handle)
    }

    pub fn make_image(
        &mut self,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mipmapped: bool,
    ) -> Result<Handle<AllocatedImage>> {
        self.res.make_image(extent, format, usage, mipmapped)
    }

    pub fn make_image_with_data(
        &mut self,
        data: &[u8],
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mipmapped: bool,
    ) -> Result<Handle<AllocatedImage>> {
        self.res
            .make_image_with_data(&mut self.imm, data, extent, format, usage, mipmapped)
    }

    pub fn destroy_image(&mut self, handle: Handle<AllocatedImage>) {
        self.res.destroy_image(handle)
    }

    pub fn upload_mesh(&mut self, indices: &[u32], vertices: &[Vertex]) -> Result<GpuMeshBuffers> {
        self.res.upload_mesh(&mut self.imm, indices, vertices)
    }

    pub fn immediate_submit<F>(&mut self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        self.imm.submit(record)
    }

    /// Rebuilds the draw context from the scene arena and refreshes the
    /// composed scene uniforms. Runs once per frame before [`Renderer::draw`].
    pub fn update_scene(&mut self) {
        self.main_draw_context.clear();

        for root in self.scene.roots.clone() {
            self.scene.refresh_transforms(root, Mat4::IDENTITY);
        }

        let res = &self.res;
        let scene = &self.scene;
        let ctx = &mut self.main_draw_context;
        for &root in &scene.roots {
            scene.draw_node(root, Mat4::IDENTITY, ctx, &|h| res.buffer(h).buf);
        }

        self.scene_data.viewproj = self.scene_data.proj * self.scene_data.view;
    }

    fn rebuild_swapchain(&mut self) -> Result<()> {
        unsafe { self.ctx.device.device_wait_idle()? };
        let size = self.window.inner_size();
        self.swapchain.rebuild(vk::Extent2D {
            width: size.width,
            height: size.height,
        })?;
        self.resize_requested = false;
        Ok(())
    }

    /// Records and submits one frame. A stale swapchain makes this a no-op
    /// that schedules a rebuild rather than an error.
    pub fn draw(&mut self) -> Result<()> {
        if self.resize_requested {
            self.rebuild_swapchain()?;
        }

        self.frames.begin_frame(&mut self.res)?;

        let (cmd, swapchain_sem, render_sem, render_fence) = {
            let slot = self.frames.current();
            (
                slot.main_command_buffer,
                slot.swapchain_semaphore,
                slot.render_semaphore,
                slot.render_fence,
            )
        };

        let Some(image_index) = self.swapchain.acquire(swapchain_sem)? else {
            self.resize_requested = true;
            return Ok(());
        };

        let device = self.ctx.device.clone();
        unsafe {
            device.reset_fences(std::slice::from_ref(&render_fence))?;
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                    .build(),
            )?;
        }

        let draw_img = self.res.image(self.draw_image).img;
        let depth_img = self.res.image(self.depth_image).img;
        let draw_img_extent = self.res.image(self.draw_image).extent;
        let swap_image = self.swapchain.images[image_index as usize];
        let swap_view = self.swapchain.image_views[image_index as usize];
        let swap_extent = self.swapchain.extent;

        self.draw_extent = vk::Extent2D {
            width: (swap_extent.width.min(draw_img_extent.width) as f32 * self.render_scale) as u32,
            height: (swap_extent.height.min(draw_img_extent.height) as f32 * self.render_scale)
                as u32,
        };

        commands::transition_image(
            &device,
            cmd,
            draw_img,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        );

        self.draw_background(cmd);

        commands::transition_image(
            &device,
            cmd,
            draw_img,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        commands::transition_image(
            &device,
            cmd,
            depth_img,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        );

        self.draw_geometry(cmd)?;

        commands::transition_image(
            &device,
            cmd,
            draw_img,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        commands::transition_image(
            &device,
            cmd,
            swap_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );

        commands::copy_image_to_image(&device, cmd, draw_img, swap_image, self.draw_extent, swap_extent);

        if let Some(overlay) = self.overlay.as_mut() {
            commands::transition_image(
                &device,
                cmd,
                swap_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            );

            let attachment = vk::RenderingAttachmentInfo::builder()
                .image_view(swap_view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .build();
            let rendering = vk::RenderingInfo::builder()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: swap_extent,
                })
                .layer_count(1)
                .color_attachments(std::slice::from_ref(&attachment))
                .build();
            unsafe { device.cmd_begin_rendering(cmd, &rendering) };
            overlay(cmd, swap_view);
            unsafe { device.cmd_end_rendering(cmd) };

            commands::transition_image(
                &device,
                cmd,
                swap_image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
        } else {
            commands::transition_image(
                &device,
                cmd,
                swap_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
        }

        unsafe {
            device.end_command_buffer(cmd)?;

            let wait_info = vk::SemaphoreSubmitInfo::builder()
                .semaphore(swapchain_sem)
                .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .build();
            let signal_info = vk::SemaphoreSubmitInfo::builder()
                .semaphore(render_sem)
                .stage_mask(vk::PipelineStageFlags2::ALL_GRAPHICS)
                .build();
            let cmd_info = vk::CommandBufferSubmitInfo::builder()
                .command_buffer(cmd)
                .build();
            let submit = vk::SubmitInfo2::builder()
                .wait_semaphore_infos(std::slice::from_ref(&wait_info))
                .signal_semaphore_infos(std::slice::from_ref(&signal_info))
                .command_buffer_infos(std::slice::from_ref(&cmd_info))
                .build();
            device.queue_submit2(
                self.ctx.graphics_queue,
                std::slice::from_ref(&submit),
                render_fence,
            )?;
        }

        if self
            .swapchain
            .present(self.ctx.graphics_queue, image_index, render_sem)?
        {
            self.resize_requested = true;
        }

        self.frames.advance();
        Ok(())
    }

    fn draw_background(&mut self, cmd: vk::CommandBuffer) {
        let device = &self.ctx.device;
        let draw_img = self.res.image(self.draw_image).img;

        let Some(effect) = self.background_effects.get(self.current_background_effect) else {
            // No compute effect registered; fall back to a flat clear.
            let clear = vk::ClearColorValue {
                float32: [0.05, 0.05, 0.1, 1.0],
            };
            let range = vk::ImageSubresourceRange::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(vk::REMAINING_MIP_LEVELS)
                .layer_count(vk::REMAINING_ARRAY_LAYERS)
                .build();
            unsafe {
                device.cmd_clear_color_image(
                    cmd,
                    draw_img,
                    vk::ImageLayout::GENERAL,
                    &clear,
                    std::slice::from_ref(&range),
                )
            };
            return;
        };

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, effect.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                effect.layout,
                0,
                std::slice::from_ref(&self.draw_image_descriptors),
                &[],
            );
            device.cmd_push_constants(
                cmd,
                effect.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&effect.data),
            );
            device.cmd_dispatch(
                cmd,
                (self.draw_extent.width + 15) / 16,
                (self.draw_extent.height + 15) / 16,
                1,
            );
        }
    }

    fn draw_geometry(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        let device = self.ctx.device.clone();

        // Scene uniforms live for exactly one frame; the slot queue reclaims
        // the buffer when this slot's fence next signals.
        let scene_buffer = self.res.make_buffer(
            std::mem::size_of::<GpuSceneData>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryVisibility::CpuAndGpu,
        )?;
        self.res.write_buffer(scene_buffer, &[self.scene_data])?;
        let raw_scene_buffer = self.res.buffer(scene_buffer).buf;

        let slot = self.frames.current_mut();
        slot.deletion_queue.push(DeferredItem::Buffer(scene_buffer));

        let scene_set = slot.descriptors.allocate(&device, self.scene_data_layout)?;
        let mut writer = DescriptorWriter::default();
        writer.write_buffer(
            0,
            raw_scene_buffer,
            std::mem::size_of::<GpuSceneData>() as u64,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
        );
        writer.update_set(&device, scene_set);

        let draw_view = self.res.image(self.draw_image).view;
        let depth_view = self.res.image(self.depth_image).view;

        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(draw_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .build();
        // Reversed depth: clear to zero, greater-or-equal test in pipelines.
        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(depth_view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 0.0,
                    stencil: 0,
                },
            })
            .build();
        let rendering = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.draw_extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment))
            .depth_attachment(&depth_attachment)
            .build();

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering);

            device.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: self.draw_extent.width as f32,
                    height: self.draw_extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: self.draw_extent,
                }],
            );

            let mut last_pipeline = vk::Pipeline::null();
            let mut last_index_buffer = vk::Buffer::null();

            for object in self
                .main_draw_context
                .opaque
                .iter()
                .chain(self.main_draw_context.transparent.iter())
            {
                let material = self.scene.material(object.material);

                if material.pipeline.pipeline != last_pipeline {
                    last_pipeline = material.pipeline.pipeline;
                    device.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        material.pipeline.pipeline,
                    );
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        material.pipeline.layout,
                        0,
                        std::slice::from_ref(&scene_set),
                        &[],
                    );
                }
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    material.pipeline.layout,
                    1,
                    std::slice::from_ref(&material.set),
                    &[],
                );

                if object.index_buffer != last_index_buffer {
                    last_index_buffer = object.index_buffer;
                    device.cmd_bind_index_buffer(
                        cmd,
                        object.index_buffer,
                        0,
                        vk::IndexType::UINT32,
                    );
                }

                let push = GpuDrawPushConstants::new(object.transform, object.vertex_buffer_address);
                device.cmd_push_constants(
                    cmd,
                    material.pipeline.layout,
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    bytemuck::bytes_of(&push),
                );

                device.cmd_draw_indexed(cmd, object.index_count, 1, object.first_index, 0, 0);
            }

            device.cmd_end_rendering(cmd);
        }

        Ok(())
    }

    /// Drives the window event loop until the window closes. Rendering is
    /// suspended while the window is minimized.
    pub fn run(&mut self) {
        let mut event_loop = match self.event_loop.take() {
            Some(el) => el,
            None => {
                log::error!("run called twice; the event loop is gone");
                return;
            }
        };

        event_loop.run_return(|event, _, control_flow| {
            *control_flow = ControlFlow::Poll;
            match event {
                Event::WindowEvent { event, .. } => match event {
                    WindowEvent::CloseRequested => *control_flow = ControlFlow::Exit,
                    WindowEvent::Resized(size) => {
                        if size.width == 0 || size.height == 0 {
                            self.stop_rendering = true;
                        } else {
                            self.stop_rendering = false;
                            self.resize_requested = true;
                        }
                    }
                    _ => {}
                },
                Event::MainEventsCleared => {
                    if self.stop_rendering {
                        std::thread::sleep(std::time::Duration::from_millis(100));
                        return;
                    }
                    self.update_scene();
                    if let Err(e) = self.draw() {
                        log::error!("frame failed: {}", e);
                        *control_flow = ControlFlow::Exit;
                    }
                }
                _ => {}
            }
        });
    }

    /// Tears the whole renderer down in reverse construction order.
    pub fn destroy(mut self) {
        if let Err(e) = unsafe { self.ctx.device.device_wait_idle() } {
            log::error!("device_wait_idle failed during shutdown: {}", e);
        }

        self.overlay = None;
        self.frames.destroy(&mut self.res);
        self.imm.destroy();
        self.main_deletion_queue.flush(&mut self.res);
        self.global_descriptors.destroy_pools(&self.ctx.device);
        self.swapchain.destroy();
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };

        if self.res.live_buffers() + self.res.live_images() > 0 {
            log::warn!(
                "shutdown with {} buffers and {} images never destroyed",
                self.res.live_buffers(),
                self.res.live_images()
            );
        }
        self.res.destroy();
        self.ctx.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_in_both_axes() {
        let pixels = checkerboard_pixels(MAGENTA, BLACK, 16);
        assert_eq!(pixels.len(), 256);
        assert_eq!(pixels[0], MAGENTA);
        assert_eq!(pixels[1], BLACK);
        // One row down the phase flips.
        assert_eq!(pixels[16], BLACK);
        assert_eq!(pixels[17], MAGENTA);
    }

    #[test]
    fn checkerboard_corners_match_parity() {
        let pixels = checkerboard_pixels(WHITE, BLACK, 16);
        assert_eq!(pixels[0], pixels[255]);
        assert_eq!(pixels[15], pixels[240]);
    }
}
