#![cfg(feature = "kiln-gpu-tests")]

use ash::vk;
use kiln::*;
use serial_test::serial;

fn setup() -> (DeviceContext, ResourceManager) {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = DeviceContext::headless().unwrap();
    let res = ResourceManager::new(&ctx.instance, ctx.device.clone(), ctx.pdevice).unwrap();
    (ctx, res)
}

fn teardown(mut ctx: DeviceContext, mut res: ResourceManager) {
    res.destroy();
    ctx.destroy();
}

#[test]
#[serial]
fn context_comes_up_headless() {
    let ctx = DeviceContext::headless();
    assert!(ctx.is_ok());
    ctx.unwrap().destroy();
}

#[test]
#[serial]
fn buffer_lifecycle_leaves_no_live_allocations() {
    let (ctx, mut res) = setup();

    let buffer = res
        .make_buffer(
            1280,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryVisibility::CpuAndGpu,
        )
        .unwrap();
    assert_eq!(res.live_buffers(), 1);

    res.write_buffer(buffer, &[8u32; 320]).unwrap();

    res.destroy_buffer(buffer);
    assert_eq!(res.live_buffers(), 0);

    // The handle is dead now; a second destroy must not free anything twice.
    res.destroy_buffer(buffer);
    assert_eq!(res.live_buffers(), 0);

    teardown(ctx, res);
}

#[test]
#[serial]
fn image_lifecycle_leaves_no_live_allocations() {
    let (ctx, mut res) = setup();

    let image = res
        .make_image(
            vk::Extent3D {
                width: 256,
                height: 256,
                depth: 1,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            true,
        )
        .unwrap();
    assert_eq!(res.live_images(), 1);

    res.destroy_image(image);
    assert_eq!(res.live_images(), 0);

    teardown(ctx, res);
}

#[test]
#[serial]
fn image_upload_destroys_its_staging_buffer() {
    let (ctx, mut res) = setup();
    let mut imm = ImmediateSubmit::new(
        ctx.device.clone(),
        ctx.graphics_queue,
        ctx.graphics_family,
    )
    .unwrap();

    let pixels = vec![0xFFu8; 16 * 16 * 4];
    let image = res
        .make_image_with_data(
            &mut imm,
            &pixels,
            vk::Extent3D {
                width: 16,
                height: 16,
                depth: 1,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
            false,
        )
        .unwrap();

    assert_eq!(res.live_images(), 1);
    assert_eq!(res.live_buffers(), 0, "staging buffer should be reclaimed");

    res.destroy_image(image);
    imm.destroy();
    teardown(ctx, res);
}

#[test]
#[serial]
fn mesh_upload_yields_addressable_buffers() {
    let (ctx, mut res) = setup();
    let mut imm = ImmediateSubmit::new(
        ctx.device.clone(),
        ctx.graphics_queue,
        ctx.graphics_family,
    )
    .unwrap();

    let vertices = [Vertex::default(); 3];
    let indices = [0u32, 1, 2];
    let mesh = res.upload_mesh(&mut imm, &indices, &vertices).unwrap();

    assert_ne!(mesh.vertex_buffer_address, 0);
    assert_eq!(res.live_buffers(), 2);

    res.destroy_buffer(mesh.vertex_buffer);
    res.destroy_buffer(mesh.index_buffer);
    assert_eq!(res.live_buffers(), 0);

    imm.destroy();
    teardown(ctx, res);
}

#[test]
#[serial]
fn immediate_submit_blocks_until_execution() {
    let (ctx, res) = setup();
    let mut imm = ImmediateSubmit::new(
        ctx.device.clone(),
        ctx.graphics_queue,
        ctx.graphics_family,
    )
    .unwrap();

    let mut recorded = false;
    imm.submit(|_cmd| {
        recorded = true;
    })
    .unwrap();
    assert!(recorded);

    // When submit returns, the fence has signaled; the queue must be drained.
    unsafe { ctx.device.queue_wait_idle(ctx.graphics_queue).unwrap() };

    imm.destroy();
    teardown(ctx, res);
}

#[test]
#[serial]
fn descriptor_allocator_grows_exactly_once_past_capacity() {
    let (ctx, res) = setup();

    let layout = DescriptorLayoutBuilder::default()
        .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
        .build(&ctx.device, vk::ShaderStageFlags::VERTEX)
        .unwrap();

    let mut alloc = DescriptorAllocator::new(
        &ctx.device,
        10,
        &[PoolSizeRatio {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            ratio: 1.0,
        }],
    )
    .unwrap();
    assert_eq!(alloc.pool_count(), 1);

    for _ in 0..11 {
        alloc.allocate(&ctx.device, layout).unwrap();
    }
    assert_eq!(alloc.growth_events(), 1);
    assert_eq!(alloc.pool_count(), 2);

    // After a reset the same load fits the pools we already have.
    alloc.reset_pools(&ctx.device).unwrap();
    for _ in 0..11 {
        alloc.allocate(&ctx.device, layout).unwrap();
    }
    assert_eq!(alloc.growth_events(), 1);
    assert_eq!(alloc.pool_count(), 2);

    alloc.destroy_pools(&ctx.device);
    unsafe { ctx.device.destroy_descriptor_set_layout(layout, None) };
    teardown(ctx, res);
}

#[test]
#[serial]
fn frame_ring_reuses_slots_only_after_their_fence() {
    let (ctx, mut res) = setup();
    let mut ring = FrameRing::new(&ctx.device, ctx.graphics_family).unwrap();

    for frame in 0..4u64 {
        assert_eq!(slot_index(ring.frame_number()), slot_index(frame));

        // Blocks on the slot's previous submission before touching it.
        ring.begin_frame(&mut res).unwrap();

        let slot = ring.current();
        let (cmd, fence) = (slot.main_command_buffer, slot.render_fence);
        unsafe {
            ctx.device.reset_fences(&[fence]).unwrap();
            ctx.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .unwrap();
            ctx.device
                .begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::builder()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                        .build(),
                )
                .unwrap();
            ctx.device.end_command_buffer(cmd).unwrap();

            let cmd_info = vk::CommandBufferSubmitInfo::builder()
                .command_buffer(cmd)
                .build();
            let submit = vk::SubmitInfo2::builder()
                .command_buffer_infos(std::slice::from_ref(&cmd_info))
                .build();
            ctx.device
                .queue_submit2(ctx.graphics_queue, std::slice::from_ref(&submit), fence)
                .unwrap();
        }

        ring.advance();
    }

    ring.wait_all(&ctx.device).unwrap();
    ring.destroy(&mut res);
    teardown(ctx, res);
}

#[test]
#[serial]
fn per_frame_deletions_run_when_the_slot_comes_back_around() {
    let (ctx, mut res) = setup();
    let mut ring = FrameRing::new(&ctx.device, ctx.graphics_family).unwrap();

    ring.begin_frame(&mut res).unwrap();
    let buffer = res
        .make_buffer(
            256,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryVisibility::CpuAndGpu,
        )
        .unwrap();
    ring.current_mut()
        .deletion_queue
        .push(DeferredItem::Buffer(buffer));
    ring.advance();

    // Still alive: its slot has not been waited on again yet.
    assert_eq!(res.live_buffers(), 1);

    ring.begin_frame(&mut res).unwrap();
    ring.advance();
    assert_eq!(res.live_buffers(), 1);

    // Wrapping back to the first slot reclaims what it deferred.
    ring.begin_frame(&mut res).unwrap();
    assert_eq!(res.live_buffers(), 0);

    ring.destroy(&mut res);
    teardown(ctx, res);
}

#[test]
#[serial]
fn oversized_buffer_write_is_rejected() {
    let (ctx, mut res) = setup();

    let buffer = res
        .make_buffer(
            64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryVisibility::CpuAndGpu,
        )
        .unwrap();

    // Larger than the buffer: must fail cleanly, not spill past the mapping.
    let result = res.write_buffer(buffer, &[0xABu8; 128]);
    assert!(matches!(
        result,
        Err(GpuError::BufferWriteOverflow {
            len: 128,
            capacity: 64
        })
    ));

    // The buffer is untouched and still usable at its real capacity.
    res.write_buffer(buffer, &[0xCDu8; 64]).unwrap();
    res.destroy_buffer(buffer);
    assert_eq!(res.live_buffers(), 0);

    teardown(ctx, res);
}

#[test]
#[serial]
fn material_write_fills_a_set_for_the_requested_pass() {
    use ash::vk::Handle as VkHandle;

    let (ctx, mut res) = setup();

    let material_layout = DescriptorLayoutBuilder::default()
        .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
        .add_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .add_binding(2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .build(&ctx.device, vk::ShaderStageFlags::FRAGMENT)
        .unwrap();

    let mut allocator = DescriptorAllocator::new(
        &ctx.device,
        4,
        &[
            PoolSizeRatio {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                ratio: 1.0,
            },
            PoolSizeRatio {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                ratio: 2.0,
            },
        ],
    )
    .unwrap();

    let data_buffer = res
        .make_buffer(
            std::mem::size_of::<MaterialConstants>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryVisibility::CpuAndGpu,
        )
        .unwrap();
    res.write_buffer(data_buffer, &[MaterialConstants::default()])
        .unwrap();

    let texture = res
        .make_image(
            vk::Extent3D {
                width: 4,
                height: 4,
                depth: 1,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
            false,
        )
        .unwrap();
    let sampler = unsafe {
        ctx.device
            .create_sampler(&vk::SamplerCreateInfo::builder().build(), None)
            .unwrap()
    };

    // Pipelines are opaque here; distinct raw values let the pass selection
    // be observed without building real shader pipelines.
    let mut material = MetallicRoughnessMaterial {
        opaque_pipeline: MaterialPipeline {
            pipeline: vk::Pipeline::from_raw(1),
            layout: vk::PipelineLayout::null(),
        },
        transparent_pipeline: MaterialPipeline {
            pipeline: vk::Pipeline::from_raw(2),
            layout: vk::PipelineLayout::null(),
        },
        material_layout,
    };
    let resources = MaterialResources {
        color_image_view: res.image(texture).view,
        color_sampler: sampler,
        metal_rough_image_view: res.image(texture).view,
        metal_rough_sampler: sampler,
        data_buffer: res.buffer(data_buffer).buf,
        data_buffer_offset: 0,
    };

    let instance = material
        .write_material(
            &ctx.device,
            MaterialPass::Transparent,
            &resources,
            &mut allocator,
        )
        .unwrap();
    assert_ne!(instance.set, vk::DescriptorSet::null());
    assert_eq!(instance.pass, MaterialPass::Transparent);
    assert_eq!(instance.pipeline.pipeline, material.transparent_pipeline.pipeline);

    let opaque = material
        .write_material(&ctx.device, MaterialPass::Opaque, &resources, &mut allocator)
        .unwrap();
    assert_eq!(opaque.pipeline.pipeline, material.opaque_pipeline.pipeline);
    assert_ne!(opaque.set, instance.set);

    allocator.destroy_pools(&ctx.device);
    material.destroy(&ctx.device);
    unsafe { ctx.device.destroy_sampler(sampler, None) };
    res.destroy_image(texture);
    res.destroy_buffer(data_buffer);
    teardown(ctx, res);
}
