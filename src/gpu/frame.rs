use ash::vk;

use super::{DeletionQueue, DescriptorAllocator, PoolSizeRatio, ResourceManager, Result};

/// Number of frames recorded ahead of the GPU. Two keeps the CPU busy while
/// the GPU works on the previous frame without adding more latency.
pub const FRAME_OVERLAP: usize = 2;

/// Maps a monotonically increasing frame counter onto a ring slot.
pub fn slot_index(frame_number: u64) -> usize {
    (frame_number % FRAME_OVERLAP as u64) as usize
}

/// Everything owned by one in-flight frame. Each slot gets its own sync
/// primitives, command storage, deferred-deletion queue and descriptor
/// allocator so frames never contend with each other.
pub struct FrameSlot {
    pub command_pool: vk::CommandPool,
    pub main_command_buffer: vk::CommandBuffer,
    /// Signaled when the swapchain image for this frame is ready to render to.
    pub swapchain_semaphore: vk::Semaphore,
    /// Signaled when rendering finishes; presentation waits on it.
    pub render_semaphore: vk::Semaphore,
    /// Signaled when all GPU work for this frame completes.
    pub render_fence: vk::Fence,
    pub deletion_queue: DeletionQueue,
    pub descriptors: DescriptorAllocator,
}

impl FrameSlot {
    fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        unsafe {
            let command_pool = device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(queue_family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .build(),
                None,
            )?;

            let main_command_buffer = device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1)
                    .build(),
            )?[0];

            let semaphore_info = vk::SemaphoreCreateInfo::builder().build();
            let swapchain_semaphore = device.create_semaphore(&semaphore_info, None)?;
            let render_semaphore = device.create_semaphore(&semaphore_info, None)?;

            // Signaled so the first wait on a fresh frame does not block.
            let render_fence = device.create_fence(
                &vk::FenceCreateInfo::builder()
                    .flags(vk::FenceCreateFlags::SIGNALED)
                    .build(),
                None,
            )?;

            let descriptors = DescriptorAllocator::new(
                device,
                1000,
                &[
                    PoolSizeRatio {
                        ty: vk::DescriptorType::STORAGE_IMAGE,
                        ratio: 3.0,
                    },
                    PoolSizeRatio {
                        ty: vk::DescriptorType::STORAGE_BUFFER,
                        ratio: 3.0,
                    },
                    PoolSizeRatio {
                        ty: vk::DescriptorType::UNIFORM_BUFFER,
                        ratio: 3.0,
                    },
                    PoolSizeRatio {
                        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        ratio: 4.0,
                    },
                ],
            )?;

            Ok(Self {
                command_pool,
                main_command_buffer,
                swapchain_semaphore,
                render_semaphore,
                render_fence,
                deletion_queue: DeletionQueue::default(),
                descriptors,
            })
        }
    }

    fn destroy(&mut self, res: &mut ResourceManager) {
        self.deletion_queue.flush(res);
        let device = res.device().clone();
        unsafe {
            self.descriptors.destroy_pools(&device);
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_fence(self.render_fence, None);
            device.destroy_semaphore(self.render_semaphore, None);
            device.destroy_semaphore(self.swapchain_semaphore, None);
        }
    }
}

/// The ring of in-flight frames. `begin_frame` blocks until the slot's
/// previous use has retired, then reclaims everything that frame deferred.
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    frame_number: u64,
}

impl FrameRing {
    pub fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let mut slots = Vec::with_capacity(FRAME_OVERLAP);
        for _ in 0..FRAME_OVERLAP {
            slots.push(FrameSlot::new(device, queue_family)?);
        }
        Ok(Self {
            slots,
            frame_number: 0,
        })
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[slot_index(self.frame_number)]
    }

    pub fn current_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[slot_index(self.frame_number)]
    }

    /// Waits for the current slot's last submission, then frees its deferred
    /// resources and resets its descriptor pools for reuse.
    pub fn begin_frame(&mut self, res: &mut ResourceManager) -> Result<()> {
        let slot = &mut self.slots[slot_index(self.frame_number)];
        unsafe {
            res.device().wait_for_fences(
                std::slice::from_ref(&slot.render_fence),
                true,
                1_000_000_000,
            )?;
        }
        slot.deletion_queue.flush(res);
        slot.descriptors.reset_pools(res.device())?;
        Ok(())
    }

    pub fn advance(&mut self) {
        self.frame_number += 1;
    }

    /// Blocks until every in-flight frame has retired.
    pub fn wait_all(&self, device: &ash::Device) -> Result<()> {
        let fences: Vec<vk::Fence> = self.slots.iter().map(|s| s.render_fence).collect();
        unsafe { device.wait_for_fences(&fences, true, u64::MAX)? };
        Ok(())
    }

    /// # Prerequisites
    /// - The device must be idle.
    pub fn destroy(&mut self, res: &mut ResourceManager) {
        for slot in &mut self.slots {
            slot.destroy(res);
        }
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_index_alternates_between_two_slots() {
        assert_eq!(slot_index(0), 0);
        assert_eq!(slot_index(1), 1);
        assert_eq!(slot_index(2), 0);
        assert_eq!(slot_index(3), 1);
    }

    #[test]
    fn slot_index_is_stable_for_large_frame_counts() {
        assert_eq!(slot_index(1_000_000_000), slot_index(1_000_000_000 + FRAME_OVERLAP as u64));
    }
}
