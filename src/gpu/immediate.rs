use ash::vk;

use super::Result;

/// One-shot GPU submission channel for uploads and other work that runs
/// outside the frame loop. Owns its own command pool, buffer and fence and
/// blocks the caller until the GPU has finished.
pub struct ImmediateSubmit {
    device: ash::Device,
    queue: vk::Queue,
    fence: vk::Fence,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
}

impl ImmediateSubmit {
    pub fn new(device: ash::Device, queue: vk::Queue, queue_family: u32) -> Result<Self> {
        unsafe {
            let pool = device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(queue_family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .build(),
                None,
            )?;

            let cmd = device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1)
                    .build(),
            )?[0];

            let fence = device.create_fence(
                &vk::FenceCreateInfo::builder()
                    .flags(vk::FenceCreateFlags::SIGNALED)
                    .build(),
                None,
            )?;

            Ok(Self {
                device,
                queue,
                fence,
                pool,
                cmd,
            })
        }
    }

    /// Records `record` into a fresh command buffer, submits it and waits for
    /// the fence. When this returns the GPU has fully executed the commands.
    pub fn submit<F>(&mut self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        unsafe {
            self.device
                .reset_fences(std::slice::from_ref(&self.fence))?;
            self.device
                .reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())?;

            self.device.begin_command_buffer(
                self.cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                    .build(),
            )?;

            record(self.cmd);

            self.device.end_command_buffer(self.cmd)?;

            let cmd_info = vk::CommandBufferSubmitInfo::builder()
                .command_buffer(self.cmd)
                .build();
            let submit = vk::SubmitInfo2::builder()
                .command_buffer_infos(std::slice::from_ref(&cmd_info))
                .build();
            self.device
                .queue_submit2(self.queue, std::slice::from_ref(&submit), self.fence)?;

            self.device
                .wait_for_fences(std::slice::from_ref(&self.fence), true, u64::MAX)?;
        }
        Ok(())
    }

    /// # Prerequisites
    /// - No submission may be in flight (submit always waits, so this holds
    ///   unless the fence was externally tampered with).
    pub fn destroy(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.pool, None);
            self.device.destroy_fence(self.fence, None);
        }
        self.pool = vk::CommandPool::null();
        self.fence = vk::Fence::null();
    }
}
