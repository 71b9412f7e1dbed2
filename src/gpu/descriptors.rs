use ash::vk;

use super::{GpuError, Result};

/// Per-kind share of a descriptor pool, expressed as descriptors per set.
#[derive(Clone, Copy, Debug)]
pub struct PoolSizeRatio {
    pub ty: vk::DescriptorType,
    pub ratio: f32,
}

/// Hard ceiling on the per-pool set count; growth clamps here.
pub const MAX_SETS_PER_POOL: u32 = 4092;

const GROWTH_NUM: u32 = 3;
const GROWTH_DEN: u32 = 2;

/// Next pool generation's capacity: x1.5, clamped to [`MAX_SETS_PER_POOL`].
pub(crate) fn grown_pool_size(prev: u32) -> u32 {
    ((prev as u64 * GROWTH_NUM as u64 / GROWTH_DEN as u64) as u32).min(MAX_SETS_PER_POOL)
}

fn pool_sizes(ratios: &[PoolSizeRatio], set_count: u32) -> Vec<vk::DescriptorPoolSize> {
    ratios
        .iter()
        .map(|r| vk::DescriptorPoolSize {
            ty: r.ty,
            descriptor_count: ((r.ratio * set_count as f32) as u32).max(1),
        })
        .collect()
}

/// Pool-backed descriptor set allocator that grows on exhaustion.
///
/// Sets handed out by [`allocate`](Self::allocate) stay valid until the next
/// [`reset_pools`](Self::reset_pools) on the same instance; callers must not
/// retain them across that boundary. Reset is O(pool count) and keeps the
/// pools alive, which is what makes per-frame turnover cheap.
pub struct DescriptorAllocator {
    ratios: Vec<PoolSizeRatio>,
    full_pools: Vec<vk::DescriptorPool>,
    ready_pools: Vec<vk::DescriptorPool>,
    sets_per_pool: u32,
    growth_events: u64,
}

impl DescriptorAllocator {
    pub fn new(
        device: &ash::Device,
        initial_sets: u32,
        ratios: &[PoolSizeRatio],
    ) -> Result<Self> {
        let first = Self::create_pool(device, initial_sets, ratios)?;
        Ok(Self {
            ratios: ratios.to_vec(),
            full_pools: Vec::new(),
            ready_pools: vec![first],
            sets_per_pool: initial_sets,
            growth_events: 0,
        })
    }

    fn create_pool(
        device: &ash::Device,
        set_count: u32,
        ratios: &[PoolSizeRatio],
    ) -> Result<vk::DescriptorPool> {
        let sizes = pool_sizes(ratios, set_count);
        let pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::builder()
                    .max_sets(set_count)
                    .pool_sizes(&sizes)
                    .build(),
                None,
            )
        }
        .map_err(|cause| GpuError::DescriptorPoolExhausted {
            sets_per_pool: set_count,
            cause,
        })?;
        Ok(pool)
    }

    fn get_pool(&mut self, device: &ash::Device) -> Result<vk::DescriptorPool> {
        if let Some(pool) = self.ready_pools.pop() {
            return Ok(pool);
        }
        self.sets_per_pool = grown_pool_size(self.sets_per_pool);
        self.growth_events += 1;
        log::debug!(
            "descriptor allocator growing: new pool of {} sets (growth #{})",
            self.sets_per_pool,
            self.growth_events
        );
        Self::create_pool(device, self.sets_per_pool, &self.ratios)
    }

    /// Allocates one set of the given layout, creating a larger pool when the
    /// current ones are out of headroom. Failing to allocate from a brand-new
    /// pool is fatal and reported with the pool state.
    pub fn allocate(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let mut pool = self.get_pool(device)?;

        let layouts = [layout];
        let result = unsafe {
            device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(pool)
                    .set_layouts(&layouts)
                    .build(),
            )
        };

        let set = match result {
            Ok(sets) => sets[0],
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
            | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                self.full_pools.push(pool);
                pool = self.get_pool(device)?;
                unsafe {
                    device.allocate_descriptor_sets(
                        &vk::DescriptorSetAllocateInfo::builder()
                            .descriptor_pool(pool)
                            .set_layouts(&layouts)
                            .build(),
                    )
                }
                .map_err(|cause| GpuError::DescriptorPoolExhausted {
                    sets_per_pool: self.sets_per_pool,
                    cause,
                })?[0]
            }
            Err(cause) => {
                self.ready_pools.push(pool);
                return Err(GpuError::DescriptorPoolExhausted {
                    sets_per_pool: self.sets_per_pool,
                    cause,
                });
            }
        };

        self.ready_pools.push(pool);
        Ok(set)
    }

    /// Returns every outstanding set to its pool without releasing pool
    /// memory. Sets allocated before this call become invalid.
    pub fn reset_pools(&mut self, device: &ash::Device) -> Result<()> {
        for pool in &self.ready_pools {
            unsafe { device.reset_descriptor_pool(*pool, vk::DescriptorPoolResetFlags::empty())? };
        }
        for pool in self.full_pools.drain(..) {
            unsafe { device.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())? };
            self.ready_pools.push(pool);
        }
        Ok(())
    }

    /// Releases every pool. Shutdown only.
    pub fn destroy_pools(&mut self, device: &ash::Device) {
        for pool in self.ready_pools.drain(..) {
            unsafe { device.destroy_descriptor_pool(pool, None) };
        }
        for pool in self.full_pools.drain(..) {
            unsafe { device.destroy_descriptor_pool(pool, None) };
        }
    }

    /// Total pools currently alive (ready + full). Instrumentation for tests
    /// and leak diagnostics.
    pub fn pool_count(&self) -> usize {
        self.ready_pools.len() + self.full_pools.len()
    }

    /// Number of times allocation had to create a grown pool.
    pub fn growth_events(&self) -> u64 {
        self.growth_events
    }
}

/// Incremental builder for a descriptor set layout.
#[derive(Default)]
pub struct DescriptorLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorLayoutBuilder {
    pub fn add_binding(mut self, binding: u32, ty: vk::DescriptorType) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(1)
                .build(),
        );
        self
    }

    pub fn build(
        mut self,
        device: &ash::Device,
        stages: vk::ShaderStageFlags,
    ) -> Result<vk::DescriptorSetLayout> {
        for binding in &mut self.bindings {
            binding.stage_flags |= stages;
        }
        let layout = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder()
                    .bindings(&self.bindings)
                    .build(),
                None,
            )?
        };
        Ok(layout)
    }
}

enum WriteSource {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

struct PendingWrite {
    binding: u32,
    ty: vk::DescriptorType,
    source: WriteSource,
}

/// Batches descriptor writes so a set can be filled in one update call.
#[derive(Default)]
pub struct DescriptorWriter {
    writes: Vec<PendingWrite>,
}

impl DescriptorWriter {
    pub fn write_buffer(
        &mut self,
        binding: u32,
        buffer: vk::Buffer,
        size: u64,
        offset: u64,
        ty: vk::DescriptorType,
    ) {
        self.writes.push(PendingWrite {
            binding,
            ty,
            source: WriteSource::Buffer(vk::DescriptorBufferInfo {
                buffer,
                offset,
                range: size,
            }),
        });
    }

    pub fn write_image(
        &mut self,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
        ty: vk::DescriptorType,
    ) {
        self.writes.push(PendingWrite {
            binding,
            ty,
            source: WriteSource::Image(vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: layout,
            }),
        });
    }

    pub fn clear(&mut self) {
        self.writes.clear();
    }

    pub fn update_set(&self, device: &ash::Device, set: vk::DescriptorSet) {
        let writes: Vec<vk::WriteDescriptorSet> = self
            .writes
            .iter()
            .map(|w| {
                let base = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(w.binding)
                    .descriptor_type(w.ty);
                match &w.source {
                    WriteSource::Buffer(info) => {
                        base.buffer_info(std::slice::from_ref(info)).build()
                    }
                    WriteSource::Image(info) => base.image_info(std::slice::from_ref(info)).build(),
                }
            })
            .collect();

        unsafe { device.update_descriptor_sets(&writes, &[]) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_is_monotonic_and_capped() {
        let mut size = 10;
        let mut prev = size;
        for _ in 0..64 {
            size = grown_pool_size(size);
            assert!(size >= prev);
            assert!(size <= MAX_SETS_PER_POOL);
            prev = size;
        }
        assert_eq!(size, MAX_SETS_PER_POOL);
    }

    #[test]
    fn growth_factor_is_three_halves() {
        assert_eq!(grown_pool_size(10), 15);
        assert_eq!(grown_pool_size(1000), 1500);
        assert_eq!(grown_pool_size(MAX_SETS_PER_POOL), MAX_SETS_PER_POOL);
    }

    #[test]
    fn pool_sizes_follow_ratios() {
        let ratios = [
            PoolSizeRatio {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                ratio: 3.0,
            },
            PoolSizeRatio {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                ratio: 0.5,
            },
        ];
        let sizes = pool_sizes(&ratios, 10);
        assert_eq!(sizes[0].descriptor_count, 30);
        assert_eq!(sizes[1].descriptor_count, 5);
    }

    #[test]
    fn pool_sizes_never_zero() {
        let ratios = [PoolSizeRatio {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            ratio: 0.01,
        }];
        let sizes = pool_sizes(&ratios, 4);
        assert_eq!(sizes[0].descriptor_count, 1);
    }
}
