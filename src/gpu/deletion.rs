use crate::utils::Handle;
use ash::vk;

use super::{AllocatedBuffer, AllocatedImage, ResourceManager};

/// One deferred cleanup entry.
///
/// The resource universe of this crate is closed, so destruction is a tagged
/// handle rather than a captured closure; [`DeferredItem::Other`] stays
/// available for the rare genuinely heterogeneous case.
pub enum DeferredItem {
    Buffer(Handle<AllocatedBuffer>),
    Image(Handle<AllocatedImage>),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    DescriptorPool(vk::DescriptorPool),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    Other(Box<dyn FnOnce(&mut ResourceManager)>),
}

/// LIFO registry of deferred destruction.
///
/// Flushing executes entries in strict reverse-registration order, so a
/// dependent pushed after its dependency is always destroyed first. One
/// instance lives in every frame slot (flushed before the slot is reused)
/// and one global instance is flushed at shutdown after all fences have been
/// waited on.
#[derive(Default)]
pub struct DeletionQueue {
    items: Vec<DeferredItem>,
}

impl DeletionQueue {
    pub fn push(&mut self, item: DeferredItem) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drains all entries in reverse-registration order. Flushing an empty
    /// queue is a no-op.
    pub fn flush_with<F>(&mut self, mut func: F)
    where
        F: FnMut(DeferredItem),
    {
        for item in self.items.drain(..).rev() {
            func(item);
        }
    }

    /// Executes every pending destruction against the resource manager, then
    /// leaves the queue empty.
    ///
    /// # Prerequisites
    /// - The GPU must no longer reference anything queued here; the caller
    ///   gates this on the owning slot's fence (or a full device drain for
    ///   the global queue).
    pub fn flush(&mut self, res: &mut ResourceManager) {
        self.flush_with(|item| match item {
            DeferredItem::Buffer(handle) => res.destroy_buffer(handle),
            DeferredItem::Image(handle) => res.destroy_image(handle),
            DeferredItem::ImageView(view) => unsafe {
                res.device().destroy_image_view(view, None);
            },
            DeferredItem::Sampler(sampler) => unsafe {
                res.device().destroy_sampler(sampler, None);
            },
            DeferredItem::DescriptorPool(pool) => unsafe {
                res.device().destroy_descriptor_pool(pool, None);
            },
            DeferredItem::DescriptorSetLayout(layout) => unsafe {
                res.device().destroy_descriptor_set_layout(layout, None);
            },
            DeferredItem::Pipeline(pipeline) => unsafe {
                res.device().destroy_pipeline(pipeline, None);
            },
            DeferredItem::PipelineLayout(layout) => unsafe {
                res.device().destroy_pipeline_layout(layout, None);
            },
            DeferredItem::Other(func) => func(res),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle as VkHandle;

    fn sampler(id: u64) -> DeferredItem {
        DeferredItem::Sampler(vk::Sampler::from_raw(id))
    }

    #[test]
    fn flush_runs_in_reverse_registration_order() {
        let mut queue = DeletionQueue::default();
        queue.push(sampler(1));
        queue.push(sampler(2));
        queue.push(sampler(3));

        let mut seen = Vec::new();
        queue.flush_with(|item| {
            if let DeferredItem::Sampler(s) = item {
                seen.push(s.as_raw());
            }
        });
        assert_eq!(seen, vec![3, 2, 1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn reflushing_an_empty_queue_is_a_noop() {
        let mut queue = DeletionQueue::default();
        queue.push(sampler(9));
        queue.flush_with(|_| {});
        assert!(queue.is_empty());

        let mut count = 0;
        queue.flush_with(|_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn mixed_kinds_keep_lifo_order() {
        let mut queue = DeletionQueue::default();
        queue.push(DeferredItem::Pipeline(vk::Pipeline::from_raw(10)));
        queue.push(sampler(11));
        queue.push(DeferredItem::DescriptorPool(vk::DescriptorPool::from_raw(
            12,
        )));

        let mut order = Vec::new();
        queue.flush_with(|item| {
            order.push(match item {
                DeferredItem::DescriptorPool(_) => "pool",
                DeferredItem::Sampler(_) => "sampler",
                DeferredItem::Pipeline(_) => "pipeline",
                _ => "other",
            });
        });
        assert_eq!(order, vec!["pool", "sampler", "pipeline"]);
    }
}
