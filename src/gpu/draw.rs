use crate::utils::Handle;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use super::{
    AllocatedBuffer, DescriptorAllocator, DescriptorWriter, GpuMeshBuffers, Result,
};

/// Which pass a material renders in. Transparent surfaces draw after all
/// opaque ones, back-to-front sorting left to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterialPass {
    Opaque,
    Transparent,
}

/// A compiled pipeline and its layout, built by an external collaborator and
/// consumed here as opaque handles.
#[derive(Clone, Copy, Debug)]
pub struct MaterialPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

/// One usable material: a pipeline, a descriptor set with its textures and
/// constants, and the pass it belongs to.
#[derive(Clone, Copy, Debug)]
pub struct MaterialInstance {
    pub pipeline: MaterialPipeline,
    pub set: vk::DescriptorSet,
    pub pass: MaterialPass,
}

/// Stable index of a material inside a [`SceneArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MaterialId(pub u32);

/// Stable index of a mesh asset inside a [`SceneArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshId(pub u32);

/// Stable index of a node inside a [`SceneArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Everything the draw loop needs for one indexed draw. These are plain
/// values rebuilt from the arena every frame; nothing here owns GPU memory.
#[derive(Clone, Copy, Debug)]
pub struct RenderObject {
    pub index_count: u32,
    pub first_index: u32,
    pub index_buffer: vk::Buffer,
    pub material: MaterialId,
    pub transform: Mat4,
    pub vertex_buffer_address: vk::DeviceAddress,
}

/// Per-frame accumulator of visible surfaces, split by pass.
#[derive(Default)]
pub struct DrawContext {
    pub opaque: Vec<RenderObject>,
    pub transparent: Vec<RenderObject>,
}

impl DrawContext {
    pub fn clear(&mut self) {
        self.opaque.clear();
        self.transparent.clear();
    }

    pub fn push(&mut self, pass: MaterialPass, object: RenderObject) {
        match pass {
            MaterialPass::Opaque => self.opaque.push(object),
            MaterialPass::Transparent => self.transparent.push(object),
        }
    }
}

/// A contiguous index range of a mesh drawn with one material.
pub struct GeoSurface {
    pub start_index: u32,
    pub count: u32,
    pub material: MaterialId,
}

/// One uploaded mesh and the surfaces that slice it.
pub struct MeshAsset {
    pub name: String,
    pub surfaces: Vec<GeoSurface>,
    pub buffers: GpuMeshBuffers,
}

/// What a node contributes to the frame.
pub enum NodeKind {
    /// Pure transform, only forwards to children.
    Group,
    /// Draws every surface of the referenced mesh.
    Mesh(MeshId),
}

pub struct Node {
    pub local_transform: Mat4,
    pub world_transform: Mat4,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
}

/// Index-based scene storage. Nodes refer to meshes and children by id, so
/// the whole graph is three flat vectors with no shared ownership.
#[derive(Default)]
pub struct SceneArena {
    pub meshes: Vec<MeshAsset>,
    pub materials: Vec<MaterialInstance>,
    pub nodes: Vec<Node>,
    pub roots: Vec<NodeId>,
}

impl SceneArena {
    pub fn add_mesh(&mut self, mesh: MeshAsset) -> MeshId {
        self.meshes.push(mesh);
        MeshId(self.meshes.len() as u32 - 1)
    }

    pub fn add_material(&mut self, material: MaterialInstance) -> MaterialId {
        self.materials.push(material);
        MaterialId(self.materials.len() as u32 - 1)
    }

    pub fn add_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() as u32 - 1)
    }

    pub fn material(&self, id: MaterialId) -> &MaterialInstance {
        &self.materials[id.0 as usize]
    }

    pub fn mesh(&self, id: MeshId) -> &MeshAsset {
        &self.meshes[id.0 as usize]
    }

    /// Recomputes world transforms for the subtree under `root`.
    pub fn refresh_transforms(&mut self, root: NodeId, parent: Mat4) {
        let world = parent * self.nodes[root.0 as usize].local_transform;
        self.nodes[root.0 as usize].world_transform = world;
        let children = self.nodes[root.0 as usize].children.clone();
        for child in children {
            self.refresh_transforms(child, world);
        }
    }

    /// Walks the subtree under `node` and appends a [`RenderObject`] per
    /// surface into `ctx`, classified by the material's pass. `resolve` turns
    /// each mesh's index-buffer handle into the raw buffer for the draw loop.
    pub fn draw_node<F>(&self, node: NodeId, top_matrix: Mat4, ctx: &mut DrawContext, resolve: &F)
    where
        F: Fn(Handle<AllocatedBuffer>) -> vk::Buffer,
    {
        let n = &self.nodes[node.0 as usize];
        if let NodeKind::Mesh(mesh_id) = n.kind {
            let transform = top_matrix * n.world_transform;
            let mesh = self.mesh(mesh_id);
            let index_buffer = resolve(mesh.buffers.index_buffer);
            for surface in &mesh.surfaces {
                let pass = self.material(surface.material).pass;
                ctx.push(
                    pass,
                    RenderObject {
                        index_count: surface.count,
                        first_index: surface.start_index,
                        index_buffer,
                        material: surface.material,
                        transform,
                        vertex_buffer_address: mesh.buffers.vertex_buffer_address,
                    },
                );
            }
        }
        for &child in &n.children {
            self.draw_node(child, top_matrix, ctx, resolve);
        }
    }
}

/// Uniform block read by every draw in a frame.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuSceneData {
    pub view: Mat4,
    pub proj: Mat4,
    pub viewproj: Mat4,
    pub ambient_color: Vec4,
    pub sunlight_direction: Vec4,
    pub sunlight_color: Vec4,
}

/// Push constants for the background compute effects. Four generic vectors
/// keep the block compatible across every effect shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ComputePushConstants {
    pub data1: Vec4,
    pub data2: Vec4,
    pub data3: Vec4,
    pub data4: Vec4,
}

/// A selectable full-screen compute pass drawn before geometry.
pub struct ComputeEffect {
    pub name: &'static str,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub data: ComputePushConstants,
}

/// Uniform block for the metallic-roughness material. Padded out to the
/// 256-byte alignment most GPUs require for dynamic uniform offsets.
#[repr(C)]
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
pub struct MaterialConstants {
    pub color_factors: Vec4,
    pub metal_rough_factors: Vec4,
    pub extra: [Vec4; 14],
}

impl Default for MaterialConstants {
    fn default() -> Self {
        Self {
            color_factors: Vec4::ONE,
            metal_rough_factors: Vec4::new(1.0, 0.5, 0.0, 0.0),
            extra: [Vec4::ZERO; 14],
        }
    }
}

/// Everything a material instance samples or reads.
pub struct MaterialResources {
    pub color_image_view: vk::ImageView,
    pub color_sampler: vk::Sampler,
    pub metal_rough_image_view: vk::ImageView,
    pub metal_rough_sampler: vk::Sampler,
    pub data_buffer: vk::Buffer,
    pub data_buffer_offset: u64,
}

/// Factory for metallic-roughness material instances. Pipelines and the set
/// layout are built elsewhere and handed in; this type only owns the layout.
pub struct MetallicRoughnessMaterial {
    pub opaque_pipeline: MaterialPipeline,
    pub transparent_pipeline: MaterialPipeline,
    pub material_layout: vk::DescriptorSetLayout,
}

impl MetallicRoughnessMaterial {
    /// Allocates and fills a descriptor set, yielding a ready material.
    pub fn write_material(
        &self,
        device: &ash::Device,
        pass: MaterialPass,
        resources: &MaterialResources,
        allocator: &mut DescriptorAllocator,
    ) -> Result<MaterialInstance> {
        let set = allocator.allocate(device, self.material_layout)?;

        let mut writer = DescriptorWriter::default();
        writer.write_buffer(
            0,
            resources.data_buffer,
            std::mem::size_of::<MaterialConstants>() as u64,
            resources.data_buffer_offset,
            vk::DescriptorType::UNIFORM_BUFFER,
        );
        writer.write_image(
            1,
            resources.color_image_view,
            resources.color_sampler,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        );
        writer.write_image(
            2,
            resources.metal_rough_image_view,
            resources.metal_rough_sampler,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        );
        writer.update_set(device, set);

        let pipeline = match pass {
            MaterialPass::Opaque => self.opaque_pipeline,
            MaterialPass::Transparent => self.transparent_pipeline,
        };

        Ok(MaterialInstance {
            pipeline,
            set,
            pass,
        })
    }

    /// # Prerequisites
    /// - No set allocated against this layout may still be in use.
    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_set_layout(self.material_layout, None);
        }
        self.material_layout = vk::DescriptorSetLayout::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_object(material: MaterialId) -> RenderObject {
        RenderObject {
            index_count: 3,
            first_index: 0,
            index_buffer: vk::Buffer::null(),
            material,
            transform: Mat4::IDENTITY,
            vertex_buffer_address: 0,
        }
    }

    #[test]
    fn draw_context_partitions_by_pass() {
        let mut ctx = DrawContext::default();
        ctx.push(MaterialPass::Opaque, dummy_object(MaterialId(0)));
        ctx.push(MaterialPass::Transparent, dummy_object(MaterialId(1)));
        ctx.push(MaterialPass::Opaque, dummy_object(MaterialId(2)));
        assert_eq!(ctx.opaque.len(), 2);
        assert_eq!(ctx.transparent.len(), 1);

        ctx.clear();
        assert!(ctx.opaque.is_empty());
        assert!(ctx.transparent.is_empty());
    }

    #[test]
    fn material_constants_fill_a_256_byte_block() {
        assert_eq!(std::mem::size_of::<MaterialConstants>(), 256);
    }

    #[test]
    fn scene_data_layout_is_stable() {
        // 3 mat4 + 3 vec4
        assert_eq!(std::mem::size_of::<GpuSceneData>(), 240);
    }

    #[test]
    fn refresh_transforms_composes_parent_chains() {
        let mut arena = SceneArena::default();
        let child = arena.add_node(Node {
            local_transform: Mat4::from_translation(glam::Vec3::new(0.0, 1.0, 0.0)),
            world_transform: Mat4::IDENTITY,
            children: Vec::new(),
            kind: NodeKind::Group,
        });
        let root = arena.add_node(Node {
            local_transform: Mat4::from_translation(glam::Vec3::new(2.0, 0.0, 0.0)),
            world_transform: Mat4::IDENTITY,
            children: vec![child],
            kind: NodeKind::Group,
        });
        arena.roots.push(root);

        arena.refresh_transforms(root, Mat4::IDENTITY);

        let world = arena.nodes[child.0 as usize].world_transform;
        let p = world.transform_point3(glam::Vec3::ZERO);
        assert!((p - glam::Vec3::new(2.0, 1.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn draw_node_emits_one_object_per_surface() {
        let mut arena = SceneArena::default();
        let material = arena.add_material(MaterialInstance {
            pipeline: MaterialPipeline {
                pipeline: vk::Pipeline::null(),
                layout: vk::PipelineLayout::null(),
            },
            set: vk::DescriptorSet::null(),
            pass: MaterialPass::Opaque,
        });
        let mesh = arena.add_mesh(MeshAsset {
            name: "quad".into(),
            surfaces: vec![
                GeoSurface {
                    start_index: 0,
                    count: 3,
                    material,
                },
                GeoSurface {
                    start_index: 3,
                    count: 3,
                    material,
                },
            ],
            buffers: GpuMeshBuffers {
                index_buffer: Default::default(),
                vertex_buffer: Default::default(),
                vertex_buffer_address: 0,
            },
        });
        let node = arena.add_node(Node {
            local_transform: Mat4::IDENTITY,
            world_transform: Mat4::IDENTITY,
            children: Vec::new(),
            kind: NodeKind::Mesh(mesh),
        });

        let mut ctx = DrawContext::default();
        arena.draw_node(node, Mat4::IDENTITY, &mut ctx, &|_| vk::Buffer::null());
        assert_eq!(ctx.opaque.len(), 2);
        assert!(ctx.transparent.is_empty());
    }
}
