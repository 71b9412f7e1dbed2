use ash::vk;
use std::ffi::{c_char, c_void, CStr};

use super::{GpuError, Result};

/// Names of debugging layers enabled when validation is requested. Only the
/// standard Khronos validation layer, nothing vendor specific.
pub const DEBUG_LAYER_NAMES: [*const c_char; 1] =
    [b"VK_LAYER_KHRONOS_validation\0".as_ptr() as *const c_char];

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) };
    let text = message.to_string_lossy();
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[{:?}] {}", message_type, text)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[{:?}] {}", message_type, text)
        }
        _ => log::debug!("[{:?}] {}", message_type, text),
    }
    vk::FALSE
}

/// Instance, device and graphics queue in one place. Created once and handed
/// by reference to everything that needs raw Vulkan access.
///
/// Validation layers are an opt-in runtime switch: set `KILN_VALIDATION=1`.
pub struct DeviceContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    debug_utils: Option<ash::extensions::ext::DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    pub pdevice: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub graphics_family: u32,
}

impl DeviceContext {
    /// Full context with surface extensions enabled, for presenting.
    pub fn windowed() -> Result<Self> {
        Self::init(true)
    }

    /// Context without any windowing support, for off-screen work and tests.
    pub fn headless() -> Result<Self> {
        Self::init(false)
    }

    fn init(windowed: bool) -> Result<Self> {
        let enable_validation = std::env::var("KILN_VALIDATION")
            .map(|v| v == "1")
            .unwrap_or(false);

        let entry = unsafe { ash::Entry::load() }?;

        let app_info = vk::ApplicationInfo {
            api_version: vk::make_api_version(0, 1, 3, 0),
            ..Default::default()
        };

        let mut inst_exts = Vec::new();
        if enable_validation {
            inst_exts.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }
        if windowed {
            inst_exts.push(ash::extensions::khr::Surface::name().as_ptr());
            #[cfg(target_os = "linux")]
            {
                inst_exts.push(ash::extensions::khr::XlibSurface::name().as_ptr());
                inst_exts.push(ash::extensions::khr::WaylandSurface::name().as_ptr());
            }
            #[cfg(target_os = "windows")]
            inst_exts.push(ash::extensions::khr::Win32Surface::name().as_ptr());
        }

        let mut inst_layers = Vec::new();
        if enable_validation {
            let available_layers = entry.enumerate_instance_layer_properties()?;
            for &layer in &DEBUG_LAYER_NAMES {
                let name = unsafe { CStr::from_ptr(layer) };
                if available_layers
                    .iter()
                    .any(|prop| unsafe { CStr::from_ptr(prop.layer_name.as_ptr()) == name })
                {
                    inst_layers.push(layer);
                }
            }
        }

        let instance = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::builder()
                    .application_info(&app_info)
                    .enabled_extension_names(&inst_exts)
                    .enabled_layer_names(&inst_layers)
                    .build(),
                None,
            )
        }?;

        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = ash::extensions::ext::DebugUtils::new(&entry, &instance);
            let messenger_ci = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));
            let messenger =
                unsafe { debug_utils.create_debug_utils_messenger(&messenger_ci, None)? };
            (Some(debug_utils), Some(messenger))
        } else {
            (None, None)
        };

        let (pdevice, properties, graphics_family) = Self::pick_device(&instance)?;

        log::info!("selected GPU: {}", unsafe {
            CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy()
        });

        let priorities = [1.0];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_family)
            .queue_priorities(&priorities)
            .build();

        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .build();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true)
            .synchronization2(true)
            .build();

        let mut dev_exts = Vec::new();
        if windowed {
            dev_exts.push(ash::extensions::khr::Swapchain::name().as_ptr());
        }

        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&dev_exts)
            .push_next(&mut features12)
            .push_next(&mut features13);

        let device = unsafe { instance.create_device(pdevice, &device_info, None)? };
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };

        Ok(Self {
            entry,
            instance,
            debug_utils,
            debug_messenger,
            pdevice,
            properties,
            device,
            graphics_queue,
            graphics_family,
        })
    }

    /// Picks the first discrete GPU exposing Vulkan 1.3 and a graphics queue,
    /// falling back to any device that qualifies.
    fn pick_device(
        instance: &ash::Instance,
    ) -> Result<(vk::PhysicalDevice, vk::PhysicalDeviceProperties, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices()? };

        let mut fallback = None;
        for pdevice in devices {
            let props = unsafe { instance.get_physical_device_properties(pdevice) };
            if vk::api_version_major(props.api_version) == 1
                && vk::api_version_minor(props.api_version) < 3
            {
                continue;
            }

            let queue_props =
                unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
            let Some(family) = queue_props
                .iter()
                .position(|p| p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            else {
                continue;
            };

            let candidate = (pdevice, props, family as u32);
            if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                return Ok(candidate);
            }
            fallback.get_or_insert(candidate);
        }

        fallback.ok_or(GpuError::NoSuitableGpu)
    }

    /// # Prerequisites
    /// - Everything created from this device must already be destroyed.
    pub fn destroy(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            if let (Some(utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
