// SPDX-License-Identifier: CEPL-1.0
//! Device bootstrap: instance, optional validation, surface, physical device and queue
//! selection, logical device. Everything lives in [`DeviceContext`], which the rest of the
//! backend borrows for every call.

use std::ffi::{c_char, c_void, CStr};

use anyhow::{anyhow, Context, Result};
use ash::ext::debug_utils;
use ash::khr::{push_descriptor, surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use sprite_render::RendererConfig;
use tracing::{debug, error, info, warn};

use crate::error::{RenderError, VkCall};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device extensions a physical device must expose to qualify.
const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 2] = [swapchain::NAME, push_descriptor::NAME];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Deduplicated family list, one queue is requested per entry.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Prefers one family that does both; otherwise the first graphics family and the first
/// present family.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> Option<QueueFamilies> {
    let mut graphics = None;
    let mut present = None;

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        if family.queue_count == 0 {
            continue;
        }
        let is_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let can_present = supports_present(index);

        if is_graphics && can_present {
            return Some(QueueFamilies {
                graphics: index,
                present: index,
            });
        }
        if is_graphics && graphics.is_none() {
            graphics = Some(index);
        }
        if can_present && present.is_none() {
            present = Some(index);
        }
    }

    Some(QueueFamilies {
        graphics: graphics?,
        present: present?,
    })
}

pub fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == name))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else {
        debug!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

unsafe fn validation_available(entry: &Entry) -> bool {
    entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default()
        .iter()
        .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == VALIDATION_LAYER))
}

unsafe fn create_instance(
    entry: &Entry,
    display: RawDisplayHandle,
    config: &RendererConfig,
) -> Result<(Instance, bool)> {
    let app_name = std::ffi::CString::new(config.app_name.as_str())
        .context("application name contains a NUL byte")?;

    // push descriptors need get_physical_device_properties2, core since 1.1
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .engine_name(c"sprite")
        .api_version(vk::API_VERSION_1_1);

    let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
        .vk("enumerate_required_extensions")?
        .to_vec();

    let validation = config.validation && validation_available(entry);
    if config.validation && !validation {
        warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
    }
    let layers: Vec<*const c_char> = if validation {
        extensions.push(debug_utils::NAME.as_ptr());
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    let instance = entry
        .create_instance(&create_info, None)
        .vk("create_instance")?;
    Ok((instance, validation))
}

unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance) -> Result<DebugMessenger> {
    let loader = debug_utils::Instance::new(entry, instance);
    let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    let messenger = loader
        .create_debug_utils_messenger(&info, None)
        .vk("create_debug_utils_messenger")?;
    Ok(DebugMessenger { loader, messenger })
}

struct PhysicalChoice {
    phys: vk::PhysicalDevice,
    queues: QueueFamilies,
    descriptor_indexing: bool,
}

/// First device in enumeration order that qualifies. No scoring.
unsafe fn pick_physical_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<PhysicalChoice> {
    for phys in instance
        .enumerate_physical_devices()
        .vk("enumerate_physical_devices")?
    {
        let extensions = instance
            .enumerate_device_extension_properties(phys)
            .vk("enumerate_device_extension_properties")?;
        if !REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .all(|name| has_extension(&extensions, name))
        {
            continue;
        }

        let families = instance.get_physical_device_queue_family_properties(phys);
        let queues = select_queue_families(&families, |index| {
            surface_loader
                .get_physical_device_surface_support(phys, index, surface)
                .unwrap_or(false)
        });
        if let Some(queues) = queues {
            return Ok(PhysicalChoice {
                phys,
                queues,
                descriptor_indexing: has_extension(
                    &extensions,
                    ash::ext::descriptor_indexing::NAME,
                ),
            });
        }
    }
    Err(RenderError::NoSuitableDevice.into())
}

/// Long-lived Vulkan state shared by every backend operation.
///
/// Created once per renderer. Dropping it destroys the command pool, device, surface,
/// debug messenger and instance, in that order; every object created from the device
/// must already be gone.
pub struct DeviceContext {
    _entry: Entry,
    pub instance: Instance,
    debug: Option<DebugMessenger>,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,

    pub phys: vk::PhysicalDevice,
    pub queues: QueueFamilies,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    /// Zero when the device has no anisotropic filtering.
    pub max_anisotropy: f32,

    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub swapchain_loader: swapchain::Device,
    pub push_descriptor: push_descriptor::Device,
    pub command_pool: vk::CommandPool,
}

impl DeviceContext {
    // STRICT ORDER:
    // instance -> surface (from THIS instance) -> physical device queried against the
    // surface -> logical device. The surface must exist before queue selection.
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        config: &RendererConfig,
    ) -> Result<Self> {
        let display_raw = display
            .display_handle()
            .map_err(|e| anyhow!("display handle: {e}"))?
            .as_raw();
        let window_raw = window
            .window_handle()
            .map_err(|e| anyhow!("window handle: {e}"))?
            .as_raw();

        unsafe {
            let entry = Entry::linked();
            let (instance, validation) = create_instance(&entry, display_raw, config)?;
            let debug = if validation {
                Some(create_debug_messenger(&entry, &instance)?)
            } else {
                None
            };

            let surface_loader = surface::Instance::new(&entry, &instance);
            let surface =
                ash_window::create_surface(&entry, &instance, display_raw, window_raw, None)
                    .vk("create_surface")?;

            let choice = pick_physical_device(&instance, &surface_loader, surface)?;
            let props = instance.get_physical_device_properties(choice.phys);
            let features = instance.get_physical_device_features(choice.phys);
            info!(
                "vk: device {:?}, graphics family {}, present family {}",
                props.device_name_as_c_str().unwrap_or(c"?"),
                choice.queues.graphics,
                choice.queues.present
            );

            let priorities = [1.0_f32];
            let queue_infos: Vec<_> = choice
                .queues
                .unique()
                .into_iter()
                .map(|family| {
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(family)
                        .queue_priorities(&priorities)
                })
                .collect();

            let mut extensions: Vec<*const c_char> = REQUIRED_DEVICE_EXTENSIONS
                .iter()
                .map(|name| name.as_ptr())
                .collect();
            if choice.descriptor_indexing {
                extensions.push(ash::ext::descriptor_indexing::NAME.as_ptr());
            }

            let anisotropy = features.sampler_anisotropy == vk::TRUE;
            let enabled = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(anisotropy);

            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&extensions)
                .enabled_features(&enabled);
            let device = instance
                .create_device(choice.phys, &device_info, None)
                .vk("create_device")?;

            let graphics_queue = device.get_device_queue(choice.queues.graphics, 0);
            let present_queue = device.get_device_queue(choice.queues.present, 0);

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(choice.queues.graphics)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .vk("create_command_pool")?;

            Ok(Self {
                swapchain_loader: swapchain::Device::new(&instance, &device),
                push_descriptor: push_descriptor::Device::new(&instance, &device),
                memory: instance.get_physical_device_memory_properties(choice.phys),
                max_anisotropy: if anisotropy {
                    props.limits.max_sampler_anisotropy
                } else {
                    0.0
                },
                _entry: entry,
                instance,
                debug,
                surface_loader,
                surface,
                phys: choice.phys,
                queues: choice.queues,
                device,
                graphics_queue,
                present_queue,
                command_pool,
            })
        }
    }

    pub fn sharing_families(&self) -> Vec<u32> {
        self.queues.unique()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some(debug) = self.debug.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn ext(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, &src) in props.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = src as c_char;
        }
        props
    }

    #[test]
    fn prefers_a_family_that_does_both() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let picked = select_queue_families(&families, |i| i != 0).unwrap();
        assert_eq!(
            picked,
            QueueFamilies {
                graphics: 2,
                present: 2
            }
        );
        assert!(picked.is_shared());
        assert_eq!(picked.unique(), vec![2]);
    }

    #[test]
    fn splits_graphics_and_present_when_no_family_does_both() {
        let families = [
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        let picked = select_queue_families(&families, |i| i == 2).unwrap();
        assert_eq!(
            picked,
            QueueFamilies {
                graphics: 1,
                present: 2
            }
        );
        assert_eq!(picked.unique(), vec![1, 2]);
    }

    #[test]
    fn no_present_support_disqualifies() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(select_queue_families(&families, |_| false), None);
    }

    #[test]
    fn no_graphics_disqualifies() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        assert_eq!(select_queue_families(&families, |_| true), None);
    }

    #[test]
    fn empty_families_are_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];
        let picked = select_queue_families(&families, |_| true).unwrap();
        assert_eq!(picked.graphics, 1);
    }

    #[test]
    fn extension_lookup_matches_whole_names() {
        let available = [ext(swapchain::NAME), ext(c"VK_KHR_push")];
        assert!(has_extension(&available, swapchain::NAME));
        assert!(!has_extension(&available, push_descriptor::NAME));
    }
}
