// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! Vulkan device ownership. The context owns instance, device, and the
//! graphics queue; every queue submission and `vkDeviceWaitIdle` goes
//! through one mutex, and teardown holds that mutex across the final wait
//! before any GPU object is destroyed.
//!
//! The layer-renderer pipelines live out-of-tree; the in-tree
//! [`VulkanRenderer`] keeps the layer bookkeeping and clears its offscreen
//! target, which is enough to keep HMD timing stable with no client.

use std::{
    borrow::Cow,
    ffi::{c_void, CStr, CString},
    sync::Arc,
    time,
};

use anyhow::{bail, Context, Result};
use ash::{ext, vk};
use glam::Vec2;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::devices::Pose;
use crate::handoff::LayerFlags;
use crate::renderer::{
    CompositorRenderer, LayerSlot, RenderError, SwapchainImage, IDLE_CLEAR_COLOR,
};

pub struct VkContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    debug: Option<VkDebugContext>,
    pub device: ash::Device,
    pub device_info: VkDeviceInfo,
    pub queue: VkQueue,
}

struct VkDebugContext {
    loader: ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// The graphics queue, serialized by a mutex. Hold the lock for every
/// submission and across `vkDeviceWaitIdle`.
pub struct VkQueue {
    pub family: u32,
    inner: Mutex<vk::Queue>,
}

impl VkQueue {
    pub fn submit(
        &self,
        device: &ash::Device,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let queue = self.inner.lock();
        unsafe { device.queue_submit(*queue, submits, fence) }
    }

    /// Drains the queue. Required before destroying anything the GPU might
    /// still reference.
    pub fn wait_idle(&self, device: &ash::Device) {
        let _queue = self.inner.lock();
        if let Err(e) = unsafe { device.device_wait_idle() } {
            error!("vkDeviceWaitIdle failed: {e:?}");
        }
    }
}

pub struct VkDeviceInfo {
    pub pdevice: vk::PhysicalDevice,
    pub device_name: CString,
    pub device_type: vk::PhysicalDeviceType,
    pub graphics_family: u32,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
}

impl VkDeviceInfo {
    fn query(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<Self> {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let device_name =
            unsafe { CStr::from_ptr(props.device_name.as_ptr()).to_owned() };

        let graphics_family = unsafe {
            instance
                .get_physical_device_queue_family_properties(device)
                .iter()
                .enumerate()
                .find(|(_, properties)| {
                    properties.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                        && properties.queue_flags.contains(vk::QueueFlags::TRANSFER)
                })
                .map(|(index, _)| index as u32)
                .ok_or_else(|| anyhow::anyhow!("no graphics queue found"))?
        };

        let memory_props = unsafe { instance.get_physical_device_memory_properties(device) };

        Ok(Self {
            pdevice: device,
            device_name,
            device_type: props.device_type,
            graphics_family,
            memory_props,
        })
    }
}

impl VkContext {
    pub fn new(enable_debug: bool) -> Result<Self> {
        let entry = unsafe { ash::Entry::load().context("loading libvulkan")? };

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"oxserver")
            .application_version(0)
            .engine_name(c"oxserver")
            .engine_version(0)
            .api_version(vk::make_api_version(0, 1, 3, 0));

        let mut layers = Vec::new();
        let mut extensions = Vec::new();
        if enable_debug {
            let available = unsafe { entry.enumerate_instance_layer_properties()? };
            let validation = c"VK_LAYER_KHRONOS_validation";
            if available.iter().any(|layer| {
                (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == validation
            }) {
                layers.push(validation.as_ptr());
                extensions.push(ext::debug_utils::NAME.as_ptr());
            } else {
                warn!("validation layers requested but not available");
            }
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .context("creating vulkan instance")?
        };

        let debug = if !extensions.is_empty() {
            let loader = ext::debug_utils::Instance::new(&entry, &instance);

            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));

            let messenger = unsafe {
                loader.create_debug_utils_messenger(&messenger_info, None)?
            };

            Some(VkDebugContext { loader, messenger })
        } else {
            None
        };

        let device_info = select_physical_device(&instance)?;
        info!(
            device = ?device_info.device_name,
            family = device_info.graphics_family,
            "selected vulkan device"
        );

        let queue_create = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(device_info.graphics_family)
            .queue_priorities(&[1.0]);

        let device_create = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create));

        let device = unsafe {
            instance
                .create_device(device_info.pdevice, &device_create, None)
                .context("creating vulkan device")?
        };

        let queue = VkQueue {
            family: device_info.graphics_family,
            inner: Mutex::new(unsafe {
                device.get_device_queue(device_info.graphics_family, 0)
            }),
        };

        Ok(Self {
            entry,
            instance,
            debug,
            device,
            device_info,
            queue,
        })
    }
}

impl Drop for VkContext {
    fn drop(&mut self) {
        self.queue.wait_idle(&self.device);

        unsafe {
            self.device.destroy_device(None);
            if let Some(debug) = self.debug.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn select_physical_device(instance: &ash::Instance) -> Result<VkDeviceInfo> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    if devices.is_empty() {
        bail!("no vulkan devices present");
    }

    let mut candidates = devices
        .into_iter()
        .filter_map(|d| VkDeviceInfo::query(instance, d).ok())
        .collect::<Vec<_>>();

    // Prefer a discrete GPU, but any device with a graphics queue will do.
    candidates.sort_by_key(|info| match info.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        _ => 2,
    });

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no usable vulkan device"))
}

pub(crate) fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    flags: vk::MemoryPropertyFlags,
    memory_type_bits: Option<u32>,
) -> Option<u32> {
    for i in 0..props.memory_type_count {
        if let Some(mask) = memory_type_bits {
            if mask & (1 << i) == 0 {
                continue;
            }
        }

        if flags.is_empty()
            || props.memory_types[i as usize]
                .property_flags
                .contains(flags)
        {
            return Some(i);
        }
    }

    None
}

unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() || (*data).p_message.is_null() {
        Cow::Borrowed("")
    } else {
        CStr::from_ptr((*data).p_message).to_string_lossy()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "oxserver::vulkan", "{message}");
    } else {
        warn!(target: "oxserver::vulkan", "{message}");
    }

    vk::FALSE
}

fn vk_call(call: &'static str, result: vk::Result) -> RenderError {
    RenderError::Vulkan { call, result }
}

/// The in-tree compositor backend. Owns an offscreen target it clears each
/// frame; the layer stack is tracked so the external layer renderers can
/// consume it, but nothing is sampled here.
pub struct VulkanRenderer {
    vk: Arc<VkContext>,

    target: vk::Image,
    target_memory: vk::DeviceMemory,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,

    layers: Vec<LayerSlot>,
    clear_color: [f32; 4],

    frame_interval: time::Duration,
    next_frame: time::Instant,
}

impl VulkanRenderer {
    pub fn new(
        vk: Arc<VkContext>,
        width: u32,
        height: u32,
        refresh_rate_hz: f32,
    ) -> Result<Self, RenderError> {
        let device = &vk.device;

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let target = unsafe {
            device
                .create_image(&image_info, None)
                .map_err(|e| vk_call("vkCreateImage", e))?
        };

        let requirements = unsafe { device.get_image_memory_requirements(target) };
        let memory_type = select_memory_type(
            &vk.device_info.memory_props,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Some(requirements.memory_type_bits),
        )
        .or_else(|| {
            select_memory_type(
                &vk.device_info.memory_props,
                vk::MemoryPropertyFlags::empty(),
                Some(requirements.memory_type_bits),
            )
        })
        .ok_or(vk_call(
            "vkGetImageMemoryRequirements",
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        ))?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);

        let target_memory = unsafe {
            device
                .allocate_memory(&alloc_info, None)
                .map_err(|e| vk_call("vkAllocateMemory", e))?
        };

        unsafe {
            device
                .bind_image_memory(target, target_memory, 0)
                .map_err(|e| vk_call("vkBindImageMemory", e))?;
        }

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(vk.queue.family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|e| vk_call("vkCreateCommandPool", e))?
        };

        let alloc = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe {
            device
                .allocate_command_buffers(&alloc)
                .map_err(|e| vk_call("vkAllocateCommandBuffers", e))?[0]
        };

        let fence_info =
            vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = unsafe {
            device
                .create_fence(&fence_info, None)
                .map_err(|e| vk_call("vkCreateFence", e))?
        };

        let frame_interval = time::Duration::from_secs_f64(1.0 / refresh_rate_hz as f64);

        debug!(width, height, refresh_rate_hz, "created compositor target");

        Ok(Self {
            vk,
            target,
            target_memory,
            command_pool,
            command_buffer,
            fence,
            layers: Vec::new(),
            clear_color: IDLE_CLEAR_COLOR,
            frame_interval,
            next_frame: time::Instant::now() + frame_interval,
        })
    }

    fn slot(&mut self, index: usize) -> Result<&mut LayerSlot, RenderError> {
        let len = self.layers.len();
        self.layers
            .get_mut(index)
            .ok_or(RenderError::LayerOutOfRange(index, len))
    }
}

impl CompositorRenderer for VulkanRenderer {
    fn set_layer_count(&mut self, count: usize) -> Result<(), RenderError> {
        self.layers.clear();
        self.layers.resize(count, LayerSlot::Empty);
        Ok(())
    }

    fn destroy_layers(&mut self) {
        self.layers.clear();
    }

    fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn set_projection_layer(
        &mut self,
        index: usize,
        left: SwapchainImage<'_>,
        right: SwapchainImage<'_>,
        flags: LayerFlags,
    ) -> Result<(), RenderError> {
        *self.slot(index)? = LayerSlot::Projection {
            left_swapchain: left.swapchain.id,
            right_swapchain: right.swapchain.id,
            flags,
        };
        Ok(())
    }

    fn set_quad_layer(
        &mut self,
        index: usize,
        image: SwapchainImage<'_>,
        pose: Pose,
        size: Vec2,
        flags: LayerFlags,
    ) -> Result<(), RenderError> {
        *self.slot(index)? = LayerSlot::Quad {
            swapchain: image.swapchain.id,
            pose,
            size,
            flags,
        };
        Ok(())
    }

    fn draw(&mut self) -> Result<(), RenderError> {
        let device = &self.vk.device;

        unsafe {
            device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(|e| vk_call("vkWaitForFences", e))?;
            device
                .reset_fences(&[self.fence])
                .map_err(|e| vk_call("vkResetFences", e))?;

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(|e| vk_call("vkBeginCommandBuffer", e))?;

            let range = vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1);

            // Previous contents are discarded every frame.
            let barrier = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(self.target)
                .subresource_range(range);

            device.cmd_pipeline_barrier(
                self.command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );

            let clear = vk::ClearColorValue {
                float32: self.clear_color,
            };
            device.cmd_clear_color_image(
                self.command_buffer,
                self.target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear,
                &[range],
            );

            device
                .end_command_buffer(self.command_buffer)
                .map_err(|e| vk_call("vkEndCommandBuffer", e))?;
        }

        let buffers = [self.command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&buffers);

        self.vk
            .queue
            .submit(&self.vk.device, &[submit], self.fence)
            .map_err(|e| vk_call("vkQueueSubmit", e))?;

        // The real pacing signal comes from the display; without one we
        // tick at the HMD's nominal refresh rate.
        let now = time::Instant::now();
        if now < self.next_frame {
            std::thread::sleep(self.next_frame - now);
        }
        self.next_frame += self.frame_interval;

        Ok(())
    }

    fn garbage_collect(&mut self) {}
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        // The queue lock is held across the idle wait; nothing may be
        // submitted while we destroy.
        self.vk.queue.wait_idle(&self.vk.device);

        unsafe {
            let device = &self.vk.device;
            device.destroy_fence(self.fence, None);
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_image(self.target, None);
            device.free_memory(self.target_memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_type_selection() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(
            select_memory_type(&props, vk::MemoryPropertyFlags::DEVICE_LOCAL, None),
            Some(0)
        );
        assert_eq!(
            select_memory_type(&props, vk::MemoryPropertyFlags::HOST_VISIBLE, None),
            Some(1)
        );
        assert_eq!(
            select_memory_type(&props, vk::MemoryPropertyFlags::HOST_VISIBLE, Some(0b01)),
            None
        );
        assert_eq!(
            select_memory_type(&props, vk::MemoryPropertyFlags::PROTECTED, None),
            None
        );
    }
}
