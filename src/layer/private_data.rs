// Per-instance and per-device side data
//
// The layer does not wrap dispatchable handles. Instead it keeps a
// process-wide map from the handle's dispatch pointer (the first
// machine word of any dispatchable object) to the data it associates
// with the owning instance or device. Child objects such as
// VkPhysicalDevice and VkQueue share their parent's dispatch pointer,
// so the same lookup serves them.
use ash::vk;
use ash::vk::Handle;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::dispatch::{DeviceDispatchTable, InstanceDispatchTable};
use super::loader::{PfnSetDeviceLoaderData, PfnSetInstanceLoaderData};
use crate::wsi::surface::Surface;
use crate::wsi::PlatformSet;
use crate::{Result, WsiError};

/// The first machine word of a dispatchable object, written by the
/// ICD. Identical for every child object of one instance or device.
pub fn dispatch_key<T: Handle>(handle: T) -> usize {
    unsafe { *(handle.as_raw() as usize as *const usize) }
}

struct Registry {
    instances: HashMap<usize, Arc<InstanceData>>,
    devices: HashMap<usize, Arc<DeviceData>>,
}

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry {
        instances: HashMap::new(),
        devices: HashMap::new(),
    });
}

/// Layer state attached to one VkInstance.
pub struct InstanceData {
    pub handle: vk::Instance,
    pub disp: InstanceDispatchTable,
    pub set_loader_data: PfnSetInstanceLoaderData,
    pub api_version: u32,
    pub enabled_platforms: PlatformSet,
    enabled_extensions: HashSet<String>,
    /// VkSurfaceKHR handles we own a platform surface for. Guarded
    /// separately from the global registry lock.
    surfaces: Mutex<HashMap<u64, Arc<dyn Surface>>>,
}

impl InstanceData {
    pub fn associate(
        instance: vk::Instance,
        disp: InstanceDispatchTable,
        set_loader_data: PfnSetInstanceLoaderData,
        enabled_platforms: PlatformSet,
        api_version: u32,
        enabled_extensions: HashSet<String>,
    ) {
        let data = Arc::new(InstanceData {
            handle: instance,
            disp,
            set_loader_data,
            api_version,
            enabled_platforms,
            enabled_extensions,
            surfaces: Mutex::new(HashMap::new()),
        });
        let mut registry = REGISTRY.lock().unwrap();
        registry.instances.insert(dispatch_key(instance), data);
    }

    /// Drop the association. Must happen before the downstream
    /// destroy so a racing create cannot find stale data under a
    /// recycled dispatch pointer.
    pub fn disassociate(instance: vk::Instance) -> Option<Arc<InstanceData>> {
        let mut registry = REGISTRY.lock().unwrap();
        registry.instances.remove(&dispatch_key(instance))
    }

    pub fn get<T: Handle>(handle: T) -> Arc<InstanceData> {
        let registry = REGISTRY.lock().unwrap();
        registry
            .instances
            .get(&dispatch_key(handle))
            .expect("no layer data associated with this instance")
            .clone()
    }

    pub fn try_get<T: Handle>(handle: T) -> Option<Arc<InstanceData>> {
        let registry = REGISTRY.lock().unwrap();
        registry.instances.get(&dispatch_key(handle)).cloned()
    }

    pub fn is_instance_extension_enabled(&self, name: &str) -> bool {
        self.enabled_extensions.contains(name)
    }

    /// Take ownership of a platform surface for the given VkSurfaceKHR.
    pub fn add_surface(&self, vk_surface: vk::SurfaceKHR, surface: Arc<dyn Surface>) -> Result<()> {
        let mut surfaces = self.surfaces.lock().unwrap();
        surfaces.insert(vk_surface.as_raw(), surface);
        Ok(())
    }

    pub fn get_surface(&self, vk_surface: vk::SurfaceKHR) -> Option<Arc<dyn Surface>> {
        let surfaces = self.surfaces.lock().unwrap();
        surfaces.get(&vk_surface.as_raw()).cloned()
    }

    pub fn remove_surface(&self, vk_surface: vk::SurfaceKHR) {
        let mut surfaces = self.surfaces.lock().unwrap();
        surfaces.remove(&vk_surface.as_raw());
    }

    /// Whether surface queries for this handle are answered by the
    /// layer. We create a surface object for every surface we are
    /// responsible for, so ownership of one is the entire answer.
    /// ICDs are never trusted to handle our platforms themselves.
    pub fn should_layer_handle_surface(&self, vk_surface: vk::SurfaceKHR) -> bool {
        self.get_surface(vk_surface).is_some()
    }
}

impl Drop for InstanceData {
    fn drop(&mut self) {
        let surfaces = self.surfaces.lock().unwrap();
        if !surfaces.is_empty() {
            utils::log::warning!(
                "Instance destroyed with {} live surfaces",
                surfaces.len()
            );
        }
    }
}

/// Layer state attached to one VkDevice.
pub struct DeviceData {
    pub handle: vk::Device,
    pub disp: DeviceDispatchTable,
    pub instance: Arc<InstanceData>,
    pub physical_device: vk::PhysicalDevice,
    pub set_loader_data: PfnSetDeviceLoaderData,
    enabled_extensions: HashSet<String>,
    swapchains: Mutex<HashSet<u64>>,
    pub compression_control_enabled: bool,
}

impl DeviceData {
    #[allow(clippy::too_many_arguments)]
    pub fn associate(
        device: vk::Device,
        disp: DeviceDispatchTable,
        instance: Arc<InstanceData>,
        physical_device: vk::PhysicalDevice,
        set_loader_data: PfnSetDeviceLoaderData,
        enabled_extensions: HashSet<String>,
        compression_control_enabled: bool,
    ) {
        let data = Arc::new(DeviceData {
            handle: device,
            disp,
            instance,
            physical_device,
            set_loader_data,
            enabled_extensions,
            swapchains: Mutex::new(HashSet::new()),
            compression_control_enabled,
        });
        let mut registry = REGISTRY.lock().unwrap();
        registry.devices.insert(dispatch_key(device), data);
    }

    pub fn disassociate(device: vk::Device) -> Option<Arc<DeviceData>> {
        let mut registry = REGISTRY.lock().unwrap();
        registry.devices.remove(&dispatch_key(device))
    }

    pub fn get<T: Handle>(handle: T) -> Arc<DeviceData> {
        let registry = REGISTRY.lock().unwrap();
        registry
            .devices
            .get(&dispatch_key(handle))
            .expect("no layer data associated with this device")
            .clone()
    }

    pub fn try_get<T: Handle>(handle: T) -> Option<Arc<DeviceData>> {
        let registry = REGISTRY.lock().unwrap();
        registry.devices.get(&dispatch_key(handle)).cloned()
    }

    pub fn is_device_extension_enabled(&self, name: &str) -> bool {
        self.enabled_extensions.contains(name)
    }

    pub fn add_layer_swapchain(&self, swapchain: vk::SwapchainKHR) -> Result<()> {
        let mut swapchains = self.swapchains.lock().unwrap();
        swapchains.insert(swapchain.as_raw());
        Ok(())
    }

    pub fn remove_layer_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut swapchains = self.swapchains.lock().unwrap();
        swapchains.remove(&swapchain.as_raw());
    }

    pub fn layer_owns_swapchain(&self, swapchain: vk::SwapchainKHR) -> bool {
        let swapchains = self.swapchains.lock().unwrap();
        swapchains.contains(&swapchain.as_raw())
    }

    pub fn layer_owns_all_swapchains(&self, swapchains: &[vk::SwapchainKHR]) -> bool {
        let owned = self.swapchains.lock().unwrap();
        swapchains.iter().all(|sc| owned.contains(&sc.as_raw()))
    }

    pub fn should_layer_create_swapchain(&self, vk_surface: vk::SurfaceKHR) -> bool {
        self.instance.should_layer_handle_surface(vk_surface)
    }

    /// Whether the ICDs below could create a swapchain for a surface
    /// we do not own. The layer creates a surface object for every
    /// surface of its platforms, so this is statically false.
    pub fn can_icds_create_swapchain(&self, _vk_surface: vk::SurfaceKHR) -> bool {
        false
    }

    /// Tag a dispatchable object created by the layer so the loader
    /// can patch its dispatch table.
    pub fn set_device_loader_data<T: Handle + Copy>(&self, object: T) -> Result<()> {
        let res = unsafe {
            (self.set_loader_data)(
                self.handle,
                object.as_raw() as usize as *mut std::os::raw::c_void,
            )
        };
        crate::error::vk_try(res).map_err(|_| WsiError::INITIALIZATION_FAILED)
    }
}
