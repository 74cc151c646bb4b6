//! Device discovery and lookup by canonical name.

use crate::context::ComputeContext;
use crate::device_info::{canonical_name, capture, DeviceInfo};
use crate::error::{Error, Result};
use ocl::{Context, Device, DeviceType, Platform, Queue};

/// One entry in the registry: the `ocl` handles plus the captured
/// `DeviceInfo` used to answer `NoDevice` with the list of what *is*
/// available.
pub struct RegisteredDevice {
    pub name: String,
    pub platform: Platform,
    pub device: Device,
    pub info: DeviceInfo,
}

/// Enumerates every OpenCL device visible on the host and resolves
/// canonical names (`"OpenCL/<platform>/<device>"`) to `ocl` handles.
///
/// Built once at startup; `ComputeContext::init` walks this to find the
/// device it was asked for.
pub struct DeviceRegistry {
    devices: Vec<RegisteredDevice>,
}

impl DeviceRegistry {
    /// Enumerate all platforms and all devices (not just GPUs: the spec
    /// draws no line between device classes, and a CPU OpenCL driver is a
    /// legitimate fallback in a machine with no GPU).
    pub fn enumerate() -> Result<Self> {
        let mut devices = Vec::new();

        for platform in Platform::list() {
            let platform_name = platform
                .info(ocl::enums::PlatformInfo::Name)
                .map(|v| v.to_string())
                .unwrap_or_else(|_| "unknown-platform".to_string());

            let found = Device::list(platform, Some(DeviceType::ALL)).unwrap_or_default();

            for device in found {
                let device_name = device
                    .info(ocl::enums::DeviceInfo::Name)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| "unknown-device".to_string());

                let name = canonical_name(&platform_name, &device_name);

                let context = match Context::builder().platform(platform).devices(device).build() {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                let queue = match Queue::new(&context, device, None) {
                    Ok(q) => q,
                    Err(_) => continue,
                };
                let info = match capture(platform, device, &context, &queue) {
                    Ok(i) => i,
                    Err(_) => continue,
                };

                devices.push(RegisteredDevice {
                    name,
                    platform,
                    device,
                    info,
                });
            }
        }

        Ok(Self { devices })
    }

    /// Canonical names of every registered device, in discovery order.
    pub fn names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name.clone()).collect()
    }

    /// Resolve a canonical name to its registered device, or `NoDevice`
    /// listing the names that *are* available.
    pub fn open(&self, name: &str) -> Result<&RegisteredDevice> {
        self.devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::NoDevice {
                requested: name.to_string(),
                available: self.names(),
            })
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Resolve `name` and hand back a freshly constructed, uninitialised
    /// [`ComputeContext`] for it. The caller still has to call
    /// [`ComputeContext::init`] before using it (§4.1); nothing here touches
    /// the device.
    pub fn open_context(&self, name: &str) -> Result<ComputeContext> {
        let device = self.open(name)?;
        Ok(ComputeContext::new(
            device.name.clone(),
            device.platform,
            device.device,
            device.info.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_unknown_name_lists_available() {
        let registry = DeviceRegistry { devices: Vec::new() };
        let err = registry.open("OpenCL/nope/nope").unwrap_err();
        match err {
            Error::NoDevice { requested, available } => {
                assert_eq!(requested, "OpenCL/nope/nope");
                assert!(available.is_empty());
            }
            other => panic!("expected NoDevice, got {other:?}"),
        }
    }

    #[test]
    fn empty_registry_reports_empty() {
        let registry = DeviceRegistry { devices: Vec::new() };
        assert!(registry.is_empty());
        assert!(registry.names().is_empty());
    }
}
