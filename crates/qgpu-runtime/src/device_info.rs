//! Device capability capture: names, versions, extensions, and on-device
//! type-size probes.

use crate::error::Result;
use ocl::enums::DeviceInfo as OclDeviceInfo;
use ocl::enums::DeviceInfoResult;
use ocl::{Buffer, Context, Device, Kernel, MemFlags, Platform, Program, Queue};
use std::collections::BTreeMap;

/// Everything recorded about one OpenCL device at registry build time.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub platform_name: String,
    pub device_name: String,
    pub vendor: String,
    pub driver_version: String,
    pub device_version: String,
    pub extensions: String,
    pub supports_double_precision: bool,
    /// `sizeof` in bytes for `uint`, `ulong`, `float`, and (if supported)
    /// `double`, as measured on-device rather than assumed from the host.
    pub type_sizes: BTreeMap<String, u32>,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} / {} ({}, driver {}, fp64={})",
            self.platform_name,
            self.device_name.trim(),
            self.device_version,
            self.driver_version,
            self.supports_double_precision
        )
    }
}

fn info_string(device: Device, kind: OclDeviceInfo) -> Result<String> {
    Ok(device.info(kind)?.to_string())
}

/// `supportsDoublePrecision` is true if the FP config is non-zero, falling
/// back to an extension-string probe (`cl_khr_fp64`) for pre-1.2 drivers
/// that report an empty FP config regardless of actual support.
fn detect_double_precision(device: Device, extensions: &str) -> Result<bool> {
    let fp_config_nonempty = match device.info(OclDeviceInfo::DoubleFpConfig) {
        Ok(DeviceInfoResult::DoubleFpConfig(cfg)) => !cfg.is_empty(),
        _ => false,
    };
    if fp_config_nonempty {
        return Ok(true);
    }
    Ok(extensions.contains("cl_khr_fp64"))
}

/// Run a throwaway kernel that writes `sizeof(type_name)` into a 1-element
/// buffer and read it back. Used only at registry build time, never on the
/// hot path.
fn probe_type_size(context: &Context, device: Device, queue: &Queue, type_name: &str) -> Result<u32> {
    let src = format!(
        "__kernel void ore_probe_sizeof(__global uint* out) {{ out[0] = (uint)sizeof({type_name}); }}"
    );
    let program = Program::builder()
        .src(src)
        .devices(device)
        .build(context)?;

    let out_buf = Buffer::<u32>::builder()
        .queue(queue.clone())
        .flags(MemFlags::new().write_only())
        .len(1)
        .build()?;

    let kernel = Kernel::builder()
        .program(&program)
        .name("ore_probe_sizeof")
        .queue(queue.clone())
        .global_work_size(1)
        .arg(&out_buf)
        .build()?;

    unsafe {
        kernel.enq()?;
    }
    queue.finish()?;

    let mut out = [0u32; 1];
    out_buf.read(&mut out[..]).enq()?;
    Ok(out[0])
}

/// Capture the full `DeviceInfo` record for `device`, including the
/// on-device type-size probes. Requires a live context and queue for that
/// device, since the probes compile and run a kernel.
pub fn capture(
    platform: Platform,
    device: Device,
    context: &Context,
    queue: &Queue,
) -> Result<DeviceInfo> {
    let platform_name = platform
        .info(ocl::enums::PlatformInfo::Name)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| "unknown-platform".to_string());

    let device_name = info_string(device, OclDeviceInfo::Name)?;
    let vendor = info_string(device, OclDeviceInfo::Vendor)?;
    let driver_version = info_string(device, OclDeviceInfo::DriverVersion)?;
    let device_version = info_string(device, OclDeviceInfo::Version)?;
    let extensions = info_string(device, OclDeviceInfo::Extensions)?;
    let supports_double_precision = detect_double_precision(device, &extensions)?;

    let mut type_sizes = BTreeMap::new();
    type_sizes.insert("uint".to_string(), probe_type_size(context, device, queue, "uint")?);
    type_sizes.insert("ulong".to_string(), probe_type_size(context, device, queue, "ulong")?);
    type_sizes.insert("float".to_string(), probe_type_size(context, device, queue, "float")?);
    if supports_double_precision {
        type_sizes.insert(
            "double".to_string(),
            probe_type_size(context, device, queue, "double")?,
        );
    }

    Ok(DeviceInfo {
        platform_name,
        device_name,
        vendor,
        driver_version,
        device_version,
        extensions,
        supports_double_precision,
        type_sizes,
    })
}

/// Canonical registry key for a `(platform, device)` pair: `"OpenCL/<platform>/<device>"`.
pub fn canonical_name(platform_name: &str, device_name: &str) -> String {
    format!("OpenCL/{}/{}", platform_name.trim(), device_name.trim())
}
