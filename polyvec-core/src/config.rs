use std::{env, path::PathBuf, str::FromStr};

pub const ENV_HOST_DEVICES: &str = "POLYVEC_HOST_DEVICES";
pub const ENV_HOST_THREADS: &str = "POLYVEC_HOST_THREADS";
pub const ENV_DUMP_KERNELS: &str = "POLYVEC_DUMP_KERNELS";
pub const ENV_KERNEL_DIR: &str = "POLYVEC_KERNEL_DIR";

/// Engine-wide settings used when a [`crate::Context`] opens its devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of logical devices the host CPU is split into.
    pub host_devices: usize,
    /// Worker threads per host device. Defaults to an even share of the cores.
    pub host_threads: Option<usize>,
    /// Write every newly generated kernel source to [`EngineConfig::kernel_dir`].
    pub dump_kernels: bool,
    pub kernel_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_devices: 1,
            host_threads: None,
            dump_kernels: false,
            kernel_dir: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by the `POLYVEC_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host_devices: parse_var(ENV_HOST_DEVICES)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.host_devices),
            host_threads: parse_var(ENV_HOST_THREADS).filter(|n: &usize| *n > 0),
            dump_kernels: env::var(ENV_DUMP_KERNELS)
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
            kernel_dir: env::var_os(ENV_KERNEL_DIR).map(PathBuf::from),
        }
    }

    /// Threads given to each host device.
    pub fn threads_per_host_device(&self) -> usize {
        self.host_threads
            .unwrap_or_else(|| num_cpus::get() / self.host_devices.max(1))
            .max(1)
    }

    /// Where generated kernels are written when dumping is enabled.
    pub fn kernel_dump_dir(&self) -> Option<PathBuf> {
        if !self.dump_kernels {
            return None;
        }
        self.kernel_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("polyvec").join("kernels")))
    }
}

pub(crate) fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring {name}={raw:?}: not a valid value");
            None
        }
    }
}
