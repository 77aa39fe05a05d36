//! Linux sysfs hardware backend
//!
//! - Digital lines: `/sys/class/gpio/gpioN/{direction,value}`
//! - PWM: `/sys/class/pwm/pwmchipN/pwmM/{period,duty_cycle,enable}`
//! - Thermometers: `/sys/bus/w1/devices/<family>-<id>/temperature` (or `w1_slave`)
//! - Edges: one watcher thread per registration, blocking in `poll(2)` on the
//!   GPIO value file until the kernel flags an edge

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use sh_error::{Result, ShopHeaterError};
use tracing::{debug, info, warn};

use super::{
    DigitalIo, EdgeCallback, EdgeHandle, EdgeKind, EdgeSource, HardwareRig, Level, PwmOutput,
    TemperatureBus,
};
use crate::constants::{paths, sensors, EDGE_POLL_TIMEOUT};

/// Build the full capability set from sysfs.
///
/// Fails if the GPIO or PWM class directories are missing; there is no rig
/// without real hardware behind it.
pub fn open_rig(pwm_chip: u32, pwm_frequency_hz: u32) -> Result<HardwareRig> {
    let gpio_base = PathBuf::from(paths::GPIO_BASE);
    let pwm_base = PathBuf::from(paths::PWM_BASE);

    if !gpio_base.exists() {
        return Err(ShopHeaterError::hardware_init(
            paths::GPIO_BASE,
            "GPIO class directory not found (is this a GPIO-capable board?)",
        ));
    }

    Ok(HardwareRig {
        pwm: Box::new(SysfsPwm::new(&pwm_base, pwm_chip, pwm_frequency_hz)?),
        digital: Box::new(SysfsGpio::new(&gpio_base)),
        edges: Box::new(SysfsEdgeSource::new(&gpio_base)),
        thermometers: Arc::new(W1Thermometers::new(paths::W1_DEVICES)),
    })
}

fn write_attr(path: &Path, value: &str) -> std::io::Result<()> {
    fs::write(path, value)
}

/// Export `channel` under `base` and set its direction.
///
/// A line left claimed by a crashed process is unexported and claimed again once.
fn claim_line(base: &Path, channel: u32, direction: &str) -> Result<PathBuf> {
    let line_dir = base.join(format!("gpio{}", channel));

    if !line_dir.exists() {
        write_attr(&base.join("export"), &channel.to_string()).map_err(|e| {
            ShopHeaterError::hardware_init(format!("gpio{}", channel), format!("export failed: {}", e))
        })?;
    }

    if let Err(first) = write_attr(&line_dir.join("direction"), direction) {
        debug!(channel, error = %first, "GPIO busy, releasing and retrying");
        let _ = write_attr(&base.join("unexport"), &channel.to_string());
        std::thread::sleep(Duration::from_millis(100));
        write_attr(&base.join("export"), &channel.to_string())
            .and_then(|_| write_attr(&line_dir.join("direction"), direction))
            .map_err(|e| {
                ShopHeaterError::hardware_init(
                    format!("gpio{}", channel),
                    format!("pin may be in use by another process: {}", e),
                )
            })?;
    }

    Ok(line_dir)
}

// ============================================================================
// Digital lines
// ============================================================================

pub struct SysfsGpio {
    base: PathBuf,
    claimed: HashSet<u32>,
}

impl SysfsGpio {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            claimed: HashSet::new(),
        }
    }

    fn value_path(&mut self, channel: u32) -> Result<PathBuf> {
        if !self.claimed.contains(&channel) {
            claim_line(&self.base, channel, "out")?;
            self.claimed.insert(channel);
            info!(channel, "Claimed GPIO output");
        }
        Ok(self.base.join(format!("gpio{}", channel)).join("value"))
    }
}

impl DigitalIo for SysfsGpio {
    fn write_digital(&mut self, channel: u32, level: Level) -> Result<()> {
        let path = self.value_path(channel)?;
        write_attr(&path, &level.as_bit().to_string())
            .map_err(|e| ShopHeaterError::hardware_write(channel, e.to_string()))
    }

    fn read_digital(&mut self, channel: u32) -> Result<Level> {
        let path = self.base.join(format!("gpio{}", channel)).join("value");
        let content = fs::read_to_string(&path).map_err(|e| ShopHeaterError::HardwareRead {
            channel,
            reason: e.to_string(),
        })?;
        Ok(if content.trim() == "0" { Level::Low } else { Level::High })
    }
}

// ============================================================================
// PWM
// ============================================================================

pub struct SysfsPwm {
    chip_dir: PathBuf,
    period_ns: u64,
    enabled: HashSet<u32>,
}

impl SysfsPwm {
    pub fn new(base: &Path, chip: u32, frequency_hz: u32) -> Result<Self> {
        let chip_dir = base.join(format!("pwmchip{}", chip));
        if !chip_dir.exists() {
            return Err(ShopHeaterError::hardware_init(
                format!("pwmchip{}", chip),
                "PWM chip not found (is the pwm overlay enabled?)",
            ));
        }
        if frequency_hz == 0 {
            return Err(ShopHeaterError::invalid_config("fan.pwm_frequency_hz", "must be non-zero"));
        }
        Ok(Self {
            chip_dir,
            period_ns: 1_000_000_000 / frequency_hz as u64,
            enabled: HashSet::new(),
        })
    }

    fn ensure_enabled(&mut self, channel: u32) -> Result<PathBuf> {
        let dir = self.chip_dir.join(format!("pwm{}", channel));
        if self.enabled.contains(&channel) {
            return Ok(dir);
        }
        let init = |e: std::io::Error| {
            ShopHeaterError::hardware_init(format!("pwm{}", channel), e.to_string())
        };
        if !dir.exists() {
            write_attr(&self.chip_dir.join("export"), &channel.to_string()).map_err(init)?;
        }
        // Duty must not exceed the period while the period is being changed
        write_attr(&dir.join("duty_cycle"), "0").map_err(init)?;
        write_attr(&dir.join("period"), &self.period_ns.to_string()).map_err(init)?;
        write_attr(&dir.join("enable"), "1").map_err(init)?;
        self.enabled.insert(channel);
        info!(channel, period_ns = self.period_ns, "PWM channel enabled");
        Ok(dir)
    }
}

impl PwmOutput for SysfsPwm {
    fn set_pwm_duty(&mut self, channel: u32, percent: u8) -> Result<()> {
        let dir = self.ensure_enabled(channel)?;
        let duty_ns = self.period_ns * percent.min(100) as u64 / 100;
        write_attr(&dir.join("duty_cycle"), &duty_ns.to_string())
            .map_err(|e| ShopHeaterError::hardware_write(channel, e.to_string()))
    }
}

// ============================================================================
// Edge detection
// ============================================================================

struct EdgeWatcher {
    channel: u32,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct SysfsEdgeSource {
    base: PathBuf,
    watchers: HashMap<u64, EdgeWatcher>,
    next_handle: u64,
}

impl SysfsEdgeSource {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            watchers: HashMap::new(),
            next_handle: 0,
        }
    }
}

impl EdgeSource for SysfsEdgeSource {
    fn register_edge_callback(
        &mut self,
        channel: u32,
        edge: EdgeKind,
        callback: EdgeCallback,
    ) -> Result<EdgeHandle> {
        let registration = |reason: String| ShopHeaterError::EdgeRegistration { channel, reason };

        let line_dir = claim_line(&self.base, channel, "in")
            .map_err(|e| registration(e.to_string()))?;
        write_attr(&line_dir.join("edge"), edge.sysfs_name())
            .map_err(|e| registration(format!("edge setup failed: {}", e)))?;
        let value = fs::File::open(line_dir.join("value"))
            .map_err(|e| registration(format!("cannot open value file: {}", e)))?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name(format!("edge-gpio{}", channel))
            .spawn(move || watch_edges(value, callback, stop_flag))
            .map_err(|e| registration(format!("cannot spawn watcher: {}", e)))?;

        self.next_handle += 1;
        let id = self.next_handle;
        self.watchers.insert(id, EdgeWatcher { channel, stop, thread });
        info!(channel, edge = edge.sysfs_name(), "Edge detection armed");
        Ok(EdgeHandle(id))
    }

    fn deregister(&mut self, handle: EdgeHandle) -> Result<()> {
        let watcher = self
            .watchers
            .remove(&handle.0)
            .ok_or_else(|| ShopHeaterError::generic(format!("Unknown edge handle {}", handle.0)))?;

        watcher.stop.store(true, Ordering::Relaxed);
        let joined = watcher.thread.join();

        let edge_path = self.base.join(format!("gpio{}", watcher.channel)).join("edge");
        let _ = write_attr(&edge_path, "none");

        joined.map_err(|_| {
            ShopHeaterError::generic(format!("edge watcher for gpio{} panicked", watcher.channel))
        })
    }
}

fn watch_edges(mut value: fs::File, callback: EdgeCallback, stop: Arc<AtomicBool>) {
    let fd = value.as_raw_fd();
    let mut buf = [0u8; 8];
    let timeout_ms = EDGE_POLL_TIMEOUT.as_millis() as libc::c_int;

    // Consume the initial state so the first poll only reports a real edge
    let _ = value.read(&mut buf);

    while !stop.load(Ordering::Relaxed) {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLPRI | libc::POLLERR,
            revents: 0,
        };
        // SAFETY: pfd is a valid, initialized pollfd for an fd owned by `value`,
        // which outlives this call; nfds is exactly 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %err, "Edge poll failed, watcher exiting");
            break;
        }
        if rc == 0 {
            continue;
        }
        if pfd.revents & (libc::POLLPRI | libc::POLLERR) != 0 {
            // Re-arm: sysfs requires a read from offset 0 after each notification
            let _ = value.seek(SeekFrom::Start(0));
            let _ = value.read(&mut buf);
            callback();
        }
    }
}

// ============================================================================
// 1-Wire thermometers
// ============================================================================

pub struct W1Thermometers {
    devices: PathBuf,
}

impl W1Thermometers {
    pub fn new(devices: impl Into<PathBuf>) -> Self {
        Self {
            devices: devices.into(),
        }
    }

    /// Device directory for a bare id such as `3ca4f649bbd0`
    fn device_dir(&self, sensor_id: &str) -> Option<PathBuf> {
        sensors::W1_THERM_FAMILIES
            .iter()
            .map(|family| self.devices.join(format!("{}-{}", family, sensor_id)))
            .find(|p| p.exists())
    }
}

/// Parse the legacy two-line `w1_slave` format; `None` on CRC failure
fn parse_w1_slave(content: &str) -> Option<f64> {
    let mut lines = content.lines();
    let crc_line = lines.next()?;
    if !crc_line.trim_end().ends_with("YES") {
        return None;
    }
    let data_line = lines.next()?;
    let raw = data_line.split("t=").nth(1)?.trim();
    raw.parse::<i64>()
        .ok()
        .map(|milli| milli as f64 / sensors::MILLIDEGREE_DIVISOR)
}

impl TemperatureBus for W1Thermometers {
    fn read_raw_temperature(&self, sensor_id: &str) -> Result<f64> {
        let dir = self
            .device_dir(sensor_id)
            .ok_or_else(|| ShopHeaterError::sensor_read(sensor_id, "not on bus"))?;

        let temperature = dir.join("temperature");
        if temperature.exists() {
            let content = fs::read_to_string(&temperature)
                .map_err(|e| ShopHeaterError::sensor_read(sensor_id, e.to_string()))?;
            let milli = content.trim().parse::<i64>().map_err(|e| {
                ShopHeaterError::sensor_read(
                    sensor_id,
                    format!("Failed to parse '{}': {}", content.trim(), e),
                )
            })?;
            return Ok(milli as f64 / sensors::MILLIDEGREE_DIVISOR);
        }

        let content = fs::read_to_string(dir.join("w1_slave"))
            .map_err(|e| ShopHeaterError::sensor_read(sensor_id, e.to_string()))?;
        parse_w1_slave(&content)
            .ok_or_else(|| ShopHeaterError::sensor_read(sensor_id, "CRC check failed"))
    }

    fn list_sensor_ids(&self) -> Result<BTreeSet<String>> {
        let entries = match fs::read_dir(&self.devices) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("1-Wire bus not present at {:?}", self.devices);
                return Ok(BTreeSet::new());
            }
            Err(e) => {
                return Err(ShopHeaterError::FileRead {
                    path: self.devices.clone(),
                    source: e,
                })
            }
        };

        let ids = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter_map(|name| {
                let (family, id) = name.split_once('-')?;
                sensors::W1_THERM_FAMILIES
                    .contains(&family)
                    .then(|| id.to_string())
            })
            .collect();
        Ok(ids)
    }
}
