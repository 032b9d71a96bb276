use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use thetaflow_error::{FlowError, Result};

use crate::storage::DEFAULT_DISPERSION;
use crate::storage::kv::{KvFactory, MemoryKv, OrderedKv, RocksKvFactory};
use crate::window::JoinWindow;

/// Where spilled tuples are written.
#[derive(Debug, Clone)]
pub enum SpillLocation {
    Memory,
    /// A RocksDB instance per spilled cell side under this directory.
    Directory(PathBuf),
    Custom(Arc<dyn KvFactory>),
}

impl SpillLocation {
    /// Create the store for one spilled cell side.
    pub fn create_kv(&self, name: &str) -> Result<Box<dyn OrderedKv>> {
        match self {
            Self::Memory => Ok(Box::new(MemoryKv::new())),
            Self::Directory(dir) => RocksKvFactory::new(dir.clone()).create(name),
            Self::Custom(factory) => factory.create(name),
        }
    }
}

impl PartialEq for SpillLocation {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Memory, Self::Memory) => true,
            (Self::Directory(a), Self::Directory(b)) => a == b,
            (Self::Custom(a), Self::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for SpillLocation {}

/// Configuration for a single join.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    pub joiner_parallelism: usize,
    /// Joiners deployed in total, those beyond `joiner_parallelism` start
    /// idle and can be handed cells by a remap. Zero deploys exactly
    /// `joiner_parallelism`.
    pub max_parallelism: usize,
    /// Zero flushes every match immediately.
    pub batch_output_ms: u64,
    pub dispersion: u32,
    /// Tuples held in memory per cell side before spilling. Zero never spills.
    pub spill_threshold: usize,
    pub spill_location: SpillLocation,
    /// Tuples routed per epoch before closing it. Zero disables.
    pub epoch_tuples: u64,
    /// Time per epoch before closing it. Zero disables.
    pub epoch_interval_ms: u64,
    pub delivery_attempts: usize,
    pub delivery_backoff_ms: u64,
    pub input_capacity: usize,
    pub window: JoinWindow,
}

impl Default for JoinConfig {
    fn default() -> Self {
        JoinConfig {
            joiner_parallelism: num_cpus::get(),
            max_parallelism: 0,
            batch_output_ms: 0,
            dispersion: DEFAULT_DISPERSION,
            spill_threshold: 0,
            spill_location: SpillLocation::Directory(std::env::temp_dir()),
            epoch_tuples: 0,
            epoch_interval_ms: 0,
            delivery_attempts: DEFAULT_DELIVERY_ATTEMPTS,
            delivery_backoff_ms: DEFAULT_DELIVERY_BACKOFF_MS,
            input_capacity: DEFAULT_INPUT_CAPACITY,
            window: JoinWindow::Unbounded,
        }
    }
}

impl JoinConfig {
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| FlowError::configuration(format!("Missing setting for '{name}'")))?;

        (func.set)(value, self)
    }

    pub fn get(&self, name: &str) -> Result<String> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| FlowError::configuration(format!("Missing setting for '{name}'")))?;

        Ok((func.get)(self))
    }

    pub fn reset(&mut self, name: &str) -> Result<()> {
        let def_conf = Self::default();
        let val = def_conf.get(name)?;
        self.set(name, &val)
    }

    /// Parse and apply a `name=value` pair.
    pub fn set_pair(&mut self, pair: &str) -> Result<()> {
        let (name, value) = pair.split_once('=').ok_or_else(|| {
            FlowError::configuration("Expected setting in the form name=value").with_field("got", pair)
        })?;
        self.set(name.trim(), value.trim())
    }

    /// Names and descriptions of all settings, sorted by name.
    pub fn describe() -> Vec<(&'static str, &'static str)> {
        let mut settings: Vec<_> = GET_SET_FUNCTIONS
            .iter()
            .map(|(name, funcs)| (*name, funcs.description))
            .collect();
        settings.sort_unstable();
        settings
    }

    /// Number of joiners a deployment starts.
    pub fn joiner_slots(&self) -> usize {
        self.joiner_parallelism.max(self.max_parallelism)
    }

    pub fn batch_output_interval(&self) -> Option<Duration> {
        (self.batch_output_ms > 0).then(|| Duration::from_millis(self.batch_output_ms))
    }

    pub fn epoch_interval(&self) -> Option<Duration> {
        (self.epoch_interval_ms > 0).then(|| Duration::from_millis(self.epoch_interval_ms))
    }

    pub fn delivery_backoff(&self) -> Duration {
        Duration::from_millis(self.delivery_backoff_ms)
    }
}

struct SettingFunctions {
    description: &'static str,
    set: fn(value: &str, conf: &mut JoinConfig) -> Result<()>,
    get: fn(conf: &JoinConfig) -> String,
}

impl SettingFunctions {
    const fn new<S: JoinSetting>() -> Self {
        SettingFunctions {
            description: S::DESCRIPTION,
            set: S::set_from_str as _,
            get: S::get_as_string as _,
        }
    }
}

fn insert_setting<S: JoinSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<JoinerParallelism>(&mut map);
    insert_setting::<MaxParallelism>(&mut map);
    insert_setting::<BatchOutputMs>(&mut map);
    insert_setting::<Dispersion>(&mut map);
    insert_setting::<SpillThreshold>(&mut map);
    insert_setting::<SpillDir>(&mut map);
    insert_setting::<EpochTuples>(&mut map);
    insert_setting::<EpochIntervalMs>(&mut map);
    insert_setting::<DeliveryAttempts>(&mut map);
    insert_setting::<DeliveryBackoffMs>(&mut map);
    insert_setting::<InputCapacity>(&mut map);
    insert_setting::<Window>(&mut map);

    map
});

pub trait JoinSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()>;
    fn get_as_string(conf: &JoinConfig) -> String;
}

fn parse_u64(name: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        FlowError::configuration(format!("Invalid value for '{name}', expected a non-negative integer"))
            .with_field("value", value)
    })
}

fn check_range(name: &str, val: u64, min: u64, max: u64) -> Result<()> {
    if val < min {
        return Err(FlowError::configuration(format!(
            "'{name}' cannot be less than {min}"
        )));
    }
    if val > max {
        return Err(FlowError::configuration(format!(
            "'{name}' cannot be greater than {max}"
        )));
    }
    Ok(())
}

const MIN_PARALLELISM: u64 = 1;
const MAX_PARALLELISM: u64 = 1024;

pub struct JoinerParallelism;

impl JoinSetting for JoinerParallelism {
    const NAME: &'static str = "joiner_parallelism";
    const DESCRIPTION: &'static str = "Number of joiner workers";

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()> {
        let val = parse_u64(Self::NAME, value)?;
        check_range(Self::NAME, val, MIN_PARALLELISM, MAX_PARALLELISM)?;
        conf.joiner_parallelism = val as usize;
        Ok(())
    }

    fn get_as_string(conf: &JoinConfig) -> String {
        conf.joiner_parallelism.to_string()
    }
}

pub struct MaxParallelism;

impl JoinSetting for MaxParallelism {
    const NAME: &'static str = "max_parallelism";
    const DESCRIPTION: &'static str = "Upper bound on joiners a remap may use, 0 for joiner_parallelism";

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()> {
        let val = parse_u64(Self::NAME, value)?;
        check_range(Self::NAME, val, 0, MAX_PARALLELISM)?;
        conf.max_parallelism = val as usize;
        Ok(())
    }

    fn get_as_string(conf: &JoinConfig) -> String {
        conf.max_parallelism.to_string()
    }
}

pub struct BatchOutputMs;

impl JoinSetting for BatchOutputMs {
    const NAME: &'static str = "batch_output_ms";
    const DESCRIPTION: &'static str = "Interval for flushing batched matches, 0 to emit immediately";

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()> {
        conf.batch_output_ms = parse_u64(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &JoinConfig) -> String {
        conf.batch_output_ms.to_string()
    }
}

pub struct Dispersion;

impl JoinSetting for Dispersion {
    const NAME: &'static str = "dispersion";
    const DESCRIPTION: &'static str = "Physical keys per logical key in spill storage";

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()> {
        let val = parse_u64(Self::NAME, value)?;
        check_range(Self::NAME, val, 1, u32::MAX as u64)?;
        conf.dispersion = val as u32;
        Ok(())
    }

    fn get_as_string(conf: &JoinConfig) -> String {
        conf.dispersion.to_string()
    }
}

pub struct SpillThreshold;

impl JoinSetting for SpillThreshold {
    const NAME: &'static str = "spill_threshold";
    const DESCRIPTION: &'static str = "Tuples buffered in memory per cell side before spilling, 0 to never spill";

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()> {
        conf.spill_threshold = parse_u64(Self::NAME, value)? as usize;
        Ok(())
    }

    fn get_as_string(conf: &JoinConfig) -> String {
        conf.spill_threshold.to_string()
    }
}

pub struct SpillDir;

impl JoinSetting for SpillDir {
    const NAME: &'static str = "spill_dir";
    const DESCRIPTION: &'static str = "Directory for spill files, 'memory' to keep spills in memory";

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()> {
        let value = value.trim();
        if value.is_empty() {
            return Err(FlowError::configuration("Spill directory cannot be empty"));
        }
        conf.spill_location = if value.eq_ignore_ascii_case("memory") {
            SpillLocation::Memory
        } else {
            SpillLocation::Directory(PathBuf::from(value))
        };
        Ok(())
    }

    fn get_as_string(conf: &JoinConfig) -> String {
        match &conf.spill_location {
            SpillLocation::Memory => "memory".to_string(),
            SpillLocation::Directory(path) => path.display().to_string(),
            SpillLocation::Custom(factory) => format!("{factory:?}"),
        }
    }
}

pub struct EpochTuples;

impl JoinSetting for EpochTuples {
    const NAME: &'static str = "epoch_tuples";
    const DESCRIPTION: &'static str = "Tuples routed per epoch before it is closed, 0 to disable";

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()> {
        conf.epoch_tuples = parse_u64(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &JoinConfig) -> String {
        conf.epoch_tuples.to_string()
    }
}

pub struct EpochIntervalMs;

impl JoinSetting for EpochIntervalMs {
    const NAME: &'static str = "epoch_interval_ms";
    const DESCRIPTION: &'static str = "Time per epoch before it is closed, 0 to disable";

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()> {
        conf.epoch_interval_ms = parse_u64(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &JoinConfig) -> String {
        conf.epoch_interval_ms.to_string()
    }
}

pub const DEFAULT_DELIVERY_ATTEMPTS: usize = 5;
pub const DEFAULT_DELIVERY_BACKOFF_MS: u64 = 10;

pub struct DeliveryAttempts;

impl JoinSetting for DeliveryAttempts {
    const NAME: &'static str = "delivery_attempts";
    const DESCRIPTION: &'static str = "Attempts made to deliver a control message before aborting";

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()> {
        let val = parse_u64(Self::NAME, value)?;
        check_range(Self::NAME, val, 1, 100)?;
        conf.delivery_attempts = val as usize;
        Ok(())
    }

    fn get_as_string(conf: &JoinConfig) -> String {
        conf.delivery_attempts.to_string()
    }
}

pub struct DeliveryBackoffMs;

impl JoinSetting for DeliveryBackoffMs {
    const NAME: &'static str = "delivery_backoff_ms";
    const DESCRIPTION: &'static str = "Delay between delivery attempts";

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()> {
        conf.delivery_backoff_ms = parse_u64(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &JoinConfig) -> String {
        conf.delivery_backoff_ms.to_string()
    }
}

pub const DEFAULT_INPUT_CAPACITY: usize = 1024;

pub struct InputCapacity;

impl JoinSetting for InputCapacity {
    const NAME: &'static str = "input_capacity";
    const DESCRIPTION: &'static str = "Capacity of the bounded source channel";

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()> {
        let val = parse_u64(Self::NAME, value)?;
        check_range(Self::NAME, val, 1, 1 << 20)?;
        conf.input_capacity = val as usize;
        Ok(())
    }

    fn get_as_string(conf: &JoinConfig) -> String {
        conf.input_capacity.to_string()
    }
}

pub struct Window;

impl JoinSetting for Window {
    const NAME: &'static str = "window";
    const DESCRIPTION: &'static str = "Join window: 'unbounded', 'sliding:<ms>' or 'tumbling:<ms>'";

    fn set_from_str(value: &str, conf: &mut JoinConfig) -> Result<()> {
        conf.window = value.parse()?;
        Ok(())
    }

    fn get_as_string(conf: &JoinConfig) -> String {
        conf.window.to_string()
    }
}
