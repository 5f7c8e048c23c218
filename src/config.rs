use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TraceError},
    serialize::serde_hex,
    Address,
};

#[cfg(target_pointer_width = "64")]
const USER_SPACE_TOP: Address = 0x7fff_ffff_ffff;
#[cfg(not(target_pointer_width = "64"))]
const USER_SPACE_TOP: Address = 0x7fff_ffff;

/// Addresses strictly between `min` and `max` look like real heap chunks.
/// Anything else is an error return or a sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoiseBand {
    #[serde(with = "serde_hex")]
    pub min: Address,
    #[serde(with = "serde_hex")]
    pub max: Address,
}

impl NoiseBand {
    pub fn admits(&self, address: Address) -> bool {
        self.min < address && address < self.max
    }
}

impl Default for NoiseBand {
    fn default() -> Self {
        Self {
            min: 0x1000,
            max: USER_SPACE_TOP,
        }
    }
}

/// Exception codes that end the trace and the target with it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCodeRange {
    pub first: u32,
    pub last: u32,
}

impl FaultCodeRange {
    pub fn contains(&self, code: u32) -> bool {
        (self.first..=self.last).contains(&code)
    }
}

impl Default for FaultCodeRange {
    fn default() -> Self {
        // error-severity status codes, access violations included
        Self {
            first: 0xC000_0000,
            last: 0xCFFF_FFFF,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceOptions {
    pub log_allocations: bool,
    pub log_frees: bool,
    pub show_timestamps: bool,
    /// Put the process id in the log file names
    pub split_output_per_process: bool,
    /// Keep tracking, but write no heap event lines
    pub silent: bool,
    pub buffer_output: bool,
    pub output_dir: PathBuf,
    pub log_name: String,
    pub noise_band: NoiseBand,
    pub fatal_codes: FaultCodeRange,
    /// Where to dump the event log as JSON when the trace finishes
    pub event_dump: Option<PathBuf>,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            log_allocations: true,
            log_frees: true,
            show_timestamps: false,
            split_output_per_process: false,
            silent: false,
            buffer_output: true,
            output_dir: PathBuf::from("."),
            log_name: "heaplog".to_owned(),
            noise_band: NoiseBand::default(),
            fatal_codes: FaultCodeRange::default(),
            event_dump: None,
        }
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(TraceError::Config(format!(
            "{key} should be a boolean, got {other:?}"
        ))),
    }
}

impl TraceOptions {
    pub fn from_json_file<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Defaults (or `HEAPLOG_CONFIG`, if set) overlaid with the `HEAPLOG_*`
    /// variables of the current environment
    pub fn from_env() -> Result<Self> {
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: Vec<(String, String)> = vars
            .into_iter()
            .filter(|(key, _)| key.starts_with("HEAPLOG_"))
            .collect();
        let mut options = match vars.iter().find(|(key, _)| key == "HEAPLOG_CONFIG") {
            Some((_, path)) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        for (key, value) in &vars {
            let flag = || parse_flag(key, value);
            match key.as_str() {
                "HEAPLOG_LOG_ALLOC" => options.log_allocations = flag()?,
                "HEAPLOG_LOG_FREE" => options.log_frees = flag()?,
                "HEAPLOG_TIMESTAMPS" => options.show_timestamps = flag()?,
                "HEAPLOG_SPLIT" => options.split_output_per_process = flag()?,
                "HEAPLOG_SILENT" => options.silent = flag()?,
                "HEAPLOG_BUFFER" => options.buffer_output = flag()?,
                "HEAPLOG_DIR" => options.output_dir = PathBuf::from(value),
                "HEAPLOG_CONFIG" => {}
                other => log::warn!("ignoring unknown setting {other}"),
            }
        }
        Ok(options)
    }

    fn file_name(&self, stem: &str, pid: u32) -> PathBuf {
        let name = if self.split_output_per_process {
            format!("{stem}_{pid}.log")
        } else {
            format!("{stem}.log")
        };
        self.output_dir.join(name)
    }

    pub fn primary_log_path(&self, pid: u32) -> PathBuf {
        self.file_name(&self.log_name, pid)
    }

    pub fn exception_log_path(&self, pid: u32) -> PathBuf {
        self.file_name(&format!("{}_exceptions", self.log_name), pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let options = TraceOptions::default();
        assert!(options.log_allocations);
        assert!(options.log_frees);
        assert!(!options.show_timestamps);
        assert!(!options.split_output_per_process);
        assert!(!options.silent);
        assert!(options.buffer_output);
        assert!(options.noise_band.admits(0x401000));
        assert!(!options.noise_band.admits(0x1000));
        assert!(!options.noise_band.admits(0));
        assert!(options.fatal_codes.contains(0xC000_0005));
        assert!(!options.fatal_codes.contains(0x8000_0003));
    }

    #[test]
    fn env_overrides_defaults() {
        let options = TraceOptions::from_vars(vars(&[
            ("HEAPLOG_SILENT", "1"),
            ("HEAPLOG_BUFFER", "false"),
            ("HEAPLOG_SPLIT", "yes"),
            ("HEAPLOG_DIR", "/tmp/traces"),
            ("PATH", "/usr/bin"),
        ]))
        .unwrap();
        assert!(options.silent);
        assert!(!options.buffer_output);
        assert_eq!(
            options.primary_log_path(77),
            Path::new("/tmp/traces/heaplog_77.log")
        );
        assert_eq!(
            options.exception_log_path(77),
            Path::new("/tmp/traces/heaplog_exceptions_77.log")
        );
    }

    #[test]
    fn bad_flag_is_a_config_error() {
        let err = TraceOptions::from_vars(vars(&[("HEAPLOG_LOG_FREE", "maybe")])).unwrap_err();
        assert!(matches!(err, TraceError::Config(_)));
    }

    #[test]
    fn file_names_without_split() {
        let options = TraceOptions::default();
        assert_eq!(options.primary_log_path(5), Path::new("./heaplog.log"));
        assert_eq!(
            options.exception_log_path(5),
            Path::new("./heaplog_exceptions.log")
        );
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let options: TraceOptions = serde_json::from_str(
            r#"{"show_timestamps": true, "noise_band": {"min": "0x10000", "max": "0x7fffffff"}}"#,
        )
        .unwrap();
        assert!(options.show_timestamps);
        assert!(options.log_frees);
        assert_eq!(options.noise_band.min, 0x10000);
        assert_eq!(options.log_name, "heaplog");
    }
}
