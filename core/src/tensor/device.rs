//! Logical device descriptors.
//!
//! Every graph node carries a `DeviceSpec` telling the external runtime where to run it. A spec
//! is a partial address in a cluster:
//!
//! ```text
//! /job:worker/replica:0/task:1/device:GPU:3
//! ```
//!
//! Any component may be missing. `/gpu:0` is a GPU on whatever host builds the graph, `/job:ps`
//! is "some device of the parameter-server job", and the empty spec means "unplaced".
//!
//! # ML Context
//!
//! Placement matters for data parallelism because the cost of an aggregation is dominated by
//! copies between devices. Two devices with the same `(job, replica, task)` share a host and talk
//! over PCIe/NVLink; anything else crosses the network.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Kind of hardware a device spec names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

impl DeviceType {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "CPU",
            DeviceType::Gpu => "GPU",
        }
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "gpu" => Ok(DeviceType::Gpu),
            _ => Err(Error::Device(format!("unknown device type {s}"))),
        }
    }
}

/// A possibly partial device address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceSpec {
    pub job: Option<String>,
    pub replica: Option<usize>,
    pub task: Option<usize>,
    pub device_type: Option<DeviceType>,
    pub index: Option<usize>,
}

impl DeviceSpec {
    /// `/cpu:<index>` on the local host.
    pub fn cpu(index: usize) -> Self {
        Self {
            device_type: Some(DeviceType::Cpu),
            index: Some(index),
            ..Self::default()
        }
    }

    /// `/gpu:<index>` on the local host.
    pub fn gpu(index: usize) -> Self {
        Self {
            device_type: Some(DeviceType::Gpu),
            index: Some(index),
            ..Self::default()
        }
    }

    /// `/job:<job>/replica:0/task:<task>`, a whole host.
    pub fn task(job: &str, task: usize) -> Self {
        Self {
            job: Some(job.to_string()),
            replica: Some(0),
            task: Some(task),
            ..Self::default()
        }
    }

    /// Returns `self` with the device part replaced.
    pub fn with_device(mut self, device_type: DeviceType, index: usize) -> Self {
        self.device_type = Some(device_type);
        self.index = Some(index);
        self
    }

    /// True for the empty spec.
    pub fn is_unplaced(&self) -> bool {
        *self == Self::default()
    }

    pub fn is_gpu(&self) -> bool {
        self.device_type == Some(DeviceType::Gpu)
    }

    pub fn is_cpu(&self) -> bool {
        self.device_type == Some(DeviceType::Cpu)
    }

    /// The `(job, replica, task)` triple identifying the host of this device.
    pub fn host(&self) -> DeviceSpec {
        DeviceSpec {
            job: self.job.clone(),
            replica: self.replica,
            task: self.task,
            device_type: None,
            index: None,
        }
    }

    /// Two devices on the same host can exchange data without crossing the network.
    pub fn same_host(&self, other: &DeviceSpec) -> bool {
        self.job == other.job && self.task == other.task
    }

    /// Fills every component missing in `self` from `base`.
    pub fn merged_with(&self, base: &DeviceSpec) -> DeviceSpec {
        DeviceSpec {
            job: self.job.clone().or_else(|| base.job.clone()),
            replica: self.replica.or(base.replica),
            task: self.task.or(base.task),
            device_type: self.device_type.or(base.device_type),
            index: self.index.or(base.index),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(job) = &self.job {
            write!(f, "/job:{job}")?;
        }
        if let Some(replica) = self.replica {
            write!(f, "/replica:{replica}")?;
        }
        if let Some(task) = self.task {
            write!(f, "/task:{task}")?;
        }
        if let Some(device_type) = self.device_type {
            write!(f, "/device:{}:{}", device_type.name(), self.index.unwrap_or(0))?;
        }
        Ok(())
    }
}

fn parse_index(s: &str, what: &str, spec: &str) -> Result<usize> {
    s.parse()
        .map_err(|_| Error::Device(format!("bad {what} '{s}' in '{spec}'")))
}

impl FromStr for DeviceSpec {
    type Err = Error;

    /// Parses the `/job:x/replica:r/task:t/device:GPU:i` family, including the short
    /// `/gpu:0` and `/cpu:0` forms. The empty string parses to the unplaced spec.
    fn from_str(s: &str) -> Result<Self> {
        let mut spec = DeviceSpec::default();
        for part in s.split('/').filter(|p| !p.is_empty()) {
            let fields: Vec<&str> = part.split(':').collect();
            match fields.as_slice() {
                ["job", job] if !job.is_empty() => spec.job = Some(job.to_string()),
                ["replica", r] => spec.replica = Some(parse_index(r, "replica", s)?),
                ["task", t] => spec.task = Some(parse_index(t, "task", s)?),
                ["device", kind, index] => {
                    spec.device_type = Some(kind.parse()?);
                    spec.index = Some(parse_index(index, "device index", s)?);
                }
                [kind, index] => {
                    spec.device_type = Some(kind.parse()?);
                    spec.index = Some(parse_index(index, "device index", s)?);
                }
                _ => return Err(Error::Device(format!("cannot parse '{part}' in '{s}'"))),
            }
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_spec() {
        let d: DeviceSpec = "/job:worker/replica:0/task:2/device:GPU:3".parse().unwrap();
        assert_eq!(d.job.as_deref(), Some("worker"));
        assert_eq!(d.replica, Some(0));
        assert_eq!(d.task, Some(2));
        assert_eq!(d.device_type, Some(DeviceType::Gpu));
        assert_eq!(d.index, Some(3));
        assert_eq!(d.to_string(), "/job:worker/replica:0/task:2/device:GPU:3");
    }

    #[test]
    fn test_parse_short_forms() {
        assert_eq!("/gpu:1".parse::<DeviceSpec>().unwrap(), DeviceSpec::gpu(1));
        assert_eq!("/CPU:0".parse::<DeviceSpec>().unwrap(), DeviceSpec::cpu(0));
        assert!("".parse::<DeviceSpec>().unwrap().is_unplaced());
    }

    #[test]
    fn test_parse_prefix_plus_short_device() {
        let d: DeviceSpec = "/job:localhost/cpu:0".parse().unwrap();
        assert_eq!(d.job.as_deref(), Some("localhost"));
        assert!(d.is_cpu());
    }

    #[test]
    fn test_parse_errors() {
        assert!("/job:worker/task:x".parse::<DeviceSpec>().is_err());
        assert!("/tpu:0".parse::<DeviceSpec>().is_err());
        assert!("/job:a:b:c:d".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn test_same_host() {
        let a = DeviceSpec::task("worker", 0).with_device(DeviceType::Gpu, 0);
        let b = DeviceSpec::task("worker", 0).with_device(DeviceType::Cpu, 0);
        let c = DeviceSpec::task("worker", 1).with_device(DeviceType::Gpu, 0);
        assert!(a.same_host(&b));
        assert!(!a.same_host(&c));
        assert_eq!(a.host(), DeviceSpec::task("worker", 0));
    }

    #[test]
    fn test_merged_with() {
        let base = DeviceSpec::task("worker", 3);
        let merged = DeviceSpec::gpu(1).merged_with(&base);
        assert_eq!(merged.to_string(), "/job:worker/replica:0/task:3/device:GPU:1");
    }
}
