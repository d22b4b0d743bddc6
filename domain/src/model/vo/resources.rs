use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::InvalidResources;

/// What a job needs from the scheduler.
///
/// Shared behind an `Arc` by the job descriptor that owns it, so it can't change after being
/// attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct ResourceSpec {
    /// Cores per job
    #[builder(default = 1)]
    #[serde(default = "ResourceSpec::default_cores")]
    pub cores: u32,
    /// Memory per job
    #[builder(default, setter(strip_option))]
    #[serde(default, with = "memory")]
    pub memory: Option<ByteSize>,
    /// Wall clock limit, `None` leaves it to the backend
    #[builder(default, setter(strip_option))]
    #[serde(default, with = "walltime")]
    pub walltime: Option<Duration>,
    /// GPUs per job
    #[builder(default)]
    #[serde(default)]
    pub gpus: u32,
    /// Variables exported before the commands run
    #[builder(default)]
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Absolute working directory
    #[builder(setter(into))]
    pub workdir: PathBuf,
}

impl ResourceSpec {
    pub fn default_cores() -> u32 {
        1
    }

    /// Checks everything that can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<(), InvalidResources> {
        if self.cores == 0 {
            return Err(InvalidResources::ZeroCores);
        }
        if !self.workdir.is_absolute() {
            return Err(InvalidResources::RelativeWorkdir(self.workdir.clone()));
        }
        if let Some(name) = self.environment.keys().find(|name| !is_env_name(name)) {
            return Err(InvalidResources::EnvironmentName(name.clone()));
        }
        Ok(())
    }

    /// The workdir must exist by the time the job is handed to a backend.
    pub fn check_workdir(&self) -> Result<(), InvalidResources> {
        match std::fs::metadata(&self.workdir) {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(InvalidResources::MissingWorkdir(self.workdir.clone())),
        }
    }

    /// Memory rounded up to whole MiB, which is what every batch directive expects.
    pub fn memory_mb(&self) -> Option<u64> {
        self.memory.map(|m| m.as_u64().div_ceil(1024 * 1024))
    }
}

pub fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Memory is stored as plain bytes, and read back from either bytes or a human string
/// such as `"4 GiB"`.
mod memory {
    use bytesize::ByteSize;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Human(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<ByteSize>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(m) => s.serialize_some(&m.as_u64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ByteSize>, D::Error> {
        match Option::<Raw>::deserialize(d)? {
            None => Ok(None),
            Some(Raw::Bytes(b)) => Ok(Some(ByteSize::b(b))),
            Some(Raw::Human(s)) => s.parse::<ByteSize>().map(Some).map_err(serde::de::Error::custom),
        }
    }
}

mod walltime {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
