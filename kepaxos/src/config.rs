//! Replica construction inputs (§6) plus the optional TOML loading
//! convenience the teacher crate offers under its own `toml_config`
//! feature.

use crate::ballot::MAX_REPLICAS;
use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Asymmetric read/write quorum sizing, carried over from the teacher's own
/// `FlexibleQuorum` concept. This engine's *commit* quorum is fixed by the
/// spec (`floor(N/2)` responses, see [`crate::engine::required_votes`]); this
/// struct exists so an embedder's surrounding cache can size its own
/// read-repair fan-out independently, and is not consulted by the protocol
/// engine itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    any(feature = "serde_types", feature = "toml_config"),
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct FlexibleQuorum {
    pub read_quorum_size: usize,
    pub write_quorum_size: usize,
}

/// Construction inputs for a [`crate::replica::Replica`] (§6).
#[derive(Clone, Debug)]
#[cfg_attr(
    any(feature = "serde_types", feature = "toml_config"),
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ReplicaConfig {
    /// 0-based index of this replica into `peers`.
    pub my_index: u8,
    /// Named peers, length <= 256. Includes this replica's own entry.
    pub peers: Vec<String>,
    /// Location of the persistent log, interpreted by the chosen `Log` impl.
    pub dbfile: PathBuf,
    /// Submit deadline, in seconds. `0` maps to the 30s default.
    #[cfg_attr(
        any(feature = "serde_types", feature = "toml_config"),
        serde(with = "duration_secs")
    )]
    pub timeout: Duration,
    pub flexible_quorum: Option<FlexibleQuorum>,
}

impl ReplicaConfig {
    pub fn new(
        my_index: u8,
        peers: Vec<String>,
        dbfile: impl Into<PathBuf>,
        timeout_secs: u64,
    ) -> Result<Self, ConfigError> {
        let cfg = ReplicaConfig {
            my_index,
            peers,
            dbfile: dbfile.into(),
            timeout: Duration::from_secs(if timeout_secs == 0 {
                DEFAULT_TIMEOUT_SECS
            } else {
                timeout_secs
            }),
            flexible_quorum: None,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.len() > MAX_REPLICAS {
            return Err(ConfigError::TooManyPeers(self.peers.len()));
        }
        if self.my_index as usize >= self.peers.len() {
            return Err(ConfigError::IndexOutOfRange {
                index: self.my_index as usize,
                peer_count: self.peers.len(),
            });
        }
        Ok(())
    }

    #[cfg(feature = "toml_config")]
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: ReplicaConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[cfg(feature = "toml_config")]
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(any(feature = "serde_types", feature = "toml_config"))]
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_defaults_to_thirty_seconds() {
        let cfg = ReplicaConfig::new(0, vec!["a".into(), "b".into()], "db", 0).unwrap();
        assert_eq!(cfg.timeout, Duration::from_secs(30));
    }

    #[test]
    fn index_out_of_range_is_rejected() {
        let err = ReplicaConfig::new(2, vec!["a".into(), "b".into()], "db", 1).unwrap_err();
        assert!(matches!(err, ConfigError::IndexOutOfRange { .. }));
    }
}
