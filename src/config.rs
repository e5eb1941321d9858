//! Session configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields the
//! stock five-class setup.
//!
//! ```toml
//! [session]
//! classes = ["yes", "no", "Other"]
//! threshold = 0.6
//!
//! [training]
//! epochs = 20
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::classes::ClassList;
use crate::error::ConfigError;
use crate::network::WindowShape;
use crate::stream::{ListenOptions, StreamMode};
use crate::{
    BATCH_SIZE, EPOCHS, FREQUENCY_BINS, KERNEL_BINS, LEARNING_RATE, NUM_FRAMES, OVERLAP_FACTOR,
    POOL_SIZE, PROBABILITY_THRESHOLD,
};

/// Narrowest window whose conv output still fills one pooling window.
pub const MIN_BINS: usize = KERNEL_BINS + POOL_SIZE[1] - 1;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub session: SessionConfig,
    pub stream: StreamConfig,
    pub training: TrainingConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub classes: ClassList,
    /// Display threshold a class probability must exceed to count as active.
    pub threshold: f32,
    /// Seed for weight init and shuffling; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            classes: ClassList::default(),
            threshold: PROBABILITY_THRESHOLD,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub frames: usize,
    pub bins: usize,
    pub overlap_factor: f32,
    /// Only passed to the stream in classification mode.
    pub probability_threshold: f32,
    pub invoke_on_noise_and_unknown: bool,
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frames: NUM_FRAMES,
            bins: FREQUENCY_BINS,
            overlap_factor: OVERLAP_FACTOR,
            probability_threshold: PROBABILITY_THRESHOLD,
            invoke_on_noise_and_unknown: true,
            channel_capacity: 256,
        }
    }
}

impl StreamConfig {
    pub fn window_shape(&self) -> WindowShape {
        WindowShape::new(self.frames, self.bins, 1)
    }

    pub fn listen_options(&self, mode: StreamMode) -> ListenOptions {
        ListenOptions {
            overlap_factor: self.overlap_factor,
            probability_threshold: match mode {
                StreamMode::Classification => Some(self.probability_threshold),
                StreamMode::LabeledCollection => None,
            },
            invoke_on_noise_and_unknown: self.invoke_on_noise_and_unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub shuffle: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: EPOCHS,
            batch_size: BATCH_SIZE,
            learning_rate: LEARNING_RATE,
            shuffle: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory backing `local://` slots.
    pub root: PathBuf,
    /// Directory receiving `downloads://` exports.
    pub downloads: PathBuf,
    pub local_model: String,
    pub export_model: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("models"),
            downloads: PathBuf::from("downloads"),
            local_model: "local://my-model".to_string(),
            export_model: "downloads://my-model".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        contents.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);

        if !in_unit(self.session.threshold) {
            return Err(ConfigError::invalid(format!(
                "session.threshold {} must lie within [0, 1]",
                self.session.threshold
            )));
        }
        if !in_unit(self.stream.probability_threshold) {
            return Err(ConfigError::invalid(format!(
                "stream.probability_threshold {} must lie within [0, 1]",
                self.stream.probability_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.stream.overlap_factor) {
            return Err(ConfigError::invalid(format!(
                "stream.overlap_factor {} must lie within [0, 1)",
                self.stream.overlap_factor
            )));
        }
        if self.stream.frames == 0 {
            return Err(ConfigError::invalid("stream.frames must be > 0"));
        }
        if self.stream.bins < MIN_BINS {
            return Err(ConfigError::invalid(format!(
                "stream.bins must be >= {MIN_BINS}"
            )));
        }
        if self.stream.channel_capacity == 0 {
            return Err(ConfigError::invalid("stream.channel_capacity must be > 0"));
        }
        if self.training.epochs == 0 {
            return Err(ConfigError::invalid("training.epochs must be > 0"));
        }
        if self.training.batch_size == 0 {
            return Err(ConfigError::invalid("training.batch_size must be > 0"));
        }
        if !(self.training.learning_rate > 0.0) {
            return Err(ConfigError::invalid("training.learning_rate must be > 0"));
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Topology;

    #[test]
    fn empty_document_yields_defaults() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.session.classes.len(), 5);
        assert_eq!(config.training.epochs, 10);
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.stream.frames, 9);
        assert_eq!(config.stream.bins, 232);
    }

    #[test]
    fn parses_custom_values() {
        let toml = r#"
            [session]
            classes = ["yes", "no", "Other"]
            threshold = 0.6
            seed = 7

            [training]
            epochs = 3
            shuffle = false

            [store]
            local_model = "local://words"
        "#;
        let config: Config = toml.parse().unwrap();
        assert_eq!(config.session.classes.len(), 3);
        assert_eq!(config.session.threshold, 0.6);
        assert_eq!(config.session.seed, Some(7));
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.batch_size, 16);
        assert!(!config.training.shuffle);
        assert_eq!(config.store.local_model, "local://words");
    }

    #[test]
    fn sample_config_spells_out_the_defaults() {
        let config: Config = include_str!("../config/kws.toml").parse().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn rejects_single_class() {
        let err = "[session]\nclasses = [\"yes\"]".parse::<Config>();
        assert!(err.is_err());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = "[session]\nthreshold = 1.5".parse::<Config>().unwrap_err();
        assert!(err.to_string().contains("session.threshold"));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = "[training]\nbatch_size = 0".parse::<Config>().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn narrowest_accepted_window_builds_a_topology() {
        let err = "[stream]\nbins = 3".parse::<Config>().unwrap_err();
        assert!(err.to_string().contains("stream.bins must be >= 4"));

        let config: Config = "[stream]\nbins = 4".parse().unwrap();
        let topology = Topology::for_window(
            config.stream.window_shape(),
            config.session.classes.len(),
            config.training.learning_rate,
        );
        assert!(topology.is_ok());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!("[training]\nepoch = 3".parse::<Config>().is_err());
    }

    #[test]
    fn listen_options_follow_mode() {
        let stream = StreamConfig::default();
        let collect = stream.listen_options(StreamMode::LabeledCollection);
        assert_eq!(collect.probability_threshold, None);
        assert!(collect.invoke_on_noise_and_unknown);

        let classify = stream.listen_options(StreamMode::Classification);
        assert_eq!(classify.probability_threshold, Some(0.75));
        assert_eq!(classify.overlap_factor, 0.999);
    }

    #[test]
    fn load_from_missing_file_reports_path() {
        let err = Config::load_from_file("does/not/exist.toml").unwrap_err();
        assert!(err.to_string().contains("does/not/exist.toml"));
    }
}
