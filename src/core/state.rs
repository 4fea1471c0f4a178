//! Shared state container passed through every step of a build.
//!
//! Keys are a closed set of well-known slots and values are a tagged union,
//! so a step reading the wrong shape gets `None` instead of a failed runtime
//! cast. Keys are write-once per stage by convention; `put` reports when it
//! replaces a value.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};
use tracing::debug;

use crate::adapters::{Image, KeyPair};
use crate::error::BuildError;

/// Well-known state slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKey {
    /// Terminal error recorded by a halting step
    Error,
    SourceImage,
    KeyPair,
    VpcId,
    SubnetId,
    SecurityGroupId,
    InstanceId,
    InstanceAddress,
    /// Id of the baked image in the build region
    ImageId,
    /// Region -> image id for every usable copy
    Images,
    /// Metadata exposed on the artifact
    GeneratedData,
}

impl StateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::SourceImage => "source_image",
            Self::KeyPair => "key_pair",
            Self::VpcId => "vpc_id",
            Self::SubnetId => "subnet_id",
            Self::SecurityGroupId => "security_group_id",
            Self::InstanceId => "instance_id",
            Self::InstanceAddress => "instance_address",
            Self::ImageId => "image",
            Self::Images => "images",
            Self::GeneratedData => "generated_data",
        }
    }
}

/// Value stored under a `StateKey`
#[derive(Debug, Clone)]
pub enum StateValue {
    Id(String),
    Image(Image),
    KeyPair(KeyPair),
    Images(BTreeMap<String, String>),
    Data(Map<String, Value>),
    Error(BuildError),
}

/// The mutable bag every step reads from and writes to.
///
/// Created once per build and consumed by the artifact assembler.
#[derive(Debug, Default)]
pub struct StateBag {
    values: HashMap<StateKey, StateValue>,
}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: StateKey) -> Option<&StateValue> {
        self.values.get(&key)
    }

    pub fn contains(&self, key: StateKey) -> bool {
        self.values.contains_key(&key)
    }

    /// Store a value, returning whatever it replaced
    pub fn put(&mut self, key: StateKey, value: StateValue) -> Option<StateValue> {
        let previous = self.values.insert(key, value);
        if previous.is_some() {
            debug!(key = key.as_str(), "Overwriting state value");
        }
        previous
    }

    pub fn remove(&mut self, key: StateKey) -> Option<StateValue> {
        self.values.remove(&key)
    }

    /// Keys currently present
    pub fn keys(&self) -> Vec<StateKey> {
        let mut keys: Vec<StateKey> = self.values.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn id(&self, key: StateKey) -> Option<&str> {
        match self.values.get(&key) {
            Some(StateValue::Id(id)) => Some(id),
            _ => None,
        }
    }

    /// Read an id a previous step must have recorded
    pub fn require_id(&self, step: &str, key: StateKey) -> Result<String, BuildError> {
        self.id(key)
            .map(str::to_string)
            .ok_or_else(|| BuildError::MissingState {
                step: step.to_string(),
                key,
            })
    }

    pub fn put_id(&mut self, key: StateKey, id: impl Into<String>) {
        self.put(key, StateValue::Id(id.into()));
    }

    pub fn error(&self) -> Option<&BuildError> {
        match self.values.get(&StateKey::Error) {
            Some(StateValue::Error(err)) => Some(err),
            _ => None,
        }
    }

    pub fn set_error(&mut self, err: BuildError) {
        self.put(StateKey::Error, StateValue::Error(err));
    }

    pub fn take_error(&mut self) -> Option<BuildError> {
        match self.values.remove(&StateKey::Error) {
            Some(StateValue::Error(err)) => Some(err),
            Some(other) => {
                self.values.insert(StateKey::Error, other);
                None
            }
            None => None,
        }
    }

    /// True when the build ended in an error that leaves no usable artifact
    pub fn is_failed_build(&self) -> bool {
        self.error().is_some_and(|err| !err.is_partial_propagation())
    }

    pub fn source_image(&self) -> Option<&Image> {
        match self.values.get(&StateKey::SourceImage) {
            Some(StateValue::Image(image)) => Some(image),
            _ => None,
        }
    }

    pub fn key_pair(&self) -> Option<&KeyPair> {
        match self.values.get(&StateKey::KeyPair) {
            Some(StateValue::KeyPair(key)) => Some(key),
            _ => None,
        }
    }

    pub fn images(&self) -> Option<&BTreeMap<String, String>> {
        match self.values.get(&StateKey::Images) {
            Some(StateValue::Images(images)) => Some(images),
            _ => None,
        }
    }

    /// Record a usable image for `region`
    pub fn insert_image(&mut self, region: impl Into<String>, image_id: impl Into<String>) {
        let entry = self
            .values
            .entry(StateKey::Images)
            .or_insert_with(|| StateValue::Images(BTreeMap::new()));
        if let StateValue::Images(images) = entry {
            images.insert(region.into(), image_id.into());
        }
    }

    pub fn generated_data(&self) -> Option<&Map<String, Value>> {
        match self.values.get(&StateKey::GeneratedData) {
            Some(StateValue::Data(data)) => Some(data),
            _ => None,
        }
    }

    /// Add one entry to the artifact metadata
    pub fn insert_generated(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let entry = self
            .values
            .entry(StateKey::GeneratedData)
            .or_insert_with(|| StateValue::Data(Map::new()));
        if let StateValue::Data(data) = entry {
            data.insert(name.into(), value.into());
        }
    }
}
