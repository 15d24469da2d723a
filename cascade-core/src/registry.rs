//! Explicit mapping from a computation type name, as found in topology descriptors, to the
//! function building it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::computation::{Computation, ComputationFactory, ComputationMetadata};
use crate::context::ComputationContext;
use crate::error::{Error, Result};
use crate::record::Record;

/// Builds a computation given the name it runs under.
pub type ComputationConstructor = Arc<dyn Fn(&str) -> Box<dyn Computation> + Send + Sync>;

pub const FORWARD: &str = "forward";
pub const LOG: &str = "log";

#[derive(Clone, Default)]
pub struct ComputationRegistry {
    constructors: BTreeMap<String, ComputationConstructor>,
}

impl fmt::Debug for ComputationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

impl ComputationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the `forward` and `log` computations.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(FORWARD, |name: &str| {
            Box::new(Forward::new(name)) as Box<dyn Computation>
        });
        registry.register(LOG, |name: &str| {
            Box::new(LogRecords::new(name)) as Box<dyn Computation>
        });
        registry
    }

    /// Registers a constructor, replacing any previous one for the type.
    pub fn register<F>(&mut self, type_name: &str, constructor: F)
    where
        F: Fn(&str) -> Box<dyn Computation> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_name.to_string(), Arc::new(constructor));
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// A factory building `type_name` computations named `name`.
    pub fn factory(&self, type_name: &str, name: &str) -> Result<ComputationFactory> {
        let constructor = self.constructors.get(type_name).cloned().ok_or_else(|| {
            Error::Config(format!("unknown computation type {type_name} for {name}"))
        })?;
        let name = name.to_string();
        Ok(Arc::new(move || constructor(&name)))
    }
}

/// Copies every record of `i1` to `o1`.
pub struct Forward {
    metadata: ComputationMetadata,
}

impl Forward {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ComputationMetadata::new(name, 1, 1),
        }
    }
}

impl Computation for Forward {
    fn metadata(&self) -> &ComputationMetadata {
        &self.metadata
    }

    fn process_record(
        &mut self,
        context: &mut ComputationContext,
        _input: &str,
        record: &Record,
    ) -> Result<()> {
        context.produce("o1", record.clone())
    }
}

/// Logs every record of `i1`.
pub struct LogRecords {
    metadata: ComputationMetadata,
}

impl LogRecords {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ComputationMetadata::new(name, 1, 0),
        }
    }
}

impl Computation for LogRecords {
    fn metadata(&self) -> &ComputationMetadata {
        &self.metadata
    }

    fn process_record(
        &mut self,
        context: &mut ComputationContext,
        input: &str,
        record: &Record,
    ) -> Result<()> {
        info!(
            computation = %context.computation_name(),
            input,
            offset = ?context.last_offset(),
            key = %record.key_str(),
            watermark = %record.watermark,
            size = record.payload.len(),
            "Record"
        );
        Ok(())
    }
}
