//! Per-invocation state shared by all commands

use std::path::PathBuf;

use anyhow::{Context, Result};

use ft_core::config::{Paths, Settings};
use ft_core::error::PreconditionError;
use ft_core::guard::{self, Requirement};
use ft_core::{Cloudflared, ConfigStore, Registry, SystemProcessLister};

/// Resolved settings, file locations and external collaborators
pub struct AppContext {
    pub paths: Paths,
    pub settings: Settings,
    pub store: ConfigStore,
    pub gateway: Cloudflared,
    pub lister: SystemProcessLister,
}

impl AppContext {
    pub fn new(config_dir: PathBuf, settings: Settings) -> Self {
        let paths = Paths::new(config_dir, &settings);
        Self {
            store: ConfigStore::new(paths.registry_file()),
            gateway: Cloudflared::new(settings.cloudflared_bin.clone()),
            lister: SystemProcessLister::default(),
            paths,
            settings,
        }
    }

    /// Fail with a precondition error unless the environment meets `requirement`
    pub fn require(&self, requirement: Requirement) -> Result<(), PreconditionError> {
        guard::check(&self.gateway, &self.paths, requirement)
    }

    pub fn load_registry(&self) -> Registry {
        self.store.load()
    }

    pub fn save_registry(&self, registry: &Registry) -> Result<()> {
        self.store
            .save(registry)
            .with_context(|| format!("Failed to save registry to {:?}", self.store.path()))
    }
}
