//! Platform-specific implementations
//!
//! The applier only talks to the system through these traits so it can be
//! exercised against in-memory fakes.

#[cfg(target_os = "linux")]
pub mod linux;

use crate::config::Config;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Command line is empty")]
    EmptyCommand,
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Kernel packet filter
pub trait Firewall: Send + Sync {
    /// Load `script` as one transaction; either all of it applies or none does
    fn run_script(&self, script: &str) -> Result<(), PlatformError>;
}

/// Policy routing for marked packets
pub trait RoutingManager: Send + Sync {
    fn ensure_policy_route(
        &self,
        mark: &str,
        table: u32,
        interface: &str,
    ) -> Result<(), PlatformError>;
}

/// An external daemon managed through its init script
pub trait ServiceControl: Send + Sync {
    fn restart(&self) -> Result<(), PlatformError>;
}

/// Everything the applier drives
#[derive(Clone)]
pub struct Platform {
    pub firewall: Arc<dyn Firewall>,
    pub routing: Arc<dyn RoutingManager>,
    pub resolver: Arc<dyn ServiceControl>,
    pub client: Arc<dyn ServiceControl>,
}

/// Get the system implementations for the current platform
pub fn get_platform(config: &Config) -> Result<Platform, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Platform {
            firewall: Arc::new(linux::NftFirewall::new(&config.firewall.nft)),
            routing: Arc::new(linux::LinuxRoutingManager::new()),
            resolver: Arc::new(linux::InitScript::new(
                config.resolver.reload_command.clone(),
            )),
            client: Arc::new(linux::InitScript::new(config.client.restart_command.clone())),
        })
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Err(PlatformError::UnsupportedPlatform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_error_display() {
        let err = PlatformError::CommandFailed {
            command: "nft -f -".to_string(),
            stderr: "Error: No such file or directory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "`nft -f -` failed: Error: No such file or directory"
        );

        let err = PlatformError::UnsupportedPlatform;
        assert_eq!(err.to_string(), "Unsupported platform");
    }

    #[test]
    fn test_get_platform_returns_ok() {
        #[cfg(target_os = "linux")]
        {
            let result = get_platform(&Config::default());
            assert!(result.is_ok());
        }
    }
}
