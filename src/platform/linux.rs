//! Linux implementations: nftables, iproute2 and init scripts

use super::{Firewall, PlatformError, RoutingManager, ServiceControl};
use std::io::Write;
use std::process::{Command, Output, Stdio};
use tracing::debug;

fn describe(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

fn check(command: String, output: Output) -> Result<(), PlatformError> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlatformError::CommandFailed {
            command,
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(())
}

fn run(program: &str, args: &[&str]) -> Result<(), PlatformError> {
    let command = describe(program, args);
    debug!("Running {}", command);
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| PlatformError::Spawn {
            command: command.clone(),
            source,
        })?;
    check(command, output)
}

pub struct NftFirewall {
    nft: String,
}

impl NftFirewall {
    pub fn new(nft: &str) -> Self {
        Self {
            nft: nft.to_string(),
        }
    }
}

impl Default for NftFirewall {
    fn default() -> Self {
        Self::new("nft")
    }
}

impl Firewall for NftFirewall {
    fn run_script(&self, script: &str) -> Result<(), PlatformError> {
        let command = describe(&self.nft, &["-f", "-"]);
        let spawn_err = |source| PlatformError::Spawn {
            command: command.clone(),
            source,
        };

        let mut child = Command::new(&self.nft)
            .args(["-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).map_err(spawn_err)?;
        }

        let output = child.wait_with_output().map_err(spawn_err)?;
        check(command, output)
    }
}

pub struct LinuxRoutingManager;

impl LinuxRoutingManager {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxRoutingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingManager for LinuxRoutingManager {
    fn ensure_policy_route(
        &self,
        mark: &str,
        table: u32,
        interface: &str,
    ) -> Result<(), PlatformError> {
        let table = table.to_string();
        for family in ["-4", "-6"] {
            // Repeated applies must not stack duplicate rules
            let _ = run(
                "ip",
                &[family, "rule", "del", "fwmark", mark, "table", &table],
            );
            run(
                "ip",
                &[family, "rule", "add", "fwmark", mark, "table", &table],
            )?;
            run(
                "ip",
                &[
                    family, "route", "replace", "default", "dev", interface, "table", &table,
                ],
            )?;
        }
        Ok(())
    }
}

/// Restart a daemon by running its configured command line
pub struct InitScript {
    command: Vec<String>,
}

impl InitScript {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl ServiceControl for InitScript {
    fn restart(&self) -> Result<(), PlatformError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(PlatformError::EmptyCommand)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run(program, &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_command() {
        assert_eq!(describe("nft", &["-f", "-"]), "nft -f -");
    }

    #[test]
    fn test_empty_init_script() {
        let script = InitScript::new(vec![]);
        assert!(matches!(script.restart(), Err(PlatformError::EmptyCommand)));
    }

    #[test]
    fn test_init_script_reports_failure() {
        let ok = InitScript::new(vec!["true".to_string()]);
        assert!(ok.restart().is_ok());

        let failing = InitScript::new(vec!["false".to_string()]);
        assert!(matches!(
            failing.restart(),
            Err(PlatformError::CommandFailed { .. })
        ));

        let missing = InitScript::new(vec!["/nonexistent/splitroute-init".to_string()]);
        assert!(matches!(missing.restart(), Err(PlatformError::Spawn { .. })));
    }
}
