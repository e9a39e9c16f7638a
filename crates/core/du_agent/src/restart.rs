use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("The restart command {command:?} failed")]
    CommandFailed { command: String },

    #[error(transparent)]
    FromIo(#[from] std::io::Error),
}

/// Reboot and agent-restart, as requested by deployment results.
#[async_trait]
pub trait RestartOps: Send + Sync {
    async fn reboot(&self) -> Result<(), RestartError>;
    async fn restart_agent(&self) -> Result<(), RestartError>;
}

/// System-level restart commands, `sync`ed first.
#[derive(Debug)]
pub struct SystemRestart {
    pub reboot_command: Vec<String>,
    pub agent_restart_command: Vec<String>,
}

impl Default for SystemRestart {
    fn default() -> Self {
        SystemRestart {
            reboot_command: vec!["init".to_string(), "6".to_string()],
            agent_restart_command: vec![
                "systemctl".to_string(),
                "restart".to_string(),
                "du-agent".to_string(),
            ],
        }
    }
}

impl SystemRestart {
    async fn run(&self, command_line: &[String]) -> Result<(), RestartError> {
        run_command(&["sync".to_string()]).await?;
        run_command(command_line).await
    }
}

async fn run_command(command_line: &[String]) -> Result<(), RestartError> {
    let Some((program, args)) = command_line.split_first() else {
        return Ok(());
    };
    info!("Running {command_line:?}");
    let status = Command::new(program).args(args).status().await?;
    // An interrupted command can be the restart taking effect
    if status.code().is_some_and(|code| code != 0) {
        return Err(RestartError::CommandFailed {
            command: command_line.join(" "),
        });
    }
    Ok(())
}

#[async_trait]
impl RestartOps for SystemRestart {
    async fn reboot(&self) -> Result<(), RestartError> {
        self.run(&self.reboot_command).await
    }

    async fn restart_agent(&self) -> Result<(), RestartError> {
        self.run(&self.agent_restart_command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_failing_command_is_an_error() {
        let restart = SystemRestart {
            reboot_command: vec!["false".to_string()],
            agent_restart_command: vec![],
        };
        assert!(matches!(
            restart.reboot().await,
            Err(RestartError::CommandFailed { .. })
        ));
    }

    #[tokio::test]
    async fn a_succeeding_command_is_fine() {
        let restart = SystemRestart {
            reboot_command: vec!["true".to_string()],
            agent_restart_command: vec!["true".to_string()],
        };
        restart.reboot().await.unwrap();
        restart.restart_agent().await.unwrap();
    }
}
