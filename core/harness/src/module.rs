use super::{DeathReason, Heart};
use async_trait::async_trait;
use futures::{pin_mut, select, FutureExt};
use library::{BoxedError, EmptyResult};
use std::any::type_name;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

/// Reason why a module has terminated
#[derive(Error, Debug)]
pub enum ModuleTerminationReason {
    /// Startup routine threw an error
    #[error("startup routine threw an error")]
    StartupFailed(#[source] BoxedError),
    /// Core run loop threw an error
    #[error("error during operation")]
    OperationalError(#[source] BoxedError),
    /// [`Heart`] of the runner died
    #[error("heart died: {0}")]
    HeartDied(DeathReason),
    /// Run loop exited cleanly
    #[error("run loop exited cleanly")]
    ExitedNormally,
    /// Timeout during startup
    #[error("timeout during startup")]
    Timeout,
}

impl ModuleTerminationReason {
    /// Whether the module terminated due to a problem rather than by finishing or being stopped
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::ExitedNormally | Self::HeartDied(_))
    }
}

/// Executable module
#[async_trait]
pub trait Module {
    /// Executed before running the core loop
    async fn pre_startup(&mut self) -> EmptyResult {
        Ok(())
    }

    /// Core run loop of the module
    ///
    /// Returning ends the module. The loop is dropped at its next suspension point when the
    /// heart of the runner dies, e.g. because the process received SIGTERM.
    async fn run(&mut self) -> EmptyResult;

    /// Shutdown hook executed after the core loop has terminated
    #[instrument(skip(self))]
    async fn post_shutdown(&mut self, termination_reason: &ModuleTerminationReason) {
        if termination_reason.is_failure() {
            error!(reason = %termination_reason, "Module terminated with an error");
        } else {
            info!(reason = %termination_reason, "Module exited normally");
        }
    }
}

/// Runner for [`Module`] implementations
pub struct ModuleRunner {
    startup_timeout: Duration,
    shutdown_timeout: Duration,
}

impl ModuleRunner {
    /// Creates a new instance with custom timeouts for the startup and shutdown hooks
    pub fn new(startup_timeout: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            startup_timeout,
            shutdown_timeout,
        }
    }
}

impl Default for ModuleRunner {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl ModuleRunner {
    /// Executes a [`Module`] until it exits or the process is asked to terminate
    /// and returns the reason why it terminated.
    pub async fn run<M: Module + Send>(&self, module: M) -> ModuleTerminationReason {
        self.run_with_heart(module, Heart::without_heart_stone())
            .await
    }

    /// Executes a [`Module`] until it exits or the given heart dies,
    /// calling the lifecycle functions in order.
    #[instrument(skip(self, module, heart), fields(module_name = type_name::<M>()))]
    pub async fn run_with_heart<M: Module + Send>(
        &self,
        mut module: M,
        mut heart: Heart,
    ) -> ModuleTerminationReason {
        info!("Commencing module startup sequence");
        let startup = timeout(self.startup_timeout, module.pre_startup()).await;

        let termination_reason = match startup {
            Ok(Ok(_)) => Self::run_loop(&mut module, &mut heart).await,
            Ok(Err(error)) => {
                error!(?error, "Module startup sequence encountered an error");
                ModuleTerminationReason::StartupFailed(error)
            }
            Err(_) => {
                error!("Module startup sequence timed out");
                ModuleTerminationReason::Timeout
            }
        };

        info!("Commencing module shutdown sequence");
        let result = timeout(
            self.shutdown_timeout,
            module.post_shutdown(&termination_reason),
        )
        .await;

        if result.is_err() {
            error!("Module shutdown sequence timed out");
        }

        termination_reason
    }

    async fn run_loop<M: Module + Send>(
        module: &mut M,
        heart: &mut Heart,
    ) -> ModuleTerminationReason {
        info!("Executing module run procedure");

        let run = module.run().fuse();
        let death = heart.death().fuse();
        pin_mut!(run, death);

        select! {
            result = run => match result {
                Ok(()) => {
                    debug!("Module run procedure completed successfully");
                    ModuleTerminationReason::ExitedNormally
                }
                Err(error) => {
                    info!(?error, "Module run procedure encountered an error");
                    ModuleTerminationReason::OperationalError(error)
                }
            },
            reason = death => {
                info!(%reason, "Heart died, stopping module");
                ModuleTerminationReason::HeartDied(reason)
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        fail_startup: bool,
        fail_run: bool,
        run_forever: bool,
        stall_startup: bool,
        shutdown_reason: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl Module for Recorder {
        async fn pre_startup(&mut self) -> EmptyResult {
            if self.stall_startup {
                futures::future::pending::<()>().await;
            }

            if self.fail_startup {
                return Err("startup failed".into());
            }

            Ok(())
        }

        async fn run(&mut self) -> EmptyResult {
            if self.run_forever {
                futures::future::pending::<()>().await;
            }

            if self.fail_run {
                return Err("run failed".into());
            }

            Ok(())
        }

        async fn post_shutdown(&mut self, termination_reason: &ModuleTerminationReason) {
            *self.shutdown_reason.lock().unwrap() = Some(termination_reason.to_string());
        }
    }

    #[tokio::test]
    async fn exit_normally() {
        let shutdown_reason = Arc::new(Mutex::new(None));
        let module = Recorder {
            shutdown_reason: shutdown_reason.clone(),
            ..Default::default()
        };

        let reason = ModuleRunner::default().run(module).await;

        assert!(matches!(reason, ModuleTerminationReason::ExitedNormally));
        assert!(!reason.is_failure());
        assert_eq!(
            shutdown_reason.lock().unwrap().as_deref(),
            Some("run loop exited cleanly")
        );
    }

    #[tokio::test]
    async fn report_startup_failures() {
        let module = Recorder {
            fail_startup: true,
            ..Default::default()
        };

        let reason = ModuleRunner::default().run(module).await;

        assert!(matches!(reason, ModuleTerminationReason::StartupFailed(_)));
        assert!(reason.is_failure());
    }

    #[tokio::test]
    async fn report_operational_errors() {
        let module = Recorder {
            fail_run: true,
            ..Default::default()
        };

        let reason = ModuleRunner::default().run(module).await;

        assert!(matches!(reason, ModuleTerminationReason::OperationalError(_)));
        assert!(reason.is_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn time_out_during_startup() {
        let module = Recorder {
            stall_startup: true,
            ..Default::default()
        };

        let runner = ModuleRunner::new(Duration::from_secs(5), Duration::from_secs(5));
        let reason = runner.run(module).await;

        assert!(matches!(reason, ModuleTerminationReason::Timeout));
    }

    #[tokio::test]
    async fn stop_when_heart_dies() {
        let shutdown_reason = Arc::new(Mutex::new(None));
        let module = Recorder {
            run_forever: true,
            shutdown_reason: shutdown_reason.clone(),
            ..Default::default()
        };
        let (heart, mut stone) = Heart::new();

        let handle = tokio::spawn(async move {
            ModuleRunner::default()
                .run_with_heart(module, heart)
                .await
        });
        stone.kill("shutdown requested".to_owned()).await;
        let reason = handle.await.unwrap();

        assert!(matches!(
            reason,
            ModuleTerminationReason::HeartDied(DeathReason::Killed(_))
        ));
        assert!(!reason.is_failure());
        assert!(shutdown_reason.lock().unwrap().is_some());
    }
}
