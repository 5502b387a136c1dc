//! Reconnect policy after a network failure.
//!
//! A bounded number of attempts with a fixed pause between them; the user
//! hears about it exactly once, when every attempt has failed. Individual
//! attempt failures are only logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::engine::{build_protocol_handlers, Engine, EngineHooks};
use crate::protocol::ProtocolClient;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    protocol: Arc<dyn ProtocolClient>,
    hooks: EngineHooks,
    reconnecting: Arc<AtomicBool>,
}

impl Clone for ConnectionSupervisor {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            protocol: self.protocol.clone(),
            hooks: self.hooks.clone(),
            reconnecting: self.reconnecting.clone(),
        }
    }
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        config: SupervisorConfig,
        protocol: Arc<dyn ProtocolClient>,
        hooks: EngineHooks,
    ) -> Self {
        Self {
            config,
            protocol,
            hooks,
            reconnecting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Kick off a reconnect cycle unless one is already running. Returns
    /// immediately; the outcome lands back on the scheduler as a task.
    pub(crate) fn spawn_reconnect(&self, rt: &Handle) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            log::debug!("reconnect already in progress");
            return;
        }
        let this = self.clone();
        rt.spawn(async move {
            let mut recovered = false;
            for attempt in 1..=this.config.attempts {
                log::info!("reconnect attempt {attempt}/{}", this.config.attempts);
                this.protocol
                    .set_handlers(build_protocol_handlers(&this.hooks));
                match tokio::time::timeout(this.config.connect_timeout, this.protocol.connect())
                    .await
                {
                    Ok(Ok(())) => {
                        recovered = true;
                        break;
                    }
                    Ok(Err(e)) => log::warn!("reconnect attempt {attempt} failed: {e}"),
                    Err(_) => log::warn!("reconnect attempt {attempt} timed out"),
                }
                if attempt < this.config.attempts {
                    tokio::time::sleep(this.config.retry_delay).await;
                }
            }
            if recovered {
                this.hooks
                    .tasks
                    .schedule(|engine: &mut Engine| engine.on_reconnected());
            } else {
                this.hooks
                    .tasks
                    .schedule(|engine: &mut Engine| engine.on_reconnect_exhausted());
            }
            this.reconnecting.store(false, Ordering::SeqCst);
        });
    }
}
