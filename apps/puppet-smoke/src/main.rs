mod config;
mod logging;

use std::{process, sync::Arc, time::Duration};

use config::SmokeConfig;
use puppet_core::{
    BackendKind, Puppet, PuppetBackend, PuppetError, PuppetErrorKind, PuppetEvent, Receiver,
    StableState, retry_with_backoff,
};
use puppet_loopback::LoopbackBackend;
use puppet_mock::MockBackend;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const LOOPBACK_TRAFFIC_PERIOD: Duration = Duration::from_secs(2);
const LOOPBACK_SELF_NAME: &str = "loopback";

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            process::exit(2);
        }
    };

    if let Err(err) = run(config).await {
        error!(code = err.code(), error = %err, "smoke run failed");
        process::exit(1);
    }
}

async fn run(config: SmokeConfig) -> Result<(), PuppetError> {
    info!(?config, "starting puppet smoke run");

    let loopback = match config.backend {
        BackendKind::Loopback => Some(Arc::new(LoopbackBackend::new(LOOPBACK_SELF_NAME))),
        BackendKind::Mock => None,
    };
    let backend: Arc<dyn PuppetBackend> = match &loopback {
        Some(loopback) => Arc::clone(loopback) as Arc<dyn PuppetBackend>,
        None => Arc::new(MockBackend::new()),
    };
    let puppet = Puppet::new(backend, config.puppet_options())?;

    let listener_stop = CancellationToken::new();
    let listener = tokio::spawn(log_events(puppet.clone(), listener_stop.clone()));

    retry_with_backoff(config.start_retry_policy(), || puppet.start()).await?;
    exercise(&puppet).await?;

    let shutdown = CancellationToken::new();
    let traffic = loopback.as_ref().map(|loopback| {
        tokio::spawn(loopback_traffic(
            Arc::clone(loopback),
            shutdown.child_token(),
        ))
    });

    tokio::select! {
        _ = tokio::time::sleep(config.run_for) => {
            info!(run_secs = config.run_for.as_secs(), "run window elapsed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
        _ = puppet.await_state(StableState::Off) => {
            warn!("session went down before the run window elapsed");
        }
    }

    shutdown.cancel();
    if let Some(traffic) = traffic {
        join_logged("loopback traffic", traffic).await;
    }

    if puppet.is_logged_in() {
        puppet.logout().await?;
    }
    puppet.stop().await?;
    listener_stop.cancel();
    join_logged("event listener", listener).await;

    info!("puppet smoke run finished");
    Ok(())
}

/// Wait for a background task, logging a panic or cancellation instead of
/// propagating it. Returns whether the task finished cleanly.
async fn join_logged(task: &'static str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(err) => {
            warn!(task, error = %err, "background task did not finish cleanly");
            false
        }
    }
}

/// Drive a few entity operations so each run touches the accessor surface.
async fn exercise(puppet: &Puppet) -> Result<(), PuppetError> {
    let Some(self_id) = puppet.self_id() else {
        return Err(PuppetError::backend("session started without an identity"));
    };

    let me = puppet.contact_payload(&self_id).await?;
    info!(id = %me.id, name = %me.name, "logged in as");

    let room_id = puppet
        .room_create(&[self_id.clone()], "puppet smoke")
        .await?;
    puppet.set_room_topic(&room_id, "puppet smoke (renamed)").await?;
    let topic = puppet.room_topic(&room_id).await?;
    info!(%room_id, %topic, "room topic after rename");

    puppet
        .message_send_text(&Receiver::Room(room_id), "hello from puppet-smoke")
        .await?;

    match puppet.ding("smoke").await {
        Ok(()) => {}
        Err(err) if err.kind == PuppetErrorKind::Unsupported => {
            debug!("backend does not answer ding");
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

async fn log_events(puppet: Puppet, shutdown: CancellationToken) {
    let mut events = puppet.subscribe();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(PuppetEvent::Message { message_id }) => {
                match puppet.message_payload(&message_id).await {
                    Ok(message) => info!(
                        %message_id,
                        from = %message.from_id,
                        text = message.text.as_deref().unwrap_or_default(),
                        "message"
                    ),
                    Err(err) => warn!(%message_id, error = %err, "failed loading message"),
                }
            }
            Ok(event) => info!(event = event.name(), ?event, "puppet event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event listener lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn loopback_traffic(backend: Arc<LoopbackBackend>, shutdown: CancellationToken) {
    let friend = match backend.add_contact("loopback friend") {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "failed seeding loopback contact");
            return;
        }
    };
    let me = Receiver::Contact(backend.self_id().to_owned());

    let mut ticks = tokio::time::interval(LOOPBACK_TRAFFIC_PERIOD);
    let mut sequence: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticks.tick() => {
                sequence += 1;
                let text = format!("ping #{sequence}");
                if let Err(err) = backend.inject_message(&friend, me.clone(), text) {
                    warn!(error = %err, "failed injecting loopback message");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_logged_reports_clean_exit() {
        let handle = tokio::spawn(async {});
        assert!(join_logged("noop", handle).await);
    }

    #[tokio::test]
    async fn join_logged_absorbs_panicked_and_aborted_tasks() {
        let panicked = tokio::spawn(async {
            panic!("listener blew up");
        });
        assert!(!join_logged("panicked", panicked).await);

        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        assert!(!join_logged("aborted", aborted).await);
    }
}
