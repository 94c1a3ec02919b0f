/// `scripting/worker.rs` - the one thread that owns the Lua VM
///
/// `spawn_worker` builds the `ScriptEngine` on a dedicated OS thread and
/// returns a cloneable `HostHandle`. Protocol callbacks, timers and the UI
/// push `HostEvent`s through the handle; the worker applies them between
/// ticks, so the VM is never entered from two threads.
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::bridge::BoundaryValue;
use super::engine::ScriptEngine;
use super::menu::MenuPresenter;
use super::trigger::HostEvent;
use crate::config::HostConfig;
use crate::error::{ScriptError, ScriptResult};
use crate::protocol::{InboundMessage, Outbound};

const EVENT_QUEUE_SIZE: usize = 1024;

/// Sending side of the worker's event queue.
#[derive(Clone)]
pub struct HostHandle {
    tx: SyncSender<HostEvent>,
}

impl HostHandle {
    /// Queues `event` without blocking. Returns false if it was dropped.
    pub fn send(&self, event: HostEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                log::warn!("script host queue is full; dropped {} event", event.kind());
                false
            }
            Err(TrySendError::Disconnected(event)) => {
                log::warn!("script host is gone; dropped {} event", event.kind());
                false
            }
        }
    }

    pub fn call(&self, name: impl Into<String>, args: Vec<BoundaryValue>) -> bool {
        self.send(HostEvent::Call {
            name: name.into(),
            args,
        })
    }

    pub fn deliver(&self, message: InboundMessage) -> bool {
        self.send(HostEvent::Message(message))
    }

    pub fn endpoints_discovered(&self) -> bool {
        self.send(HostEvent::EndpointsDiscovered)
    }

    pub fn update_menu(&self, trigger: impl Into<String>) -> bool {
        self.send(HostEvent::UpdateMenu {
            trigger: trigger.into(),
        })
    }

    pub fn menu_clicked(&self, path: Vec<String>) -> bool {
        self.send(HostEvent::MenuClicked { path })
    }

    /// Blocks until the shutdown request is queued.
    pub fn shutdown(&self) -> bool {
        self.tx.send(HostEvent::Shutdown).is_ok()
    }

    /// `shutdown` for async callers: the wait for queue room happens on the
    /// blocking pool, so runtime workers keep running meanwhile.
    pub async fn shutdown_async(&self) -> bool {
        let handle = self.clone();
        tokio::task::spawn_blocking(move || handle.shutdown())
            .await
            .unwrap_or(false)
    }
}

/// Starts the script host thread and waits until its environment is built.
///
/// # Errors
///
/// `HostFatal` when the thread cannot be started or the environment cannot
/// be created. Script errors during `main.lua` are logged, not returned.
pub fn spawn_worker(
    config: HostConfig,
    outbound: Arc<dyn Outbound>,
    presenter: Arc<dyn MenuPresenter>,
) -> ScriptResult<(HostHandle, JoinHandle<()>)> {
    let (tx, rx) = sync_channel(EVENT_QUEUE_SIZE);
    let (ready_tx, ready_rx) = sync_channel::<ScriptResult<()>>(1);
    let tick_interval = config.tick_interval;

    let join = thread::Builder::new()
        .name("script-host".to_string())
        .spawn(move || {
            let mut engine = match ScriptEngine::new(config, outbound, presenter) {
                Ok(engine) => {
                    let _ = ready_tx.send(Ok(()));
                    engine
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            engine.start();
            run_loop(&mut engine, &rx, tick_interval);
            log::info!(
                "script host stopped; {} thread(s) abandoned",
                engine.live_threads()
            );
        })
        .map_err(ScriptError::host_fatal)?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok((HostHandle { tx }, join)),
        Ok(Err(e)) => {
            let _ = join.join();
            Err(e)
        }
        Err(_) => Err(ScriptError::HostFatal(
            "script host exited during startup".into(),
        )),
    }
}

/// Waits for events up to one tick interval, then ticks. Every wake ticks,
/// so a burst of events is applied promptly.
fn run_loop(engine: &mut ScriptEngine, rx: &Receiver<HostEvent>, tick_interval: Duration) {
    let mut next_tick = Instant::now() + tick_interval;
    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(event) => {
                engine.enqueue(event);
                while let Ok(event) = rx.try_recv() {
                    engine.enqueue(event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::info!("all host handles dropped");
                break;
            }
        }

        if !engine.tick() {
            break;
        }
        let now = Instant::now();
        if now >= next_tick {
            next_tick = now + tick_interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::test_support::{
        host_config, write_scripts, RecordingOutbound, RecordingPresenter, Sent,
    };

    #[test]
    fn events_run_on_the_worker_until_shutdown() {
        let (_dir, mut config) = host_config();
        config.tick_interval = Duration::from_millis(5);
        write_scripts(
            &config.script_root,
            &[(
                "main.lua",
                r#"
                function ready() osc.send("/ready", true) end
                function receive(address, n) osc.send(address, n * 2) end
                function wave() sleep(0.01) osc.send("/wave", "done") end
                "#,
            )],
        );
        let outbound = RecordingOutbound::default();
        let (handle, join) = spawn_worker(
            config,
            Arc::new(outbound.clone()),
            Arc::new(RecordingPresenter::default()),
        )
        .unwrap();

        assert!(handle.endpoints_discovered());
        assert!(handle.deliver(InboundMessage {
            address: "/avatar/parameters/Level".into(),
            values: vec![BoundaryValue::Integer(21)],
        }));
        assert!(handle.call("wave", vec![]));

        let deadline = Instant::now() + Duration::from_secs(5);
        while outbound.sent().len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.shutdown());
        join.join().unwrap();

        assert_eq!(
            outbound.sent(),
            vec![
                Sent::Boolean("/ready".into(), true),
                Sent::Number("/avatar/parameters/Level".into(), 42.0),
                Sent::String("/wave".into(), "done".into()),
            ]
        );
        assert!(!handle.call("wave", vec![]));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn async_shutdown_waits_off_the_runtime_thread() {
        let (tx, rx) = sync_channel(1);
        tx.try_send(HostEvent::EndpointsDiscovered).unwrap();
        let handle = HostHandle { tx };
        let drain = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let first = rx.recv().unwrap();
            let second = rx.recv().unwrap();
            (first, second)
        });

        let (queued_at, ticked_at) = tokio::join!(
            async {
                assert!(handle.shutdown_async().await);
                Instant::now()
            },
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Instant::now()
            }
        );
        assert!(ticked_at < queued_at);

        let (first, second) = drain.join().unwrap();
        assert!(matches!(first, HostEvent::EndpointsDiscovered));
        assert!(matches!(second, HostEvent::Shutdown));
    }

    #[test]
    fn environment_failure_is_host_fatal() {
        let (dir, mut config) = host_config();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        config.io_root = blocker.join("io_dir");

        let result = spawn_worker(
            config,
            Arc::new(RecordingOutbound::default()),
            Arc::new(RecordingPresenter::default()),
        );
        assert!(matches!(result, Err(ScriptError::HostFatal(_))));
    }
}
