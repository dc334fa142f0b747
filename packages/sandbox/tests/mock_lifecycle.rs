// ABOUTME: Lifecycle and fallback tests against an in-memory container runtime
// ABOUTME: Covers idempotent start, eviction, fallback chains, and crash self-healing

use async_trait::async_trait;
use scribble_sandbox::{
    ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, Result, SandboxError,
    SandboxMode, SandboxService, SandboxSettings,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct MockContainer {
    name: String,
    state: ContainerState,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    next_id: usize,
    create_calls: usize,
    start_calls: usize,
    kill_calls: usize,
    executed_binaries: Vec<String>,
    fail_ping: bool,
    fail_create: bool,
    fail_stop: bool,
    fail_kill: bool,
    fail_start_ids: HashSet<String>,
    missing_binaries: HashSet<String>,
    create_delay: Option<Duration>,
    exec_delay: Option<Duration>,
    stop_delay: Option<Duration>,
    /// Raw bytes the in-container agent "replies" with; None simulates a
    /// dead agent (shim prints nothing)
    agent_reply: Option<String>,
    /// Canned stdout per code snippet for the stateless path
    outputs: HashMap<String, String>,
}

/// In-memory stand-in for Docker
struct MockRuntime {
    state: Mutex<MockState>,
    agent_socket: String,
}

impl MockRuntime {
    fn new(settings: &SandboxSettings) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            agent_socket: settings.agent_socket.clone(),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn seed_leftover(&self, name: &str, state: ContainerState) -> String {
        self.with(|s| {
            s.next_id += 1;
            let id = format!("leftover-{}", s.next_id);
            s.containers.insert(
                id.clone(),
                MockContainer {
                    name: name.to_string(),
                    state,
                },
            );
            id
        })
    }

    fn set_state(&self, container_id: &str, state: ContainerState) {
        self.with(|s| {
            s.containers.get_mut(container_id).unwrap().state = state;
        });
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        if self.with(|s| s.fail_ping) {
            return Err(SandboxError::Configuration("mock daemon down".to_string()));
        }
        Ok(())
    }

    async fn create(&self, name: &str, _spec: &ContainerSpec) -> Result<String> {
        let delay = self.with(|s| s.create_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            s.create_calls += 1;
            if s.fail_create {
                return Err(SandboxError::Creation("mock refused".to_string()));
            }
            s.next_id += 1;
            let id = format!("cid-{}", s.next_id);
            s.containers.insert(
                id.clone(),
                MockContainer {
                    name: name.to_string(),
                    state: ContainerState::Stopped,
                },
            );
            Ok(id)
        })
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.with(|s| {
            s.start_calls += 1;
            if s.fail_start_ids.contains(container_id) {
                return Err(SandboxError::Creation("mock start refused".to_string()));
            }
            match s.containers.get_mut(container_id) {
                Some(c) => {
                    c.state = ContainerState::Running;
                    Ok(())
                }
                None => Err(SandboxError::NotRunning(container_id.to_string())),
            }
        })
    }

    async fn stop(&self, container_id: &str, _wait_secs: u64) -> Result<()> {
        let delay = self.with(|s| s.stop_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            if s.fail_stop {
                return Err(SandboxError::Stop("mock stop refused".to_string()));
            }
            if let Some(c) = s.containers.get_mut(container_id) {
                c.state = ContainerState::Stopped;
            }
            Ok(())
        })
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        self.with(|s| {
            s.kill_calls += 1;
            if s.fail_kill {
                return Err(SandboxError::Stop("mock kill refused".to_string()));
            }
            if let Some(c) = s.containers.get_mut(container_id) {
                c.state = ContainerState::Stopped;
            }
            Ok(())
        })
    }

    async fn remove(&self, container_id: &str, _force: bool) -> Result<()> {
        self.with(|s| {
            s.containers.remove(container_id);
        });
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState> {
        Ok(self.with(|s| {
            s.containers
                .get(container_id)
                .map(|c| c.state)
                .unwrap_or(ContainerState::Absent)
        }))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<(String, ContainerState)>> {
        Ok(self.with(|s| {
            s.containers
                .iter()
                .find(|(_, c)| c.name == name)
                .map(|(id, c)| (id.clone(), c.state))
        }))
    }

    async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<ExecOutput> {
        let delay = self.with(|s| s.exec_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let binary = cmd[0].clone();
        let code = cmd.get(2).cloned().unwrap_or_default();

        self.with(|s| {
            let running = s
                .containers
                .get(container_id)
                .map(|c| c.state == ContainerState::Running)
                .unwrap_or(false);
            if !running {
                return Err(SandboxError::Execution(format!(
                    "container {} is not running",
                    container_id
                )));
            }

            s.executed_binaries.push(binary.clone());

            if s.missing_binaries.contains(&binary) {
                return Ok(ExecOutput {
                    exit_code: 127,
                    stdout: Vec::new(),
                    stderr: format!("exec: \"{}\": executable file not found", binary).into_bytes(),
                });
            }

            // The stateful shim embeds the agent socket path; its stdout is
            // whatever the agent sent before closing
            if code.contains(&self.agent_socket) {
                let reply = s.agent_reply.clone().unwrap_or_default();
                return Ok(ExecOutput {
                    exit_code: 0,
                    stdout: reply.into_bytes(),
                    stderr: Vec::new(),
                });
            }

            match s.outputs.get(&code) {
                Some(stdout) => Ok(ExecOutput {
                    exit_code: 0,
                    stdout: stdout.clone().into_bytes(),
                    stderr: Vec::new(),
                }),
                None => Ok(ExecOutput {
                    exit_code: 1,
                    stdout: Vec::new(),
                    stderr: b"mock: no canned output".to_vec(),
                }),
            }
        })
    }
}

fn test_settings() -> SandboxSettings {
    SandboxSettings {
        stop_wait: Duration::from_millis(50),
        ..SandboxSettings::default()
    }
}

fn service_with(settings: SandboxSettings) -> (Arc<SandboxService>, Arc<MockRuntime>) {
    let runtime = MockRuntime::new(&settings);
    let service = Arc::new(SandboxService::new(runtime.clone(), settings));
    (service, runtime)
}

#[tokio::test]
async fn start_is_idempotent() {
    let (service, runtime) = service_with(test_settings());

    service.start("room-1").await.unwrap();
    service.start("room-1").await.unwrap();

    assert_eq!(service.registry().len().await, 1);
    assert_eq!(runtime.with(|s| s.create_calls), 1);
}

#[tokio::test]
async fn concurrent_starts_share_one_sandbox() {
    let (service, runtime) = service_with(test_settings());
    // Hold the first start mid-creation so the second genuinely races it
    runtime.with(|s| s.create_delay = Some(Duration::from_millis(50)));

    let (a, b) = tokio::join!(service.start("room-1"), service.start("room-1"));
    a.unwrap();
    b.unwrap();

    assert_eq!(runtime.with(|s| s.create_calls), 1);
    assert_eq!(service.registry().len().await, 1);
}

#[tokio::test]
async fn sweep_queued_behind_an_exec_spares_the_room() {
    let settings = SandboxSettings {
        idle_timeout: Duration::from_millis(250),
        ..test_settings()
    };
    let (service, runtime) = service_with(settings);
    runtime.with(|s| {
        s.exec_delay = Some(Duration::from_millis(100));
        s.outputs.insert("print(1)".to_string(), "1\n".to_string());
    });

    service.start("room-1").await.unwrap();

    // Pin the room's critical section so both the exec and the sweep have
    // to queue on it; the lock is fair, so they acquire in arrival order
    let lock = service.registry().lock("room-1").await;
    let guard = lock.lock().await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let svc = service.clone();
    let exec = tokio::spawn(async move { svc.exec("room-1", "print(1)").await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The sweep samples the room as idle, then waits behind the exec
    let svc = service.clone();
    let sweep = tokio::spawn(async move { svc.sweep_idle().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    drop(guard);

    // The exec ran first and refreshed the room's activity; the sweep's
    // re-check under the lock must spare it
    let output = exec.await.unwrap().unwrap();
    assert!(output.contains('1'));
    assert_eq!(sweep.await.unwrap(), 0);
    assert!(service.registry().get("room-1").await.is_some());
}

#[tokio::test]
async fn stop_clears_state_and_unknown_stop_is_noop() {
    let (service, _runtime) = service_with(test_settings());

    service.start("room-1").await.unwrap();
    service.stop("room-1").await.unwrap();

    let err = service.exec("room-1", "print(1)").await.unwrap_err();
    assert!(matches!(err, SandboxError::NotRunning(_)));

    // Stopping a room that was never started succeeds silently
    service.stop("room-never").await.unwrap();
}

#[tokio::test]
async fn start_exec_stop_scenario() {
    let (service, runtime) = service_with(test_settings());
    runtime.with(|s| {
        s.outputs
            .insert("print(3*7)".to_string(), "21\n".to_string());
    });

    service.start("room-1").await.unwrap();
    let output = service.exec("room-1", "print(3*7)").await.unwrap();
    assert!(output.contains("21"));

    service.stop("room-1").await.unwrap();
    let err = service.exec("room-1", "print(1)").await.unwrap_err();
    assert!(matches!(err, SandboxError::NotRunning(_)));
}

#[tokio::test]
async fn creation_failure_leaves_no_registry_entry() {
    let (service, runtime) = service_with(test_settings());
    runtime.with(|s| s.fail_create = true);

    let err = service.start("room-1").await.unwrap_err();
    assert!(matches!(err, SandboxError::Creation(_)));
    assert!(service.registry().is_empty().await);
}

#[tokio::test]
async fn leftover_container_is_reattached_not_recreated() {
    let settings = test_settings();
    let (service, runtime) = service_with(settings.clone());
    let leftover_id =
        runtime.seed_leftover(&settings.container_name("room-1"), ContainerState::Stopped);

    service.start("room-1").await.unwrap();

    assert_eq!(runtime.with(|s| s.create_calls), 0);
    assert_eq!(
        service.registry().get("room-1").await.unwrap().container_id,
        leftover_id
    );
    assert_eq!(
        runtime.inspect(&leftover_id).await.unwrap(),
        ContainerState::Running
    );
}

#[tokio::test]
async fn exec_restarts_a_crashed_container() {
    let (service, runtime) = service_with(test_settings());
    runtime.with(|s| {
        s.outputs.insert("print(1)".to_string(), "1\n".to_string());
    });

    service.start("room-1").await.unwrap();
    let container_id = service.registry().get("room-1").await.unwrap().container_id;

    // Simulate an external crash
    runtime.set_state(&container_id, ContainerState::Stopped);

    let output = service.exec("room-1", "print(1)").await.unwrap();
    assert!(output.contains('1'));
    assert_eq!(runtime.with(|s| s.create_calls), 1, "restart, not recreate");
}

#[tokio::test]
async fn exec_recreates_when_restart_fails() {
    let (service, runtime) = service_with(test_settings());
    runtime.with(|s| {
        s.outputs.insert("print(1)".to_string(), "1\n".to_string());
    });

    service.start("room-1").await.unwrap();
    let old_id = service.registry().get("room-1").await.unwrap().container_id;

    runtime.set_state(&old_id, ContainerState::Stopped);
    runtime.with(|s| {
        s.fail_start_ids.insert(old_id.clone());
    });

    let output = service.exec("room-1", "print(1)").await.unwrap();
    assert!(output.contains('1'));

    let new_id = service.registry().get("room-1").await.unwrap().container_id;
    assert_ne!(new_id, old_id, "handle replaced in place");
    assert_eq!(runtime.with(|s| s.create_calls), 2);
}

#[tokio::test]
async fn interpreter_falls_back_to_secondary_binary() {
    let (service, runtime) = service_with(test_settings());
    runtime.with(|s| {
        s.missing_binaries.insert("python3".to_string());
        s.outputs
            .insert("print(3*7)".to_string(), "21\n".to_string());
    });

    service.start("room-1").await.unwrap();
    let output = service.exec("room-1", "print(3*7)").await.unwrap();
    assert!(output.contains("21"));

    let binaries = runtime.with(|s| s.executed_binaries.clone());
    assert_eq!(binaries, vec!["python3".to_string(), "python".to_string()]);
}

#[tokio::test]
async fn exhausted_interpreters_name_every_attempt() {
    let (service, runtime) = service_with(test_settings());
    runtime.with(|s| {
        s.missing_binaries.insert("python3".to_string());
        s.missing_binaries.insert("python".to_string());
    });

    service.start("room-1").await.unwrap();
    let err = service.exec("room-1", "print(1)").await.unwrap_err();

    match err {
        SandboxError::Execution(msg) => {
            assert!(msg.contains("python3"));
            assert!(msg.contains("python"));
        }
        other => panic!("expected Execution error, got {:?}", other),
    }
}

#[tokio::test]
async fn dead_agent_demotes_to_stateless_without_error() {
    let settings = SandboxSettings {
        mode: SandboxMode::Stateful,
        ..test_settings()
    };
    let (service, runtime) = service_with(settings);
    runtime.with(|s| {
        // agent_reply stays None: the shim reads nothing before EOF
        s.outputs
            .insert("print(3*7)".to_string(), "21\n".to_string());
    });

    service.start("room-1").await.unwrap();
    let output = service.exec("room-1", "print(3*7)").await.unwrap();
    assert!(output.contains("21"));
}

#[tokio::test]
async fn malformed_agent_reply_demotes_to_stateless() {
    let settings = SandboxSettings {
        mode: SandboxMode::Stateful,
        ..test_settings()
    };
    let (service, runtime) = service_with(settings);
    runtime.with(|s| {
        s.agent_reply = Some("<<< not json >>>".to_string());
        s.outputs.insert("print(1)".to_string(), "1\n".to_string());
    });

    service.start("room-1").await.unwrap();
    let output = service.exec("room-1", "print(1)").await.unwrap();
    assert!(output.contains('1'));
}

#[tokio::test]
async fn agent_reply_is_returned_verbatim() {
    let settings = SandboxSettings {
        mode: SandboxMode::Stateful,
        ..test_settings()
    };
    let (service, runtime) = service_with(settings);
    runtime.with(|s| {
        s.agent_reply =
            Some(r#"{"ok": true, "stdout": "5\n", "stderr": "warned\n"}"#.to_string());
    });

    service.start("room-1").await.unwrap();
    let output = service.exec("room-1", "print(x)").await.unwrap();
    assert_eq!(output, "5\nwarned\n");
}

#[tokio::test]
async fn guest_exception_surfaces_as_execution_error() {
    let settings = SandboxSettings {
        mode: SandboxMode::Stateful,
        ..test_settings()
    };
    let (service, runtime) = service_with(settings);
    runtime.with(|s| {
        s.agent_reply = Some(
            r#"{"ok": false, "stdout": "", "stderr": "", "error": "NameError(\"name 'x' is not defined\")", "traceback": "Traceback (most recent call last): ..."}"#
                .to_string(),
        );
    });

    service.start("room-1").await.unwrap();
    let err = service.exec("room-1", "print(x)").await.unwrap_err();

    match err {
        SandboxError::Execution(msg) => {
            assert!(msg.contains("NameError"));
            assert!(msg.contains("Traceback"));
        }
        other => panic!("expected Execution error, got {:?}", other),
    }
}

#[tokio::test]
async fn idle_rooms_are_evicted_and_fresh_rooms_survive() {
    let settings = SandboxSettings {
        idle_timeout: Duration::from_millis(50),
        ..test_settings()
    };
    let (service, _runtime) = service_with(settings);

    service.start("room-old").await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    service.start("room-new").await.unwrap();

    let evicted = service.sweep_idle().await;
    assert_eq!(evicted, 1);
    assert!(service.registry().get("room-old").await.is_none());
    assert!(service.registry().get("room-new").await.is_some());
}

#[tokio::test]
async fn hung_graceful_stop_is_raced_by_a_kill() {
    let (service, runtime) = service_with(test_settings());
    runtime.with(|s| s.stop_delay = Some(Duration::from_millis(300)));

    service.start("room-1").await.unwrap();
    service.stop("room-1").await.unwrap();

    assert!(runtime.with(|s| s.kill_calls) >= 1);
    assert!(service.registry().is_empty().await);
}

#[tokio::test]
async fn failed_stop_and_kill_still_clear_the_room() {
    let (service, runtime) = service_with(test_settings());
    runtime.with(|s| {
        s.fail_stop = true;
        s.fail_kill = true;
    });

    service.start("room-1").await.unwrap();

    // Both escalation steps fail; the room is still torn down
    service.stop("room-1").await.unwrap();
    assert!(service.registry().is_empty().await);
    assert!(runtime.with(|s| s.kill_calls) >= 1);
}

#[tokio::test]
async fn stopping_a_room_releases_its_lock_entry() {
    let (service, _runtime) = service_with(test_settings());

    service.start("room-1").await.unwrap();
    service.start("room-2").await.unwrap();
    assert_eq!(service.registry().lock_count().await, 2);

    service.stop("room-1").await.unwrap();
    assert_eq!(service.registry().lock_count().await, 1);
    assert!(service.registry().get("room-2").await.is_some());
}

#[tokio::test]
async fn spawned_reaper_evicts_in_the_background() {
    let settings = SandboxSettings {
        idle_timeout: Duration::from_millis(20),
        reap_interval: Duration::from_millis(30),
        ..test_settings()
    };
    let (service, _runtime) = service_with(settings);

    service.start("room-1").await.unwrap();
    let reaper = scribble_sandbox::IdleReaper::spawn(service.clone());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(service.registry().is_empty().await);

    reaper.shutdown();
}

#[tokio::test]
async fn is_ready_tracks_daemon_reachability() {
    let (service, runtime) = service_with(test_settings());

    assert!(service.is_ready().await);
    runtime.with(|s| s.fail_ping = true);
    assert!(!service.is_ready().await);
}

#[tokio::test]
async fn rooms_operate_independently() {
    let (service, runtime) = service_with(test_settings());
    runtime.with(|s| {
        s.outputs.insert("print(1)".to_string(), "1\n".to_string());
    });

    service.start("room-a").await.unwrap();
    service.start("room-b").await.unwrap();
    assert_eq!(service.registry().len().await, 2);

    service.stop("room-a").await.unwrap();

    // room-b is untouched by room-a's stop
    let output = service.exec("room-b", "print(1)").await.unwrap();
    assert!(output.contains('1'));
    let mut rooms = service.list_rooms().await;
    rooms.sort();
    assert_eq!(rooms, vec!["room-b".to_string()]);
}
