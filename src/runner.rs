use std::path::Path;
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::{ConfigError, RunnerConfig, StrategyRunnerConfig};
use crate::firewall::{new_firewall, Firewall, FirewallError, FirewallRule, FirewallSettings};
use crate::process::ProcessManager;
use crate::strategy::{split_ports, tokenize_args, ParseError, ParsedRule, Parser};
use crate::watcher::ConfigWatcher;

const BIN_PATH: &str = "/usr/bin";
const LISTS_PATH: &str = "/etc/zapret/lists";
const RULE_COMMENT: &str = "Added by zapret";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("strategy runner already running")]
    AlreadyRunning,
    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),
    #[error("firewall setup failed: {0}")]
    FirewallSetup(#[source] FirewallError),
    #[error("add rule failed: {0}")]
    AddRule(#[source] FirewallError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("stop errors: {0}")]
    Stop(String),
}

/// Point-in-time snapshot of the runner.
#[derive(Debug, Clone)]
pub struct RunnerStatus {
    pub running: bool,
    pub strategy_file: String,
    pub active_queues: usize,
    pub active_processes: usize,
    pub firewall_backend: &'static str,
}

struct Inner {
    config: RunnerConfig,
    parser: Parser,
    firewall: Box<dyn Firewall>,
    processes: ProcessManager,
    watcher: Option<ConfigWatcher>,
    running: bool,
    /// Kernel structures exist and need teardown. Diverges from `running`
    /// when a start fails mid-install; stop must still clean up then.
    installed: bool,
    last_parsed_len: usize,
}

/// Orchestrates the strategy lifecycle: parse, firewall install, worker
/// spawn, file-watch reload, and teardown.
///
/// Start, stop, and restart hold the write lock for their whole duration
/// and are therefore serialized; status takes only the read lock.
pub struct StrategyRunner {
    daemon_cfg: StrategyRunnerConfig,
    /// Handle the watcher callback restarts through; weak, because the
    /// runner owns the watcher and must outlive it.
    self_weak: Weak<StrategyRunner>,
    inner: RwLock<Inner>,
}

impl StrategyRunner {
    pub fn new(daemon_cfg: &StrategyRunnerConfig) -> Result<Arc<Self>, RunnerError> {
        let config = load_runner_config(daemon_cfg)?;
        let inner = build_inner(config);

        Ok(Arc::new_cyclic(|weak| Self {
            daemon_cfg: daemon_cfg.clone(),
            self_weak: weak.clone(),
            inner: RwLock::new(inner),
        }))
    }

    /// Bring the strategy up. Fails without side effects on parse or
    /// firewall-setup errors; a mid-loop rule failure returns the error
    /// and leaves already-installed rules for a subsequent stop to clean
    /// up. Individual worker-spawn failures are tolerated: the bypass
    /// flag on the kernel rule passes traffic for an absent worker.
    pub async fn start(&self) -> Result<(), RunnerError> {
        let mut inner = self.inner.write().await;
        self.start_locked(&mut inner).await
    }

    async fn start_locked(&self, inner: &mut Inner) -> Result<(), RunnerError> {
        if inner.running {
            return Err(RunnerError::AlreadyRunning);
        }

        tracing::info!(
            interface = %inner.config.interface,
            strategy_file = %inner.config.strategy_file,
            firewall = inner.config.firewall.backend.as_str(),
            "starting strategy runner"
        );

        let strategy = inner.parser.parse(Path::new(&inner.config.strategy_file))?;
        inner.last_parsed_len = strategy.rules.len();
        tracing::info!(count = strategy.rules.len(), "parsed strategy rules");

        tracing::info!(
            backend = inner.config.firewall.backend.as_str(),
            table = %inner.config.firewall.table_name,
            chain = %inner.config.firewall.chain_name,
            "setting up firewall"
        );
        inner
            .firewall
            .setup()
            .await
            .map_err(RunnerError::FirewallSetup)?;
        inner.installed = true;

        let interface = inner.config.interface_match();
        for rule in &strategy.rules {
            let fw_rule = to_firewall_rule(rule, interface.clone());
            tracing::debug!(
                protocol = rule.protocol.as_str(),
                ports = %rule.ports,
                queue = rule.queue_num,
                "adding firewall rule"
            );
            inner
                .firewall
                .add_rule(&fw_rule)
                .await
                .map_err(RunnerError::AddRule)?;
        }

        tracing::info!(count = strategy.rules.len(), "starting nfqws processes");
        for rule in &strategy.rules {
            let args = tokenize_args(&rule.nfqws_args);
            if let Err(err) = inner.processes.start(rule.queue_num, &args).await {
                // One bad worker must not kill the whole strategy.
                tracing::error!(queue = rule.queue_num, error = %err, "failed to start process");
            }
        }

        if inner.config.watch {
            self.arm_watcher(inner);
        }

        inner.running = true;
        let process_count = inner.processes.count().await;
        tracing::info!(
            rules = strategy.rules.len(),
            processes = process_count,
            "strategy runner started"
        );

        Ok(())
    }

    fn arm_watcher(&self, inner: &mut Inner) {
        let paths = [
            inner.config.config_path.clone(),
            inner.config.strategy_file.clone(),
        ];
        let weak = self.self_weak.clone();
        let callback = Arc::new(move || {
            let Some(runner) = weak.upgrade() else {
                return;
            };
            tracing::info!("config changed, restarting strategy runner");
            tokio::spawn(async move {
                if let Err(err) = runner.restart().await {
                    tracing::error!(error = %err, "failed to restart strategy runner");
                }
            });
        });

        match ConfigWatcher::new(&paths, callback) {
            Ok(watcher) => inner.watcher = Some(watcher),
            Err(err) => {
                // Run without hot-reload rather than failing startup.
                tracing::warn!(error = %err, "failed to create config watcher");
            }
        }
    }

    /// Tear everything down: watcher, workers, firewall. Idempotent, and
    /// best-effort throughout — every subsystem is attempted and errors
    /// are aggregated.
    pub async fn stop(&self) -> Result<(), RunnerError> {
        let mut inner = self.inner.write().await;
        stop_locked(&mut inner).await
    }

    /// Reload the runner configuration and bring the strategy back up.
    /// Stop errors are logged, not propagated; a config that fails
    /// validation leaves the system stopped.
    pub async fn restart(&self) -> Result<(), RunnerError> {
        let mut inner = self.inner.write().await;

        tracing::info!("restarting strategy runner");
        if let Err(err) = stop_locked(&mut inner).await {
            tracing::error!(error = %err, "error stopping runner");
        }

        tracing::info!(path = %self.daemon_cfg.config_path, "reloading configuration");
        let config = load_runner_config(&self.daemon_cfg)?;

        // Fresh backend instance so table/backend/interface changes take
        // effect.
        *inner = build_inner(config);

        self.start_locked(&mut inner).await
    }

    /// Configured nftables table name, for the metrics exporter.
    pub async fn table_name(&self) -> String {
        self.inner.read().await.config.firewall.table_name.clone()
    }

    pub async fn status(&self) -> RunnerStatus {
        let inner = self.inner.read().await;
        RunnerStatus {
            running: inner.running,
            strategy_file: inner.config.strategy_file.clone(),
            active_queues: inner.last_parsed_len,
            active_processes: inner.processes.count().await,
            firewall_backend: inner.firewall.backend_name(),
        }
    }
}

async fn stop_locked(inner: &mut Inner) -> Result<(), RunnerError> {
    // A start that failed mid-install leaves running false but kernel
    // rules behind; those still need teardown.
    if !inner.running && !inner.installed {
        tracing::info!("strategy runner not running");
        return Ok(());
    }

    tracing::info!("stopping strategy runner");
    let mut errors = Vec::new();

    if let Some(watcher) = inner.watcher.take() {
        tracing::info!("stopping config watcher");
        watcher.stop();
    }

    let process_count = inner.processes.count().await;
    tracing::info!(count = process_count, "stopping nfqws processes");
    if let Err(err) = inner.processes.stop_all().await {
        tracing::warn!(error = %err, "error stopping processes");
        errors.push(err.to_string());
    }

    tracing::info!("removing firewall rules");
    if let Err(err) = inner.firewall.remove_all().await {
        tracing::warn!(error = %err, "error removing firewall rules");
        errors.push(err.to_string());
    }
    inner.firewall.close();

    inner.running = false;
    inner.installed = false;
    tracing::info!("strategy runner stopped");

    if errors.is_empty() {
        Ok(())
    } else {
        Err(RunnerError::Stop(errors.join("; ")))
    }
}

fn load_runner_config(daemon_cfg: &StrategyRunnerConfig) -> Result<RunnerConfig, ConfigError> {
    let mut config = RunnerConfig::load(Path::new(&daemon_cfg.config_path))?;
    config.validate()?;
    config.binary_path = daemon_cfg.nfqws_binary.clone();
    config.watch = daemon_cfg.watch;
    Ok(config)
}

fn build_inner(config: RunnerConfig) -> Inner {
    let firewall = new_firewall(&FirewallSettings {
        backend: config.firewall.backend,
        table_name: config.firewall.table_name.clone(),
        chain_name: config.firewall.chain_name.clone(),
    });

    let parser = Parser::new(
        BIN_PATH,
        LISTS_PATH,
        config.gamefilter_ports.clone(),
        config.gamefilter,
    );
    let processes = ProcessManager::new(config.binary_path.clone());

    Inner {
        config,
        parser,
        firewall,
        processes,
        watcher: None,
        running: false,
        installed: false,
        last_parsed_len: 0,
    }
}

fn to_firewall_rule(rule: &ParsedRule, interface: Option<String>) -> FirewallRule {
    FirewallRule {
        protocol: rule.protocol,
        ports: split_ports(&rule.ports),
        queue_num: rule.queue_num,
        interface,
        comment: RULE_COMMENT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockState {
        setup_calls: AtomicUsize,
        remove_calls: AtomicUsize,
        rules: Mutex<Vec<FirewallRule>>,
    }

    struct MockFirewall {
        state: Arc<MockState>,
        fail_add_from: Option<usize>,
    }

    #[async_trait::async_trait]
    impl Firewall for MockFirewall {
        fn backend_name(&self) -> &'static str {
            "nftables"
        }

        async fn setup(&mut self) -> Result<(), FirewallError> {
            self.state.setup_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn add_rule(&mut self, rule: &FirewallRule) -> Result<(), FirewallError> {
            let mut rules = self.state.rules.lock().unwrap();
            if let Some(limit) = self.fail_add_from {
                if rules.len() >= limit {
                    return Err(FirewallError::Command {
                        command: "mock".to_string(),
                        stderr: "injected failure".to_string(),
                    });
                }
            }
            rules.push(rule.clone());
            Ok(())
        }

        async fn remove_all(&mut self) -> Result<(), FirewallError> {
            self.state.remove_calls.fetch_add(1, Ordering::SeqCst);
            self.state.rules.lock().unwrap().clear();
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn write_strategy(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn test_runner(
        strategy_file: &Path,
        binary_path: &str,
        fail_add_from: Option<usize>,
    ) -> (Arc<StrategyRunner>, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let firewall = Box::new(MockFirewall {
            state: state.clone(),
            fail_add_from,
        });

        let config = RunnerConfig {
            interface: "any".to_string(),
            gamefilter: false,
            gamefilter_ports: "1024-65535".to_string(),
            strategy_file: strategy_file.display().to_string(),
            firewall: crate::config::FirewallSection::default(),
            binary_path: binary_path.to_string(),
            config_path: String::new(),
            watch: false,
        };

        let parser = Parser::new(
            BIN_PATH,
            LISTS_PATH,
            config.gamefilter_ports.clone(),
            config.gamefilter,
        );
        let processes = ProcessManager::new(config.binary_path.clone());

        let runner = Arc::new_cyclic(|weak| StrategyRunner {
            daemon_cfg: StrategyRunnerConfig {
                enabled: true,
                config_path: "/nonexistent/strategy.yaml".to_string(),
                watch: false,
                nfqws_binary: binary_path.to_string(),
            },
            self_weak: weak.clone(),
            inner: RwLock::new(Inner {
                config,
                parser,
                firewall,
                processes,
                watcher: None,
                running: false,
                installed: false,
                last_parsed_len: 0,
            }),
        });

        (runner, state)
    }

    #[tokio::test]
    async fn start_installs_rules_and_spawns_workers_in_order() {
        let strategy = write_strategy(
            "--filter-tcp=80,443 --dpi-desync=split --new --filter-udp=443 --dpi-desync=fake\n",
        );
        let (runner, state) = test_runner(strategy.path(), "/bin/sleep", None);

        runner.start().await.unwrap();

        let rules = state.rules.lock().unwrap().clone();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].queue_num, 0);
        assert_eq!(rules[0].ports, vec!["80,443"]);
        assert_eq!(rules[1].queue_num, 1);
        assert_eq!(state.setup_calls.load(Ordering::SeqCst), 1);

        let status = runner.status().await;
        assert!(status.running);
        assert_eq!(status.active_queues, 2);
        assert_eq!(status.active_processes, 2);
        assert_eq!(status.firewall_backend, "nftables");

        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let strategy = write_strategy("--filter-tcp=443 --dpi-desync=fake\n");
        let (runner, _) = test_runner(strategy.path(), "/bin/sleep", None);

        runner.start().await.unwrap();
        assert!(matches!(
            runner.start().await,
            Err(RunnerError::AlreadyRunning)
        ));
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_clears_everything() {
        let strategy = write_strategy("--filter-tcp=443 --dpi-desync=fake\n");
        let (runner, state) = test_runner(strategy.path(), "/bin/sleep", None);

        runner.start().await.unwrap();
        runner.stop().await.unwrap();

        let status = runner.status().await;
        assert!(!status.running);
        assert_eq!(status.active_processes, 0);
        assert!(state.rules.lock().unwrap().is_empty());
        assert_eq!(state.remove_calls.load(Ordering::SeqCst), 1);

        // Second stop is a no-op
        runner.stop().await.unwrap();
        assert_eq!(state.remove_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parse_failure_leaves_no_side_effects() {
        let strategy = write_strategy(":: nothing here\n");
        let (runner, state) = test_runner(strategy.path(), "/bin/sleep", None);

        assert!(matches!(
            runner.start().await,
            Err(RunnerError::Parse(ParseError::EmptyStrategy))
        ));
        assert_eq!(state.setup_calls.load(Ordering::SeqCst), 0);
        assert!(!runner.status().await.running);
    }

    #[tokio::test]
    async fn add_rule_failure_aborts_start_and_stop_cleans_up() {
        let strategy = write_strategy(
            "--filter-tcp=80 --dpi-desync=split --new --filter-tcp=443 --dpi-desync=fake\n",
        );
        let (runner, state) = test_runner(strategy.path(), "/bin/sleep", Some(1));

        assert!(matches!(
            runner.start().await,
            Err(RunnerError::AddRule(_))
        ));
        // The first rule stays installed until stop cleans up.
        assert_eq!(state.rules.lock().unwrap().len(), 1);
        assert!(!runner.status().await.running);

        // Stop must tear down the partially-installed rules even though
        // the failed start never marked the runner as running.
        runner.stop().await.unwrap();
        assert!(state.rules.lock().unwrap().is_empty());
        assert_eq!(state.remove_calls.load(Ordering::SeqCst), 1);

        // With nothing left installed, a further stop is a no-op.
        runner.stop().await.unwrap();
        assert_eq!(state.remove_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_spawn_failure_is_tolerated() {
        let strategy = write_strategy(
            "--filter-tcp=80 --dpi-desync=split --new --filter-tcp=443 --dpi-desync=fake\n",
        );
        let (runner, state) = test_runner(strategy.path(), "/nonexistent/nfqws", None);

        runner.start().await.unwrap();

        let status = runner.status().await;
        assert!(status.running);
        assert_eq!(status.active_queues, 2);
        assert_eq!(status.active_processes, 0);
        assert_eq!(state.rules.lock().unwrap().len(), 2);

        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_with_broken_config_leaves_system_stopped() {
        let strategy = write_strategy("--filter-tcp=443 --dpi-desync=fake\n");
        let (runner, _) = test_runner(strategy.path(), "/bin/sleep", None);

        runner.start().await.unwrap();
        // daemon_cfg points at a config whose strategy_file does not
        // exist, so reload validation fails.
        assert!(matches!(
            runner.restart().await,
            Err(RunnerError::Config(_))
        ));
        assert!(!runner.status().await.running);
    }
}
