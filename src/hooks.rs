use crate::collectors::commands::{DiagnosticCommand, DIAGNOSTIC_COMMANDS};
use crate::collectors::runner::CommandRunner;
use crate::collectors::{CollectError, Collector};
use crate::installer::{
    required_packages, InstallError, PackageInstaller, ReadinessGate, PACKAGE_OWNER,
};
use crate::machine::{self, ConfigView, LifecycleEvent};
use crate::state::{FlagStore, PersistedState, StateError};
use crate::status::{Status, StatusLevel, StatusSink};
use crate::submit::{SubmitError, Submitter};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a guarded action did not complete. None of these end the process.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("failed to install the OS packages: {0}")]
    PackageInstall(#[from] InstallError),
    #[error("failed to collect the data: {0}")]
    CollectionIo(#[from] CollectError),
    #[error("failed to submit the collected data: {0}")]
    SubmissionUnreachable(SubmitError),
    #[error("the inventory server rejected the data: {0}")]
    SubmissionRejected(SubmitError),
    #[error("collected some data, but there is nowhere to submit it to")]
    Misconfigured,
}

impl From<SubmitError> for ActionError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Rejected { .. } => ActionError::SubmissionRejected(err),
            other => ActionError::SubmissionUnreachable(other),
        }
    }
}

impl ActionError {
    pub fn status(&self) -> Option<Status> {
        let message = match self {
            ActionError::PackageInstall(_) => "failed to install the OS packages",
            ActionError::CollectionIo(_) => "failed to collect the data",
            ActionError::SubmissionUnreachable(_) | ActionError::SubmissionRejected(_) => {
                "failed to submit the collected data"
            }
            ActionError::Misconfigured => return None,
        };
        Some(Status::maintenance(message))
    }
}

#[derive(Debug, Clone)]
pub struct HookSettings {
    pub bundle_path: PathBuf,
    pub work_dir_parent: PathBuf,
    pub command_timeout: Duration,
    pub sudo: bool,
    pub commands: Vec<DiagnosticCommand>,
}

impl HookSettings {
    pub fn new(bundle_path: PathBuf, work_dir_parent: PathBuf, command_timeout: Duration, sudo: bool) -> Self {
        Self {
            bundle_path,
            work_dir_parent,
            command_timeout,
            sudo,
            commands: DIAGNOSTIC_COMMANDS.to_vec(),
        }
    }
}

/// Handles one lifecycle event per call: applies the flag transition, runs
/// the actions that became due and persists the result.
pub struct Hooks<'a, R, I, G, S> {
    settings: HookSettings,
    runner: &'a R,
    installer: &'a I,
    gate: &'a G,
    submitter: &'a Submitter,
    status: &'a S,
}

impl<'a, R, I, G, S> Hooks<'a, R, I, G, S>
where
    R: CommandRunner,
    I: PackageInstaller,
    G: ReadinessGate,
    S: StatusSink,
{
    pub fn new(
        settings: HookSettings,
        runner: &'a R,
        installer: &'a I,
        gate: &'a G,
        submitter: &'a Submitter,
        status: &'a S,
    ) -> Self {
        Self {
            settings,
            runner,
            installer,
            gate,
            submitter,
            status,
        }
    }

    pub async fn handle(
        &self,
        store: &dyn FlagStore,
        event: LifecycleEvent,
        submit_url: Option<&str>,
    ) -> Result<PersistedState, StateError> {
        let mut state = match store.load() {
            Ok(state) => state,
            Err(err @ StateError::Parse { .. }) => {
                warn!(error = %err, "discarding the unreadable state, starting over");
                PersistedState::default()
            }
            Err(err) => return Err(err),
        };
        info!(event = %event, flags = ?state.flags.names(), "handling hook");

        let config = ConfigView {
            submit_url,
            changed: state.last_submit_url.as_deref() != submit_url,
        };
        let transition = machine::apply_event(state.flags, event, config);
        state.flags = transition.flags;
        if let Some(status) = transition.status {
            self.report(&mut state, status).await;
        }

        if event == LifecycleEvent::Stop {
            self.stop().await;
        } else {
            self.run_due_actions(&mut state, submit_url).await;
        }

        state.last_submit_url = submit_url.map(str::to_string);
        if let Err(err) = store.save(&state) {
            self.status.set(&Status::error("failed to save the state")).await;
            return Err(err);
        }
        debug!(flags = ?state.flags.names(), "hook done");
        Ok(state)
    }

    /// Each action runs at most once per invocation. A failure leaves its
    /// "done" flag unset; the next update-status re-arms it.
    async fn run_due_actions(&self, state: &mut PersistedState, submit_url: Option<&str>) {
        if machine::collect_due(&state.flags) {
            if self.gate.is_ready() {
                state.flags.collecting = false;
                if let Err(err) = self.collect(state).await {
                    self.fail(state, &err).await;
                }
            } else {
                debug!("package repository not available yet");
                self.report(
                    state,
                    Status::maintenance("waiting for the package repository to be configured"),
                )
                .await;
            }
        }

        if machine::submit_due(&state.flags) {
            state.flags.submitting = false;
            if let Err(err) = self.submit(state, submit_url).await {
                self.fail(state, &err).await;
            }
        }
    }

    async fn collect(&self, state: &mut PersistedState) -> Result<(), ActionError> {
        self.report(state, Status::maintenance("installing packages for data collection"))
            .await;
        let installed = self.installer.install_packages(&required_packages()).await?;
        if installed.is_empty() {
            debug!("all the needed packages were already installed");
        } else {
            info!(packages = ?installed, "installed new packages");
        }
        self.installer.record_packages(PACKAGE_OWNER, &installed)?;

        self.report(state, Status::maintenance("collecting data")).await;
        let collector = Collector::new(
            self.runner,
            &self.settings.commands,
            &self.settings.work_dir_parent,
            self.settings.command_timeout,
            self.settings.sudo,
        );
        let summary = collector.collect(&self.settings.bundle_path).await?;
        debug!(?summary, "collection finished");

        state.flags.collected = true;
        self.report(state, Status::maintenance("")).await;
        Ok(())
    }

    async fn submit(
        &self,
        state: &mut PersistedState,
        submit_url: Option<&str>,
    ) -> Result<(), ActionError> {
        let url = match submit_url {
            Some(url) if state.flags.configured => url,
            _ => return Err(ActionError::Misconfigured),
        };

        self.report(state, Status::maintenance("submitting the collected data")).await;
        let code = self.submitter.submit(&self.settings.bundle_path, url).await?;
        info!(url, status = code, "inventory data submitted");

        state.flags.submitted = true;
        self.report(state, Status::active("inventory data submitted")).await;
        Ok(())
    }

    async fn stop(&self) {
        match fs::remove_file(&self.settings.bundle_path) {
            Ok(()) => info!(path = %self.settings.bundle_path.display(), "removed the collected data"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.settings.bundle_path.display(),
                error = %err,
                "could not remove the collected data"
            ),
        }

        match self.installer.unrecord_packages(PACKAGE_OWNER).await {
            Ok(removed) if removed.is_empty() => debug!("no packages to remove"),
            Ok(removed) => info!(packages = ?removed, "removed packages"),
            Err(err) => warn!(error = %err, "could not remove the recorded packages"),
        }
    }

    async fn fail(&self, state: &mut PersistedState, err: &ActionError) {
        match err {
            ActionError::Misconfigured => info!("{err}"),
            _ => warn!(error = %err, "action failed"),
        }
        if let Some(status) = err.status() {
            self.report(state, status).await;
        }
    }

    async fn report(&self, state: &mut PersistedState, status: Status) {
        self.status.set(&status).await;
        state.status = status;
    }
}

pub fn is_done(state: &PersistedState) -> bool {
    state.flags.submitted && state.status.level == StatusLevel::Active
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::runner::testing::FakeRunner;
    use crate::installer::PackageRecord;
    use crate::state::testing::MemoryFlagStore;
    use crate::state::{FileFlagStore, RetryFlags};
    use crate::status::testing::RecordingStatus;
    use crate::submit::testing::Endpoint;
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeInstaller {
        fail: Cell<bool>,
        newly_installed: Vec<String>,
        installs: Cell<usize>,
        recorded: RefCell<PackageRecord>,
        unrecorded: RefCell<Vec<String>>,
    }

    impl PackageInstaller for FakeInstaller {
        async fn install_packages(
            &self,
            wanted: &BTreeMap<String, String>,
        ) -> Result<Vec<String>, InstallError> {
            assert!(wanted.contains_key("dmidecode"));
            self.installs.set(self.installs.get() + 1);
            if self.fail.get() {
                return Err(InstallError::Apt {
                    action: "install",
                    code: Some(100),
                    stderr: "E: Unable to locate package lshw".to_string(),
                });
            }
            Ok(self.newly_installed.clone())
        }

        fn record_packages(&self, owner: &str, names: &[String]) -> Result<(), InstallError> {
            self.recorded.borrow_mut().add(owner, names);
            Ok(())
        }

        async fn unrecord_packages(&self, owner: &str) -> Result<Vec<String>, InstallError> {
            self.unrecorded.borrow_mut().push(owner.to_string());
            Ok(self.recorded.borrow_mut().remove_owner(owner))
        }
    }

    struct Gate(Cell<bool>);

    impl ReadinessGate for Gate {
        fn is_ready(&self) -> bool {
            self.0.get()
        }
    }

    struct Fixture {
        scratch: TempDir,
        data: TempDir,
        runner: FakeRunner,
        installer: FakeInstaller,
        gate: Gate,
        submitter: Submitter,
        status: RecordingStatus,
        store: MemoryFlagStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                scratch: tempfile::tempdir().unwrap(),
                data: tempfile::tempdir().unwrap(),
                runner: FakeRunner::default(),
                installer: FakeInstaller {
                    newly_installed: vec!["a-package".to_string(), "another-package".to_string()],
                    ..FakeInstaller::default()
                },
                gate: Gate(Cell::new(true)),
                submitter: Submitter::new(Duration::from_secs(5), "storage-node-7".to_string())
                    .unwrap(),
                status: RecordingStatus::default(),
                store: MemoryFlagStore::default(),
            }
        }

        fn bundle_path(&self) -> PathBuf {
            self.data.path().join("storpool/collect.json")
        }

        fn hooks(&self) -> Hooks<'_, FakeRunner, FakeInstaller, Gate, RecordingStatus> {
            let mut settings = HookSettings::new(
                self.bundle_path(),
                self.scratch.path().to_path_buf(),
                Duration::from_secs(5),
                false,
            );
            settings.commands.clear();
            Hooks::new(
                settings,
                &self.runner,
                &self.installer,
                &self.gate,
                &self.submitter,
                &self.status,
            )
        }

        fn set_flags(&self, flags: RetryFlags) {
            self.store.state.borrow_mut().flags = flags;
        }

        fn flags(&self) -> RetryFlags {
            self.store.state.borrow().flags
        }

        async fn handle(&self, event: LifecycleEvent, url: Option<&str>) -> PersistedState {
            self.hooks().handle(&self.store, event, url).await.unwrap()
        }
    }

    fn bundle_names(path: &Path) -> Vec<String> {
        crate::bundle::CollectedBundle::load(path)
            .unwrap()
            .names()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn install_without_url_collects_but_does_not_submit() {
        let fx = Fixture::new();
        fx.set_flags(RetryFlags {
            collected: true,
            submitted: true,
            ..RetryFlags::default()
        });

        let state = fx.handle(LifecycleEvent::Install, None).await;

        assert_eq!(state.flags.names(), vec!["collected"]);
        assert_eq!(fx.installer.installs.get(), 1);
        assert_eq!(
            fx.installer.recorded.borrow().packages_of(PACKAGE_OWNER),
            vec!["a-package", "another-package"]
        );
        assert_eq!(
            bundle_names(&fx.bundle_path()),
            vec!["collect.err", "collect.sh", "collect.txt"]
        );
        assert_eq!(
            fx.status.messages(),
            vec![
                "setting up",
                "installing packages for data collection",
                "collecting data",
                "",
            ]
        );
    }

    #[tokio::test]
    async fn collect_then_submit_retries_until_accepted() {
        let fx = Fixture::new();
        let (endpoint, url) = Endpoint::start(300).await;

        fx.set_flags(RetryFlags {
            collecting: true,
            ..RetryFlags::default()
        });
        let state = fx.handle(LifecycleEvent::UpdateStatus, None).await;
        assert_eq!(state.flags.names(), vec!["collected"]);
        assert_eq!(endpoint.hits(), 0);

        // Not configured yet: the submission intent is consumed without a request.
        fx.set_flags(RetryFlags {
            submitting: true,
            ..fx.flags()
        });
        fx.handle(LifecycleEvent::UpdateStatus, None).await;
        assert_eq!(fx.flags().names(), vec!["collected"]);
        assert_eq!(endpoint.hits(), 0);

        // Configured, but the server answers 300.
        let state = fx.handle(LifecycleEvent::ConfigChanged, Some(&url)).await;
        assert_eq!(state.flags.names(), vec!["configured", "collected"]);
        assert_eq!(endpoint.hits(), 1);
        assert_eq!(
            fx.status.last(),
            Some(Status::maintenance("failed to submit the collected data"))
        );

        // The next tick re-arms and the server now accepts.
        endpoint.set_status(200);
        let state = fx.handle(LifecycleEvent::UpdateStatus, Some(&url)).await;
        assert_eq!(state.flags.names(), vec!["configured", "collected", "submitted"]);
        assert_eq!(endpoint.hits(), 2);
        assert_eq!(state.status, Status::active("inventory data submitted"));
        assert!(is_done(&state));

        // Nothing left to do.
        fx.handle(LifecycleEvent::UpdateStatus, Some(&url)).await;
        fx.handle(LifecycleEvent::ConfigChanged, Some(&url)).await;
        assert_eq!(endpoint.hits(), 2);
        assert_eq!(fx.installer.installs.get(), 1);
    }

    #[tokio::test]
    async fn submitted_envelope_names_the_host() {
        let fx = Fixture::new();
        let (endpoint, url) = Endpoint::start(200).await;

        fx.handle(LifecycleEvent::Install, Some(&url)).await;
        let state = fx.handle(LifecycleEvent::ConfigChanged, Some(&url)).await;

        // install already saw the URL, so config-changed only had to configure.
        assert_eq!(state.flags.names(), vec!["configured", "collected", "submitted"]);
        assert_eq!(endpoint.hits(), 1);
        let body: serde_json::Value = serde_json::from_slice(&endpoint.last_body().unwrap()).unwrap();
        assert_eq!(body["filename"], "storage-node-7");
        assert!(body["contents"].as_str().unwrap().contains("collect.sh"));
    }

    #[tokio::test]
    async fn package_failure_leaves_collection_for_the_next_tick() {
        let fx = Fixture::new();
        fx.installer.fail.set(true);

        let state = fx.handle(LifecycleEvent::Install, None).await;
        assert_eq!(state.flags.names(), vec!["submitting"]);
        assert_eq!(state.status, Status::maintenance("failed to install the OS packages"));
        assert!(!fx.bundle_path().exists());

        fx.installer.fail.set(false);
        let state = fx.handle(LifecycleEvent::UpdateStatus, None).await;
        assert_eq!(state.flags.names(), vec!["collected"]);
        assert_eq!(fx.installer.installs.get(), 2);
    }

    #[tokio::test]
    async fn collection_io_failure_is_reported() {
        let fx = Fixture::new();
        fs::write(fx.data.path().join("storpool"), "in the way").unwrap();

        let state = fx.handle(LifecycleEvent::Install, None).await;
        assert!(!state.flags.collected);
        assert!(!state.flags.collecting);
        assert_eq!(state.status, Status::maintenance("failed to collect the data"));
    }

    #[tokio::test]
    async fn closed_gate_keeps_collection_pending() {
        let fx = Fixture::new();
        fx.gate.0.set(false);

        let state = fx.handle(LifecycleEvent::Install, None).await;
        assert_eq!(state.flags.names(), vec!["collecting", "submitting"]);
        assert_eq!(fx.installer.installs.get(), 0);
        assert_eq!(
            state.status,
            Status::maintenance("waiting for the package repository to be configured")
        );

        fx.gate.0.set(true);
        let state = fx.handle(LifecycleEvent::UpdateStatus, None).await;
        assert!(state.flags.collected);
    }

    #[tokio::test]
    async fn unreachable_server_is_retried_on_the_next_tick() {
        let fx = Fixture::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_url = format!("http://{}/submit", listener.local_addr().unwrap());
        drop(listener);

        fx.handle(LifecycleEvent::ConfigChanged, Some(&dead_url)).await;
        assert_eq!(fx.flags().names(), vec!["configured", "collected"]);

        let state = fx.handle(LifecycleEvent::UpdateStatus, Some(&dead_url)).await;
        assert_eq!(state.flags.names(), vec!["configured", "collected"]);
        assert_eq!(state.status, Status::maintenance("failed to submit the collected data"));
    }

    #[tokio::test]
    async fn losing_the_url_stops_submissions() {
        let fx = Fixture::new();
        let (endpoint, url) = Endpoint::start(200).await;
        fx.handle(LifecycleEvent::ConfigChanged, Some(&url)).await;
        assert_eq!(endpoint.hits(), 1);

        let state = fx.handle(LifecycleEvent::ConfigChanged, None).await;
        assert_eq!(state.flags.names(), vec!["collected"]);
        assert_eq!(state.last_submit_url, None);

        let state = fx.handle(LifecycleEvent::UpdateStatus, None).await;
        assert_eq!(state.flags.names(), vec!["collected"]);
        assert_eq!(endpoint.hits(), 1);
    }

    #[tokio::test]
    async fn upgrade_recollects_and_resubmits() {
        let fx = Fixture::new();
        let (endpoint, url) = Endpoint::start(200).await;
        fx.handle(LifecycleEvent::ConfigChanged, Some(&url)).await;

        fx.status.seen.lock().unwrap().clear();
        let state = fx.handle(LifecycleEvent::UpgradeCharm, Some(&url)).await;
        assert_eq!(
            fx.status.messages().first().map(String::as_str),
            Some("installing packages for data collection")
        );
        // configured is cleared, so the fresh data waits for config-changed.
        assert_eq!(state.flags.names(), vec!["collected"]);
        assert_eq!(fx.installer.installs.get(), 2);
        assert_eq!(endpoint.hits(), 1);

        let state = fx.handle(LifecycleEvent::ConfigChanged, Some(&url)).await;
        assert_eq!(state.flags.names(), vec!["configured", "collected", "submitted"]);
        assert_eq!(endpoint.hits(), 2);
    }

    #[tokio::test]
    async fn stop_removes_the_bundle_and_packages() {
        let fx = Fixture::new();
        fx.handle(LifecycleEvent::Install, None).await;
        assert!(fx.bundle_path().exists());
        let before = fx.flags();

        let state = fx.handle(LifecycleEvent::Stop, None).await;
        assert!(!fx.bundle_path().exists());
        assert_eq!(state.flags, before);
        assert_eq!(*fx.installer.unrecorded.borrow(), vec![PACKAGE_OWNER]);
        assert!(fx.installer.recorded.borrow().packages_of(PACKAGE_OWNER).is_empty());

        // A second stop with nothing left is harmless.
        fx.handle(LifecycleEvent::Stop, None).await;
    }

    #[tokio::test]
    async fn every_invocation_is_persisted() {
        let fx = Fixture::new();
        fx.handle(LifecycleEvent::UpdateStatus, None).await;
        fx.handle(LifecycleEvent::Stop, None).await;
        assert_eq!(*fx.store.saves.borrow(), 2);
    }

    #[tokio::test]
    async fn unreadable_state_file_is_replaced() {
        let fx = Fixture::new();
        let path = fx.data.path().join("state.json");
        fs::write(&path, r#"{"flags": {"collected": tru"#).unwrap();
        let store = FileFlagStore::new(&path);
        fx.gate.0.set(false);

        let state = fx
            .hooks()
            .handle(&store, LifecycleEvent::Install, None)
            .await
            .unwrap();
        assert_eq!(state.flags.names(), vec!["collecting", "submitting"]);
        assert_eq!(store.load().unwrap(), state);

        fs::write(&path, "not json").unwrap();
        let state = fx
            .hooks()
            .handle(&store, LifecycleEvent::UpgradeCharm, None)
            .await
            .unwrap();
        assert_eq!(state.flags.names(), vec!["collecting", "submitting"]);
    }

    #[tokio::test]
    async fn failing_to_save_reports_an_error_status() {
        let fx = Fixture::new();
        let blocker = fx.data.path().join("blocker");
        fs::write(&blocker, "a file, not a directory").unwrap();
        let store = FileFlagStore::new(blocker.join("state.json"));

        let err = fx
            .hooks()
            .handle(&store, LifecycleEvent::UpdateStatus, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Write { .. }));
        assert_eq!(fx.status.last(), Some(Status::error("failed to save the state")));
    }

    #[test]
    fn submit_errors_map_to_the_right_kind() {
        let rejected: ActionError = SubmitError::Rejected {
            url: "http://x/".to_string(),
            status: 500,
        }
        .into();
        assert!(matches!(rejected, ActionError::SubmissionRejected(_)));
        assert_eq!(ActionError::Misconfigured.status(), None);
    }
}
