//! Pure flag transitions for lifecycle events, plus the guards that decide
//! which action is due. Nothing here touches the host.

use crate::state::RetryFlags;
use crate::status::Status;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Install,
    ConfigChanged,
    UpdateStatus,
    UpgradeCharm,
    Stop,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 5] = [
        LifecycleEvent::Install,
        LifecycleEvent::ConfigChanged,
        LifecycleEvent::UpdateStatus,
        LifecycleEvent::UpgradeCharm,
        LifecycleEvent::Stop,
    ];

    pub fn hook_name(self) -> &'static str {
        match self {
            LifecycleEvent::Install => "install",
            LifecycleEvent::ConfigChanged => "config-changed",
            LifecycleEvent::UpdateStatus => "update-status",
            LifecycleEvent::UpgradeCharm => "upgrade-charm",
            LifecycleEvent::Stop => "stop",
        }
    }

    pub fn from_hook_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.hook_name() == name)
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.hook_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigView<'a> {
    pub submit_url: Option<&'a str>,
    /// `submit_url` differs from the value seen by the previous invocation.
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub flags: RetryFlags,
    pub status: Option<Status>,
}

pub fn apply_event(flags: RetryFlags, event: LifecycleEvent, config: ConfigView<'_>) -> Transition {
    match event {
        LifecycleEvent::Install => Transition {
            flags: full_cycle(flags),
            status: Some(Status::maintenance("setting up")),
        },
        LifecycleEvent::UpgradeCharm => Transition {
            flags: RetryFlags {
                configured: false,
                ..full_cycle(flags)
            },
            status: None,
        },
        LifecycleEvent::ConfigChanged => config_changed(flags, config),
        LifecycleEvent::UpdateStatus => Transition {
            flags: RetryFlags {
                collecting: flags.collecting || !flags.collected,
                submitting: flags.submitting || !flags.submitted,
                ..flags
            },
            status: None,
        },
        LifecycleEvent::Stop => Transition {
            flags,
            status: None,
        },
    }
}

fn full_cycle(flags: RetryFlags) -> RetryFlags {
    RetryFlags {
        collecting: true,
        collected: false,
        submitting: true,
        submitted: false,
        ..flags
    }
}

fn config_changed(flags: RetryFlags, config: ConfigView<'_>) -> Transition {
    if config.submit_url.is_none() {
        return Transition {
            flags: RetryFlags {
                configured: false,
                submitting: false,
                submitted: false,
                ..flags
            },
            status: Some(Status::maintenance("waiting for configuration")),
        };
    }

    if !config.changed && flags.configured {
        return Transition {
            flags,
            status: None,
        };
    }

    let recollect = !flags.collected && !flags.collecting;
    let message = if recollect {
        "about to try to collect data again"
    } else {
        "about to resubmit any collected data"
    };
    Transition {
        flags: RetryFlags {
            configured: true,
            submitting: true,
            submitted: false,
            collecting: flags.collecting || recollect,
            ..flags
        },
        status: Some(Status::maintenance(message)),
    }
}

pub fn collect_due(flags: &RetryFlags) -> bool {
    flags.collecting && !flags.collected
}

pub fn submit_due(flags: &RetryFlags) -> bool {
    flags.collected && flags.submitting && !flags.submitted
}
