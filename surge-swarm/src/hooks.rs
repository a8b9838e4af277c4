//! Caller customization points of a swarm run.

use std::fmt;

use surge_core::{AddTorrentParams, Alert, Session, SettingsPack};

/// Called for every node's session right after construction
pub type SessionInit = Box<dyn FnMut(&Session)>;
/// Adjusts node 0's settings before its session is built
pub type SessionCustomize = Box<dyn FnMut(&mut SettingsPack)>;
/// Adjusts node 0's add-torrent parameters before submission
pub type AddTorrentCustomize = Box<dyn FnMut(&mut AddTorrentParams)>;
/// Observes every alert raised by node 0
pub type OnAlert = Box<dyn FnMut(&Alert, &Session)>;
/// Decides, once per tick, whether the run is over
pub type Terminate = Box<dyn FnMut(u32, &Session) -> bool>;

/// Every callback a swarm run invokes. Unset callbacks do nothing.
///
/// The default `terminate` never ends the run, so download runs rely on the
/// configured time limit unless a predicate is supplied.
pub struct SwarmHooks {
    pub session_init: SessionInit,
    pub session_customize: SessionCustomize,
    pub add_torrent_customize: AddTorrentCustomize,
    pub on_alert: OnAlert,
    pub terminate: Terminate,
}

impl Default for SwarmHooks {
    fn default() -> Self {
        Self {
            session_init: Box::new(|_| {}),
            session_customize: Box::new(|_| {}),
            add_torrent_customize: Box::new(|_| {}),
            on_alert: Box::new(|_, _| {}),
            terminate: Box::new(|_, _| false),
        }
    }
}

impl fmt::Debug for SwarmHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmHooks").finish_non_exhaustive()
    }
}

impl SwarmHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_init(mut self, hook: impl FnMut(&Session) + 'static) -> Self {
        self.session_init = Box::new(hook);
        self
    }

    pub fn session_customize(mut self, hook: impl FnMut(&mut SettingsPack) + 'static) -> Self {
        self.session_customize = Box::new(hook);
        self
    }

    pub fn add_torrent_customize(
        mut self,
        hook: impl FnMut(&mut AddTorrentParams) + 'static,
    ) -> Self {
        self.add_torrent_customize = Box::new(hook);
        self
    }

    pub fn on_alert(mut self, hook: impl FnMut(&Alert, &Session) + 'static) -> Self {
        self.on_alert = Box::new(hook);
        self
    }

    pub fn terminate(mut self, hook: impl FnMut(u32, &Session) -> bool + 'static) -> Self {
        self.terminate = Box::new(hook);
        self
    }
}
