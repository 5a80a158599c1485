/// Session-replay bookkeeping for one logical connection
///
/// Callers set session state (autocommit, isolation, read-only mode,
/// session variables) through the logical connection; every accepted
/// setting is recorded here so it can be reapplied, best effort, after a
/// physical reconnect.
use std::time::SystemTime;

use crate::core::conn::{IsolationLevel, SessionSetting};

/// Captured session settings in replay order
#[derive(Debug, Clone)]
pub struct SessionState {
    autocommit: Option<bool>,
    isolation: Option<IsolationLevel>,
    read_only: Option<bool>,
    /// Caller-set variables in first-set order; re-setting a variable
    /// updates it in place so replay preserves the original ordering
    variables: Vec<(String, String)>,
    last_update: Option<SystemTime>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            autocommit: None,
            isolation: None,
            read_only: None,
            variables: Vec::new(),
            last_update: None,
        }
    }

    /// Record a setting that was successfully applied to the live
    /// physical connection
    pub fn record(&mut self, setting: &SessionSetting) {
        match setting {
            SessionSetting::Autocommit(on) => self.autocommit = Some(*on),
            SessionSetting::Isolation(level) => self.isolation = Some(*level),
            SessionSetting::ReadOnly(on) => self.read_only = Some(*on),
            SessionSetting::Variable { name, value } => {
                match self.variables.iter_mut().find(|(n, _)| n == name) {
                    Some(entry) => entry.1 = value.clone(),
                    None => self.variables.push((name.clone(), value.clone())),
                }
            }
        }
        self.last_update = Some(SystemTime::now());
    }

    /// Ordered list of settings to reapply after a reconnect: transaction
    /// characteristics first, then variables in first-set order
    pub fn replay_plan(&self) -> Vec<SessionSetting> {
        let mut plan = Vec::new();
        if let Some(on) = self.autocommit {
            plan.push(SessionSetting::Autocommit(on));
        }
        if let Some(level) = self.isolation {
            plan.push(SessionSetting::Isolation(level));
        }
        if let Some(on) = self.read_only {
            plan.push(SessionSetting::ReadOnly(on));
        }
        for (name, value) in &self.variables {
            plan.push(SessionSetting::Variable {
                name: name.clone(),
                value: value.clone(),
            });
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.autocommit.is_none()
            && self.isolation.is_none()
            && self.read_only.is_none()
            && self.variables.is_empty()
    }

    pub fn autocommit(&self) -> Option<bool> {
        self.autocommit
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn read_only(&self) -> Option<bool> {
        self.read_only
    }

    pub fn variables(&self) -> &[(String, String)] {
        &self.variables
    }

    pub fn last_update(&self) -> Option<SystemTime> {
        self.last_update
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
