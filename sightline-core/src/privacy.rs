//! Privacy gate
//!
//! Decides, before anything else runs, whether the current page may be
//! tracked. The decision is recomputed on every call from the persisted
//! opt-out flag, the in-memory opt-out flag, the skip patterns, and the host
//! signals; only the storage read itself may be cached by the storage layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::TrackerConfig;
use crate::host::Host;
use crate::storage::{keys, Storage};

static HEADLESS_AGENT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\b(HeadlessChrome|PhantomJS)\b").ok());

/// Why tracking is suppressed on this page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suppression {
    /// Tracker configured with `disabled`
    Disabled,
    /// Host reports do-not-track
    DoNotTrack,
    /// Page looks automation-driven
    Bot,
    /// Path matched this skip pattern
    SkippedPath(String),
}

/// Outcome of a privacy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivacyState {
    Allowed,
    OptedOut,
    Suppressed(Suppression),
}

impl PrivacyState {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PrivacyState::Allowed)
    }
}

/// A path glob from `skipPatterns`.
///
/// `*` matches across `/`, so `/admin/*` covers every page under `/admin/`.
/// A pattern that is not a valid glob only matches the identical path.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    glob: Option<glob::Pattern>,
}

impl PathPattern {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let glob = match glob::Pattern::new(&raw) {
            Ok(glob) => Some(glob),
            Err(e) => {
                tracing::debug!(pattern = %raw, error = %e, "invalid path glob, matching literally");
                None
            }
        };
        Self { raw, glob }
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.raw == path {
            return true;
        }
        self.glob.as_ref().is_some_and(|glob| glob.matches(path))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Static part of the privacy decision, taken from configuration
#[derive(Debug, Clone, Default)]
pub struct PrivacyPolicy {
    pub disabled: bool,
    pub respect_do_not_track: bool,
    pub ignore_bot_detection: bool,
    pub skip_patterns: Vec<PathPattern>,
}

impl PrivacyPolicy {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            disabled: config.disabled,
            respect_do_not_track: config.respect_do_not_track,
            ignore_bot_detection: config.ignore_bot_detection,
            skip_patterns: config.skip_patterns.iter().map(PathPattern::new).collect(),
        }
    }
}

/// Resolves whether tracking may happen and owns the opt-out switch
pub struct PrivacyGate {
    storage: Arc<dyn Storage>,
    host: Arc<dyn Host>,
    policy: PrivacyPolicy,
    opted_out: AtomicBool,
}

impl PrivacyGate {
    /// `storage` is the long-lived scope holding the opt-out flag
    pub fn new(storage: Arc<dyn Storage>, host: Arc<dyn Host>, policy: PrivacyPolicy) -> Self {
        Self {
            storage,
            host,
            policy,
            opted_out: AtomicBool::new(false),
        }
    }

    /// Full decision for `path`
    pub fn state(&self, path: &str) -> PrivacyState {
        if self.persisted_opt_out() || self.opted_out.load(Ordering::SeqCst) {
            return PrivacyState::OptedOut;
        }

        if let Some(pattern) = self.policy.skip_patterns.iter().find(|p| p.matches(path)) {
            return PrivacyState::Suppressed(Suppression::SkippedPath(pattern.as_str().to_string()));
        }

        if self.policy.disabled {
            return PrivacyState::Suppressed(Suppression::Disabled);
        }

        if self.policy.respect_do_not_track && self.host.do_not_track() {
            return PrivacyState::Suppressed(Suppression::DoNotTrack);
        }

        if !self.policy.ignore_bot_detection && is_likely_bot(&*self.host) {
            return PrivacyState::Suppressed(Suppression::Bot);
        }

        PrivacyState::Allowed
    }

    pub fn is_tracking_allowed(&self, path: &str) -> bool {
        self.state(path).is_allowed()
    }

    /// Stop all tracking for this profile, effective immediately
    pub fn opt_out(&self) {
        self.opted_out.store(true, Ordering::SeqCst);
        if let Err(e) = self.storage.set(keys::OPT_OUT, "true") {
            tracing::debug!(error = %e, "failed to persist opt-out, applies to this page only");
        }
    }

    /// Undo a previous opt-out
    pub fn opt_in(&self) {
        self.opted_out.store(false, Ordering::SeqCst);
        if let Err(e) = self.storage.remove(keys::OPT_OUT) {
            tracing::debug!(error = %e, "failed to clear persisted opt-out");
        }
    }

    pub fn is_opted_out(&self) -> bool {
        self.opted_out.load(Ordering::SeqCst) || self.persisted_opt_out()
    }

    fn persisted_opt_out(&self) -> bool {
        matches!(self.storage.get(keys::OPT_OUT), Ok(Some(flag)) if flag == "true")
    }
}

/// Automation signal or a headless user agent
pub fn is_likely_bot(host: &dyn Host) -> bool {
    if host.is_automated() {
        return true;
    }
    match (host.user_agent(), HEADLESS_AGENT.as_ref()) {
        (Some(ua), Some(re)) => re.is_match(&ua),
        _ => false,
    }
}

/// Rewrites paths so identifiers in them never leave the page.
///
/// `/users/*/profile` turns `/users/123/profile` into `/users/*/profile`;
/// `/admin/**` turns anything under `/admin/` into `/admin/*`.
#[derive(Debug, Clone, Default)]
pub struct PathMasker {
    patterns: Vec<String>,
}

impl PathMasker {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn mask(&self, path: &str) -> String {
        for pattern in &self.patterns {
            let Some(star) = pattern.find('*') else {
                continue;
            };
            let prefix = &pattern[..star];
            if !path.starts_with(prefix) {
                continue;
            }
            if pattern[star..].starts_with("**") {
                return format!("{}*", prefix);
            }
            let remainder = &path[prefix.len()..];
            let rest = remainder.find('/').map(|i| &remainder[i..]).unwrap_or("");
            return format!("{}*{}", prefix, rest);
        }
        path.to_string()
    }
}
