//! The embedding environment
//!
//! Everything the client reads from the page (location, title, privacy
//! signals) and the page lifecycle notifications it reacts to come through
//! [`Host`]. [`StaticHost`] is an in-process implementation whose state the
//! owner mutates directly.

use std::sync::{Arc, Mutex, RwLock};

use url::Url;

/// Page lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Page went to the background; it may never come back
    VisibilityHidden,
    /// Page is in the foreground again
    VisibilityVisible,
    /// Page is being unloaded
    PageHide,
    /// Client-side navigation to a new URL
    RouteChange(Url),
}

impl LifecycleEvent {
    /// Events after which the page may be gone without further notice
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleEvent::VisibilityHidden | LifecycleEvent::PageHide)
    }
}

/// Receives lifecycle notifications from the host
pub trait LifecycleListener: Send + Sync {
    fn on_lifecycle(&self, event: &LifecycleEvent);
}

/// Capabilities the client needs from its environment
pub trait Host: Send + Sync {
    /// Current page URL
    fn location(&self) -> Url;

    /// Document title
    fn title(&self) -> Option<String> {
        None
    }

    /// Referring page
    fn referrer(&self) -> Option<String> {
        None
    }

    /// The user agent asked not to be tracked
    fn do_not_track(&self) -> bool {
        false
    }

    fn user_agent(&self) -> Option<String> {
        None
    }

    /// The page is driven by automation (webdriver and friends)
    fn is_automated(&self) -> bool {
        false
    }

    /// Preferred language tag, e.g. `en-US`
    fn language(&self) -> Option<String> {
        None
    }

    /// IANA time zone name, e.g. `Europe/Berlin`
    fn timezone(&self) -> Option<String> {
        None
    }

    /// Subscribe to lifecycle notifications
    fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>);
}

/// Host whose state is set by its owner.
///
/// Lifecycle notifications are delivered synchronously by [`StaticHost::emit`].
pub struct StaticHost {
    location: RwLock<Url>,
    title: RwLock<Option<String>>,
    referrer: RwLock<Option<String>>,
    user_agent: RwLock<Option<String>>,
    language: RwLock<Option<String>>,
    timezone: RwLock<Option<String>>,
    do_not_track: RwLock<bool>,
    automated: RwLock<bool>,
    listeners: Mutex<Vec<Arc<dyn LifecycleListener>>>,
}

impl StaticHost {
    pub fn new(location: Url) -> Self {
        Self {
            location: RwLock::new(location),
            title: RwLock::new(None),
            referrer: RwLock::new(None),
            user_agent: RwLock::new(None),
            language: RwLock::new(None),
            timezone: RwLock::new(None),
            do_not_track: RwLock::new(false),
            automated: RwLock::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Parse `url` as the initial location
    pub fn parse(url: &str) -> crate::error::Result<Self> {
        let location = Url::parse(url)
            .map_err(|e| crate::error::Error::Config(format!("invalid page url {:?}: {}", url, e)))?;
        Ok(Self::new(location))
    }

    /// Change the location without notifying listeners (a full page load)
    pub fn set_location(&self, location: Url) {
        if let Ok(mut current) = self.location.write() {
            *current = location;
        }
    }

    /// Change the location and notify listeners (a client-side navigation)
    pub fn navigate(&self, location: Url) {
        self.set_location(location.clone());
        self.emit(LifecycleEvent::RouteChange(location));
    }

    pub fn set_title(&self, title: Option<String>) {
        if let Ok(mut current) = self.title.write() {
            *current = title;
        }
    }

    pub fn set_referrer(&self, referrer: Option<String>) {
        if let Ok(mut current) = self.referrer.write() {
            *current = referrer;
        }
    }

    pub fn set_user_agent(&self, user_agent: Option<String>) {
        if let Ok(mut current) = self.user_agent.write() {
            *current = user_agent;
        }
    }

    pub fn set_language(&self, language: Option<String>) {
        if let Ok(mut current) = self.language.write() {
            *current = language;
        }
    }

    pub fn set_timezone(&self, timezone: Option<String>) {
        if let Ok(mut current) = self.timezone.write() {
            *current = timezone;
        }
    }

    pub fn set_do_not_track(&self, enabled: bool) {
        if let Ok(mut current) = self.do_not_track.write() {
            *current = enabled;
        }
    }

    pub fn set_automated(&self, automated: bool) {
        if let Ok(mut current) = self.automated.write() {
            *current = automated;
        }
    }

    /// Deliver `event` to every registered listener
    pub fn emit(&self, event: LifecycleEvent) {
        // Snapshot so a listener may register another without deadlocking.
        let listeners: Vec<_> = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            listener.on_lifecycle(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }
}

impl Host for StaticHost {
    fn location(&self) -> Url {
        match self.location.read() {
            Ok(location) => location.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn title(&self) -> Option<String> {
        self.title.read().ok().and_then(|t| t.clone())
    }

    fn referrer(&self) -> Option<String> {
        self.referrer.read().ok().and_then(|r| r.clone())
    }

    fn do_not_track(&self) -> bool {
        self.do_not_track.read().map(|v| *v).unwrap_or(false)
    }

    fn user_agent(&self) -> Option<String> {
        self.user_agent.read().ok().and_then(|ua| ua.clone())
    }

    fn is_automated(&self) -> bool {
        self.automated.read().map(|v| *v).unwrap_or(false)
    }

    fn language(&self) -> Option<String> {
        self.language.read().ok().and_then(|l| l.clone())
    }

    fn timezone(&self) -> Option<String> {
        self.timezone.read().ok().and_then(|tz| tz.clone())
    }

    fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }
}

/// Value of the first `name` query parameter on `url`
pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl LifecycleListener for Counting {
        fn on_lifecycle(&self, _event: &LifecycleEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_navigate_updates_location_and_notifies() {
        let host = StaticHost::parse("https://example.com/start").unwrap();
        let listener = Arc::new(Counting(AtomicUsize::new(0)));
        host.add_lifecycle_listener(listener.clone());

        host.navigate(Url::parse("https://example.com/next").unwrap());

        assert_eq!(host.location().path(), "/next");
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
        assert_eq!(host.listener_count(), 1);
    }

    #[test]
    fn test_query_param() {
        let url = Url::parse("https://example.com/?anonId=abc&empty=&x=1").unwrap();
        assert_eq!(query_param(&url, "anonId").as_deref(), Some("abc"));
        assert_eq!(query_param(&url, "empty"), None);
        assert_eq!(query_param(&url, "missing"), None);
    }

    #[test]
    fn test_terminal_events() {
        assert!(LifecycleEvent::PageHide.is_terminal());
        assert!(LifecycleEvent::VisibilityHidden.is_terminal());
        assert!(!LifecycleEvent::VisibilityVisible.is_terminal());
    }
}
