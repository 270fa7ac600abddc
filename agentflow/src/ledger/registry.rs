//! Compensation handlers and the declarative rules that select them.

use super::entry::SideEffectEntry;
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// What a handler did.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The effect is undone.
    Compensated(Value),
    /// The handler cannot undo it alone.
    RequiresUserAction(Vec<String>),
}

/// Undoes one kind of effect.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    /// Compensates `entry`. An `Err` is a hard failure.
    async fn compensate(&self, entry: &SideEffectEntry) -> Result<HandlerOutcome, String>;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = Result<HandlerOutcome, String>> + Send>>;

/// A handler backed by a closure.
pub struct FnCompensationHandler {
    f: Box<dyn Fn(SideEffectEntry) -> BoxedHandlerFuture + Send + Sync>,
}

impl FnCompensationHandler {
    /// Wraps an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(SideEffectEntry) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutcome, String>> + Send + 'static,
    {
        Self {
            f: Box::new(move |entry| Box::pin(f(entry))),
        }
    }
}

impl std::fmt::Debug for FnCompensationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCompensationHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl CompensationHandler for FnCompensationHandler {
    async fn compensate(&self, entry: &SideEffectEntry) -> Result<HandlerOutcome, String> {
        (self.f)(entry.clone()).await
    }
}

/// Predicate over an effect. Every set field must match.
#[derive(Debug, Clone, Default)]
pub struct MatchRule {
    operation: Option<String>,
    description: Option<Regex>,
    service: Option<String>,
}

impl MatchRule {
    /// A rule matching everything.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches an exact operation kind, or a prefix when it ends in `*`.
    #[must_use]
    pub fn operation(operation: impl Into<String>) -> Self {
        Self::any().with_operation(operation)
    }

    /// Adds an operation constraint.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Adds a description pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is not a valid regex.
    pub fn with_description(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.description = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Adds a service constraint.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Whether the rule matches `entry`.
    #[must_use]
    pub fn matches(&self, entry: &SideEffectEntry) -> bool {
        let effect = &entry.effect;
        let operation_ok = self.operation.as_deref().map_or(true, |want| {
            match want.strip_suffix('*') {
                Some(prefix) => effect.operation.starts_with(prefix),
                None => effect.operation == want,
            }
        });
        let description_ok = self
            .description
            .as_ref()
            .map_or(true, |re| re.is_match(&effect.description));
        let service_ok = self
            .service
            .as_deref()
            .map_or(true, |want| effect.service.as_deref() == Some(want));
        operation_ok && description_ok && service_ok
    }
}

/// Ordered list of rule/handler pairs; the first matching rule wins.
#[derive(Default)]
pub struct CompensationRegistry {
    handlers: RwLock<Vec<(MatchRule, Arc<dyn CompensationHandler>)>>,
}

impl std::fmt::Debug for CompensationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationRegistry")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl CompensationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler.
    pub fn register(&self, rule: MatchRule, handler: Arc<dyn CompensationHandler>) {
        self.handlers.write().push((rule, handler));
    }

    /// The first handler whose rule matches.
    #[must_use]
    pub fn find(&self, entry: &SideEffectEntry) -> Option<Arc<dyn CompensationHandler>> {
        self.handlers
            .read()
            .iter()
            .find(|(rule, _)| rule.matches(entry))
            .map(|(_, handler)| Arc::clone(handler))
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Returns true if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{CompensationDescriptor, SideEffect};
    use serde_json::json;
    use uuid::Uuid;

    fn entry(operation: &str, description: &str, service: Option<&str>) -> SideEffectEntry {
        let mut effect = SideEffect::new(operation, description, CompensationDescriptor::Idempotent);
        effect.service = service.map(String::from);
        SideEffectEntry::first(0, Uuid::nil(), "n".into(), effect)
    }

    #[test]
    fn test_rule_matching() {
        let rule = MatchRule::operation("calendar.*")
            .with_service("gcal")
            .with_description(r"^meeting")
            .unwrap();
        assert!(rule.matches(&entry("calendar.create", "meeting with ops", Some("gcal"))));
        assert!(!rule.matches(&entry("calendar.create", "lunch", Some("gcal"))));
        assert!(!rule.matches(&entry("calendar.create", "meeting", Some("outlook"))));
        assert!(!rule.matches(&entry("email.send", "meeting", Some("gcal"))));
        assert!(MatchRule::any().matches(&entry("anything", "", None)));
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let registry = CompensationRegistry::new();
        registry.register(
            MatchRule::operation("email.send"),
            Arc::new(FnCompensationHandler::new(|_| async {
                Ok(HandlerOutcome::Compensated(json!("specific")))
            })),
        );
        registry.register(
            MatchRule::any(),
            Arc::new(FnCompensationHandler::new(|_| async {
                Ok(HandlerOutcome::Compensated(json!("fallback")))
            })),
        );

        let handler = registry.find(&entry("email.send", "", None)).unwrap();
        let outcome = handler.compensate(&entry("email.send", "", None)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Compensated(json!("specific")));

        let fallback = registry.find(&entry("sms.send", "", None)).unwrap();
        let outcome = fallback.compensate(&entry("sms.send", "", None)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Compensated(json!("fallback")));
    }

    #[tokio::test]
    async fn test_mock_handler() {
        let mut handler = MockCompensationHandler::new();
        handler
            .expect_compensate()
            .times(1)
            .returning(|_| Err("upstream refused".into()));
        let registry = CompensationRegistry::new();
        registry.register(MatchRule::any(), Arc::new(handler));

        let found = registry.find(&entry("x", "", None)).unwrap();
        assert_eq!(found.compensate(&entry("x", "", None)).await.unwrap_err(), "upstream refused");
    }
}
