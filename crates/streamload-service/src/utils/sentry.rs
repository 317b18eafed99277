use crate::intention::Intention;

/// Write own data to [`sentry::Scope`], only the subset that is considered useful for debugging.
pub trait ConfigureScope {
    /// Writes information to the given scope.
    fn to_scope(&self, scope: &mut sentry::Scope);

    /// Configures the current scope.
    fn configure_scope(&self) {
        sentry::configure_scope(|scope| self.to_scope(scope));
    }
}

impl<A> ConfigureScope for Intention<A> {
    fn to_scope(&self, scope: &mut sentry::Scope) {
        scope.set_tag("intention.key", self.key());
        scope.set_tag("intention.source", self.current_source());
        scope.set_tag("intention.attempts_remaining", self.attempts_remaining());
        scope.set_extra(
            "intention.permitted_sources",
            format!("{:?}", self.permitted_sources()).into(),
        );
    }
}
