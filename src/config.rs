/// What the engine does when the transition hook fails after a committed append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HookFailure {
    /// Return the hook's error to the caller. The entry stays committed.
    #[default]
    Propagate,
    /// Report success and keep the delivery in the outbox for `flush_outbox`.
    Defer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub hook_failure: HookFailure,
    pub outbox_capacity: usize,
    pub max_delivery_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hook_failure: HookFailure::Propagate,
            outbox_capacity: 1024,
            max_delivery_attempts: 5,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_hook_failure(mut self, policy: HookFailure) -> Self {
        self.hook_failure = policy;
        self
    }
    pub fn set_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }
    pub fn set_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }
}
