//! Physical key names for everything stored in Redis

const REGULAR_TASKS: &str = "regular_tasks";
const DELAYED_TASKS: &str = "delayed_tasks";
const DELAYED_TASK_DATA: &str = "delayed_task_data";
const LOCK_PREFIX: &str = "lock:";

/// Maps logical key names onto prefixed store keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix an arbitrary logical key
    pub fn key(&self, logical: &str) -> String {
        format!("{}_{}", self.prefix, logical)
    }

    /// List holding immediate tasks
    pub fn regular_tasks(&self) -> String {
        self.key(REGULAR_TASKS)
    }

    /// Sorted set of `[identifier, type]` members scored by due time
    pub fn delayed_tasks(&self) -> String {
        self.key(DELAYED_TASKS)
    }

    /// Hash of identifier -> merged payload for delayed tasks
    pub fn delayed_task_data(&self) -> String {
        self.key(DELAYED_TASK_DATA)
    }

    pub fn lock(&self, name: &str) -> String {
        self.key(&format!("{}{}", LOCK_PREFIX, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_with_underscore() {
        let keys = KeyNamespace::new("app");
        assert_eq!(keys.regular_tasks(), "app_regular_tasks");
        assert_eq!(keys.delayed_tasks(), "app_delayed_tasks");
        assert_eq!(keys.delayed_task_data(), "app_delayed_task_data");
        assert_eq!(keys.lock("import"), "app_lock:import");
        assert_eq!(keys.key("workers"), "app_workers");
    }

    #[test]
    fn namespaces_do_not_overlap() {
        let a = KeyNamespace::new("a");
        let b = KeyNamespace::new("b");
        assert_ne!(a.regular_tasks(), b.regular_tasks());
    }
}
