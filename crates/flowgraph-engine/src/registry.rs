use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use flowgraph_core::error::{FlowError, Result};

use crate::context::FlowContext;
use crate::graph::Node;
use crate::traits::{ConditionComponent, TaskComponent};

/// Registry of named task and condition components.
///
/// Nodes reference components as `@name`. Cloning is cheap; components are
/// shared behind `Arc`.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    tasks: HashMap<String, Arc<dyn TaskComponent>>,
    conditions: HashMap<String, Arc<dyn ConditionComponent>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task component (replaces any previous one of that name).
    pub fn register_task(&mut self, name: impl Into<String>, task: impl TaskComponent + 'static) {
        self.tasks.insert(name.into(), Arc::new(task));
    }

    /// Register a synchronous closure as a task component.
    pub fn task_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut FlowContext, &Node) -> Result<()> + Send + Sync + 'static,
    {
        self.register_task(name, f);
    }

    pub fn register_condition(
        &mut self,
        name: impl Into<String>,
        condition: impl ConditionComponent + 'static,
    ) {
        self.conditions.insert(name.into(), Arc::new(condition));
    }

    /// Register a closure as a condition component.
    pub fn condition_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&FlowContext) -> Result<bool> + Send + Sync + 'static,
    {
        self.register_condition(name, f);
    }

    /// Get a task component by name.
    pub fn task(&self, name: &str) -> Result<Arc<dyn TaskComponent>> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::ComponentNotFound(format!("@{}", name)))
    }

    /// Get a condition component by name.
    pub fn condition(&self, name: &str) -> Result<Arc<dyn ConditionComponent>> {
        self.conditions
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::ComponentNotFound(format!("@{}", name)))
    }

    /// Remove a component of either kind. Returns whether anything was removed.
    pub fn unregister(&mut self, name: &str) -> bool {
        let task = self.tasks.remove(name).is_some();
        let condition = self.conditions.remove(name).is_some();
        task || condition
    }

    /// Names of all registered task components, sorted.
    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Names of all registered condition components, sorted.
    pub fn condition_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.conditions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("tasks", &self.task_names())
            .field("conditions", &self.condition_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_core::NodeType;
    use std::collections::BTreeMap;

    fn node() -> Node {
        Node {
            id: "n".into(),
            title: None,
            node_type: NodeType::Activity,
            meta: BTreeMap::new(),
            when: None,
            task: None,
            links: vec![],
        }
    }

    #[tokio::test]
    async fn test_task_fn_runs() {
        let mut registry = ComponentRegistry::new();
        registry.task_fn("mark", |ctx, node| {
            ctx.put("visited", node.id.clone());
            Ok(())
        });

        let mut ctx = FlowContext::new("i");
        let n = node();
        registry.task("mark").unwrap().run(&mut ctx, &n).await.unwrap();
        assert_eq!(ctx.get_str("visited"), Some("n"));
    }

    #[test]
    fn test_condition_fn_runs() {
        let mut registry = ComponentRegistry::new();
        registry.condition_fn("is_vip", |ctx| Ok(ctx.get_str("tier") == Some("vip")));

        let mut ctx = FlowContext::new("i");
        let cond = registry.condition("is_vip").unwrap();
        assert!(!cond.test(&ctx).unwrap());
        ctx.put("tier", "vip");
        assert!(cond.test(&ctx).unwrap());
    }

    #[test]
    fn test_missing_component() {
        let registry = ComponentRegistry::new();
        assert!(matches!(
            registry.task("nope"),
            Err(FlowError::ComponentNotFound(name)) if name == "@nope"
        ));
        assert!(registry.condition("nope").is_err());
    }

    #[test]
    fn test_unregister_and_names() {
        let mut registry = ComponentRegistry::new();
        registry.task_fn("b", |_, _| Ok(()));
        registry.task_fn("a", |_, _| Ok(()));
        registry.condition_fn("a", |_| Ok(true));

        assert_eq!(registry.task_names(), vec!["a", "b"]);
        assert!(registry.unregister("a"));
        assert!(registry.condition_names().is_empty());
        assert!(!registry.unregister("a"));
        assert_eq!(registry.task_names(), vec!["b"]);
    }
}
